//! Conversion between sequences of numbers and instrument byte blocks.
//!
//! Three block framings are supported in addition to raw element bytes:
//!
//! * `ieee` — `#<k><length><bytes>` definite-length blocks from
//!   IEEE 488.2-1992 Section 8.7.9, plus the `#0 ... \n` indefinite form of
//!   Section 8.7.10
//! * `hp` — `#A<u16 length><bytes>` from the HP-IB `FORM#` transfer format
//! * `ascii` — comma-separated decimal text per the program-data separator
//!   rules of IEEE 488.2-1992 Section 7.4.2.2

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Byte order of a multi-byte element on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
    /// The byte order of the host CPU
    Native,
}
impl ByteOrder {
    fn big(self) -> bool {
        match self {
            Self::Little => false,
            Self::Big => true,
            Self::Native => cfg!(target_endian = "big"),
        }
    }
}

/// A fixed-size numeric element that can be written to and read from a
/// byte block.
pub trait Element: Copy {
    const SIZE: usize;

    fn put(self, big: bool, out: &mut Vec<u8>);
    fn take(bytes: &[u8], big: bool) -> Self;
}

macro_rules! impl_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const SIZE: usize = size_of::<$t>();

            fn put(self, big: bool, out: &mut Vec<u8>) {
                if big {
                    out.extend(self.to_be_bytes());
                } else {
                    out.extend(self.to_le_bytes());
                }
            }

            fn take(bytes: &[u8], big: bool) -> Self {
                let bytes = bytes[..Self::SIZE].try_into().unwrap();
                if big {
                    Self::from_be_bytes(bytes)
                } else {
                    Self::from_le_bytes(bytes)
                }
            }
        }
    )*};
}
impl_element!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

fn raw_bytes<T: Element>(values: &[T], order: ByteOrder) -> Vec<u8> {
    let big = order.big();
    let mut out = Vec::with_capacity(values.len() * T::SIZE);
    for value in values {
        value.put(big, &mut out);
    }
    out
}

fn raw_values<T: Element>(bytes: &[u8], order: ByteOrder) -> Vec<T> {
    let big = order.big();
    bytes
        .chunks_exact(T::SIZE)
        .map(|chunk| T::take(chunk, big))
        .collect()
}

/// Encode values as a definite-length IEEE 488.2 block, `#<k><length><bytes>`.
///
/// The length field allows at most 9 digits, so blocks of 10^9 bytes or more
/// are rejected.
pub fn to_bytes_ieee<T: Element>(values: &[T], order: ByteOrder) -> Result<Vec<u8>> {
    let nbytes = values.len() * T::SIZE;
    let digits = nbytes.to_string();
    if digits.len() > 9 {
        return Err(Error::Protocol(
            "length too big for the IEEE-488.2 block format".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(2 + digits.len() + nbytes);
    out.push(b'#');
    out.push(b'0' + digits.len() as u8);
    out.extend(digits.as_bytes());
    out.append(&mut raw_bytes(values, order));
    Ok(out)
}

/// Decode an IEEE 488.2 block. Both the definite-length form and the
/// indefinite `#0` form are accepted; an indefinite block may carry a
/// trailing `\n` which is not part of the data.
pub fn from_bytes_ieee<T: Element>(buffer: &[u8], order: ByteOrder) -> Result<Vec<T>> {
    let offset = buffer
        .iter()
        .position(|&b| b == b'#')
        .ok_or_else(|| Error::Protocol("cannot find the # character of an IEEE-488.2 block".to_string()))?;

    let k = match buffer.get(offset + 1) {
        Some(b @ b'0'..=b'9') => (b - b'0') as usize,
        _ => {
            return Err(Error::Protocol(
                "the character after # of an IEEE-488.2 block is not a digit".to_string(),
            ));
        }
    };

    let data = if k == 0 {
        let mut data = &buffer[offset + 2..];
        if data.ends_with(b"\n") {
            data = &data[..data.len() - 1];
        }
        data
    } else {
        let digits = buffer
            .get(offset + 2..offset + 2 + k)
            .ok_or_else(|| Error::Protocol("truncated IEEE-488.2 block length".to_string()))?;
        let nbytes: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Error::Protocol(format!("the characters after #{k} are not an integer length"))
            })?;
        let start = offset + 2 + k;
        buffer
            .get(start..start + nbytes)
            .ok_or_else(|| Error::Protocol("IEEE-488.2 block is shorter than its length field".to_string()))?
    };

    Ok(raw_values(&data[..data.len() - data.len() % T::SIZE], order))
}

/// Encode values as an HP-IB `FORM#` block, `#A<u16 length><bytes>`. The
/// length field uses the same byte order as the elements.
pub fn to_bytes_hp<T: Element>(values: &[T], order: ByteOrder) -> Vec<u8> {
    let nbytes = (values.len() * T::SIZE) as u16;
    let mut out = Vec::with_capacity(4 + nbytes as usize);
    out.extend(b"#A");
    nbytes.put(order.big(), &mut out);
    out.append(&mut raw_bytes(values, order));
    out
}

/// Decode an HP-IB `FORM#` block.
pub fn from_bytes_hp<T: Element>(buffer: &[u8], order: ByteOrder) -> Result<Vec<T>> {
    let offset = buffer
        .windows(2)
        .position(|w| w == b"#A")
        .ok_or_else(|| Error::Protocol("cannot find the #A characters of an HP block".to_string()))?;

    let length = buffer
        .get(offset + 2..offset + 4)
        .ok_or_else(|| Error::Protocol("the characters after #A are not a 16-bit length".to_string()))?;
    let nbytes = u16::take(length, order.big()) as usize;

    let start = offset + 4;
    let data = buffer
        .get(start..start + nbytes)
        .ok_or_else(|| Error::Protocol("HP block is shorter than its length field".to_string()))?;
    Ok(raw_values(&data[..data.len() - data.len() % T::SIZE], order))
}

/// Encode values with no block header.
pub fn to_bytes_raw<T: Element>(values: &[T], order: ByteOrder) -> Vec<u8> {
    raw_bytes(values, order)
}

/// Decode a headerless byte block. The buffer length must be a multiple of
/// the element size.
pub fn from_bytes_raw<T: Element>(buffer: &[u8], order: ByteOrder) -> Result<Vec<T>> {
    if buffer.len() % T::SIZE != 0 {
        return Err(Error::Protocol(format!(
            "buffer of {} bytes is not a multiple of the {}-byte element size",
            buffer.len(),
            T::SIZE
        )));
    }
    Ok(raw_values(buffer, order))
}

/// Number formatting for [`to_bytes_ascii`], parsed from a `printf`-like
/// specification such as `.2e` or `.6f`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsciiFormat {
    pub precision: Option<usize>,
    pub notation: Notation,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Notation {
    /// `format!("{}")`
    #[default]
    Plain,
    /// lower-case scientific, `1.23e4`
    Scientific,
    /// upper-case scientific, `1.23E4`
    ScientificUpper,
    /// fixed-point
    Fixed,
}

impl AsciiFormat {
    /// Parse a format specification. Any byte-order prefix (`@=<>!`) is
    /// ignored, matching how the other block formats treat their dtype.
    pub fn parse(spec: &str) -> Result<AsciiFormat> {
        let spec = spec.trim_start_matches(['@', '=', '<', '>', '!']);
        let mut format = AsciiFormat::default();
        let mut rest = spec;
        if let Some(tail) = rest.strip_prefix('.') {
            let digits: String = tail.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return Err(Error::Protocol(format!("invalid format spec {spec:?}")));
            }
            format.precision = Some(digits.parse().unwrap());
            rest = &tail[digits.len()..];
        }
        format.notation = match rest {
            "" | "d" | "g" => Notation::Plain,
            "e" => Notation::Scientific,
            "E" => Notation::ScientificUpper,
            "f" => Notation::Fixed,
            _ => return Err(Error::Protocol(format!("invalid format spec {spec:?}"))),
        };
        Ok(format)
    }

    fn push(self, value: f64, out: &mut String) {
        match (self.notation, self.precision) {
            (Notation::Plain, None) => write!(out, "{value}"),
            (Notation::Plain, Some(p)) => write!(out, "{value:.p$}"),
            (Notation::Scientific, None) => write!(out, "{value:e}"),
            (Notation::Scientific, Some(p)) => write!(out, "{value:.p$e}"),
            (Notation::ScientificUpper, None) => write!(out, "{value:E}"),
            (Notation::ScientificUpper, Some(p)) => write!(out, "{value:.p$E}"),
            (Notation::Fixed, None) => write!(out, "{value:.6}"),
            (Notation::Fixed, Some(p)) => write!(out, "{value:.p$}"),
        }
        .expect("writing to a String cannot fail");
    }
}

/// Encode values as comma-separated ASCII.
pub fn to_bytes_ascii<T: Into<f64> + Copy>(values: &[T], format: AsciiFormat) -> Vec<u8> {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        format.push((*value).into(), &mut out);
    }
    out.into_bytes()
}

/// Decode comma-separated ASCII values. Whitespace around each element is
/// ignored and an empty buffer yields an empty array.
pub fn from_bytes_ascii(buffer: &[u8]) -> Result<Vec<f64>> {
    let text = std::str::from_utf8(buffer)
        .map_err(|_| Error::Protocol("ASCII data block is not valid UTF-8".to_string()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|item| {
            item.trim()
                .parse()
                .map_err(|_| Error::Protocol(format!("cannot parse {item:?} as a number")))
        })
        .collect()
}
