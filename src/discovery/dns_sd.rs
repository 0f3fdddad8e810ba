//! Multicast DNS and DNS-Based Service Discovery of LXI devices.
//!
//! References: RFC 1035 (message format), RFC 6762 (multicast DNS),
//! RFC 6763 (service discovery) and the LXI Device Specification 2022.

use std::{collections::BTreeSet, net::Ipv4Addr, time::Duration};

use futures::future::join_all;
use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::{
    discovery::{lxi, DiscoveredDevice},
    error::{Error, Result},
};

// RFC 6762, Section 5.1
const MDNS_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

const HTTP_PORT: u16 = 80;
const HISLIP_PORT: u16 = 4880;
const VXI11_PORT: u16 = 111;

/// The service names LXI devices register.
const SERVICES: [&str; 6] = [
    // VXI-11 Discovery and Identification Extended Function, Section 10.1.5
    "_vxi-11._tcp.local.",
    // LXI HiSLIP Extended Function, Section 20.7.1
    "_hislip._tcp.local.",
    // LXI Device Specification 2022, Section 10.4.3
    "_http._tcp.local.",
    "_lxi._tcp.local.",
    "_scpi-raw._tcp.local.",
    "_scpi-telnet._tcp.local.",
];

// resource record types
const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_TXT: u16 = 16;
const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 1;

/// The data of one resource record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordData {
    /// A domain-name pointer, RFC 1035 Section 3.3.12
    Pointer(String),
    /// A service location, RFC 2782
    Service {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// Key=value strings, RFC 1035 Section 3.3.14
    Text(Vec<(String, String)>),
    /// An IPv4 host address, RFC 1035 Section 3.4.1
    HostAddress([u8; 4]),
    /// Anything this client does not interpret
    Other(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub record_type: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: Option<RecordData>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub question_type: u16,
    pub class: u16,
}

/// One parsed DNS message.
#[derive(Clone, Debug, Default)]
pub struct DnsRecord {
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}
impl<'a> Cursor<'a> {
    fn get(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.offset + length;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| Error::Protocol("truncated DNS message".to_string()))?;
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.get(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.get(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.get(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decode a domain name, following compression pointers
    /// (RFC 1035, Section 4.1.4). The trailing root label becomes a
    /// trailing dot.
    fn name(&mut self) -> Result<String> {
        let mut labels: Vec<String> = vec![];
        let mut jumps = 0;
        let mut return_offset = None;
        loop {
            let length = self.u8()?;
            if length == 0 {
                labels.push(String::new());
                break;
            }
            if length & 0b1100_0000 != 0 {
                // a 14-bit pointer into the message
                jumps += 1;
                if jumps > 64 {
                    return Err(Error::Protocol("DNS name pointer loop".to_string()));
                }
                let low = self.u8()?;
                let pointer = (usize::from(length & 0b0011_1111) << 8) | usize::from(low);
                return_offset.get_or_insert(self.offset);
                self.offset = pointer;
                continue;
            }
            let label = self.get(usize::from(length))?;
            labels.push(String::from_utf8_lossy(label).into_owned());
        }
        if let Some(offset) = return_offset {
            self.offset = offset;
        }
        Ok(labels.join("."))
    }

    fn question(&mut self) -> Result<Question> {
        Ok(Question {
            name: self.name()?,
            question_type: self.u16()?,
            class: self.u16()?,
        })
    }

    fn resource_record(&mut self) -> Result<ResourceRecord> {
        let name = self.name()?;
        let record_type = self.u16()?;
        let class = self.u16()?;
        let ttl = self.u32()?;
        let data_length = usize::from(self.u16()?);

        if data_length == 0 {
            return Ok(ResourceRecord {
                name,
                record_type,
                class,
                ttl,
                data: None,
            });
        }

        let data = match record_type {
            TYPE_PTR => RecordData::Pointer(self.name()?),
            TYPE_SRV => RecordData::Service {
                priority: self.u16()?,
                weight: self.u16()?,
                port: self.u16()?,
                target: self.name()?,
            },
            TYPE_TXT => {
                let stop = self.offset + data_length;
                let mut pairs = vec![];
                while self.offset < stop {
                    let length = usize::from(self.u8()?);
                    let text = String::from_utf8_lossy(self.get(length)?).into_owned();
                    let (key, value) = text.split_once('=').unwrap_or((text.as_str(), ""));
                    pairs.push((key.to_string(), value.to_string()));
                }
                RecordData::Text(pairs)
            }
            TYPE_A => {
                let bytes = self.get(4)?;
                RecordData::HostAddress([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            _ => RecordData::Other(self.get(data_length)?.to_vec()),
        };

        Ok(ResourceRecord {
            name,
            record_type,
            class,
            ttl,
            data: Some(data),
        })
    }
}

impl DnsRecord {
    /// Parse a DNS reply, RFC 1035 Section 4.1.
    pub fn parse(reply: &[u8]) -> Result<DnsRecord> {
        let mut cursor = Cursor {
            data: reply,
            offset: 0,
        };

        let transaction_id = cursor.u16()?;
        if transaction_id != 0 {
            return Err(Error::Protocol(format!(
                "unexpected DNS transaction id {transaction_id}"
            )));
        }
        let flags = cursor.u16()?;
        // QR=1 (response), AA=1 (authoritative)
        if flags & 0b1000_0100_0000_0000 == 0 {
            return Err(Error::Protocol(format!("unexpected DNS flags {flags:#06x}")));
        }

        let question_count = cursor.u16()?;
        let answer_count = cursor.u16()?;
        let authority_count = cursor.u16()?;
        let additional_count = cursor.u16()?;

        let mut record = DnsRecord::default();
        for _ in 0..question_count {
            record.questions.push(cursor.question()?);
        }
        for _ in 0..answer_count {
            record.answers.push(cursor.resource_record()?);
        }
        for _ in 0..authority_count {
            record.authority.push(cursor.resource_record()?);
        }
        for _ in 0..additional_count {
            record.additional.push(cursor.resource_record()?);
        }
        Ok(record)
    }
}

/// Build the one-shot query carrying a PTR question per LXI service.
pub(crate) fn query_message() -> Vec<u8> {
    let mut message = vec![];
    message.extend(0u16.to_be_bytes()); // transaction id
    message.extend(0u16.to_be_bytes()); // flags: standard query
    message.extend((SERVICES.len() as u16).to_be_bytes());
    message.extend(0u16.to_be_bytes());
    message.extend(0u16.to_be_bytes());
    message.extend(0u16.to_be_bytes());
    for service in SERVICES {
        for label in service.split('.') {
            message.push(label.len() as u8);
            message.extend(label.as_bytes());
        }
        message.extend(TYPE_PTR.to_be_bytes());
        message.extend(CLASS_IN.to_be_bytes());
    }
    message
}

/// What a reply tells us about one device before any webserver lookup.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ReplySummary {
    pub addresses: BTreeSet<String>,
    /// The port of the `_lxi._tcp` webserver, when one was advertised
    pub lxi_port: Option<u16>,
    /// Whether an `_lxi`/`_http` answer suggests fetching the
    /// identification document even though no `_lxi` SRV record exists
    pub fetch_identification: bool,
}

/// Derive VISA addresses from the SRV records of a reply,
/// LXI Device Specification 2022 Section 10.4.3.
pub(crate) fn summarize_reply(ip: &str, record: &DnsRecord) -> ReplySummary {
    let mut summary = ReplySummary::default();

    for additional in &record.additional {
        let Some(RecordData::Service { port, .. }) = &additional.data else {
            continue;
        };
        let port = *port;
        if additional.name.ends_with("_scpi-raw._tcp.local.") {
            let _ = summary.addresses.insert(format!("TCPIP::{ip}::{port}::SOCKET"));
        } else if additional.name.ends_with("_vxi-11._tcp.local.") {
            let suffix = if port == VXI11_PORT {
                String::new()
            } else {
                format!(",{port}")
            };
            let _ = summary
                .addresses
                .insert(format!("TCPIP::{ip}::inst0{suffix}::INSTR"));
        } else if additional.name.ends_with("_hislip._tcp.local.") {
            let suffix = if port == HISLIP_PORT {
                String::new()
            } else {
                format!(",{port}")
            };
            let _ = summary
                .addresses
                .insert(format!("TCPIP::{ip}::hislip0{suffix}::INSTR"));
        } else if additional.name.ends_with("_lxi._tcp.local.") {
            summary.lxi_port = Some(port);
        }
    }

    if summary.lxi_port.is_none() {
        summary.fetch_identification = record.answers.iter().any(|answer| {
            answer.name == "_lxi._tcp.local." || answer.name == "_http._tcp.local."
        });
    }
    summary
}

/// The `http://host[:port]` form, eliding the default port.
fn webserver_url(ip: &str, port: u16) -> String {
    if port == HTTP_PORT {
        format!("http://{ip}")
    } else {
        format!("http://{ip}:{port}")
    }
}

async fn discover(interface_ip: String, timeout: Duration) -> Vec<(String, DiscoveredDevice)> {
    let mut found = vec![];
    let socket = match UdpSocket::bind((interface_ip.as_str(), 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot bind the mDNS socket on {interface_ip}: {e}");
            return found;
        }
    };
    let _ = socket.set_multicast_loop_v4(true);
    let _ = socket.set_multicast_ttl_v4(255);
    if let Err(e) = socket.send_to(&query_message(), (MDNS_ADDR, MDNS_PORT)).await {
        warn!("cannot send the mDNS query on {interface_ip}: {e}");
        return found;
    }

    let budget = crate::message::TimeBudget::new(Some(timeout));
    let poll = Duration::from_millis(100).min(timeout / 10);
    let mut reply = [0u8; 8192];
    loop {
        let Ok(Some(_)) = budget.remaining() else { break };
        let Ok(received) = tokio::time::timeout(poll, socket.recv_from(&mut reply)).await else {
            continue;
        };
        let Ok((length, peer)) = received else { break };

        let record = match DnsRecord::parse(&reply[..length]) {
            Ok(record) => record,
            Err(e) => {
                debug!("ignoring a DNS reply from {peer}: {e}");
                continue;
            }
        };

        let ip = peer.ip().to_string();
        let summary = summarize_reply(&ip, &record);
        let mut addresses = summary.addresses;
        let mut webserver = String::new();
        let mut description = String::new();

        // enrich from the identification document of the webserver
        let port = summary.lxi_port.unwrap_or(HTTP_PORT);
        if summary.lxi_port.is_some() || summary.fetch_identification {
            webserver = webserver_url(&ip, port);
            if let Ok(device) = lxi::parse_lxi_webserver(&ip, port, Some(timeout)).await {
                description = device.description;
                for interface in device.interfaces {
                    addresses.extend(interface.addresses);
                }
            }
        }

        if description.is_empty() {
            description = "Unknown LXI device".to_string();
        }
        found.push((
            ip,
            DiscoveredDevice {
                webserver,
                description,
                addresses: addresses.into_iter().collect(),
            },
        ));
    }
    found
}

/// Find LXI devices that answer mDNS service discovery on the given
/// interface addresses.
pub async fn find_lxi(
    interfaces: &[String],
    timeout: Duration,
) -> std::collections::BTreeMap<String, DiscoveredDevice> {
    debug!("find LXI devices: interfaces={interfaces:?}, timeout={timeout:?}");
    let tasks = interfaces
        .iter()
        .map(|ip| discover(ip.clone(), timeout))
        .collect::<Vec<_>>();
    join_all(tasks).await.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A captured reply from an instrument announcing every LXI service.
    const REPLY: &[u8] = b"\x00\x00\x84\x00\x00\x06\x00\x06\x00\x00\x00\r\x07_vxi-11\x04_tcp\x05local\x00\x00\
\x0c\x00\x01\x07_hislip\xc0\x14\x00\x0c\x00\x01\x05_http\xc0\x14\x00\x0c\x00\x01\
\x04_lxi\xc0\x14\x00\x0c\x00\x01\t_scpi-raw\xc0\x14\x00\x0c\x00\x01\x0c_scpi-telnet\
\xc0\x14\x00\x0c\x00\x01\xc02\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 0 Product Number - 0\
\xc02\xc0>\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 0 Product Number - 1\
\xc0>\xc0I\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 1 Product Number - 0\
\xc0I\xc0Y\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 2 Product Number - 7\
\xc0Y\xc0\x0c\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 9 Product Number - 9\
\xc0\x0c\xc0$\x00\x0c\x00\x01\x00\x00\x00\n\x00$!Manufacturer 6 Product Number - 2\
\xc0$\xc0x\x00!\x00\x01\x00\x00\x00\n\x00\x18\x00\x00\x00\x00\x00P\x0fX-123456-0000-0\
\xc0\x19\xc0x\x00\x10\x00\x01\x00\x00\x00\n\x00\x11\ttxtvers=1\x06path=/\xc0\xa8\x00!\x00\
\x01\x00\x00\x00\n\x00\x08\x00\x00\x00\x00\x00P\xc1\x9e\xc0\xa8\x00\x10\x00\x01\x00\
\x00\x00\n\x00u\ttxtvers=1\x15Manufacturer=ABCD1234\x0cModel=123456\x17\
SerialNumber=MY_SERIAL1/FirmwareVersion=A.00.01-02.03-04.05-06.07-08-09\xc0\xd8\x00!\x00\
\x01\x00\x00\x00\n\x00\x08\x00\x00\x00\x00\x13\xa1\xc1\x9e\xc0\xd8\x00\x10\x00\x01\x00\
\x00\x00\n\x00u\ttxtvers=1\x15Manufacturer=ABCDEFGH\x0cModel=987654\x17\
SerialNumber=MY_SERIAL2/FirmwareVersion=B.10.11-12.13-14.15-16.17-18-19\xc1\x08\x00!\x00\
\x01\x00\x00\x00\n\x00\x08\x00\x00\x00\x00\x13\xa0\xc1\x9e\xc1\x08\x00\x10\x00\x01\x00\
\x00\x00\n\x00u\ttxtvers=1\x15Manufacturer=AAAAAAAA\x0cModel=BBBBBB\x17\
SerialNumber=1234567890/FirmwareVersion=C.20.21-22.23-24.25-26.27-28-29\xc18\x00!\x00\x01\
\x00\x00\x00\n\x00\x08\x00\x00\x00\x00\x00o\xc1\x9e\xc18\x00\x10\x00\x01\x00\x00\x00\n\x00\
u\ttxtvers=1\x15Manufacturer=ZZZZzzzz\x0cModel=tuvwxy\x17SerialNumber=0123456789/\
FirmwareVersion=D-33-33-33-33-33-33-33-33-33-00\xc1h\x00!\x00\x01\x00\x00\x00\n\x00\x08\
\x00\x00\x00\x00\x13\x10\xc1\x9e\xc1h\x00\x10\x00\x01\x00\x00\x00\n\x00u\ttxtvers=1\x15\
Manufacturer=00000000\x0cModel=000000\x17SerialNumber=0000000000/\
FirmwareVersion=0000000000000000000000000000000\xc1\x9e\x00\x01\x00\x01\x00\x00\x00\n\
\x00\x04\xa9\xfed\x0f";

    #[test]
    fn parse_captured_reply() {
        let record = DnsRecord::parse(REPLY).unwrap();

        assert_eq!(record.questions.len(), 6);
        assert_eq!(record.questions[0].name, "_vxi-11._tcp.local.");
        assert_eq!(record.questions[0].question_type, TYPE_PTR);
        assert_eq!(record.questions[5].name, "_scpi-telnet._tcp.local.");

        assert_eq!(record.answers.len(), 6);
        assert_eq!(record.answers[0].name, "_http._tcp.local.");
        assert_eq!(
            record.answers[0].data,
            Some(RecordData::Pointer(
                "Manufacturer 0 Product Number - 0._http._tcp.local.".to_string()
            ))
        );
        assert_eq!(record.answers[0].ttl, 10);

        assert!(record.authority.is_empty());
        assert_eq!(record.additional.len(), 13);

        // the SRV record of the http service
        assert_eq!(
            record.additional[0].data,
            Some(RecordData::Service {
                priority: 0,
                weight: 0,
                port: 80,
                target: "X-123456-0000-0.local.".to_string()
            })
        );

        // a TXT record with LXI key=value pairs
        let Some(RecordData::Text(pairs)) = &record.additional[3].data else {
            panic!("expected a TXT record");
        };
        assert!(pairs.contains(&("Manufacturer".to_string(), "ABCD1234".to_string())));
        assert!(pairs.contains(&("SerialNumber".to_string(), "MY_SERIAL1".to_string())));

        // the A record names the device address
        assert_eq!(
            record.additional[12].data,
            Some(RecordData::HostAddress([169, 254, 100, 15]))
        );
    }

    #[test]
    fn parse_reply_without_compression_targets() {
        let reply = b"\x00\x00\x84\x00\x00\x00\x00\x02\x00\x00\x00\x00\x05_http\x04_tcp\x05local\
\x00\x00\x0c\x00\x01\x00\x00\x0e\x10\x001\x1eabcdefghijklmnopqrstuvwxyz-123\
\x05_http\x04_tcp\x05local\x00\t_services\x07_dns-sd\x04_udp\x05local\x00\
\x00\x0c\x00\x01\x00\x00\x0e\x10\x00\x12\x05_http\x04_tcp\x05local\x00";

        let record = DnsRecord::parse(reply).unwrap();
        assert!(record.questions.is_empty());
        assert_eq!(record.answers.len(), 2);
        assert_eq!(record.answers[0].name, "_http._tcp.local.");
        assert_eq!(
            record.answers[0].data,
            Some(RecordData::Pointer(
                "abcdefghijklmnopqrstuvwxyz-123._http._tcp.local.".to_string()
            ))
        );
        assert_eq!(record.answers[0].ttl, 3600);
        assert_eq!(record.answers[1].name, "_services._dns-sd._udp.local.");
        assert_eq!(
            record.answers[1].data,
            Some(RecordData::Pointer("_http._tcp.local.".to_string()))
        );
    }

    #[test]
    fn queries_are_rejected() {
        // flags of a query, not a response
        let query = query_message();
        assert!(DnsRecord::parse(&query).is_err());
    }

    #[test]
    fn derived_addresses() {
        let record = DnsRecord::parse(REPLY).unwrap();
        let summary = summarize_reply("169.254.100.15", &record);

        assert_eq!(
            summary.addresses.iter().cloned().collect::<Vec<_>>(),
            [
                "TCPIP::169.254.100.15::5025::SOCKET",
                "TCPIP::169.254.100.15::hislip0::INSTR",
                "TCPIP::169.254.100.15::inst0::INSTR",
            ]
        );
        // the _lxi._tcp service advertised its webserver on port 80
        assert_eq!(summary.lxi_port, Some(80));
        assert!(!summary.fetch_identification);
    }

    #[test]
    fn nondefault_ports_are_kept() {
        let mut record = DnsRecord::default();
        record.additional.push(ResourceRecord {
            name: "X._vxi-11._tcp.local.".to_string(),
            record_type: TYPE_SRV,
            class: CLASS_IN,
            ttl: 10,
            data: Some(RecordData::Service {
                priority: 0,
                weight: 0,
                port: 1024,
                target: "X.local.".to_string(),
            }),
        });
        record.additional.push(ResourceRecord {
            name: "X._hislip._tcp.local.".to_string(),
            record_type: TYPE_SRV,
            class: CLASS_IN,
            ttl: 10,
            data: Some(RecordData::Service {
                priority: 0,
                weight: 0,
                port: 4990,
                target: "X.local.".to_string(),
            }),
        });

        let summary = summarize_reply("10.0.0.9", &record);
        assert!(summary.addresses.contains("TCPIP::10.0.0.9::inst0,1024::INSTR"));
        assert!(summary.addresses.contains("TCPIP::10.0.0.9::hislip0,4990::INSTR"));
    }

    #[test]
    fn http_answer_triggers_identification_fetch() {
        let mut record = DnsRecord::default();
        record.answers.push(ResourceRecord {
            name: "_http._tcp.local.".to_string(),
            record_type: TYPE_PTR,
            class: CLASS_IN,
            ttl: 10,
            data: Some(RecordData::Pointer("dev._http._tcp.local.".to_string())),
        });
        let summary = summarize_reply("10.0.0.9", &record);
        assert!(summary.fetch_identification);
        assert!(summary.lxi_port.is_none());
    }

    #[test]
    fn query_message_layout() {
        let message = query_message();
        // header: id=0, flags=0, 6 questions
        assert_eq!(&message[..12], b"\x00\x00\x00\x00\x00\x06\x00\x00\x00\x00\x00\x00");
        assert_eq!(&message[12..20], b"\x07_vxi-11");
        // each question ends with QTYPE=PTR, QCLASS=IN
        assert_eq!(&message[message.len() - 4..], b"\x00\x0c\x00\x01");
    }
}
