//! Fetch and parse the LXI identification document of a device.
//!
//! The document lives at `http://<host>[:port]/lxi/identification`
//! (LXI Device Specification 2022, Section 10.2). Devices without the
//! endpoint fall back to the `<title>` of their homepage. The XML subset
//! used by identification documents is small, so a hand-written scanner
//! is used rather than a DOM library; it tolerates namespace prefixes
//! and malformed markup.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    transport::TcpTransport,
};

/// One network interface advertised by an LXI device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LxiInterface {
    /// `LXI` for LXI devices; vendors may use GPIB, USB, Serial, ...
    pub interface_type: String,
    /// VISA-style addresses the interface supports
    pub addresses: Vec<String>,
    pub mac_address: String,
    pub hostname: String,
}

/// The identification record of an LXI device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LxiDevice {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    /// The manufacturer description, or the webpage title when only an
    /// HTML homepage is available
    pub description: String,
    pub firmware: String,
    pub interfaces: Vec<LxiInterface>,
}

/// Issue a plain HTTP/1.0 GET and return the status code and body.
async fn http_get(host: &str, port: u16, path: &str, timeout: Option<Duration>) -> Result<(u16, String)> {
    let mut transport = TcpTransport::new(host, port);
    transport.connect(timeout).await?;

    let request = format!(
        "GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\nAccept: */*\r\n\r\n"
    );
    transport.send_all(request.as_bytes()).await?;

    let budget = crate::message::TimeBudget::new(timeout);
    let mut response = vec![];
    let mut chunk = [0u8; 4096];
    loop {
        let received = budget.run(transport.recv(&mut chunk)).await?;
        if received == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..received]);
    }

    let text = String::from_utf8_lossy(&response).into_owned();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed HTTP response from {host}:{port}")))?;
    let body = match text.find("\r\n\r\n") {
        Some(index) => text[index + 4..].to_string(),
        None => String::new(),
    };
    Ok((status, body))
}

/// Get the identification record from a device's webserver.
pub async fn parse_lxi_webserver(
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<LxiDevice> {
    let (status, body) = http_get(host, port, "/lxi/identification", timeout).await?;
    if status == 404 {
        // no XML document, parse the homepage instead
        let (_, body) = http_get(host, port, "/", timeout).await?;
        return Ok(parse_html(&body));
    }
    match parse_xml(&body) {
        Some(device) => Ok(device),
        // some webservers redirect invalid URLs to the homepage instead
        // of replying 404
        None => Ok(parse_html(&body)),
    }
}

/// The local part of a possibly namespace-prefixed tag name.
fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}

/// A `(attributes, inner-text)` pair for one XML element.
type Element<'a> = (&'a str, &'a str);

/// Find every element whose local tag name matches, returning its
/// attribute string and inner markup. Elements of the same name are
/// assumed not to nest.
fn elements<'a>(xml: &'a str, name: &str) -> Vec<Element<'a>> {
    let mut found = vec![];
    let mut rest = xml;
    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find('>') else { break };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        if tag.starts_with(['/', '?', '!']) {
            continue;
        }
        let tag = tag.strip_suffix('/').unwrap_or(tag);
        let (tag_name, attributes) = match tag.find(char::is_whitespace) {
            Some(index) => (&tag[..index], tag[index..].trim()),
            None => (tag, ""),
        };
        if local_name(tag_name) != name {
            continue;
        }

        // inner text runs to the matching close tag
        let inner = match rest.find("</") {
            Some(mut close) => {
                // skip close tags of other (nested) element names
                loop {
                    let after = &rest[close + 2..];
                    let close_name = after.split('>').next().unwrap_or("");
                    if local_name(close_name.trim()) == name {
                        break &rest[..close];
                    }
                    match after.find("</") {
                        Some(next) => close = close + 2 + next,
                        None => break &rest[..close],
                    }
                }
            }
            None => rest,
        };
        found.push((attributes, inner));
        rest = &rest[inner.len()..];
    }
    found
}

fn first_text(xml: &str, name: &str) -> Option<String> {
    elements(xml, name)
        .first()
        .map(|(_, inner)| inner.trim().to_string())
}

fn attribute<'a>(attributes: &'a str, name: &str) -> Option<&'a str> {
    let index = attributes.find(name)?;
    let rest = &attributes[index + name.len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    rest.find(quote).map(|end| &rest[..end])
}

/// Parse an LXI identification XML document. Returns `None` when the
/// content is not such a document.
pub fn parse_xml(content: &str) -> Option<LxiDevice> {
    let (_, root) = elements(content, "LXIDevice").into_iter().next()?;

    let mut device = LxiDevice {
        manufacturer: first_text(root, "Manufacturer").unwrap_or_default(),
        model: first_text(root, "Model").unwrap_or_default(),
        serial: first_text(root, "SerialNumber").unwrap_or_default(),
        description: first_text(root, "ManufacturerDescription").unwrap_or_default(),
        firmware: first_text(root, "FirmwareRevision").unwrap_or_default(),
        interfaces: vec![],
    };

    for (attributes, inner) in elements(root, "Interface") {
        device.interfaces.push(LxiInterface {
            interface_type: attribute(attributes, "InterfaceType").unwrap_or("").to_string(),
            addresses: elements(inner, "InstrumentAddressString")
                .into_iter()
                .map(|(_, text)| text.trim().to_string())
                .filter(|text| !text.is_empty())
                .collect(),
            mac_address: first_text(inner, "MACAddress").unwrap_or_default(),
            hostname: first_text(inner, "Hostname").unwrap_or_default(),
        });
    }

    Some(device)
}

/// Fall back to the `<title>` of an HTML homepage as the description.
pub fn parse_html(content: &str) -> LxiDevice {
    let lowered = content.to_ascii_lowercase();
    let device = LxiDevice::default();
    let Some(start) = lowered.find("<title>") else {
        return device;
    };
    let Some(length) = lowered[start + 7..].find("</title>") else {
        return device;
    };
    LxiDevice {
        description: content[start + 7..start + 7 + length].trim().to_string(),
        ..device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTIFICATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<LXIDevice xmlns="http://www.lxistandard.org/InstrumentIdentification/1.0">
  <Manufacturer>Keysight Technologies</Manufacturer>
  <Model>34465A</Model>
  <SerialNumber>MY12345678</SerialNumber>
  <FirmwareRevision>A.03.02</FirmwareRevision>
  <ManufacturerDescription>Digital Multimeter</ManufacturerDescription>
  <Interface InterfaceType="LXI" InterfaceName="eth0">
    <InstrumentAddressString>TCPIP::10.0.0.7::inst0::INSTR</InstrumentAddressString>
    <InstrumentAddressString>TCPIP::10.0.0.7::hislip0::INSTR</InstrumentAddressString>
    <MACAddress>00-11-22-33-44-55</MACAddress>
    <Hostname>K-34465A-45678</Hostname>
  </Interface>
  <Interface InterfaceType="USB">
    <InstrumentAddressString>USB::0x2A8D::0x0101::MY12345678::INSTR</InstrumentAddressString>
  </Interface>
</LXIDevice>"#;

    #[test]
    fn identification_document() {
        let device = parse_xml(IDENTIFICATION).unwrap();
        assert_eq!(device.manufacturer, "Keysight Technologies");
        assert_eq!(device.model, "34465A");
        assert_eq!(device.serial, "MY12345678");
        assert_eq!(device.firmware, "A.03.02");
        assert_eq!(device.description, "Digital Multimeter");

        assert_eq!(device.interfaces.len(), 2);
        let lxi = &device.interfaces[0];
        assert_eq!(lxi.interface_type, "LXI");
        assert_eq!(
            lxi.addresses,
            [
                "TCPIP::10.0.0.7::inst0::INSTR",
                "TCPIP::10.0.0.7::hislip0::INSTR"
            ]
        );
        assert_eq!(lxi.mac_address, "00-11-22-33-44-55");
        assert_eq!(lxi.hostname, "K-34465A-45678");
        assert_eq!(device.interfaces[1].interface_type, "USB");
    }

    #[test]
    fn namespace_prefixes_are_ignored() {
        let content = r#"<lxi:LXIDevice xmlns:lxi="urn:x"><lxi:Manufacturer>X</lxi:Manufacturer>
            <lxi:Model>Y</lxi:Model></lxi:LXIDevice>"#;
        let device = parse_xml(content).unwrap();
        assert_eq!(device.manufacturer, "X");
        assert_eq!(device.model, "Y");
    }

    #[test]
    fn not_an_identification_document() {
        assert!(parse_xml("<html><body>hello</body></html>").is_none());
        assert!(parse_xml("garbage").is_none());
    }

    #[test]
    fn html_title_fallback() {
        let device = parse_html("<html><head><TITLE>\n  My Instrument </TITLE></head></html>");
        assert_eq!(device.description, "My Instrument");
        assert_eq!(parse_html("<html></html>"), LxiDevice::default());
        assert_eq!(parse_html("<title>never closed"), LxiDevice::default());
    }

    #[tokio::test]
    async fn webserver_fetch() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = IDENTIFICATION;
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /lxi/identification HTTP/1.0"));
            let response = format!("HTTP/1.0 200 OK\r\nContent-Type: text/xml\r\n\r\n{body}");
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let device = parse_lxi_webserver("127.0.0.1", port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(device.model, "34465A");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn webserver_404_falls_back_to_homepage() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).await.unwrap();
                let response = if buf[..n].starts_with(b"GET /lxi/identification") {
                    "HTTP/1.0 404 Not Found\r\n\r\n".to_string()
                } else {
                    "HTTP/1.0 200 OK\r\n\r\n<html><title>Legacy Scope</title></html>".to_string()
                };
                stream.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let device = parse_lxi_webserver("127.0.0.1", port, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(device.description, "Legacy Scope");
        server.await.unwrap();
    }
}
