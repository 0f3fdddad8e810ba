//! Discovery of Prologix GPIB-ETHERNET controllers.
//!
//! Every host of each interface's /24 network is probed with a TCP
//! connection to the controller port; anything that answers `++ver` with
//! a reply starting with `Prologix` is a controller. The MAC address is
//! recovered from the system `arp` table when possible.

use std::{collections::BTreeMap, time::Duration};

use futures::future::join_all;
use log::{debug, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::Command,
};

use crate::discovery::DiscoveredDevice;

/// The fixed port of a Prologix GPIB-ETHERNET controller.
pub const PROLOGIX_PORT: u16 = 1234;

/// Extract a MAC address from one line of `arp` output, tolerating the
/// single-digit groups that some platforms print.
fn find_mac(text: &str) -> Option<String> {
    for token in text.split_whitespace() {
        let separator = if token.contains(':') {
            ':'
        } else if token.contains('-') {
            '-'
        } else {
            continue;
        };
        let groups: Vec<&str> = token.split(separator).collect();
        if groups.len() != 6 {
            continue;
        }
        if !groups
            .iter()
            .all(|g| (1..=2).contains(&g.len()) && g.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            continue;
        }
        let mac: Vec<String> = groups
            .iter()
            .map(|g| {
                if g.len() == 1 {
                    format!("0{g}")
                } else {
                    (*g).to_string()
                }
            })
            .collect();
        return Some(mac.join("-"));
    }
    None
}

/// Look up the MAC address of a host in the system arp table.
async fn arp_lookup(host: &str) -> Option<String> {
    let option = if cfg!(target_os = "windows") { "-a" } else { "-n" };
    let output = Command::new("arp").arg(option).arg(host).output().await.ok()?;
    if !output.stderr.is_empty() {
        return None;
    }
    find_mac(&String::from_utf8_lossy(&output.stdout))
}

async fn probe(host: String, port: u16, timeout: Duration) -> Option<(String, DiscoveredDevice)> {
    let connect = TcpStream::connect((host.as_str(), port));
    let stream = tokio::time::timeout(timeout, connect).await.ok()?.ok()?;

    let mut stream = BufReader::new(stream);
    stream.get_mut().write_all(b"++ver\n").await.ok()?;

    let mut reply = String::new();
    let _ = tokio::time::timeout(timeout, stream.read_line(&mut reply))
        .await
        .ok()?
        .ok()?;
    if !reply.starts_with("Prologix") {
        return None;
    }

    let mut description = reply.trim_end().to_string();
    debug!("found {description} at {host}");

    let mut names = vec![host.clone()];
    if let Some(mac) = arp_lookup(&host).await {
        description.push_str(&format!(" (MAC Address: {mac})"));
        names.push(format!("prologix-{mac}"));
    }
    names.sort();

    Some((
        host,
        DiscoveredDevice {
            webserver: String::new(),
            description,
            addresses: names
                .into_iter()
                .map(|name| format!("Prologix::{name}::{port}::GPIB::<PAD>[::<SAD>]"))
                .collect(),
        },
    ))
}

/// Find Prologix GPIB-ETHERNET controllers on the /24 networks of the
/// given interface addresses.
pub async fn find_prologix(
    interfaces: &[String],
    port: u16,
    timeout: Duration,
) -> BTreeMap<String, DiscoveredDevice> {
    debug!("find Prologix controllers: interfaces={interfaces:?}, timeout={timeout:?}");

    let mut tasks = vec![];
    for interface in interfaces {
        let mut octets = interface.split('.');
        let (Some(a), Some(b), Some(c)) = (octets.next(), octets.next(), octets.next()) else {
            warn!("cannot derive a network from the interface address {interface:?}");
            continue;
        };
        let network = format!("{a}.{b}.{c}");
        tasks.extend((1..255).map(|d| probe(format!("{network}.{d}"), port, timeout)));
    }

    join_all(tasks).await.into_iter().flatten().collect()
}
