//! Network discovery of instruments: mDNS/DNS-SD, VXI-11 port-mapper
//! broadcast and Prologix controller scans.

use std::{collections::BTreeMap, time::Duration};

use log::warn;
use tokio::process::Command;

pub mod dns_sd;
pub mod lxi;
pub mod prologix;
pub mod vxi11;

pub use dns_sd::find_lxi;
pub use lxi::{LxiDevice, LxiInterface};
pub use prologix::{find_prologix, PROLOGIX_PORT};
pub use vxi11::find_vxi11;

/// A device found on the network.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// URL of the device webserver, when it has one
    pub webserver: String,
    pub description: String,
    /// VISA-style addresses the device can be reached at
    pub addresses: Vec<String>,
}

/// The result of searching all discovery protocols at once.
#[derive(Clone, Debug, Default)]
pub struct Discovered {
    /// mDNS/DNS-SD devices, keyed by IPv4 address
    pub lxi: BTreeMap<String, DiscoveredDevice>,
    /// VXI-11 devices found via the port-mapper broadcast
    pub vxi11: BTreeMap<String, DiscoveredDevice>,
    /// Prologix GPIB-ETHERNET controllers
    pub prologix: BTreeMap<String, DiscoveredDevice>,
}

/// The IPv4 addresses of the local network interfaces, excluding
/// loopback. An empty set means enumeration is not supported here.
pub async fn ipv4_addresses() -> Vec<String> {
    let output = if cfg!(target_os = "linux") {
        Command::new("hostname").arg("--all-ip-addresses").output().await
    } else {
        Command::new("ifconfig").output().await
    };
    let Ok(output) = output else {
        warn!("cannot enumerate the network interfaces");
        return vec![];
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let mut addresses: Vec<String> = text
        .split_whitespace()
        .filter(|token| {
            token.split('.').count() == 4
                && token.split('.').all(|octet| octet.parse::<u8>().is_ok())
        })
        .map(str::to_string)
        .filter(|address| address != "127.0.0.1")
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

/// Run every discovery protocol concurrently over the given interface
/// addresses (all local interfaces when `None`) and collect the results.
pub async fn find_all(interfaces: Option<&[String]>, timeout: Duration) -> Discovered {
    let interfaces = match interfaces {
        Some(interfaces) => interfaces.to_vec(),
        None => ipv4_addresses().await,
    };

    let (lxi, vxi11, prologix) = tokio::join!(
        dns_sd::find_lxi(&interfaces, timeout),
        vxi11::find_vxi11(&interfaces, timeout),
        prologix::find_prologix(&interfaces, PROLOGIX_PORT, timeout),
    );

    Discovered {
        lxi,
        vxi11,
        prologix,
    }
}
