//! VXI-11 device discovery via an RPC port-mapper broadcast.
//!
//! A `PMAPPROC_GETPORT` call for the Device Core program is broadcast
//! over UDP to port 111 (RFC 1057, Appendix A); every host that answers
//! with a non-zero port is a VXI-11 device.

use std::{collections::BTreeMap, time::Duration};

use futures::future::join_all;
use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::{
    discovery::{lxi, DiscoveredDevice},
    protocol::vxi11::{
        onc,
        portmap::{self, IpProtocol},
        rpc::{DEVICE_CORE, DEVICE_CORE_VERSION},
        xdr::XdrReader,
    },
};

const BROADCAST_ADDR: &str = "255.255.255.255";

async fn broadcast(
    interface_ip: String,
    target: (String, u16),
    timeout: Duration,
) -> Vec<(String, DiscoveredDevice)> {
    let mut found = vec![];
    let socket = match UdpSocket::bind((interface_ip.as_str(), 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cannot bind the broadcast socket on {interface_ip}: {e}");
            return found;
        }
    };
    let _ = socket.set_broadcast(true);

    let (xid, message) =
        portmap::getport_broadcast_message(DEVICE_CORE, DEVICE_CORE_VERSION, IpProtocol::Tcp);
    let (target_host, pmap_port) = target;
    if let Err(e) = socket.send_to(&message, (target_host.as_str(), pmap_port)).await {
        warn!("cannot broadcast the port-mapper call on {interface_ip}: {e}");
        return found;
    }

    let budget = crate::message::TimeBudget::new(Some(timeout));
    let poll = Duration::from_millis(100).min(timeout / 10);
    let mut reply = [0u8; 1024];
    loop {
        let Ok(Some(_)) = budget.remaining() else { break };
        let Ok(received) = tokio::time::timeout(poll, socket.recv_from(&mut reply)).await else {
            continue;
        };
        let Ok((length, peer)) = received else { break };

        // replies from anything but a port mapper are not interesting
        if peer.port() != pmap_port {
            continue;
        }
        let Ok(Some(data)) = onc::check_reply(xid, &reply[..length]) else {
            continue;
        };
        let Ok(port) = XdrReader::new(&data).u32() else {
            continue;
        };
        if port == 0 {
            // the host answered but does not serve the Device Core program
            continue;
        }

        let ip = peer.ip().to_string();
        debug!("found a VXI-11 device at {ip} (core port {port})");

        let mut addresses = std::collections::BTreeSet::new();
        let _ = addresses.insert(format!("TCPIP::{ip}::inst0::INSTR"));
        let mut description = String::new();

        if let Ok(device) = lxi::parse_lxi_webserver(&ip, 80, Some(timeout)).await {
            description = device.description.clone();
            if description.is_empty() {
                let parts: Vec<&str> = [&device.manufacturer, &device.model, &device.serial]
                    .into_iter()
                    .map(String::as_str)
                    .filter(|part| !part.is_empty())
                    .collect();
                description = parts.join(", ");
            }
            for interface in device.interfaces {
                if interface.interface_type != "LXI" {
                    continue;
                }
                addresses.extend(interface.addresses);
                if !interface.hostname.is_empty() {
                    let _ = addresses
                        .insert(format!("TCPIP::{}::inst0::INSTR", interface.hostname));
                }
            }
        }

        if description.is_empty() {
            description = "Unknown LXI device".to_string();
        }
        found.push((
            ip.clone(),
            DiscoveredDevice {
                webserver: format!("http://{ip}"),
                description,
                addresses: addresses.into_iter().collect(),
            },
        ));
    }
    found
}

/// Find VXI-11 devices by broadcasting a port-mapper call on the given
/// interface addresses.
pub async fn find_vxi11(
    interfaces: &[String],
    timeout: Duration,
) -> BTreeMap<String, DiscoveredDevice> {
    find_vxi11_at(
        interfaces,
        (BROADCAST_ADDR.to_string(), portmap::PMAP_PORT),
        timeout,
    )
    .await
}

/// [`find_vxi11`] with a configurable broadcast target.
pub async fn find_vxi11_at(
    interfaces: &[String],
    target: (String, u16),
    timeout: Duration,
) -> BTreeMap<String, DiscoveredDevice> {
    debug!("find VXI-11 devices: interfaces={interfaces:?}, timeout={timeout:?}");
    let tasks = interfaces
        .iter()
        .map(|ip| broadcast(ip.clone(), target.clone(), timeout))
        .collect::<Vec<_>>();
    join_all(tasks).await.into_iter().flatten().collect()
}
