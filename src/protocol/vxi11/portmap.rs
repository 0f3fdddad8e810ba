//! RPC port-mapper client, RFC 1833.

use std::time::Duration;

use crate::error::{Error, Result};

use super::{
    onc::RpcClient,
    xdr::{XdrPack, XdrReader},
};

pub const PMAP_PROG: u32 = 100000;
pub const PMAP_VERS: u32 = 2;
pub const PMAP_PORT: u16 = 111;

const PMAPPROC_GETPORT: u32 = 3;

/// Socket protocol family of the program being looked up.
#[derive(Clone, Copy, Debug)]
#[repr(u32)]
pub enum IpProtocol {
    Tcp = 6,
    Udp = 17,
}

fn append_mapping(client: &mut RpcClient, prog: u32, vers: u32, protocol: IpProtocol) {
    let mut mapping = vec![];
    prog.pack_xdr(&mut mapping);
    vers.pack_xdr(&mut mapping);
    (protocol as u32).pack_xdr(&mut mapping);
    0u32.pack_xdr(&mut mapping); // port is ignored for GETPORT
    client.append(&mapping);
}

/// Ask the port mapper on `host` which port a program is served on.
///
/// Opens its own TCP connection to port 111 and closes it afterwards.
/// A mapped port of 0 means the program is not registered.
pub async fn get_port(
    host: &str,
    prog: u32,
    vers: u32,
    protocol: IpProtocol,
    timeout: Option<Duration>,
) -> Result<u16> {
    get_port_at(host, PMAP_PORT, prog, vers, protocol, timeout).await
}

/// [`get_port`] against a port mapper that is not listening on port 111.
pub async fn get_port_at(
    host: &str,
    pmap_port: u16,
    prog: u32,
    vers: u32,
    protocol: IpProtocol,
    timeout: Option<Duration>,
) -> Result<u16> {
    let mut client = RpcClient::new(host);
    client.set_timeout(timeout);
    client.connect(pmap_port).await?;

    client.init(PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT);
    append_mapping(&mut client, prog, vers, protocol);
    client.write().await?;
    let reply = client.read().await;
    client.close();

    let port = XdrReader::new(&reply?).u16()?;
    if port == 0 {
        return Err(Error::Connection(format!(
            "the port mapper on {host} has no port for program {prog}"
        )));
    }
    Ok(port)
}

/// Build a GETPORT call message for a UDP broadcast, where no record
/// marking is used. Returns the transaction id and the message.
pub(crate) fn getport_broadcast_message(prog: u32, vers: u32, protocol: IpProtocol) -> (u32, Vec<u8>) {
    let mut client = RpcClient::new("");
    client.init(PMAP_PROG, PMAP_VERS, PMAPPROC_GETPORT);
    append_mapping(&mut client, prog, vers, protocol);
    (client.xid(), client.buffer().to_vec())
}
