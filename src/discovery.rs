//! LAN discovery: a client broadcasts a single magic-byte datagram, servers
//! answer with an application-supplied opaque payload. Neither direction
//! goes through the object serializer, so discovery works without any class
//! registration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// One responding server, with the opaque bytes it answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub addr: SocketAddr,
    pub response: Vec<u8>,
}

async fn send_probes(magic: u8, udp_port: u16) -> anyhow::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let probe = [magic];
    // limited broadcast for the LAN, loopback for servers on this host
    for target in [Ipv4Addr::BROADCAST, Ipv4Addr::LOCALHOST] {
        if let Err(e) = socket.send_to(&probe, (target, udp_port)).await {
            debug!("discovery probe to {} not sent: {}", target, e);
        }
    }
    Ok(socket)
}

/// Returns the address of the first server answering a probe on `udp_port`,
/// or `None` when the timeout elapses first.
pub async fn discover_host(
    magic: u8,
    udp_port: u16,
    timeout: Duration,
) -> anyhow::Result<Option<SocketAddr>> {
    let socket = send_probes(magic, udp_port).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 2048];
    match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
        Err(_elapsed) => Ok(None),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok((len, from))) => {
            trace!("discovery response from {:?}: {} bytes", from, len);
            Ok(Some(from))
        }
    }
}

/// Collects every server answering a probe on `udp_port` until the timeout
/// elapses. Servers reached through more than one probe are reported once.
pub async fn discover_hosts(
    magic: u8,
    udp_port: u16,
    timeout: Duration,
) -> anyhow::Result<Vec<DiscoveredHost>> {
    let socket = send_probes(magic, udp_port).await?;
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 2048];
    let mut hosts: Vec<DiscoveredHost> = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_elapsed) => return Ok(hosts),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok((len, from))) => {
                trace!("discovery response from {:?}: {} bytes", from, len);
                if hosts.iter().all(|h| h.addr != from) {
                    hosts.push(DiscoveredHost {
                        addr: from,
                        response: buf[..len].to_vec(),
                    });
                }
            }
        }
    }
}
