//! Public port assignment

use crate::error::SessionError;
use burrow_quota::PortPolicy;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

/// A public port with both of its sockets already bound
#[derive(Debug)]
pub struct BoundPort {
    pub port: u16,
    pub tcp: TcpListener,
    pub udp: UdpSocket,
}

/// Bind the first candidate port of `policy` that is free for both TCP and UDP
///
/// Candidates are tried in ascending order. `reserved` lets the caller skip
/// ports that belong to another session even if nothing is bound on them
/// right now, e.g. while that session's TCP side is toggled off.
pub async fn assign_port(
    policy: &PortPolicy,
    bind_ip: IpAddr,
    reserved: impl Fn(u16) -> bool,
) -> Result<BoundPort, SessionError> {
    for port in policy.candidates() {
        if reserved(port) {
            continue;
        }
        if let Some(bound) = try_bind(bind_ip, port).await {
            debug!("Assigned port {} from policy {}", port, policy);
            return Ok(bound);
        }
    }

    Err(SessionError::PortConflict(match policy {
        PortPolicy::Single(port) => format!("port {} is in use", port),
        PortPolicy::Range { start, end } => format!("no free port in {}-{}", start, end),
    }))
}

/// Bind both sockets on one port, or neither
pub async fn try_bind(bind_ip: IpAddr, port: u16) -> Option<BoundPort> {
    let addr = SocketAddr::new(bind_ip, port);
    let tcp = TcpListener::bind(addr).await.ok()?;
    let udp = UdpSocket::bind(addr).await.ok()?;
    Some(BoundPort { port, tcp, udp })
}
