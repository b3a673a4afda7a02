//! Relay configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default body of the response sent when an HTML page is blocked
pub const DEFAULT_FORBIDDEN_HTML_MESSAGE: &str =
    "Serving web pages through this tunnel is not allowed for this key.";

/// Runtime settings shared by every component of a relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Where hosts open their control channel
    pub control_addr: SocketAddr,
    /// Where hosts dial back data channels
    pub transfer_addr: SocketAddr,
    /// Host name shown to hosts in the connect line
    pub public_host: String,
    /// Address public listeners bind to
    pub bind_ip: IpAddr,
    /// Host versions allowed to connect; empty accepts any version
    pub accepted_versions: Vec<String>,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    /// How long a forwarder waits for its data channel
    pub rendezvous_timeout: Duration,
    /// How long a fresh connection may take to send its greeting
    pub handshake_timeout: Duration,
    pub accept_delay: Duration,
    pub peek_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub udp_queue_capacity: usize,
    pub flush_interval: Duration,
    pub forbidden_html_message: String,
    /// Banned IPs and CIDR ranges
    pub banned: Vec<String>,
    /// Surface pump I/O errors instead of treating them as normal termination
    pub debug: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 44801),
            transfer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 44802),
            public_host: "localhost".to_string(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            accepted_versions: vec![env!("CARGO_PKG_VERSION").to_string()],
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_check_interval: Duration::from_secs(5),
            rendezvous_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            accept_delay: Duration::from_millis(50),
            peek_timeout: Duration::from_millis(200),
            udp_idle_timeout: Duration::from_secs(60),
            udp_queue_capacity: 100,
            flush_interval: Duration::from_secs(30),
            forbidden_html_message: DEFAULT_FORBIDDEN_HTML_MESSAGE.to_string(),
            banned: Vec::new(),
            debug: false,
        }
    }
}

impl RelayConfig {
    pub fn accepts_version(&self, version: &str) -> bool {
        self.accepted_versions.is_empty() || self.accepted_versions.iter().any(|v| v == version)
    }
}
