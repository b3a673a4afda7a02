//! UDP forwarding for a session's public port
//!
//! Datagrams from each remote peer are queued to a forwarder of their own,
//! which carries them to the host as framed records over a dedicated data
//! channel and sends the host's replies back from the shared public socket.

mod server;

pub use server::{UdpRelayError, UdpRelayServer, DATAGRAM_OVERHEAD};
