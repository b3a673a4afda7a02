//! TCP forwarding for a session's public port
//!
//! Every client accepted on the public port gets its own data channel from
//! the host. Bytes are pumped both ways, metered against the session's key
//! and throttled to the key's rate.

mod filter;
mod server;

pub use filter::{forbidden_response, is_html_response, request_line};
pub use server::{TcpProxyServer, TcpProxyServerError};
