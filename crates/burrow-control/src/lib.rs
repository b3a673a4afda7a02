//! Control plane of the relay
//!
//! Hosts authenticate on the control port and become a [`Session`]. Forwarders
//! ask their session for data channels, which hosts dial back on the shared
//! transfer port; the [`Rendezvous`] pairs the two sides by session id.

pub mod ban;
pub mod config;
pub mod error;
pub mod handler;
pub mod port;
pub mod registry;
pub mod rendezvous;
pub mod session;
pub mod transfer;

pub use ban::{BanChecker, BanList, BanListError};
pub use config::{RelayConfig, DEFAULT_FORBIDDEN_HTML_MESSAGE};
pub use error::SessionError;
pub use handler::ControlHandler;
pub use port::{assign_port, BoundPort};
pub use registry::SessionRegistry;
pub use rendezvous::{Rendezvous, RendezvousError};
pub use session::{
    CloseReason, ConnectionGuard, ListenerSpawner, PublicSocket, Session, SessionContext,
    SessionInfo, SessionState,
};
pub use transfer::TransferServer;
