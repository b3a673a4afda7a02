//! Burrow - public API for running a quota-metered tunnel relay
//!
//! Re-exports the burrow crates and provides [`RelayBuilder`], which wires
//! key storage, the control and transfer ports, and the TCP/UDP forwarders
//! into one relay.
//!
//! # Quick Start
//!
//! ```ignore
//! use burrow_lib::{open_key_store, RelayBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = open_key_store("sqlite://./burrow.db?mode=rwc").await?;
//!     let relay = RelayBuilder::new()
//!         .control_addr("0.0.0.0:44801")?
//!         .transfer_addr("0.0.0.0:44802")?
//!         .public_host("relay.example.com")
//!         .key_store(store)
//!         .build()?;
//!
//!     relay.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Key Components
//!
//! - **KeyManager**: shared metering state per key, persisted by a `KeyStore`
//! - **ControlHandler**: host handshake, heartbeats and sub-channel toggles
//! - **TransferServer**: where hosts dial back data channels
//! - **TcpProxyServer** / **UdpRelayServer**: per-session public port forwarders

mod relay;

pub use relay::{ForwardingSpawner, Relay, RelayBuilder, RelayError, RunningRelay};

pub use burrow_control::{
    BanChecker, BanList, CloseReason, ControlHandler, RelayConfig, Session, SessionError,
    SessionInfo, SessionRegistry, SessionState, TransferServer,
};
pub use burrow_proto::{ChannelKind, HostCommand, ServerCommand, ServerMessage, UdpFrame};
pub use burrow_quota::{
    format_expire, parse_expire, KeyManager, KeyRecord, KeyStore, KeyStoreError,
    MemoryKeyStore, PortPolicy, QuotaKey, RateLimiter,
};
pub use burrow_server_tcp::TcpProxyServer;
pub use burrow_server_udp::UdpRelayServer;

#[cfg(feature = "db")]
pub use burrow_relay_db::DbKeyStore;

/// Connect to a database, run migrations, and wrap it as a key store
#[cfg(feature = "db")]
pub async fn open_key_store(
    database_url: &str,
) -> Result<std::sync::Arc<dyn KeyStore>, RelayError> {
    let db = burrow_relay_db::connect(database_url)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;
    burrow_relay_db::migrate(&db)
        .await
        .map_err(|e| RelayError::Database(e.to_string()))?;
    Ok(std::sync::Arc::new(DbKeyStore::new(db)))
}
