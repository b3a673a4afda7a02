//! Relay builder: wires key storage, the control and transfer ports, and the
//! per-session forwarders into one runnable relay

use burrow_control::{
    BanList, BanListError, CloseReason, ControlHandler, ListenerSpawner, RelayConfig,
    Rendezvous, Session, SessionContext, SessionRegistry, TransferServer,
};
use burrow_quota::{KeyManager, KeyStore, MemoryKeyStore};
use burrow_server_tcp::TcpProxyServer;
use burrow_server_udp::UdpRelayServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long the relay waits for its accept loops after cancelling them
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay builder errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Invalid ban list: {0}")]
    BanList(#[from] BanListError),

    #[error("Database error: {0}")]
    Database(String),
}

/// Spawns the TCP and UDP forwarders for a session's public port
pub struct ForwardingSpawner;

impl ListenerSpawner for ForwardingSpawner {
    fn spawn_tcp(
        &self,
        session: Arc<Session>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        TcpProxyServer::spawn(session, listener, token)
    }

    fn spawn_udp(
        &self,
        session: Arc<Session>,
        socket: UdpSocket,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        UdpRelayServer::spawn(session, socket, token)
    }
}

/// Builder for a relay
///
/// # Example
/// ```ignore
/// let relay = RelayBuilder::new()
///     .control_addr("0.0.0.0:44801")?
///     .transfer_addr("0.0.0.0:44802")?
///     .public_host("relay.example.com")
///     .key_store(store)
///     .build()?;
/// let running = relay.start().await?;
/// ```
pub struct RelayBuilder {
    config: RelayConfig,
    store: Option<Arc<dyn KeyStore>>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            config: RelayConfig::default(),
            store: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn control_addr(mut self, addr: &str) -> Result<Self, RelayError> {
        self.config.control_addr = parse_addr("control", addr)?;
        Ok(self)
    }

    pub fn transfer_addr(mut self, addr: &str) -> Result<Self, RelayError> {
        self.config.transfer_addr = parse_addr("transfer", addr)?;
        Ok(self)
    }

    pub fn public_host(mut self, host: &str) -> Self {
        self.config.public_host = host.to_string();
        self
    }

    /// Where quota keys live; defaults to an empty in-memory store
    pub fn key_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Relay, RelayError> {
        let config = self.config;
        if config.control_addr.port() != 0 && config.control_addr == config.transfer_addr {
            return Err(RelayError::ConfigError(format!(
                "control and transfer ports must differ (both {})",
                config.control_addr
            )));
        }
        if config.udp_queue_capacity == 0 {
            return Err(RelayError::ConfigError(
                "UDP queue capacity must be at least 1".to_string(),
            ));
        }

        let bans = Arc::new(BanList::from_entries(config.banned.iter())?);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryKeyStore::new()));
        let keys = Arc::new(KeyManager::new(store));
        let rendezvous: Arc<Rendezvous<TcpStream>> = Rendezvous::new(config.rendezvous_timeout);
        let registry = Arc::new(SessionRegistry::new());
        let config = Arc::new(config);

        let ctx = SessionContext {
            config: config.clone(),
            keys: keys.clone(),
            rendezvous: rendezvous.clone(),
            spawner: Arc::new(ForwardingSpawner),
        };
        let handler = Arc::new(ControlHandler::new(ctx, registry.clone(), bans.clone()));
        let transfer = Arc::new(TransferServer::new(
            rendezvous.clone(),
            bans,
            config.handshake_timeout,
        ));

        Ok(Relay {
            config,
            keys,
            rendezvous,
            registry,
            handler,
            transfer,
        })
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_addr(what: &str, addr: &str) -> Result<SocketAddr, RelayError> {
    addr.parse()
        .map_err(|_| RelayError::ParseError(format!("Invalid {} address: {}", what, addr)))
}

/// A configured relay, ready to bind its ports
pub struct Relay {
    config: Arc<RelayConfig>,
    keys: Arc<KeyManager>,
    rendezvous: Arc<Rendezvous<TcpStream>>,
    registry: Arc<SessionRegistry>,
    handler: Arc<ControlHandler>,
    transfer: Arc<TransferServer>,
}

impl Relay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn keys(&self) -> Arc<KeyManager> {
        self.keys.clone()
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind the control and transfer ports and start serving
    pub async fn start(self) -> Result<RunningRelay, RelayError> {
        let control = bind(self.config.control_addr).await?;
        let transfer = bind(self.config.transfer_addr).await?;
        let control_addr = local_addr(&control, self.config.control_addr);
        let transfer_addr = local_addr(&transfer, self.config.transfer_addr);

        let listeners = CancellationToken::new();
        let writer_shutdown = CancellationToken::new();
        let writer = self
            .keys
            .spawn_writer(self.config.flush_interval, writer_shutdown.clone());

        let tasks = vec![
            tokio::spawn(self.handler.clone().serve(control, listeners.clone())),
            tokio::spawn(self.transfer.clone().serve(transfer, listeners.clone())),
        ];

        info!(
            "Relay started: control {}, transfer {}, public host {}",
            control_addr, transfer_addr, self.config.public_host
        );

        Ok(RunningRelay {
            control_addr,
            transfer_addr,
            keys: self.keys,
            rendezvous: self.rendezvous,
            registry: self.registry,
            listeners,
            writer_shutdown,
            writer,
            tasks,
        })
    }

    /// Start, serve until `shutdown` fires, then stop gracefully
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let running = self.start().await?;
        shutdown.cancelled().await;
        running.shutdown().await;
        Ok(())
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::BindError { addr, source })
}

fn local_addr(listener: &TcpListener, fallback: SocketAddr) -> SocketAddr {
    listener.local_addr().unwrap_or(fallback)
}

/// A relay with its ports bound and accept loops running
pub struct RunningRelay {
    control_addr: SocketAddr,
    transfer_addr: SocketAddr,
    keys: Arc<KeyManager>,
    rendezvous: Arc<Rendezvous<TcpStream>>,
    registry: Arc<SessionRegistry>,
    listeners: CancellationToken,
    writer_shutdown: CancellationToken,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningRelay {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Close every session, stop accepting, and flush key balances
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        let closed = self.registry.close_all(CloseReason::Shutdown);
        if closed > 0 {
            info!("Sent exit to {} hosts", closed);
        }

        self.listeners.cancel();
        for task in self.tasks {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Accept loop failed: {}", e),
                Err(_) => warn!("Accept loop did not stop within {:?}", STOP_TIMEOUT),
            }
        }
        self.rendezvous.clear();

        self.writer_shutdown.cancel();
        if let Some(writer) = self.writer {
            if let Err(e) = writer.await {
                error!("Key writer failed: {}", e);
            }
        }
        info!("Relay stopped");
    }
}
