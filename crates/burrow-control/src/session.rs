//! One authenticated host and everything it owns
//!
//! A session owns its public port, the TCP listener and UDP socket bound on
//! it, and a tree of cancellation tokens: the session token, one child per
//! sub-channel, and one grandchild per forwarded connection. Closing the
//! session cancels the root, which tears down every listener and forwarder
//! exactly once.

use crate::config::RelayConfig;
use crate::error::SessionError;
use crate::rendezvous::{Rendezvous, RendezvousError};
use burrow_proto::{ChannelKind, ServerCommand, ServerMessage};
use burrow_quota::{KeyManager, QuotaKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a disabled sub-channel's listener gets to wind down
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts the accept loops for a session's public sockets
///
/// Implemented by the relay so this crate does not depend on the forwarders.
pub trait ListenerSpawner: Send + Sync {
    fn spawn_tcp(
        &self,
        session: Arc<Session>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> JoinHandle<()>;

    fn spawn_udp(
        &self,
        session: Arc<Session>,
        socket: UdpSocket,
        token: CancellationToken,
    ) -> JoinHandle<()>;
}

/// Services shared by every session of a relay
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<RelayConfig>,
    pub keys: Arc<KeyManager>,
    pub rendezvous: Arc<Rendezvous<TcpStream>>,
    pub spawner: Arc<dyn ListenerSpawner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Handshaking,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HeartbeatTimeout,
    /// Key expired or was disabled
    KeyRevoked,
    QuotaExhausted,
    /// Host sent `exit`
    HostExit,
    /// Control channel closed or failed
    ControlLost,
    /// Relay shutting down
    Shutdown,
}

impl CloseReason {
    /// Last command sent to the host, if it can still hear us
    fn farewell(&self) -> Option<ServerCommand> {
        match self {
            CloseReason::QuotaExhausted => Some(ServerCommand::ExitNoFlow),
            CloseReason::HostExit | CloseReason::ControlLost => None,
            CloseReason::HeartbeatTimeout | CloseReason::KeyRevoked | CloseReason::Shutdown => {
                Some(ServerCommand::Exit)
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::KeyRevoked => "key expired or disabled",
            CloseReason::QuotaExhausted => "quota exhausted",
            CloseReason::HostExit => "host exit",
            CloseReason::ControlLost => "control channel lost",
            CloseReason::Shutdown => "relay shutdown",
        };
        f.write_str(s)
    }
}

/// A public socket about to get an accept loop
#[derive(Debug)]
pub enum PublicSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl PublicSocket {
    pub fn kind(&self) -> ChannelKind {
        match self {
            PublicSocket::Tcp(_) => ChannelKind::Tcp,
            PublicSocket::Udp(_) => ChannelKind::Udp,
        }
    }
}

#[derive(Default)]
struct SubChannel {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl SubChannel {
    fn is_running(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    async fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(LISTENER_STOP_TIMEOUT, task).await.is_err() {
                warn!("Listener did not stop within {:?}", LISTENER_STOP_TIMEOUT);
            }
        }
    }
}

/// Removes a forwarded connection from the session's bookkeeping when dropped
pub struct ConnectionGuard {
    connections: Arc<DashMap<u64, ChannelKind>>,
    id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(&self.id);
    }
}

/// Point-in-time view of a session for logs and admin output
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub key: String,
    pub port: u16,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub tcp_enabled: bool,
    pub udp_enabled: bool,
    pub connections: usize,
    pub started_at: DateTime<Utc>,
}

pub struct Session {
    id: Uuid,
    key: Arc<QuotaKey>,
    port: u16,
    peer: SocketAddr,
    ctx: SessionContext,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    control_tx: mpsc::UnboundedSender<ServerMessage>,
    token: CancellationToken,
    tcp: tokio::sync::Mutex<SubChannel>,
    udp: tokio::sync::Mutex<SubChannel>,
    connections: Arc<DashMap<u64, ChannelKind>>,
    next_connection: AtomicU64,
    last_heartbeat: Mutex<Instant>,
    started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        key: Arc<QuotaKey>,
        port: u16,
        peer: SocketAddr,
        ctx: SessionContext,
        control_tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            key,
            port,
            peer,
            ctx,
            state: AtomicU8::new(SessionState::Handshaking as u8),
            close_reason: Mutex::new(None),
            control_tx,
            token: CancellationToken::new(),
            tcp: tokio::sync::Mutex::new(SubChannel::default()),
            udp: tokio::sync::Mutex::new(SubChannel::default()),
            connections: Arc::new(DashMap::new()),
            next_connection: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            started_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &Arc<QuotaKey> {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.ctx.keys
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|r| *r)
    }

    /// Root of the session's cancellation tree
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Queue a frame for the host; returns false once the writer is gone
    pub fn send(&self, msg: impl Into<ServerMessage>) -> bool {
        self.control_tx.send(msg.into()).is_ok()
    }

    /// Record a heartbeat from the host
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Move to `Active` and start the accept loops for the enabled sub-channels
    pub async fn activate(
        self: &Arc<Self>,
        tcp: Option<TcpListener>,
        udp: Option<UdpSocket>,
    ) -> Result<(), SessionError> {
        self.state
            .compare_exchange(
                SessionState::Handshaking as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| SessionError::Closed)?;

        self.touch();
        if let Some(listener) = tcp {
            self.launch(PublicSocket::Tcp(listener)).await;
        }
        if let Some(socket) = udp {
            self.launch(PublicSocket::Udp(socket)).await;
        }
        self.spawn_monitor();

        info!(
            "Session {} active for key {} on port {}",
            self.id,
            self.key.name(),
            self.port
        );
        Ok(())
    }

    fn sub_channel(&self, kind: ChannelKind) -> &tokio::sync::Mutex<SubChannel> {
        match kind {
            ChannelKind::Tcp => &self.tcp,
            ChannelKind::Udp => &self.udp,
        }
    }

    async fn launch(self: &Arc<Self>, socket: PublicSocket) {
        let mut sub = self.sub_channel(socket.kind()).lock().await;
        self.start_locked(&mut sub, socket);
    }

    fn start_locked(self: &Arc<Self>, sub: &mut SubChannel, socket: PublicSocket) {
        let token = self.token.child_token();
        let task = match socket {
            PublicSocket::Tcp(listener) => {
                self.ctx
                    .spawner
                    .spawn_tcp(self.clone(), listener, token.clone())
            }
            PublicSocket::Udp(socket) => {
                self.ctx
                    .spawner
                    .spawn_udp(self.clone(), socket, token.clone())
            }
        };
        sub.token = Some(token);
        sub.task = Some(task);
    }

    pub async fn channel_enabled(&self, kind: ChannelKind) -> bool {
        self.sub_channel(kind).lock().await.is_running()
    }

    /// Toggle one sub-channel; returns whether anything changed
    ///
    /// Disabling tears down that sub-channel's listener and connections only.
    /// Enabling binds a fresh socket on the session's port.
    pub async fn set_channel(
        self: &Arc<Self>,
        kind: ChannelKind,
        enabled: bool,
    ) -> Result<bool, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }

        let mut sub = self.sub_channel(kind).lock().await;
        if sub.is_running() == enabled {
            return Ok(false);
        }

        if enabled {
            let addr = SocketAddr::new(self.ctx.config.bind_ip, self.port);
            let socket = match kind {
                ChannelKind::Tcp => PublicSocket::Tcp(TcpListener::bind(addr).await?),
                ChannelKind::Udp => PublicSocket::Udp(UdpSocket::bind(addr).await?),
            };
            self.start_locked(&mut sub, socket);
        } else {
            sub.stop().await;
        }
        drop(sub);

        info!(
            "Session {} {} {} on port {}",
            self.id,
            if enabled { "enabled" } else { "disabled" },
            kind,
            self.port
        );
        Ok(true)
    }

    /// Ask the host for a data channel and wait for it to dial back
    pub async fn open_data_channel(
        &self,
        kind: ChannelKind,
        client: SocketAddr,
    ) -> Result<TcpStream, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed);
        }

        let session_id: u64 = rand::random();
        if !self.send(ServerCommand::SendSocket {
            kind,
            session_id,
            client,
        }) {
            return Err(SessionError::Closed);
        }

        let timeout = self.ctx.config.rendezvous_timeout;
        tokio::select! {
            result = self.ctx.rendezvous.request(kind, session_id, timeout) => {
                result.map_err(|e| match e {
                    RendezvousError::Timeout { kind, session_id } => {
                        SessionError::RendezvousTimeout { kind, session_id }
                    }
                    other => SessionError::ProtocolCorruption(other.to_string()),
                })
            }
            _ = self.token.cancelled() => Err(SessionError::Closed),
        }
    }

    /// Track a forwarded connection until the guard is dropped
    pub fn register_connection(&self, kind: ChannelKind) -> ConnectionGuard {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(id, kind);
        ConnectionGuard {
            connections: self.connections.clone(),
            id,
        }
    }

    pub fn active_connections(&self, kind: Option<ChannelKind>) -> usize {
        match kind {
            None => self.connections.len(),
            Some(kind) => self.connections.iter().filter(|e| *e.value() == kind).count(),
        }
    }

    /// React to a forwarder's deduction hitting zero
    ///
    /// Returns `false` when the store shows the key was topped up in the
    /// meantime and forwarding may continue. Otherwise the session is closed
    /// with `exitNoFlow`, the key is disabled, and `true` is returned.
    pub async fn quota_exhausted(&self) -> bool {
        if self.ctx.keys.reconcile(&self.key).await {
            return false;
        }
        if self.close(CloseReason::QuotaExhausted) {
            warn!(
                "Key {} out of quota, session {} closed",
                self.key.name(),
                self.id
            );
        }
        self.key.disable();
        true
    }

    /// Decide whether the session must end now
    pub fn check_health(&self) -> Option<CloseReason> {
        let silence = self.since_heartbeat();
        if silence > self.ctx.config.heartbeat_timeout {
            warn!(
                "Session {}: no heartbeat for {:?}",
                self.id, silence
            );
            return Some(CloseReason::HeartbeatTimeout);
        }
        if self.key.is_out_of_date() {
            return Some(CloseReason::KeyRevoked);
        }
        if !self.key.is_enabled() {
            if self.key.balance() <= 0.0 {
                return Some(CloseReason::QuotaExhausted);
            }
            return Some(CloseReason::KeyRevoked);
        }
        None
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let session = self.clone();
        let check_interval = self.ctx.config.heartbeat_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = session.token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Some(reason) = session.check_health() {
                            session.close(reason);
                            break;
                        }
                    }
                }
            }
            debug!("Monitor for session {} stopped", session.id);
        });
    }

    /// Begin closing; returns whether this call did it
    ///
    /// Safe to call from any number of tasks. Only the first caller records
    /// the reason, sends the farewell command and cancels the session tree.
    pub fn close(&self, reason: CloseReason) -> bool {
        let transitioned = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < SessionState::Closing as u8).then_some(SessionState::Closing as u8)
            })
            .is_ok();
        if !transitioned {
            return false;
        }

        if let Ok(mut r) = self.close_reason.lock() {
            *r = Some(reason);
        }
        if let Some(cmd) = reason.farewell() {
            self.send(cmd);
        }
        self.token.cancel();

        info!(
            "Closing session {} (key {}, port {}): {}",
            self.id,
            self.key.name(),
            self.port,
            reason
        );
        true
    }

    /// Mark teardown complete; called once the control channel is gone
    pub fn finish(&self) {
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            key: self.key.name().to_string(),
            port: self.port,
            peer: self.peer,
            state: self.state(),
            tcp_enabled: self.channel_enabled(ChannelKind::Tcp).await,
            udp_enabled: self.channel_enabled(ChannelKind::Udp).await,
            connections: self.active_connections(None),
            started_at: self.started_at,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key.name())
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burrow_quota::{parse_expire, KeyRecord, KeyStore, MemoryKeyStore, PortPolicy};
    use std::sync::atomic::AtomicUsize;

    /// Spawner whose accept loops just park until cancelled
    #[derive(Default)]
    pub(crate) struct IdleSpawner {
        pub tcp_spawned: AtomicUsize,
        pub udp_spawned: AtomicUsize,
    }

    impl ListenerSpawner for IdleSpawner {
        fn spawn_tcp(
            &self,
            _session: Arc<Session>,
            listener: TcpListener,
            token: CancellationToken,
        ) -> JoinHandle<()> {
            self.tcp_spawned.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                token.cancelled().await;
                drop(listener);
            })
        }

        fn spawn_udp(
            &self,
            _session: Arc<Session>,
            socket: UdpSocket,
            token: CancellationToken,
        ) -> JoinHandle<()> {
            self.udp_spawned.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                token.cancelled().await;
                drop(socket);
            })
        }
    }

    pub(crate) fn record(name: &str, balance: f64) -> KeyRecord {
        KeyRecord {
            name: name.to_string(),
            balance,
            rate: 0.0,
            expire_at: parse_expire("2099/01/01-00:00").unwrap(),
            port: PortPolicy::Single(5000),
            enabled: true,
            html_enabled: true,
        }
    }

    pub(crate) async fn context(
        config: RelayConfig,
        records: Vec<KeyRecord>,
        spawner: Arc<dyn ListenerSpawner>,
    ) -> SessionContext {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::with_records(records));
        SessionContext {
            config: Arc::new(config),
            keys: Arc::new(KeyManager::new(store)),
            rendezvous: Rendezvous::new(Duration::from_secs(5)),
            spawner,
        }
    }

    async fn session_with(
        config: RelayConfig,
        balance: f64,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<ServerMessage>, Arc<IdleSpawner>) {
        let spawner = Arc::new(IdleSpawner::default());
        let ctx = context(config, vec![record("k1", balance)], spawner.clone()).await;
        let key = ctx.keys.acquire("k1").await.unwrap().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(key, 0, "127.0.0.1:50000".parse().unwrap(), ctx, tx);
        (session, rx, spawner)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, mut rx, _) = session_with(RelayConfig::default(), 10.0).await;
        session.activate(None, None).await.unwrap();

        assert!(session.close(CloseReason::Shutdown));
        assert!(!session.close(CloseReason::HeartbeatTimeout));
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
        assert!(session.token().is_cancelled());

        assert_eq!(rx.recv().await, Some(ServerCommand::Exit.into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_close_sends_one_farewell() {
        let (session, mut rx, _) = session_with(RelayConfig::default(), 10.0).await;
        session.activate(None, None).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.close(CloseReason::KeyRevoked) })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(rx.recv().await, Some(ServerCommand::Exit.into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_toggle_channels() {
        let config = RelayConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            ..Default::default()
        };
        let (session, _rx, spawner) = session_with(config, 10.0).await;

        let bound = crate::port::try_bind("127.0.0.1".parse().unwrap(), 0).await;
        // Port 0 binds two unrelated ephemeral ports; only exercise the UDP side
        let udp = bound.map(|b| b.udp);
        session.activate(None, udp).await.unwrap();
        assert!(!session.channel_enabled(ChannelKind::Tcp).await);
        assert!(session.channel_enabled(ChannelKind::Udp).await);

        assert!(!session.set_channel(ChannelKind::Udp, true).await.unwrap());
        assert!(session.set_channel(ChannelKind::Udp, false).await.unwrap());
        assert!(!session.channel_enabled(ChannelKind::Udp).await);
        assert_eq!(spawner.udp_spawned.load(Ordering::SeqCst), 1);

        session.close(CloseReason::Shutdown);
        assert!(matches!(
            session.set_channel(ChannelKind::Tcp, true).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_silence_closes_session() {
        let config = RelayConfig {
            heartbeat_timeout: Duration::from_secs(10),
            heartbeat_check_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let (session, mut rx, _) = session_with(config, 10.0).await;
        session.activate(None, None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        session.touch();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(session.is_active());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(session.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert_eq!(rx.recv().await, Some(ServerCommand::Exit.into()));
    }

    #[tokio::test]
    async fn test_connection_bookkeeping() {
        let (session, _rx, _) = session_with(RelayConfig::default(), 10.0).await;
        let a = session.register_connection(ChannelKind::Tcp);
        let b = session.register_connection(ChannelKind::Udp);
        let _c = session.register_connection(ChannelKind::Udp);
        assert_eq!(session.active_connections(None), 3);
        assert_eq!(session.active_connections(Some(ChannelKind::Udp)), 2);

        drop(a);
        drop(b);
        assert_eq!(session.active_connections(None), 1);
        assert_eq!(session.active_connections(Some(ChannelKind::Tcp)), 0);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_closes_with_no_flow() {
        let (session, mut rx, _) = session_with(RelayConfig::default(), 1.0).await;
        session.activate(None, None).await.unwrap();

        assert!(session.key().deduct(2.0).is_err());
        assert!(session.quota_exhausted().await);

        assert_eq!(session.close_reason(), Some(CloseReason::QuotaExhausted));
        assert!(!session.key().is_enabled());
        assert_eq!(rx.recv().await, Some(ServerCommand::ExitNoFlow.into()));
    }

    #[tokio::test]
    async fn test_data_channel_timeout() {
        let config = RelayConfig {
            rendezvous_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (session, mut rx, _) = session_with(config, 10.0).await;
        session.activate(None, None).await.unwrap();

        let client: SocketAddr = "203.0.113.9:61000".parse().unwrap();
        let result = session.open_data_channel(ChannelKind::Tcp, client).await;
        assert!(matches!(
            result,
            Err(SessionError::RendezvousTimeout { kind: ChannelKind::Tcp, .. })
        ));
        assert!(session.is_active());

        match rx.recv().await {
            Some(ServerMessage::Command(ServerCommand::SendSocket { kind, client: c, .. })) => {
                assert_eq!(kind, ChannelKind::Tcp);
                assert_eq!(c, client);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
