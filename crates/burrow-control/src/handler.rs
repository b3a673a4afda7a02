//! Control channel: host handshake, then commands and heartbeats

use crate::ban::BanChecker;
use crate::error::SessionError;
use crate::port::{assign_port, BoundPort};
use crate::registry::SessionRegistry;
use crate::session::{CloseReason, Session, SessionContext};
use burrow_proto::{
    ChannelKind, FrameCodec, HostCommand, HostHello, HostMessage, ServerCommand, ServerMessage,
};
use burrow_quota::{format_expire, QuotaKey};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type ControlFramed = Framed<TcpStream, FrameCodec>;

/// Accepts hosts on the control port and runs their sessions
pub struct ControlHandler {
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    bans: Arc<dyn BanChecker>,
}

impl ControlHandler {
    pub fn new(
        ctx: SessionContext,
        registry: Arc<SessionRegistry>,
        bans: Arc<dyn BanChecker>,
    ) -> Self {
        Self {
            ctx,
            registry,
            bans,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept loop for the control port
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Control channel listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept control connection: {}", e);
                            continue;
                        }
                    };

                    if self.bans.is_banned(&peer.ip()) {
                        debug!("Refused control connection from banned {}", peer);
                        continue;
                    }

                    let handler = self.clone();
                    tokio::spawn(async move {
                        match handler.handle(stream, peer).await {
                            Ok(()) => {}
                            Err(e @ (SessionError::AuthFailure(_) | SessionError::PortConflict(_))) => {
                                info!("Rejected host {}: {}", peer, e);
                            }
                            Err(e) => debug!("Control connection from {} ended: {}", peer, e),
                        }
                    });
                }
            }
        }

        info!("Control channel stopped");
    }

    /// Run one host from greeting to teardown
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), SessionError> {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, FrameCodec);

        let (hello, key, bound) = match self.authenticate(&mut framed, peer).await {
            Ok(accepted) => accepted,
            Err(SessionError::Closed) => return Ok(()),
            Err(e) => return reject(&mut framed, e).await,
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Session::new(key, bound.port, peer, self.ctx.clone(), control_tx);
        if let Err(e) = self.registry.insert(session.clone()) {
            return reject(&mut framed, e).await;
        }

        let (sink, mut stream) = framed.split();
        let writer = tokio::spawn(write_loop(sink, control_rx, session.token().clone()));

        self.greet(&session);
        let tcp = hello.channels.tcp.then_some(bound.tcp);
        let udp = hello.channels.udp.then_some(bound.udp);

        match session.activate(tcp, udp).await {
            Ok(()) => self.read_loop(&session, &mut stream).await,
            Err(e) => warn!("Session {} failed to start: {}", session.id(), e),
        }

        session.close(CloseReason::ControlLost);
        let _ = writer.await;
        self.registry.remove(&session.id());
        session.finish();

        info!(
            "Session {} for key {} ended ({})",
            session.id(),
            session.key().name(),
            session
                .close_reason()
                .map(|r| r.to_string())
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Version check, key lookup and port assignment
    async fn authenticate(
        &self,
        framed: &mut ControlFramed,
        peer: SocketAddr,
    ) -> Result<(HostHello, Arc<QuotaKey>, BoundPort), SessionError> {
        let config = &self.ctx.config;

        let line = match tokio::time::timeout(config.handshake_timeout, framed.next()).await {
            Err(_) => {
                return Err(SessionError::ProtocolCorruption(
                    "handshake timed out".to_string(),
                ))
            }
            Ok(None) => return Err(SessionError::Closed),
            Ok(Some(frame)) => frame?,
        };

        let hello: HostHello = line
            .parse()
            .map_err(|e| SessionError::ProtocolCorruption(format!("bad handshake: {}", e)))?;
        debug!(
            "Host {} greeting: key {}, version {}, lang {}, channels {}",
            peer, hello.key_name, hello.version, hello.lang, hello.channels
        );

        if !config.accepts_version(&hello.version) {
            return Err(SessionError::AuthFailure(format!(
                "version {} is not supported, please update",
                hello.version
            )));
        }

        let key = self
            .ctx
            .keys
            .acquire(&hello.key_name)
            .await?
            .ok_or_else(|| {
                SessionError::AuthFailure(format!("key {} does not exist", hello.key_name))
            })?;

        if key.is_out_of_date() {
            return Err(SessionError::AuthFailure(format!(
                "key {} expired at {}",
                key.name(),
                format_expire(&key.expire_at())
            )));
        }
        if !key.is_enabled() {
            return Err(SessionError::AuthFailure(format!(
                "key {} is disabled",
                key.name()
            )));
        }
        if key.balance() <= 0.0 {
            return Err(SessionError::AuthFailure(format!(
                "key {} has no quota left",
                key.name()
            )));
        }

        let registry = self.registry.clone();
        let bound = assign_port(&key.port_policy(), config.bind_ip, |port| {
            registry.is_port_reserved(port)
        })
        .await?;

        Ok((hello, key, bound))
    }

    fn greet(&self, session: &Session) {
        let key = session.key();
        session.send(ServerCommand::Ok);
        session.send(ServerMessage::text(session.port().to_string()));
        session.send(ServerMessage::text(format!(
            "balance: {:.2} MiB",
            key.balance()
        )));
        session.send(ServerMessage::text(format!(
            "expires: {}",
            format_expire(&key.expire_at())
        )));
        session.send(ServerMessage::text(format!(
            "connect: {}:{}",
            self.ctx.config.public_host,
            session.port()
        )));
    }

    async fn read_loop(&self, session: &Arc<Session>, stream: &mut SplitStream<ControlFramed>) {
        loop {
            tokio::select! {
                biased;
                _ = session.token().cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(line)) => self.dispatch(session, &line).await,
                    Some(Err(e)) => {
                        debug!("Control channel of session {} failed: {}", session.id(), e);
                        break;
                    }
                    None => {
                        debug!("Host closed control channel of session {}", session.id());
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, session: &Arc<Session>, line: &str) {
        let msg = match HostMessage::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Session {}: ignoring control message: {}", session.id(), e);
                return;
            }
        };

        match msg {
            HostMessage::Command(HostCommand::Ping) => {
                session.touch();
                session.send(ServerCommand::Pong);
            }
            HostMessage::Command(HostCommand::SetTcp(enabled)) => {
                toggle(session, ChannelKind::Tcp, enabled).await
            }
            HostMessage::Command(HostCommand::SetUdp(enabled)) => {
                toggle(session, ChannelKind::Udp, enabled).await
            }
            HostMessage::Command(HostCommand::Exit) => {
                session.close(CloseReason::HostExit);
            }
            HostMessage::Text(text) => debug!("Session {} host says: {}", session.id(), text),
        }
    }
}

async fn toggle(session: &Arc<Session>, kind: ChannelKind, enabled: bool) {
    if let Err(e) = session.set_channel(kind, enabled).await {
        warn!(
            "Session {}: failed to {} {}: {}",
            session.id(),
            if enabled { "enable" } else { "disable" },
            kind,
            e
        );
        session.send(ServerMessage::text(format!(
            "could not {} {} on port {}: {}",
            if enabled { "enable" } else { "disable" },
            kind,
            session.port(),
            e
        )));
    }
}

/// Tell the host why it was refused, then hang up
async fn reject(framed: &mut ControlFramed, err: SessionError) -> Result<(), SessionError> {
    let _ = framed.send(err.to_string()).await;
    let _ = framed.send(ServerCommand::Exit.to_string()).await;
    let _ = SinkExt::<String>::close(framed).await;
    Err(err)
}

/// Sole writer of a session's control channel
///
/// Frames queued before the session is cancelled, including the farewell
/// command, are still delivered before the socket is shut down.
async fn write_loop(
    mut sink: SplitSink<ControlFramed, String>,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg.encode()).await {
                        debug!("Control write failed: {}", e);
                        return;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => break,
        }
    }

    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg.encode()).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban::BanList;
    use crate::config::RelayConfig;
    use crate::session::tests::{context, record, IdleSpawner};
    use burrow_quota::{parse_expire, KeyRecord, PortPolicy};
    use std::time::Duration;

    struct Harness {
        handler: Arc<ControlHandler>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    }

    async fn harness(config: RelayConfig, records: Vec<KeyRecord>) -> Harness {
        let ctx = context(config, records, Arc::new(IdleSpawner::default())).await;
        let handler = Arc::new(ControlHandler::new(
            ctx,
            Arc::new(SessionRegistry::new()),
            Arc::new(BanList::new()),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(handler.clone().serve(listener, shutdown.clone()));
        Harness {
            handler,
            addr,
            shutdown,
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            public_host: "relay.test".to_string(),
            accepted_versions: vec!["2.0".to_string()],
            ..Default::default()
        }
    }

    async fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn connect(addr: SocketAddr, hello: &str) -> ControlFramed {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec);
        framed.send(hello.to_string()).await.unwrap();
        framed
    }

    async fn next_line(framed: &mut ControlFramed) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .unwrap()
            .map(|r| r.unwrap())
    }

    #[tokio::test]
    async fn test_successful_handshake_sequence() {
        let port = free_port().await;
        let mut key = record("k1", 10.0);
        key.port = PortPolicy::Single(port);
        let h = harness(config(), vec![key]).await;

        let mut host = connect(h.addr, "en;2.0;k1").await;
        assert_eq!(next_line(&mut host).await.unwrap(), ":>ok");
        assert_eq!(next_line(&mut host).await.unwrap(), port.to_string());
        assert_eq!(next_line(&mut host).await.unwrap(), "balance: 10.00 MiB");
        assert_eq!(
            next_line(&mut host).await.unwrap(),
            "expires: 2099/01/01-00:00"
        );
        assert_eq!(
            next_line(&mut host).await.unwrap(),
            format!("connect: relay.test:{}", port)
        );

        host.send(":>ping".to_string()).await.unwrap();
        assert_eq!(next_line(&mut host).await.unwrap(), ":>pong");
        assert_eq!(h.handler.registry().len(), 1);

        host.send(":>exit".to_string()).await.unwrap();
        assert_eq!(next_line(&mut host).await, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handler.registry().is_empty());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_rejections() {
        let mut expired = record("old", 10.0);
        expired.expire_at = parse_expire("2001/01/01-00:00").unwrap();
        let mut disabled = record("off", 10.0);
        disabled.enabled = false;
        let empty = record("empty", 0.0);
        let h = harness(config(), vec![expired, disabled, empty]).await;

        for (hello, expect) in [
            ("en;1.0;old", "version 1.0 is not supported"),
            ("en;2.0;nobody", "key nobody does not exist"),
            ("en;2.0;old", "key old expired"),
            ("en;2.0;off", "key off is disabled"),
            ("en;2.0;empty", "key empty has no quota left"),
            ("garbage", "bad handshake"),
        ] {
            let mut host = connect(h.addr, hello).await;
            let reason = next_line(&mut host).await.unwrap();
            assert!(reason.contains(expect), "{}: {}", hello, reason);
            assert_eq!(next_line(&mut host).await.unwrap(), ":>exit");
            assert_eq!(next_line(&mut host).await, None);
        }
        assert!(h.handler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_port_conflict() {
        let port = free_port().await;
        let mut a = record("a", 10.0);
        a.port = PortPolicy::Single(port);
        let mut b = record("b", 10.0);
        b.port = PortPolicy::Single(port);
        let h = harness(config(), vec![a, b]).await;

        let mut first = connect(h.addr, "en;2.0;a").await;
        assert_eq!(next_line(&mut first).await.unwrap(), ":>ok");

        let mut second = connect(h.addr, "en;2.0;b").await;
        let reason = next_line(&mut second).await.unwrap();
        assert!(reason.starts_with("Port unavailable"), "{}", reason);
        assert_eq!(next_line(&mut second).await.unwrap(), ":>exit");
    }

    #[tokio::test]
    async fn test_channel_flags_and_toggles() {
        let port = free_port().await;
        let mut key = record("k1", 10.0);
        key.port = PortPolicy::Single(port);
        let h = harness(config(), vec![key]).await;

        let mut host = connect(h.addr, "en;2.0;k1;U").await;
        for _ in 0..5 {
            next_line(&mut host).await.unwrap();
        }
        let session = h.handler.registry().by_port(port).unwrap();
        assert!(!session.channel_enabled(ChannelKind::Tcp).await);
        assert!(session.channel_enabled(ChannelKind::Udp).await);

        host.send(":>enableTCP".to_string()).await.unwrap();
        host.send(":>disableUDP".to_string()).await.unwrap();
        host.send(":>ping".to_string()).await.unwrap();
        assert_eq!(next_line(&mut host).await.unwrap(), ":>pong");

        assert!(session.channel_enabled(ChannelKind::Tcp).await);
        assert!(!session.channel_enabled(ChannelKind::Udp).await);
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_host_disconnect_tears_down_session() {
        let port = free_port().await;
        let mut key = record("k1", 10.0);
        key.port = PortPolicy::Single(port);
        let h = harness(config(), vec![key]).await;

        let mut host = connect(h.addr, "en;2.0;k1").await;
        assert_eq!(next_line(&mut host).await.unwrap(), ":>ok");
        let session = h.handler.registry().by_port(port).unwrap();
        drop(host);

        tokio::time::timeout(Duration::from_secs(5), session.token().cancelled())
            .await
            .unwrap();
        assert_eq!(session.close_reason(), Some(CloseReason::ControlLost));
    }
}
