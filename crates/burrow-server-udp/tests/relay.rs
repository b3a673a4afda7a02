use burrow_control::{ListenerSpawner, RelayConfig, Rendezvous, Session, SessionContext};
use burrow_proto::{ChannelKind, ServerCommand, ServerMessage, UdpFrame};
use burrow_quota::{parse_expire, KeyManager, KeyRecord, KeyStore, MemoryKeyStore, PortPolicy};
use burrow_server_udp::{UdpRelayServer, DATAGRAM_OVERHEAD};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct UdpOnly;

impl ListenerSpawner for UdpOnly {
    fn spawn_tcp(
        &self,
        _session: Arc<Session>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            token.cancelled().await;
            drop(listener);
        })
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

struct Harness {
    session: Arc<Session>,
    control: mpsc::UnboundedReceiver<ServerMessage>,
    rendezvous: Arc<Rendezvous<TcpStream>>,
    public: SocketAddr,
}

impl Harness {
    async fn start(config: RelayConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("burrow_server_udp=debug")
            .with_test_writer()
            .try_init();

        let record = KeyRecord {
            name: "k1".to_string(),
            balance: 10.0,
            rate: 0.0,
            expire_at: parse_expire("2099/01/01-00:00").unwrap(),
            port: PortPolicy::Single(5000),
            enabled: true,
            html_enabled: true,
        };
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::with_records(vec![record]));
        let keys = Arc::new(KeyManager::new(store));
        let rendezvous = Rendezvous::new(Duration::from_secs(5));
        let ctx = SessionContext {
            config: Arc::new(config),
            keys: keys.clone(),
            rendezvous: rendezvous.clone(),
            spawner: Arc::new(UdpOnly),
        };

        let key = keys.acquire("k1").await.unwrap().unwrap();
        let (tx, control) = mpsc::unbounded_channel();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let public = socket.local_addr().unwrap();
        let session = Session::new(key, public.port(), "127.0.0.1:50000".parse().unwrap(), ctx, tx);
        session.activate(None, Some(socket)).await.unwrap();

        Self {
            session,
            control,
            rendezvous,
            public,
        }
    }

    /// Play the host: answer the next `sendSocket`, returning the client it
    /// names and the host's end of the data channel
    async fn accept_data_channel(&mut self) -> (SocketAddr, TcpStream) {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.control.recv())
                .await
                .expect("no sendSocket request")
                .expect("control channel closed");
            if let ServerMessage::Command(ServerCommand::SendSocket {
                kind,
                session_id,
                client,
            }) = msg
            {
                assert_eq!(kind, ChannelKind::Udp);
                let (relay_side, host_side) = socket_pair().await;
                self.rendezvous.offer(kind, session_id, relay_side).unwrap();
                return (client, host_side);
            }
        }
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        bind_ip: "127.0.0.1".parse().unwrap(),
        rendezvous_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let outbound = TcpStream::connect(addr).await.unwrap();
    let (inbound, _) = listener.accept().await.unwrap();
    (inbound, outbound)
}

async fn next_frame(host: &mut TcpStream) -> UdpFrame {
    tokio::time::timeout(Duration::from_secs(5), UdpFrame::read_from(host))
        .await
        .expect("no frame from relay")
        .unwrap()
        .expect("data channel closed")
}

async fn recv(client: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("no datagram")
        .unwrap();
    (buf[..n].to_vec(), from)
}

async fn expect_closed(host: &mut TcpStream) {
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), host.read(&mut buf))
        .await
        .expect("data channel was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_datagram_round_trip() {
    let mut h = Harness::start(fast_config()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client_addr = client.local_addr().unwrap();
    client.send_to(b"hello", h.public).await.unwrap();

    let (named, mut host) = h.accept_data_channel().await;
    assert_eq!(named, client_addr);

    let frame = next_frame(&mut host).await;
    assert_eq!(frame.addr, client_addr);
    assert_eq!(&frame.payload[..], b"hello");

    let reply = UdpFrame::new(client_addr, &b"world!"[..]).encode().unwrap();
    host.write_all(&reply).await.unwrap();

    let (payload, from) = recv(&client).await;
    assert_eq!(payload, b"world!");
    assert_eq!(from, h.public);

    // Both directions charged with header overhead
    let spent = 10.0 - h.session.key().balance();
    let expected = (5 + 6 + 2 * DATAGRAM_OVERHEAD) as f64 / 1_048_576.0;
    assert!((spent - expected).abs() < 1e-12, "spent {}", spent);
}

#[tokio::test]
async fn test_each_peer_gets_its_own_channel() {
    let mut h = Harness::start(fast_config()).await;

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    a.send_to(b"from a", h.public).await.unwrap();
    let (first, mut host_first) = h.accept_data_channel().await;
    let _ = next_frame(&mut host_first).await;

    b.send_to(b"from b", h.public).await.unwrap();
    let (second, mut host_second) = h.accept_data_channel().await;
    let frame = next_frame(&mut host_second).await;

    assert_ne!(first, second);
    assert_eq!(frame.addr, b.local_addr().unwrap());
    assert_eq!(&frame.payload[..], b"from b");
    assert_eq!(h.session.active_connections(Some(ChannelKind::Udp)), 2);

    // Later datagrams from a known peer reuse its channel
    a.send_to(b"again", h.public).await.unwrap();
    let frame = next_frame(&mut host_first).await;
    assert_eq!(&frame.payload[..], b"again");
    assert!(h.control.try_recv().is_err());
}

#[tokio::test]
async fn test_corrupt_frame_drops_channel() {
    let mut h = Harness::start(fast_config()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"one", h.public).await.unwrap();
    let (_, mut host) = h.accept_data_channel().await;
    let _ = next_frame(&mut host).await;

    host.write_all(&[0u8; 32]).await.unwrap();
    expect_closed(&mut host).await;

    // The next datagram asks the host for a fresh channel
    client.send_to(b"two", h.public).await.unwrap();
    let (_, mut fresh) = h.accept_data_channel().await;
    let frame = next_frame(&mut fresh).await;
    assert_eq!(&frame.payload[..], b"two");
    assert!(h.session.is_active());
}

#[tokio::test]
async fn test_idle_peer_is_dropped() {
    let config = RelayConfig {
        udp_idle_timeout: Duration::from_millis(200),
        ..fast_config()
    };
    let mut h = Harness::start(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", h.public).await.unwrap();
    let (_, mut host) = h.accept_data_channel().await;
    let _ = next_frame(&mut host).await;

    expect_closed(&mut host).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.active_connections(Some(ChannelKind::Udp)), 0);
}

#[tokio::test]
async fn test_full_queue_drops_newest_datagrams() {
    let config = RelayConfig {
        udp_queue_capacity: 2,
        ..fast_config()
    };
    let mut h = Harness::start(config).await;

    // The host has not dialed back yet, so everything queues
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..6u8 {
        client.send_to(&[b'0' + i], h.public).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, mut host) = h.accept_data_channel().await;
    assert_eq!(&next_frame(&mut host).await.payload[..], b"0");
    assert_eq!(&next_frame(&mut host).await.payload[..], b"1");

    let more = tokio::time::timeout(Duration::from_millis(300), UdpFrame::read_from(&mut host)).await;
    assert!(more.is_err(), "overflowing datagrams were forwarded");
    assert!(h.control.try_recv().is_err());

    // The channel survives the overflow
    client.send_to(b"after", h.public).await.unwrap();
    assert_eq!(&next_frame(&mut host).await.payload[..], b"after");
    assert_eq!(h.session.active_connections(Some(ChannelKind::Udp)), 1);
}

#[tokio::test]
async fn test_rate_limit_applies_per_peer() {
    const DATAGRAMS: usize = 50;
    let mut h = Harness::start(fast_config()).await;
    // 100_000 bytes per second; each datagram meters 1000 bytes
    h.session.key().set_rate(0.8);
    let payload = vec![9u8; 1000 - DATAGRAM_OVERHEAD];

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for _ in 0..DATAGRAMS {
        a.send_to(&payload, h.public).await.unwrap();
        b.send_to(&payload, h.public).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = tokio::time::Instant::now();
    let mut hosts = Vec::new();
    for _ in 0..2 {
        let (_, mut host) = h.accept_data_channel().await;
        hosts.push(tokio::spawn(async move {
            for _ in 0..DATAGRAMS {
                next_frame(&mut host).await;
            }
        }));
    }
    for host in hosts {
        host.await.unwrap();
    }

    // Each peer gets the full rate; a shared budget would take about 1 s
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(350), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);
}
