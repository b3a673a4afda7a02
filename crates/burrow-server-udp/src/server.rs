use burrow_control::{Session, SessionError};
use burrow_proto::{ChannelKind, FrameError, UdpFrame};
use burrow_quota::{bytes_to_mib, RateLimiter};
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// IP and UDP header bytes charged on top of every payload
pub const DATAGRAM_OVERHEAD: usize = 28;

const RECV_BUFFER_SIZE: usize = 65_536;
const IDLE_POLL: Duration = Duration::from_secs(1);
const MIN_IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum UdpRelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt frame from host: {0}")]
    Frame(#[from] FrameError),

    #[error("Data channel unavailable: {0}")]
    DataChannel(#[from] SessionError),
}

struct Peer {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

/// Demultiplexes a session's public UDP socket by remote peer
pub struct UdpRelayServer {
    session: Arc<Session>,
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<SocketAddr, Peer>>,
    next_peer: u64,
}

impl UdpRelayServer {
    pub fn new(session: Arc<Session>, socket: UdpSocket) -> Self {
        Self {
            session,
            socket: Arc::new(socket),
            peers: Arc::new(DashMap::new()),
            next_peer: 0,
        }
    }

    /// Run the receive loop on a task of its own
    pub fn spawn(
        session: Arc<Session>,
        socket: UdpSocket,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let server = Self::new(session, socket);
        tokio::spawn(server.run(token))
    }

    /// Receive datagrams until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        let port = self.session.port();
        info!("UDP forwarding on port {} for session {}", port, self.session.id());

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, peer)) => {
                            self.dispatch(peer, Bytes::copy_from_slice(&buf[..n]), &token);
                        }
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms
                            debug!("UDP receive on port {} failed: {}", port, e);
                        }
                    }
                }
            }
        }

        self.peers.clear();
        info!("UDP forwarding on port {} stopped", port);
    }

    fn dispatch(&mut self, peer: SocketAddr, datagram: Bytes, token: &CancellationToken) {
        let datagram = match self.peers.get(&peer) {
            Some(entry) => match entry.tx.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!("Queue for UDP peer {} is full, dropping datagram", peer);
                    return;
                }
                // Forwarder is on its way out; start a fresh one
                Err(TrySendError::Closed(datagram)) => datagram,
            },
            None => datagram,
        };

        let (tx, rx) = mpsc::channel(self.session.config().udp_queue_capacity.max(1));
        let _ = tx.try_send(datagram);

        let id = self.next_peer;
        self.next_peer += 1;
        self.peers.insert(peer, Peer { id, tx });

        let forwarder = PeerForwarder {
            session: self.session.clone(),
            socket: self.socket.clone(),
            peer,
            limiter: RateLimiter::new(),
            last_seen: Mutex::new(Instant::now()),
        };
        let peers = self.peers.clone();
        let peer_token = token.child_token();
        tokio::spawn(async move {
            if let Err(e) = forwarder.run(rx, peer_token).await {
                if forwarder.session.config().debug {
                    warn!("UDP peer {} on port {}: {}", peer, forwarder.session.port(), e);
                } else {
                    debug!("UDP peer {} on port {}: {}", peer, forwarder.session.port(), e);
                }
            }
            peers.remove_if(&peer, |_, entry| entry.id == id);
        });
    }
}

/// Carries one remote peer's traffic over its own data channel
struct PeerForwarder {
    session: Arc<Session>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    limiter: RateLimiter,
    last_seen: Mutex<Instant>,
}

impl PeerForwarder {
    async fn run(
        &self,
        mut rx: mpsc::Receiver<Bytes>,
        token: CancellationToken,
    ) -> Result<(), UdpRelayError> {
        let _guard = self.session.register_connection(ChannelKind::Udp);

        let host = tokio::select! {
            result = self.session.open_data_channel(ChannelKind::Udp, self.peer) => result?,
            _ = token.cancelled() => return Ok(()),
        };
        let (mut host_read, mut host_write) = host.into_split();
        self.touch();

        let upstream = async {
            while let Some(payload) = rx.recv().await {
                self.touch();
                let len = payload.len();
                let Some(frame) = encode_for_host(self.peer, payload) else {
                    continue;
                };
                host_write.write_all(&frame).await?;
                if !self.meter(len).await {
                    break;
                }
            }
            Ok::<_, UdpRelayError>(())
        };

        let downstream = async {
            while let Some(frame) = UdpFrame::read_from(&mut host_read).await? {
                self.touch();
                if frame.addr != self.peer {
                    debug!(
                        "Host addressed {} on the channel of {}",
                        frame.addr, self.peer
                    );
                }
                self.socket.send_to(&frame.payload, self.peer).await?;
                if !self.meter(frame.payload.len()).await {
                    break;
                }
            }
            Ok::<_, UdpRelayError>(())
        };

        let idle_timeout = self.session.config().udp_idle_timeout;
        let idle = async {
            let mut poll = tokio::time::interval(IDLE_POLL.min(idle_timeout).max(MIN_IDLE_POLL));
            loop {
                poll.tick().await;
                if self.idle_for() > idle_timeout {
                    break;
                }
            }
        };

        let result = tokio::select! {
            result = upstream => result,
            result = downstream => result,
            _ = idle => {
                debug!("UDP peer {} idle for {:?}", self.peer, idle_timeout);
                Ok(())
            }
            _ = token.cancelled() => Ok(()),
        };
        let _ = host_write.shutdown().await;
        result
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_seen.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Charge one datagram to the key; returns false once forwarding must stop
    async fn meter(&self, payload_len: usize) -> bool {
        let bytes = payload_len + DATAGRAM_OVERHEAD;
        let key = self.session.key();
        if key.deduct(bytes_to_mib(bytes)).is_err() && self.session.quota_exhausted().await {
            return false;
        }
        self.limiter.throttle(bytes, key.rate()).await;
        true
    }
}

/// Frame one client datagram for the host; unframeable datagrams are dropped
fn encode_for_host(peer: SocketAddr, payload: Bytes) -> Option<Bytes> {
    match UdpFrame::new(peer, payload).encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!("Dropping datagram from UDP peer {}: {}", peer, e);
            None
        }
    }
}
