//! Accept loop and byte pumps for a session's public TCP port

use crate::filter::{forbidden_response, is_html_response, request_line};
use burrow_control::{Session, SessionError};
use burrow_proto::ChannelKind;
use burrow_quota::{bytes_to_mib, RateLimiter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BUFFER_SIZE: usize = 8192;
const PEEK_SIZE: usize = 512;

/// Errors that can occur while forwarding one client connection
#[derive(Debug, Error)]
pub enum TcpProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Data channel unavailable: {0}")]
    DataChannel(#[from] SessionError),
}

/// How one direction of a forwarded connection ended
#[derive(Debug)]
enum PumpEnd {
    /// Reader reached EOF and the write side was shut down
    Eof,
    /// The key ran dry and the session is closing
    Exhausted,
    /// An HTML response was replaced with a 403
    Blocked,
    /// The session, sub-channel or other direction shut the connection
    Cancelled,
    Failed(io::Error),
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToHost,
    HostToClient,
}

/// Forwards clients of one session's public TCP port to the host
pub struct TcpProxyServer {
    session: Arc<Session>,
    listener: TcpListener,
}

impl TcpProxyServer {
    pub fn new(session: Arc<Session>, listener: TcpListener) -> Self {
        Self {
            session,
            listener,
        }
    }

    /// Run the accept loop on a task of its own
    pub fn spawn(
        session: Arc<Session>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let server = Self::new(session, listener);
        tokio::spawn(server.run(token))
    }

    /// Accept clients until `token` is cancelled
    ///
    /// Every connection runs under a child of `token`, so cancelling it
    /// also drops the connections it spawned.
    pub async fn run(self, token: CancellationToken) {
        let port = self.session.port();
        info!("TCP forwarding on port {} for session {}", port, self.session.id());

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept TCP client on port {}: {}", port, e);
                            continue;
                        }
                    };

                    debug!("Accepted TCP client {} on port {}", peer, port);
                    let session = self.session.clone();
                    let conn_token = token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_tcp_connection(session.clone(), stream, peer, conn_token)
                                .await
                        {
                            if session.config().debug {
                                warn!("TCP client {} on port {}: {}", peer, session.port(), e);
                            } else {
                                debug!("TCP client {} on port {}: {}", peer, session.port(), e);
                            }
                        }
                    });
                }
            }
        }

        info!("TCP forwarding on port {} stopped", port);
    }
}

async fn handle_tcp_connection(
    session: Arc<Session>,
    client: TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
) -> Result<(), TcpProxyServerError> {
    let _guard = session.register_connection(ChannelKind::Tcp);
    let config = session.config();

    if !config.accept_delay.is_zero() {
        tokio::time::sleep(config.accept_delay).await;
    }
    log_request_line(&client, peer, config.peek_timeout).await;

    let host = tokio::select! {
        result = session.open_data_channel(ChannelKind::Tcp, peer) => result?,
        _ = token.cancelled() => return Ok(()),
    };
    let _ = client.set_nodelay(true);

    let (client_read, client_write) = client.into_split();
    let (host_read, host_write) = host.into_split();
    let filter_html = !session.key().html_enabled();
    // Both directions of one connection share its throughput budget
    let limiter = RateLimiter::new();

    let upstream = pump(
        client_read,
        host_write,
        Direction::ClientToHost,
        &session,
        &limiter,
        false,
    );
    let downstream = pump(
        host_read,
        client_write,
        Direction::HostToClient,
        &session,
        &limiter,
        filter_html,
    );

    // A clean EOF only half-closes; anything else ends both directions.
    let guarded = |pump| {
        let token = token.clone();
        async move {
            let end = tokio::select! {
                end = pump => end,
                _ = token.cancelled() => PumpEnd::Cancelled,
            };
            if !matches!(end, PumpEnd::Eof) {
                token.cancel();
            }
            end
        }
    };
    let (up, down) = tokio::join!(guarded(upstream), guarded(downstream));

    debug!(
        "TCP client {} on port {} finished (up: {:?}, down: {:?})",
        peer,
        session.port(),
        up,
        down
    );
    for end in [up, down] {
        if let PumpEnd::Failed(e) = end {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Copy one direction, metering and throttling every chunk
async fn pump(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    direction: Direction,
    session: &Session,
    limiter: &RateLimiter,
    mut filter_html: bool,
) -> PumpEnd {
    let key = session.key();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) => return PumpEnd::Failed(e),
        };

        if filter_html {
            filter_html = false;
            if is_html_response(&buf[..n]) {
                info!(
                    "Blocked HTML response on port {} for key {}",
                    session.port(),
                    key.name()
                );
                let response = forbidden_response(&session.config().forbidden_html_message);
                let _ = writer.write_all(response.as_bytes()).await;
                let _ = writer.shutdown().await;
                return PumpEnd::Blocked;
            }
        }

        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::Failed(e);
        }

        if key.deduct(bytes_to_mib(n)).is_err() && session.quota_exhausted().await {
            debug!("{:?} stopped: key {} exhausted", direction, key.name());
            return PumpEnd::Exhausted;
        }
        limiter.throttle(n, key.rate()).await;
    }
}

/// Log the first line a client sends without consuming it
async fn log_request_line(stream: &TcpStream, peer: SocketAddr, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }
    let mut buf = [0u8; PEEK_SIZE];
    if let Ok(Ok(n)) = tokio::time::timeout(timeout, stream.peek(&mut buf)).await {
        if let Some(line) = request_line(&buf[..n]) {
            debug!("{} -> {}", peer, line);
        }
    }
}
