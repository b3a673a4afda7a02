//! Shared transfer port where hosts dial back data channels

use crate::ban::BanChecker;
use crate::error::SessionError;
use crate::rendezvous::Rendezvous;
use burrow_proto::{read_frame, DataChannelHello};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct TransferServer {
    rendezvous: Arc<Rendezvous<TcpStream>>,
    bans: Arc<dyn BanChecker>,
    handshake_timeout: Duration,
}

impl TransferServer {
    pub fn new(
        rendezvous: Arc<Rendezvous<TcpStream>>,
        bans: Arc<dyn BanChecker>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            rendezvous,
            bans,
            handshake_timeout,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("Transfer port listening on {}", addr);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept data channel: {}", e);
                            continue;
                        }
                    };

                    if self.bans.is_banned(&peer.ip()) {
                        debug!("Refused data channel from banned {}", peer);
                        continue;
                    }

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream, peer).await {
                            debug!("Dropped data channel from {}: {}", peer, e);
                        }
                    });
                }
            }
        }

        info!("Transfer port stopped");
    }

    /// Read the greeting and hand the socket to the rendezvous
    ///
    /// Only the greeting frame is consumed, so the first payload bytes that
    /// follow it stay in the socket for the forwarder.
    pub async fn handle(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<DataChannelHello, SessionError> {
        let line = tokio::time::timeout(self.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| {
                SessionError::ProtocolCorruption("data channel greeting timed out".to_string())
            })??
            .ok_or_else(|| {
                SessionError::ProtocolCorruption("closed before greeting".to_string())
            })?;

        let hello: DataChannelHello = line
            .parse()
            .map_err(|e| SessionError::ProtocolCorruption(format!("bad greeting: {}", e)))?;

        let _ = stream.set_nodelay(true);
        self.rendezvous
            .offer(hello.kind, hello.session_id, stream)
            .map_err(|e| SessionError::ProtocolCorruption(e.to_string()))?;

        debug!(
            "{} data channel {} arrived from {}",
            hello.kind, hello.session_id, peer
        );
        Ok(hello)
    }
}
