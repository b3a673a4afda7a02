//! Pairing of dial-back data channels with the forwarders waiting for them
//!
//! A forwarder asks the host for a data channel tagged with a fresh session
//! id and then calls [`Rendezvous::request`]. The host's socket arrives on the
//! transfer port independently and is handed over with [`Rendezvous::offer`].
//! Either side may come first. Each `(kind, id)` pair owns one slot that is
//! either a waiter or a parked socket, never both, so a socket is delivered
//! at most once. Parked sockets nobody claims are closed by a single expiry
//! worker fed from one time-ordered queue.

use burrow_proto::ChannelKind;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RendezvousError {
    #[error("Timed out waiting for {kind} data channel {session_id}")]
    Timeout { kind: ChannelKind, session_id: u64 },

    #[error("Session id {session_id} already has a pending {kind} {side}")]
    Duplicate {
        kind: ChannelKind,
        session_id: u64,
        side: &'static str,
    },

    #[error("Waiter for {kind} data channel {session_id} is gone")]
    Abandoned { kind: ChannelKind, session_id: u64 },

    #[error("Rendezvous closed")]
    Closed,
}

type SlotKey = (ChannelKind, u64);

enum Slot<S> {
    Waiting {
        tx: oneshot::Sender<S>,
        generation: u64,
    },
    Arrived {
        socket: S,
        generation: u64,
    },
}

struct Expiry {
    deadline: Instant,
    key: SlotKey,
    generation: u64,
}

pub struct Rendezvous<S> {
    slots: DashMap<SlotKey, Slot<S>>,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
    generation: AtomicU64,
    unclaimed_ttl: Duration,
}

impl<S: Send + Sync + 'static> Rendezvous<S> {
    /// Create a registry whose unclaimed sockets are closed after `unclaimed_ttl`
    ///
    /// Must be called from within a Tokio runtime; the expiry worker stops
    /// when the registry is dropped.
    pub fn new(unclaimed_ttl: Duration) -> Arc<Self> {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let rendezvous = Arc::new(Self {
            slots: DashMap::new(),
            expiry_tx,
            generation: AtomicU64::new(0),
            unclaimed_ttl,
        });
        tokio::spawn(expire_unclaimed(Arc::downgrade(&rendezvous), expiry_rx));
        rendezvous
    }

    /// Wait up to `timeout` for the data channel tagged `session_id`
    pub async fn request(
        &self,
        kind: ChannelKind,
        session_id: u64,
        timeout: Duration,
    ) -> Result<S, RendezvousError> {
        let key = (kind, session_id);
        let generation = self.next_generation();

        let mut rx = match self.slots.entry(key) {
            Entry::Occupied(entry) => {
                if matches!(entry.get(), Slot::Waiting { .. }) {
                    return Err(RendezvousError::Duplicate {
                        kind,
                        session_id,
                        side: "request",
                    });
                }
                return match entry.remove() {
                    Slot::Arrived { socket, .. } => {
                        debug!("{} data channel {} was already waiting", kind, session_id);
                        Ok(socket)
                    }
                    Slot::Waiting { .. } => Err(RendezvousError::Closed),
                };
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(Slot::Waiting { tx, generation });
                rx
            }
        };

        let _guard = WaiterGuard {
            slots: &self.slots,
            key,
            generation,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(_)) => Err(RendezvousError::Closed),
            Err(_) => {
                // A socket may have been sent between the deadline and now
                rx.close();
                match rx.try_recv() {
                    Ok(socket) => Ok(socket),
                    Err(_) => {
                        debug!("{} data channel {} timed out", kind, session_id);
                        Err(RendezvousError::Timeout { kind, session_id })
                    }
                }
            }
        }
    }

    /// Hand over a data channel that declared `session_id`
    ///
    /// A waiting forwarder gets the socket directly; otherwise it is parked
    /// until claimed or expired. When the socket cannot be delivered it is
    /// dropped, which closes it.
    pub fn offer(&self, kind: ChannelKind, session_id: u64, socket: S) -> Result<(), RendezvousError> {
        let key = (kind, session_id);

        match self.slots.entry(key) {
            Entry::Occupied(entry) => {
                if matches!(entry.get(), Slot::Arrived { .. }) {
                    warn!("Duplicate {} data channel {}, closing it", kind, session_id);
                    return Err(RendezvousError::Duplicate {
                        kind,
                        session_id,
                        side: "offer",
                    });
                }
                if let Slot::Waiting { tx, .. } = entry.remove() {
                    if tx.send(socket).is_err() {
                        debug!("Waiter for {} data channel {} left", kind, session_id);
                        return Err(RendezvousError::Abandoned { kind, session_id });
                    }
                }
                Ok(())
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation();
                entry.insert(Slot::Arrived { socket, generation });
                let expiry = Expiry {
                    deadline: Instant::now() + self.unclaimed_ttl,
                    key,
                    generation,
                };
                if self.expiry_tx.send(expiry).is_err() {
                    warn!("Rendezvous expiry worker is gone");
                }
                Ok(())
            }
        }
    }

    /// Number of waiters plus parked sockets
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Drop every parked socket and fail every waiter
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn expire(&self, expiry: &Expiry) {
        let removed = self.slots.remove_if(&expiry.key, |_, slot| {
            matches!(slot, Slot::Arrived { generation, .. } if *generation == expiry.generation)
        });
        if removed.is_some() {
            debug!(
                "Closing unclaimed {} data channel {}",
                expiry.key.0, expiry.key.1
            );
        }
    }
}

/// Removes this request's waiter on every exit path, including cancellation
struct WaiterGuard<'a, S> {
    slots: &'a DashMap<SlotKey, Slot<S>>,
    key: SlotKey,
    generation: u64,
}

impl<S> Drop for WaiterGuard<'_, S> {
    fn drop(&mut self) {
        let generation = self.generation;
        self.slots.remove_if(&self.key, |_, slot| {
            matches!(slot, Slot::Waiting { generation: g, .. } if *g == generation)
        });
    }
}

async fn expire_unclaimed<S: Send + Sync + 'static>(
    rendezvous: Weak<Rendezvous<S>>,
    mut expiry_rx: mpsc::UnboundedReceiver<Expiry>,
) {
    // The TTL is fixed, so arrival order is deadline order
    while let Some(expiry) = expiry_rx.recv().await {
        tokio::time::sleep_until(expiry.deadline).await;
        match rendezvous.upgrade() {
            Some(rendezvous) => rendezvous.expire(&expiry),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct FakeSocket(u32);

    #[tokio::test]
    async fn test_offer_then_request() {
        let rendezvous = Rendezvous::new(Duration::from_secs(5));
        rendezvous.offer(ChannelKind::Tcp, 7, FakeSocket(1)).unwrap();
        assert_eq!(rendezvous.pending(), 1);

        let socket = rendezvous
            .request(ChannelKind::Tcp, 7, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(socket, FakeSocket(1));
        assert_eq!(rendezvous.pending(), 0);
    }

    #[tokio::test]
    async fn test_request_then_offer() {
        let rendezvous = Rendezvous::new(Duration::from_secs(5));

        let waiter = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move {
                rendezvous
                    .request(ChannelKind::Udp, 42, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rendezvous.pending(), 1);
        rendezvous.offer(ChannelKind::Udp, 42, FakeSocket(2)).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), FakeSocket(2));
        assert_eq!(rendezvous.pending(), 0);
    }

    #[tokio::test]
    async fn test_kinds_are_separate_namespaces() {
        let rendezvous = Rendezvous::new(Duration::from_secs(5));
        rendezvous.offer(ChannelKind::Tcp, 1, FakeSocket(10)).unwrap();
        rendezvous.offer(ChannelKind::Udp, 1, FakeSocket(20)).unwrap();

        let udp = rendezvous
            .request(ChannelKind::Udp, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(udp, FakeSocket(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_leaves_no_entry() {
        let rendezvous: Arc<Rendezvous<FakeSocket>> = Rendezvous::new(Duration::from_secs(5));
        let start = Instant::now();

        let result = rendezvous
            .request(ChannelKind::Tcp, 99, Duration::from_secs(3))
            .await;
        assert_eq!(
            result,
            Err(RendezvousError::Timeout {
                kind: ChannelKind::Tcp,
                session_id: 99
            })
        );
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(rendezvous.pending(), 0);

        // A late arrival is parked, not delivered to the departed waiter
        rendezvous.offer(ChannelKind::Tcp, 99, FakeSocket(3)).unwrap();
        assert_eq!(rendezvous.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_socket_expires() {
        let rendezvous = Rendezvous::new(Duration::from_secs(2));
        rendezvous.offer(ChannelKind::Tcp, 5, FakeSocket(5)).unwrap();

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(rendezvous.pending(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rendezvous.pending(), 0);

        let late = rendezvous
            .request(ChannelKind::Tcp, 5, Duration::from_millis(10))
            .await;
        assert!(matches!(late, Err(RendezvousError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_does_not_remove_newer_socket() {
        let rendezvous = Rendezvous::new(Duration::from_secs(2));
        rendezvous.offer(ChannelKind::Tcp, 8, FakeSocket(1)).unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = rendezvous
            .request(ChannelKind::Tcp, 8, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first, FakeSocket(1));
        rendezvous.offer(ChannelKind::Tcp, 8, FakeSocket(2)).unwrap();

        // First socket's expiry fires here and must leave the second alone
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(rendezvous.pending(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rendezvous.pending(), 0);
    }

    #[tokio::test]
    async fn test_duplicates_are_rejected() {
        let rendezvous = Rendezvous::new(Duration::from_secs(5));
        rendezvous.offer(ChannelKind::Tcp, 3, FakeSocket(1)).unwrap();
        assert!(matches!(
            rendezvous.offer(ChannelKind::Tcp, 3, FakeSocket(2)),
            Err(RendezvousError::Duplicate { .. })
        ));

        let waiter = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move {
                rendezvous
                    .request(ChannelKind::Tcp, 4, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            rendezvous
                .request(ChannelKind::Tcp, 4, Duration::from_secs(1))
                .await,
            Err(RendezvousError::Duplicate { .. })
        ));

        rendezvous.offer(ChannelKind::Tcp, 4, FakeSocket(4)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), FakeSocket(4));
    }

    #[tokio::test]
    async fn test_cancelled_request_cleans_up() {
        let rendezvous: Arc<Rendezvous<FakeSocket>> = Rendezvous::new(Duration::from_secs(5));
        let waiter = {
            let rendezvous = rendezvous.clone();
            tokio::spawn(async move {
                rendezvous
                    .request(ChannelKind::Tcp, 11, Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rendezvous.pending(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(rendezvous.pending(), 0);
    }

    #[tokio::test]
    async fn test_each_socket_delivered_once_under_load() {
        let rendezvous = Rendezvous::new(Duration::from_secs(30));
        let mut waiters = Vec::new();

        for id in 0..200u64 {
            let rendezvous_req = rendezvous.clone();
            waiters.push(tokio::spawn(async move {
                rendezvous_req
                    .request(ChannelKind::Tcp, id, Duration::from_secs(10))
                    .await
            }));
            let rendezvous_offer = rendezvous.clone();
            tokio::spawn(async move {
                rendezvous_offer
                    .offer(ChannelKind::Tcp, id, FakeSocket(id as u32))
                    .unwrap();
            });
        }

        for (id, waiter) in waiters.into_iter().enumerate() {
            assert_eq!(waiter.await.unwrap().unwrap(), FakeSocket(id as u32));
        }
        assert_eq!(rendezvous.pending(), 0);
    }
}
