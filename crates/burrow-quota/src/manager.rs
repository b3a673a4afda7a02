//! Key cache and persistence writer

use crate::key::{KeyEvent, QuotaKey};
use crate::store::{KeyRecord, KeyStore, KeyStoreError};
use chrono::Local;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hands out one shared [`QuotaKey`] per name and keeps the store in sync
///
/// Keys are loaded lazily on first use. Balance changes are written back by a
/// single writer task, either when a key asks for it or on the periodic
/// flush, always through the snapshot-diff in [`QuotaKey::rebase`].
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    keys: DashMap<String, Arc<QuotaKey>>,
    events_tx: mpsc::UnboundedSender<KeyEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<KeyEvent>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            keys: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// Cached key, if it has been acquired before
    pub fn get(&self, name: &str) -> Option<Arc<QuotaKey>> {
        self.keys.get(name).map(|entry| entry.value().clone())
    }

    pub fn cached(&self) -> usize {
        self.keys.len()
    }

    /// Load (or refresh) a key from the store
    ///
    /// Returns `None` when the store has no such key. An already cached key is
    /// reconciled with the stored record and the same `Arc` is returned.
    pub async fn acquire(&self, name: &str) -> Result<Option<Arc<QuotaKey>>, KeyStoreError> {
        if let Some(key) = self.get(name) {
            return Ok(self.flush(&key).await?.then_some(key));
        }

        let stored = match self.store.load(name).await? {
            Some(record) => record,
            None => return Ok(None),
        };

        let fresh = Arc::new(QuotaKey::with_events(
            stored,
            Some(self.events_tx.clone()),
        ));
        let key = self
            .keys
            .entry(name.to_string())
            .or_insert(fresh)
            .value()
            .clone();
        debug!("Key {} loaded, balance {:.2} MiB", name, key.balance());
        Ok(Some(key))
    }

    /// Write one key back to the store
    ///
    /// Load, rebase and save run under the key's sync lock, so concurrent
    /// flushes of one key never rebase against the same stored value.
    /// Returns `false` if the key no longer exists in the store, in which
    /// case it is dropped from the cache.
    pub async fn flush(&self, key: &QuotaKey) -> Result<bool, KeyStoreError> {
        let _sync = key.lock_sync().await;
        let stored = match self.store.load(key.name()).await? {
            Some(record) => record,
            None => {
                warn!("Key {} vanished from the store, evicting", key.name());
                self.evict(key.name());
                return Ok(false);
            }
        };

        let synced = key.rebase(stored.balance);
        apply_stored_policy(key, &stored);

        let mut record = key.to_record();
        record.balance = synced;
        match self.store.save(&record).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                key.restore_sync_point(stored.balance);
                Err(e)
            }
        }
    }

    pub async fn flush_all(&self) {
        let keys: Vec<Arc<QuotaKey>> = self.keys.iter().map(|e| e.value().clone()).collect();
        for key in keys {
            if let Err(e) = self.flush(&key).await {
                error!("Failed to flush key {}: {}", key.name(), e);
            }
        }
    }

    /// Second look at the store after a deduction hit zero
    ///
    /// Returns whether the key may keep metering, e.g. because it was topped
    /// up by an administrator since the last sync.
    pub async fn reconcile(&self, key: &QuotaKey) -> bool {
        if let Err(e) = self.flush(key).await {
            error!("Failed to reconcile key {}: {}", key.name(), e);
            return false;
        }
        let revived = key.is_enabled() && key.balance() > 0.0 && !key.is_out_of_date();
        if revived {
            info!(
                "Key {} revived with {:.2} MiB after reconcile",
                key.name(),
                key.balance()
            );
        }
        revived
    }

    /// Administrative top-up; returns the new balance, or `None` for an unknown key
    pub async fn top_up(&self, name: &str, mib: f64) -> Result<Option<f64>, KeyStoreError> {
        let Some(key) = self.acquire(name).await? else {
            return Ok(None);
        };
        key.credit(mib);
        self.flush(&key).await?;
        Ok(Some(key.balance()))
    }

    pub fn evict(&self, name: &str) {
        self.keys.remove(name);
    }

    /// Start the persistence writer
    ///
    /// The writer handles key events as they arrive, flushes every key on
    /// `flush_interval`, and performs a last full flush when `shutdown` fires.
    /// Only the first call starts a writer.
    pub fn spawn_writer(
        self: &Arc<Self>,
        flush_interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let mut events = self.events_rx.lock().ok()?.take()?;
        let manager = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    Some(event) = events.recv() => manager.handle_event(event).await,
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.flush_all().await,
                }
            }

            while let Ok(event) = events.try_recv() {
                manager.handle_event(event).await;
            }
            manager.flush_all().await;
            info!("Key writer stopped, {} keys flushed", manager.cached());
        }))
    }

    async fn handle_event(&self, event: KeyEvent) {
        match event {
            KeyEvent::Save(name) => {
                if let Some(key) = self.get(&name) {
                    if let Err(e) = self.flush(&key).await {
                        error!("Failed to save key {}: {}", name, e);
                    }
                }
            }
            KeyEvent::Disabled(name) => match self.store.set_enabled(&name, false).await {
                Ok(true) => debug!("Key {} persisted as disabled", name),
                Ok(false) => warn!("Key {} not found while disabling", name),
                Err(e) => error!("Failed to disable key {}: {}", name, e),
            },
        }
    }
}

/// Pick up administrative edits from the stored record
fn apply_stored_policy(key: &QuotaKey, stored: &KeyRecord) {
    key.refresh_policy(stored);

    if !stored.enabled {
        key.disable();
    } else if !key.is_enabled()
        && key.balance() > 0.0
        && Local::now().naive_local() < stored.expire_at
    {
        key.enable();
        info!("Key {} re-enabled from store", key.name());
    }
}
