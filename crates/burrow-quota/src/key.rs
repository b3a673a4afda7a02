//! In-memory metering state of one access credential

use crate::policy::{format_expire, PortPolicy};
use crate::store::KeyRecord;
use chrono::{Local, NaiveDateTime};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QuotaError {
    #[error("Quota exhausted for key {0}")]
    Exhausted(String),
}

/// Persistence work a key asks its manager to perform
#[derive(Debug, Clone, PartialEq)]
pub enum KeyEvent {
    /// Balance changed in a way that must reach the store soon
    Save(String),
    /// Key transitioned from enabled to disabled
    Disabled(String),
}

/// Balance plus the balance last reconciled with the store
#[derive(Debug, Clone, Copy)]
struct Meter {
    balance: f64,
    last_synced: f64,
}

/// One access credential as seen by the data plane
///
/// `balance` never goes negative. Deductions are serialized by a single mutex
/// per key; the enable flag flips with compare-and-set so the enabled to
/// disabled transition is observed and persisted exactly once. Store syncs
/// of one key are serialized by `sync`, held across the load, rebase and save.
pub struct QuotaKey {
    name: String,
    meter: Mutex<Meter>,
    sync: tokio::sync::Mutex<()>,
    rate_bits: AtomicU64,
    expire_at: RwLock<NaiveDateTime>,
    port: RwLock<PortPolicy>,
    enabled: AtomicBool,
    html_enabled: AtomicBool,
    events: Option<mpsc::UnboundedSender<KeyEvent>>,
}

impl std::fmt::Debug for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaKey")
            .field("name", &self.name)
            .field("balance", &self.balance())
            .field("rate", &self.rate())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl QuotaKey {
    /// Build a key with no persistence attached
    pub fn from_record(record: KeyRecord) -> Self {
        Self::with_events(record, None)
    }

    pub(crate) fn with_events(
        record: KeyRecord,
        events: Option<mpsc::UnboundedSender<KeyEvent>>,
    ) -> Self {
        let balance = record.balance.max(0.0);
        Self {
            name: record.name,
            meter: Mutex::new(Meter {
                balance,
                last_synced: balance,
            }),
            sync: tokio::sync::Mutex::new(()),
            rate_bits: AtomicU64::new(record.rate.to_bits()),
            expire_at: RwLock::new(record.expire_at),
            port: RwLock::new(record.port),
            enabled: AtomicBool::new(record.enabled),
            html_enabled: AtomicBool::new(record.html_enabled),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn balance(&self) -> f64 {
        self.meter.lock().map(|m| m.balance).unwrap_or(0.0)
    }

    /// Maximum throughput in Mbps; `<= 0` means unlimited
    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    pub fn set_rate(&self, mbps: f64) {
        self.rate_bits.store(mbps.to_bits(), Ordering::Relaxed);
    }

    pub fn expire_at(&self) -> NaiveDateTime {
        match self.expire_at.read() {
            Ok(t) => *t,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_expire_at(&self, t: NaiveDateTime) {
        if let Ok(mut expire_at) = self.expire_at.write() {
            *expire_at = t;
        }
    }

    pub fn port_policy(&self) -> PortPolicy {
        match self.port.read() {
            Ok(p) => *p,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_port_policy(&self, policy: PortPolicy) {
        if let Ok(mut port) = self.port.write() {
            *port = policy;
        }
    }

    pub fn html_enabled(&self) -> bool {
        self.html_enabled.load(Ordering::Relaxed)
    }

    pub fn set_html_enabled(&self, allowed: bool) {
        self.html_enabled.store(allowed, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// True once the expiry deadline has passed
    ///
    /// The first caller to observe expiry on an enabled key disables it and
    /// schedules the persistence write; everyone else just sees `true`.
    pub fn is_out_of_date(&self) -> bool {
        if Local::now().naive_local() < self.expire_at() {
            return false;
        }
        if self.transition_disabled() {
            info!(
                "Key {} expired at {}, disabled",
                self.name,
                format_expire(&self.expire_at())
            );
        }
        true
    }

    /// Disable the key; returns whether this call performed the transition
    pub fn disable(&self) -> bool {
        let transitioned = self.transition_disabled();
        if transitioned {
            info!("Key {} disabled", self.name);
        }
        transitioned
    }

    /// Re-enable the key; returns whether this call performed the transition
    pub fn enable(&self) -> bool {
        self.enabled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn transition_disabled(&self) -> bool {
        let transitioned = self
            .enabled
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if transitioned {
            self.emit(KeyEvent::Disabled(self.name.clone()));
        }
        transitioned
    }

    /// Subtract `mib` from the balance
    ///
    /// Non-positive (and NaN) amounts are ignored. A deduction that would take
    /// the balance below zero clamps it to zero and reports exhaustion.
    pub fn deduct(&self, mib: f64) -> Result<(), QuotaError> {
        if !(mib > 0.0) {
            return Ok(());
        }
        if self.is_out_of_date() || !self.is_enabled() {
            return Err(self.exhausted());
        }

        let clamped = {
            let mut meter = match self.meter.lock() {
                Ok(meter) => meter,
                Err(poisoned) => poisoned.into_inner(),
            };
            if meter.balance <= 0.0 {
                return Err(self.exhausted());
            }
            let remaining = meter.balance - mib;
            if remaining < 0.0 {
                meter.balance = 0.0;
                true
            } else {
                meter.balance = remaining;
                false
            }
        };

        if clamped {
            debug!("Key {} balance clamped to zero", self.name);
            self.emit(KeyEvent::Save(self.name.clone()));
            return Err(self.exhausted());
        }
        Ok(())
    }

    /// Administrative top-up; negative amounts are ignored
    pub fn credit(&self, mib: f64) {
        if !(mib > 0.0) {
            return;
        }
        if let Ok(mut meter) = self.meter.lock() {
            meter.balance += mib;
        }
        self.emit(KeyEvent::Save(self.name.clone()));
    }

    /// Exclusive right to sync this key with the store
    ///
    /// Hold the guard from loading the stored record until the rebased
    /// balance has been saved.
    pub async fn lock_sync(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.sync.lock().await
    }

    /// Fold a freshly read store balance into the in-memory state
    ///
    /// The volume consumed in memory since the last sync is applied to the
    /// stored value, so neither a concurrent writer's update nor an in-memory
    /// deduction is lost. Returns the reconciled balance, which is the value
    /// the caller must persist: deductions made after this call are counted
    /// against it on the next sync. Callers hold [`QuotaKey::lock_sync`].
    pub fn rebase(&self, stored_balance: f64) -> f64 {
        let mut meter = match self.meter.lock() {
            Ok(meter) => meter,
            Err(poisoned) => poisoned.into_inner(),
        };
        let consumed = meter.last_synced - meter.balance;
        let reconciled = (stored_balance - consumed).max(0.0);
        meter.balance = reconciled;
        meter.last_synced = reconciled;
        reconciled
    }

    /// Undo the sync point of a [`QuotaKey::rebase`] whose save failed
    ///
    /// `stored_balance` is what the store still holds, so everything consumed
    /// since is charged again on the next sync.
    pub fn restore_sync_point(&self, stored_balance: f64) {
        let mut meter = match self.meter.lock() {
            Ok(meter) => meter,
            Err(poisoned) => poisoned.into_inner(),
        };
        meter.last_synced = stored_balance;
    }

    /// Pick up administrative edits made to the stored record
    pub fn refresh_policy(&self, record: &KeyRecord) {
        self.set_rate(record.rate);
        self.set_expire_at(record.expire_at);
        self.set_port_policy(record.port);
        self.set_html_enabled(record.html_enabled);
    }

    pub fn to_record(&self) -> KeyRecord {
        KeyRecord {
            name: self.name.clone(),
            balance: self.balance(),
            rate: self.rate(),
            expire_at: self.expire_at(),
            port: self.port_policy(),
            enabled: self.is_enabled(),
            html_enabled: self.html_enabled(),
        }
    }

    fn exhausted(&self) -> QuotaError {
        QuotaError::Exhausted(self.name.clone())
    }

    fn emit(&self, event: KeyEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("Key {} persistence channel closed", self.name);
            }
        }
    }
}
