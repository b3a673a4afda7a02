//! Key persistence interface

use crate::policy::PortPolicy;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record for key {name}: {reason}")]
    CorruptRecord { name: String, reason: String },
}

/// The persisted fields of a key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRecord {
    pub name: String,
    /// Remaining volume in MiB
    pub balance: f64,
    /// Maximum throughput in Mbps; `<= 0` means unlimited
    pub rate: f64,
    pub expire_at: NaiveDateTime,
    pub port: PortPolicy,
    pub enabled: bool,
    /// Whether HTML responses may be served through this key's tunnels
    pub html_enabled: bool,
}

/// Persistence collaborator for key records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<KeyRecord>, KeyStoreError>;

    /// Insert or update a record; returns whether a row was written
    async fn save(&self, record: &KeyRecord) -> Result<bool, KeyStoreError>;

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, KeyStoreError>;

    async fn exists(&self, name: &str) -> Result<bool, KeyStoreError>;

    async fn list(&self) -> Result<Vec<KeyRecord>, KeyStoreError>;

    async fn delete(&self, name: &str) -> Result<bool, KeyStoreError>;
}

/// In-process key store
#[derive(Default)]
pub struct MemoryKeyStore {
    records: Mutex<HashMap<String, KeyRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.records.lock() {
            for record in records {
                map.insert(record.name.clone(), record);
            }
        }
        store
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, KeyRecord>>, KeyStoreError> {
        self.records
            .lock()
            .map_err(|_| KeyStoreError::Database("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self, name: &str) -> Result<Option<KeyRecord>, KeyStoreError> {
        Ok(self.records()?.get(name).cloned())
    }

    async fn save(&self, record: &KeyRecord) -> Result<bool, KeyStoreError> {
        self.records()?.insert(record.name.clone(), record.clone());
        Ok(true)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, KeyStoreError> {
        Ok(match self.records()?.get_mut(name) {
            Some(record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        })
    }

    async fn exists(&self, name: &str) -> Result<bool, KeyStoreError> {
        Ok(self.records()?.contains_key(name))
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, KeyStoreError> {
        let mut records: Vec<KeyRecord> = self.records()?.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn delete(&self, name: &str) -> Result<bool, KeyStoreError> {
        Ok(self.records()?.remove(name).is_some())
    }
}
