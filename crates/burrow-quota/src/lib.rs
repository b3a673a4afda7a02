//! Quota keys, metering and throttling
//!
//! A [`QuotaKey`] is the in-memory metering state of one access credential.
//! Every forwarder bound to the same key shares one `Arc<QuotaKey>` handed out
//! by the [`KeyManager`], which also owns persistence through a [`KeyStore`].

pub mod key;
pub mod manager;
pub mod policy;
pub mod rate_limiter;
pub mod store;

pub use key::{KeyEvent, QuotaError, QuotaKey};
pub use manager::KeyManager;
pub use policy::{format_expire, parse_expire, PolicyError, PortPolicy, EXPIRE_FORMAT};
pub use rate_limiter::RateLimiter;
pub use store::{KeyRecord, KeyStore, KeyStoreError, MemoryKeyStore};

/// Bytes in one quota unit
pub const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Convert a transferred byte count into quota units
pub fn bytes_to_mib(bytes: usize) -> f64 {
    bytes as f64 / BYTES_PER_MIB
}
