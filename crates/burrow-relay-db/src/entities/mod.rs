//! Database entities

pub mod quota_key;

pub use quota_key::Entity as QuotaKey;

pub mod prelude {
    pub use super::quota_key::Entity as QuotaKey;
}
