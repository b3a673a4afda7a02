//! Persisted access credential with its remaining quota

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "quota_keys")]
pub struct Model {
    /// Key name (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,

    /// Remaining volume in MiB
    pub balance: f64,

    /// Expiry as `yyyy/MM/dd-HH:mm` local time
    pub expire_time: String,

    /// Single port (`5000`) or inclusive range (`5000-5100`)
    pub port: String,

    /// Throughput cap in Mbps, `<= 0` for unlimited
    pub rate: f64,

    pub enabled: bool,

    /// Whether HTML responses may pass through
    pub html_enabled: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
