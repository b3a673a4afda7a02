//! `KeyStore` backed by the `quota_keys` table

use crate::entities::quota_key;
use async_trait::async_trait;
use burrow_quota::{format_expire, parse_expire, KeyRecord, KeyStore, KeyStoreError};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::debug;

#[derive(Clone)]
pub struct DbKeyStore {
    db: DatabaseConnection,
}

impl DbKeyStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn db_err(e: DbErr) -> KeyStoreError {
    KeyStoreError::Database(e.to_string())
}

fn to_record(model: quota_key::Model) -> Result<KeyRecord, KeyStoreError> {
    let corrupt = |reason: String| KeyStoreError::CorruptRecord {
        name: model.name.clone(),
        reason,
    };
    let port = model.port.parse().map_err(|e| corrupt(format!("{}", e)))?;
    let expire_at = parse_expire(&model.expire_time).map_err(|e| corrupt(format!("{}", e)))?;

    Ok(KeyRecord {
        name: model.name,
        balance: model.balance,
        rate: model.rate,
        expire_at,
        port,
        enabled: model.enabled,
        html_enabled: model.html_enabled,
    })
}

#[async_trait]
impl KeyStore for DbKeyStore {
    async fn load(&self, name: &str) -> Result<Option<KeyRecord>, KeyStoreError> {
        quota_key::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(to_record)
            .transpose()
    }

    async fn save(&self, record: &KeyRecord) -> Result<bool, KeyStoreError> {
        let existing = quota_key::Entity::find_by_id(record.name.clone())
            .one(&self.db)
            .await
            .map_err(db_err)?;
        let now = Utc::now();

        match existing {
            Some(model) => {
                let mut active: quota_key::ActiveModel = model.into();
                active.balance = Set(record.balance);
                active.expire_time = Set(format_expire(&record.expire_at));
                active.port = Set(record.port.to_string());
                active.rate = Set(record.rate);
                active.enabled = Set(record.enabled);
                active.html_enabled = Set(record.html_enabled);
                active.updated_at = Set(now);
                active.update(&self.db).await.map_err(db_err)?;
            }
            None => {
                let active = quota_key::ActiveModel {
                    name: Set(record.name.clone()),
                    balance: Set(record.balance),
                    expire_time: Set(format_expire(&record.expire_at)),
                    port: Set(record.port.to_string()),
                    rate: Set(record.rate),
                    enabled: Set(record.enabled),
                    html_enabled: Set(record.html_enabled),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                active.insert(&self.db).await.map_err(db_err)?;
                debug!("Key {} created", record.name);
            }
        }

        Ok(true)
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool, KeyStoreError> {
        let result = quota_key::Entity::update_many()
            .col_expr(quota_key::Column::Enabled, Expr::value(enabled))
            .col_expr(quota_key::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(quota_key::Column::Name.eq(name))
            .exec(&self.db)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected > 0)
    }

    async fn exists(&self, name: &str) -> Result<bool, KeyStoreError> {
        let found = quota_key::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn list(&self) -> Result<Vec<KeyRecord>, KeyStoreError> {
        quota_key::Entity::find()
            .order_by_asc(quota_key::Column::Name)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(to_record)
            .collect()
    }

    async fn delete(&self, name: &str) -> Result<bool, KeyStoreError> {
        let result = quota_key::Entity::delete_by_id(name.to_string())
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected > 0)
    }
}
