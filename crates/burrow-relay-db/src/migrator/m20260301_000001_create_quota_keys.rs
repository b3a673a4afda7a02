//! Quota key table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QuotaKeys::Table)
                    .if_not_exists()
                    .col(string_len(QuotaKeys::Name, 255).primary_key())
                    .col(double(QuotaKeys::Balance).not_null().default(0.0))
                    .col(string_len(QuotaKeys::ExpireTime, 32).not_null())
                    .col(string_len(QuotaKeys::Port, 32).not_null())
                    .col(double(QuotaKeys::Rate).not_null().default(0.0))
                    .col(boolean(QuotaKeys::Enabled).not_null().default(true))
                    .col(boolean(QuotaKeys::HtmlEnabled).not_null().default(false))
                    .col(
                        timestamp_with_time_zone(QuotaKeys::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(QuotaKeys::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_quota_keys_enabled")
                    .table(QuotaKeys::Table)
                    .col(QuotaKeys::Enabled)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(QuotaKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QuotaKeys {
    Table,
    Name,
    Balance,
    ExpireTime,
    Port,
    Rate,
    Enabled,
    HtmlEnabled,
    CreatedAt,
    UpdatedAt,
}
