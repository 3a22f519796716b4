use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RateLimitState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RateLimitState::Key)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RateLimitState::State).json_binary().null())
                    .col(ColumnDef::new(RateLimitState::ExpiresAt).double().not_null())
                    .col(
                        ColumnDef::new(RateLimitState::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Sweeps delete by expiry.
        manager
            .create_index(
                Index::create()
                    .name("rate_limit_state_expires_at_idx")
                    .table(RateLimitState::Table)
                    .col(RateLimitState::ExpiresAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RateLimitState::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RateLimitState {
    Table,
    Key,
    State,
    ExpiresAt,
    UpdatedAt,
}
