//! Migration to create the sessions table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(string_len(Sessions::Id, 253).primary_key())
                    .col(string_len(Sessions::UserId, 255).not_null())
                    .col(string_len_null(Sessions::AgentId, 255))
                    .col(
                        string_len(Sessions::State, 32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(integer(Sessions::ActiveConnections).not_null().default(0))
                    .col(timestamp_with_time_zone_null(Sessions::LastConnection))
                    .col(timestamp_with_time_zone_null(Sessions::LastDisconnect))
                    .col(
                        timestamp_with_time_zone(Sessions::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Sessions::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Agents list their sessions on reconnect
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_agent_id")
                    .table(Sessions::Table)
                    .col(Sessions::AgentId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_user_id")
                    .table(Sessions::Table)
                    .col(Sessions::UserId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Sessions {
    #[sea_orm(iden = "sessions")]
    Table,
    Id,
    UserId,
    AgentId,
    State,
    ActiveConnections,
    LastConnection,
    LastDisconnect,
    CreatedAt,
    UpdatedAt,
}
