use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ChatLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChatLogs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ChatLogs::Name).string_len(100).not_null())
                    .col(ColumnDef::new(ChatLogs::ProviderModel).string_len(100))
                    .col(ColumnDef::new(ChatLogs::ProviderName).string_len(100))
                    .col(ColumnDef::new(ChatLogs::Status).string_len(10).not_null())
                    .col(ColumnDef::new(ChatLogs::Style).string_len(20).not_null())
                    .col(ColumnDef::new(ChatLogs::UserAgent).string_len(255))
                    .col(ColumnDef::new(ChatLogs::RemoteIp).string_len(64))
                    .col(
                        ColumnDef::new(ChatLogs::AuthKeyId)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::ProviderKeyId)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::ChatIo)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ChatLogs::Error).text())
                    .col(
                        ColumnDef::new(ChatLogs::Retry)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::ProxyTimeMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::FirstChunkTimeMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::ChunkTimeMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::Tps)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::Size)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::PromptTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::CompletionTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::TotalTokens)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ChatLogs::PromptTokensDetails).text())
                    .col(
                        ColumnDef::new(ChatLogs::Cached)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ChatLogs::CachedFromLogId).integer())
                    .col(
                        ColumnDef::new(ChatLogs::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ChatLogs::UpdatedAt)
                            .timestamp()
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
                    .name("idx_chat_logs_name")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::Name)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_logs_status")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_logs_auth_key_id")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::AuthKeyId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_logs_provider_key_id")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::ProviderKeyId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_logs_cached")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::Cached)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_logs_cached_from_log_id")
                    .table(ChatLogs::Table)
                    .col(ChatLogs::CachedFromLogId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChatLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ChatLogs {
    Table,
    Id,
    Name,
    ProviderModel,
    ProviderName,
    Status,
    Style,
    UserAgent,
    RemoteIp,
    AuthKeyId,
    ProviderKeyId,
    ChatIo,
    Error,
    Retry,
    ProxyTimeMs,
    FirstChunkTimeMs,
    ChunkTimeMs,
    Tps,
    Size,
    PromptTokens,
    CompletionTokens,
    TotalTokens,
    PromptTokensDetails,
    Cached,
    CachedFromLogId,
    CreatedAt,
    UpdatedAt,
}
