use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AuthKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthKeys::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthKeys::Name).string_len(100).not_null())
                    .col(ColumnDef::new(AuthKeys::Key).string_len(64).not_null())
                    .col(
                        ColumnDef::new(AuthKeys::Status)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(AuthKeys::AllowAll)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(AuthKeys::Models).text())
                    .col(ColumnDef::new(AuthKeys::ExpiresAt).timestamp())
                    .col(
                        ColumnDef::new(AuthKeys::UsageCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(AuthKeys::LastUsedAt).timestamp())
                    .col(
                        ColumnDef::new(AuthKeys::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AuthKeys::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(AuthKeys::DeletedAt).timestamp())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_keys_key")
                    .table(AuthKeys::Table)
                    .col(AuthKeys::Key)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AuthKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AuthKeys {
    Table,
    Id,
    Name,
    Key,
    Status,
    AllowAll,
    Models,
    ExpiresAt,
    UsageCount,
    LastUsedAt,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}
