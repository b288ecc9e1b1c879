use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ChatIos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChatIos::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ChatIos::LogId).integer().not_null())
                    .col(ColumnDef::new(ChatIos::Input).text().not_null())
                    .col(ColumnDef::new(ChatIos::OfString).text())
                    .col(ColumnDef::new(ChatIos::OfStringArray).text())
                    .col(
                        ColumnDef::new(ChatIos::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ChatIos::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_chat_ios_log_id")
                            .from(ChatIos::Table, ChatIos::LogId)
                            .to(ChatLogs::Table, ChatLogs::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_chat_ios_log_id")
                    .table(ChatIos::Table)
                    .col(ChatIos::LogId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChatIos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ChatIos {
    Table,
    Id,
    LogId,
    Input,
    OfString,
    OfStringArray,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum ChatLogs {
    Table,
    Id,
}
