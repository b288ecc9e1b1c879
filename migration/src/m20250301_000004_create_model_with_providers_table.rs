use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ModelWithProviders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ModelWithProviders::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::ModelId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::ProviderId)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::ProviderModel)
                            .string_len(100)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::ToolCall)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::StructuredOutput)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::Image)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::WithHeader)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::Status)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(ModelWithProviders::CustomerHeaders).text())
                    .col(
                        ColumnDef::new(ModelWithProviders::Weight)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(ModelWithProviders::KeyCooldownUntil).timestamp())
                    .col(
                        ColumnDef::new(ModelWithProviders::KeyCooldownStep)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ModelWithProviders::ProviderCooldownUntil).timestamp())
                    .col(
                        ColumnDef::new(ModelWithProviders::ProviderCooldownStep)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::CreatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ModelWithProviders::UpdatedAt)
                            .timestamp()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(ModelWithProviders::DeletedAt).timestamp())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_model_with_providers_model_id")
                            .from(ModelWithProviders::Table, ModelWithProviders::ModelId)
                            .to(Models::Table, Models::Id)
                            .on_update(ForeignKeyAction::Cascade)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_model_with_providers_provider_id")
                            .from(ModelWithProviders::Table, ModelWithProviders::ProviderId)
                            .to(Providers::Table, Providers::Id)
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
                    .name("idx_model_with_providers_model_id")
                    .table(ModelWithProviders::Table)
                    .col(ModelWithProviders::ModelId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_model_with_providers_provider_id")
                    .table(ModelWithProviders::Table)
                    .col(ModelWithProviders::ProviderId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ModelWithProviders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ModelWithProviders {
    Table,
    Id,
    ModelId,
    ProviderId,
    ProviderModel,
    ToolCall,
    StructuredOutput,
    Image,
    WithHeader,
    Status,
    CustomerHeaders,
    Weight,
    KeyCooldownUntil,
    KeyCooldownStep,
    ProviderCooldownUntil,
    ProviderCooldownStep,
    CreatedAt,
    UpdatedAt,
    DeletedAt,
}

#[derive(DeriveIden)]
enum Models {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Providers {
    Table,
    Id,
}
