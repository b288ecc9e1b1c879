pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_providers_table;
mod m20250301_000002_create_provider_keys_table;
mod m20250301_000003_create_models_table;
mod m20250301_000004_create_model_with_providers_table;
mod m20250301_000005_create_chat_logs_table;
mod m20250301_000006_create_chat_ios_table;
mod m20250301_000007_create_auth_keys_table;
mod m20250301_000008_create_configs_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_providers_table::Migration),
            Box::new(m20250301_000002_create_provider_keys_table::Migration),
            Box::new(m20250301_000003_create_models_table::Migration),
            Box::new(m20250301_000004_create_model_with_providers_table::Migration),
            Box::new(m20250301_000005_create_chat_logs_table::Migration),
            Box::new(m20250301_000006_create_chat_ios_table::Migration),
            Box::new(m20250301_000007_create_auth_keys_table::Migration),
            Box::new(m20250301_000008_create_configs_table::Migration),
        ]
    }
}
