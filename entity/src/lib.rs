//! # Entity 模块
//!
//! 包含所有 Sea-ORM 实体定义

pub mod auth_keys;
pub mod chat_ios;
pub mod chat_logs;
pub mod configs;
pub mod model_with_providers;
pub mod models;
pub mod provider_keys;
pub mod providers;

pub use auth_keys::Entity as AuthKeys;
pub use chat_ios::Entity as ChatIos;
pub use chat_logs::Entity as ChatLogs;
pub use configs::Entity as Configs;
pub use model_with_providers::Entity as ModelWithProviders;
pub use models::Entity as Models;
pub use provider_keys::Entity as ProviderKeys;
pub use providers::Entity as Providers;
