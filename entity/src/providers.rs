//! # 上游渠道实体定义
//!
//! 一条记录对应一个上游 API 端点，config 字段保存该端点的透传配置

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 上游渠道实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 渠道名称
    pub name: String,
    /// 渠道风格: openai / openai-res / anthropic
    #[sea_orm(column_name = "type")]
    pub r#type: String,
    /// 渠道配置 JSON: base_url / api_key / version
    pub config: String,
    /// 控制台地址
    pub console: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::provider_keys::Entity")]
    ProviderKeys,
    #[sea_orm(has_many = "super::model_with_providers::Entity")]
    ModelWithProviders,
}

impl Related<super::provider_keys::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProviderKeys.def()
    }
}

impl Related<super::model_with_providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ModelWithProviders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
