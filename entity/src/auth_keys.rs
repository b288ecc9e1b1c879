//! # 接入密钥实体定义
//!
//! 客户端访问网关使用的租户级密钥，携带模型访问策略

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 接入密钥实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 项目名称
    pub name: String,
    /// sk-llmio- 前缀密钥
    pub key: String,
    /// 是否启用
    pub status: bool,
    /// 是否允许所有模型
    pub allow_all: bool,
    /// 允许的模型列表 JSON 数组
    pub models: Option<String>,
    /// 过期时间，空值永不过期
    pub expires_at: Option<DateTime>,
    /// 使用次数统计
    pub usage_count: i64,
    /// 最后使用时间
    pub last_used_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

impl Model {
    /// 解析允许的模型列表，解析失败按空列表处理
    #[must_use]
    pub fn allowed_models(&self) -> Vec<String> {
        self.models
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
