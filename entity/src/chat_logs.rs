//! # 转发审计日志实体定义
//!
//! 每次转发尝试（成功、重试失败或缓存命中）写入一行

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 转发审计日志实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chat_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 对外模型名
    pub name: String,
    /// 上游真实模型名
    pub provider_model: Option<String>,
    /// 渠道名称
    pub provider_name: Option<String>,
    /// success 或 error
    pub status: String,
    /// 请求风格
    pub style: String,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    /// 使用的 AuthKey ID
    pub auth_key_id: i32,
    /// 使用的 ProviderKey ID，0 代表未从密钥池取到
    pub provider_key_id: i32,
    /// 是否开启 IO 记录
    pub chat_io: bool,
    /// status 为 error 时的错误信息
    pub error: Option<String>,
    /// 第几次尝试
    pub retry: i32,
    /// 代理耗时，毫秒
    pub proxy_time_ms: i64,
    /// 首个 chunk 耗时，毫秒
    pub first_chunk_time_ms: i64,
    /// chunk 耗时，毫秒
    pub chunk_time_ms: i64,
    pub tps: f64,
    /// 响应大小，字节
    pub size: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    /// 提示词明细 JSON: cached_tokens / audio_tokens
    pub prompt_tokens_details: Option<String>,
    /// 是否来源于缓存命中
    pub cached: bool,
    /// 指向最初生成缓存的日志 ID
    pub cached_from_log_id: Option<i32>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::chat_ios::Entity")]
    ChatIos,
}

impl Related<super::chat_ios::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChatIos.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
