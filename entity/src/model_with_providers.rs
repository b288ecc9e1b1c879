//! # 模型渠道关联实体定义
//!
//! 虚拟模型与上游渠道的绑定关系，携带能力开关、权重与两级冷却状态

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 模型渠道关联实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "model_with_providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub model_id: i32,
    pub provider_id: i32,
    /// 上游真实模型名
    pub provider_model: String,
    /// 能否接受带有工具调用的请求
    pub tool_call: bool,
    /// 能否接受带有结构化输出的请求
    pub structured_output: bool,
    /// 能否接受带有图片的请求
    pub image: bool,
    /// 是否透传客户端请求头
    pub with_header: bool,
    /// 是否启用
    pub status: bool,
    /// 自定义请求头 JSON: {name: value}
    pub customer_headers: Option<String>,
    /// 权重，参与加权负载均衡
    pub weight: i32,
    /// key 级冷却截止时间
    pub key_cooldown_until: Option<DateTime>,
    /// key 级退避次数
    pub key_cooldown_step: i32,
    /// 渠道级冷却截止时间
    pub provider_cooldown_until: Option<DateTime>,
    /// 渠道级退避次数
    pub provider_cooldown_step: i32,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

impl Model {
    /// 解析自定义请求头 JSON，解析失败按空集处理
    #[must_use]
    pub fn customer_headers_map(&self) -> HashMap<String, String> {
        self.customer_headers
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::models::Entity",
        from = "Column::ModelId",
        to = "super::models::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Model,
    #[sea_orm(
        belongs_to = "super::providers::Entity",
        from = "Column::ProviderId",
        to = "super::providers::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Provider,
}

impl Related<super::models::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Model.def()
    }
}

impl Related<super::providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
