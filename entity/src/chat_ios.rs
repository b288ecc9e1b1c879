//! # 请求响应正文记录实体定义
//!
//! io_log 开启时保存一次转发的输入与输出正文

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 请求响应正文记录实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "chat_ios")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub log_id: i32,
    /// 原始请求正文
    pub input: String,
    /// 非流式响应正文
    pub of_string: Option<String>,
    /// 流式响应帧序列 JSON 数组
    pub of_string_array: Option<String>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::chat_logs::Entity",
        from = "Column::LogId",
        to = "super::chat_logs::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    ChatLog,
}

impl Related<super::chat_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChatLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
