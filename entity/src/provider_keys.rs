//! # 渠道密钥池实体定义
//!
//! 一个渠道下的一条上游凭证，冷却字段由调度反馈维护

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 渠道密钥实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "provider_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub provider_id: i32,
    /// 上游密钥原文
    pub key: String,
    /// 备注
    pub remark: Option<String>,
    /// 是否启用
    pub enabled: bool,
    /// 冷却截止时间，空值代表未冷却
    pub cooldown_until: Option<DateTime>,
    /// 退避次数
    pub cooldown_step: i32,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::providers::Entity",
        from = "Column::ProviderId",
        to = "super::providers::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Provider,
}

impl Related<super::providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Provider.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
