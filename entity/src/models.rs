//! # 虚拟模型实体定义
//!
//! 对外暴露的模型名，携带重试/超时/调度策略等转发元数据

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 虚拟模型实体
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    /// 对外模型名
    pub name: String,
    /// 备注
    pub remark: Option<String>,
    /// 重试次数限制
    pub max_retry: i32,
    /// 整体重试预算，单位秒
    pub time_out: i32,
    /// 是否记录请求与响应正文
    pub io_log: bool,
    /// 负载均衡策略，空串使用默认 lottery
    pub strategy: String,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub deleted_at: Option<DateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::model_with_providers::Entity")]
    ModelWithProviders,
}

impl Related<super::model_with_providers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ModelWithProviders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
