//! # 冷却管理模块
//!
//! 按错误类别对关联行的渠道/key 两级作用域做指数退避，状态持久化在关联行上。
//! 并发写入采用最后写入者胜出，多付出一档退避或丢失一次重置是可接受的

use crate::error::Result;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use entity::model_with_providers::{self, Entity as ModelWithProviders};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::time::Duration;

/// 退避基数
const BASE_BACKOFF: Duration = Duration::from_secs(1);
/// 退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// 退避次数上限
const MAX_STEP: i32 = 8;

/// 错误类别，决定更新哪个冷却作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// 良性，无需处理
    None,
    /// 调用方问题，不冷却上游
    Client,
    /// 凭证层面失败，冷却 key 作用域
    Key,
    /// 上游故障，冷却渠道作用域
    Provider,
}

/// 按上游 HTTP 状态码分类
#[must_use]
pub const fn classify_status(status: u16) -> Category {
    match status {
        401 | 403 | 429 => Category::Key,
        400 | 404 | 422 => Category::Client,
        200..=299 => Category::None,
        _ => Category::Provider,
    }
}

/// 计算第 step 次退避时长，base * 2^(step-1)，夹在 [base, max] 内
#[must_use]
pub fn backoff_for_step(step: i32) -> Duration {
    if step <= 0 {
        return BASE_BACKOFF;
    }
    let exp = (step - 1).min(30) as u32;
    let backoff = BASE_BACKOFF.saturating_mul(1u32 << exp);
    backoff.clamp(BASE_BACKOFF, MAX_BACKOFF)
}

/// 冷却管理器
#[derive(Debug)]
pub struct Manager {
    db: DatabaseConnection,
}

impl Manager {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 任一作用域的冷却截止时间严格晚于当前时间即视为冷却中
    #[must_use]
    pub fn in_cooldown(&self, assoc: &model_with_providers::Model) -> bool {
        let now = Utc::now().naive_utc();
        in_cooldown_at(assoc, now)
    }

    /// 按类别推进对应作用域的退避档位并持久化
    pub async fn on_error(
        &self,
        assoc: &model_with_providers::Model,
        category: Category,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        let (step_col, until_col, step) = match category {
            Category::Key => (
                model_with_providers::Column::KeyCooldownStep,
                model_with_providers::Column::KeyCooldownUntil,
                assoc.key_cooldown_step,
            ),
            Category::Provider => (
                model_with_providers::Column::ProviderCooldownStep,
                model_with_providers::Column::ProviderCooldownUntil,
                assoc.provider_cooldown_step,
            ),
            Category::None | Category::Client => return Ok(()),
        };

        let next_step = (step + 1).min(MAX_STEP);
        let backoff = backoff_for_step(next_step);
        let until = now
            + ChronoDuration::from_std(backoff)
                .unwrap_or_else(|_| ChronoDuration::seconds(backoff.as_secs() as i64));

        ModelWithProviders::update_many()
            .col_expr(step_col, Expr::value(next_step))
            .col_expr(until_col, Expr::value(until))
            .filter(model_with_providers::Column::Id.eq(assoc.id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// 成功后单次更新清零两个作用域
    pub async fn on_success(&self, assoc: &model_with_providers::Model) -> Result<()> {
        ModelWithProviders::update_many()
            .col_expr(model_with_providers::Column::KeyCooldownStep, Expr::value(0))
            .col_expr(
                model_with_providers::Column::KeyCooldownUntil,
                Expr::value(Option::<NaiveDateTime>::None),
            )
            .col_expr(
                model_with_providers::Column::ProviderCooldownStep,
                Expr::value(0),
            )
            .col_expr(
                model_with_providers::Column::ProviderCooldownUntil,
                Expr::value(Option::<NaiveDateTime>::None),
            )
            .filter(model_with_providers::Column::Id.eq(assoc.id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

fn in_cooldown_at(assoc: &model_with_providers::Model, now: NaiveDateTime) -> bool {
    let provider_cooling = assoc
        .provider_cooldown_until
        .is_some_and(|until| now < until);
    let key_cooling = assoc.key_cooldown_until.is_some_and(|until| now < until);
    provider_cooling || key_cooling
}
