//! # 渠道密钥池模块
//!
//! 同一渠道下启用密钥的轮询选取，密钥自身的冷却字段与关联行退避同构

use crate::cooldown::{Category, backoff_for_step};
use crate::error::{ProxyError, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use dashmap::DashMap;
use entity::provider_keys::{self, Entity as ProviderKeys};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 轮询游标：provider_id -> 单调递增序号。跨请求存活，保证同渠道内依次轮换
static ROUND_ROBIN_CURSORS: LazyLock<DashMap<i32, AtomicUsize>> = LazyLock::new(DashMap::new);

/// 渠道密钥池
#[derive(Debug)]
pub struct Pool {
    db: DatabaseConnection,
}

impl Pool {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// 为指定渠道轮询选取一个可用密钥，跳过冷却中的密钥。
    /// 返回 (密钥原文, 密钥ID)
    pub async fn pick(&self, provider_id: i32) -> Result<(String, i32)> {
        let keys = ProviderKeys::find()
            .filter(provider_keys::Column::ProviderId.eq(provider_id))
            .filter(provider_keys::Column::Enabled.eq(true))
            .order_by_asc(provider_keys::Column::Id)
            .all(&self.db)
            .await?;

        if keys.is_empty() {
            return Err(ProxyError::business(format!(
                "no enabled keys for provider {provider_id}"
            )));
        }

        let cursor = ROUND_ROBIN_CURSORS
            .entry(provider_id)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let now = Utc::now().naive_utc();
        for offset in 0..keys.len() {
            let key = &keys[(cursor + offset) % keys.len()];
            if key.cooldown_until.is_some_and(|until| now < until) {
                continue;
            }
            return Ok((key.key.clone(), key.id));
        }

        Err(ProxyError::business(format!(
            "all keys in cooldown for provider {provider_id}"
        )))
    }

    /// 按类别推进密钥冷却，client/none 不处理
    pub async fn on_error(&self, key_id: i32, category: Category) -> Result<()> {
        if !matches!(category, Category::Key | Category::Provider) {
            return Ok(());
        }
        let Some(key) = ProviderKeys::find_by_id(key_id).one(&self.db).await? else {
            return Ok(());
        };

        let next_step = (key.cooldown_step + 1).min(8);
        let backoff = backoff_for_step(next_step);
        let until = Utc::now().naive_utc()
            + ChronoDuration::from_std(backoff)
                .unwrap_or_else(|_| ChronoDuration::seconds(backoff.as_secs() as i64));

        ProviderKeys::update_many()
            .col_expr(provider_keys::Column::CooldownStep, Expr::value(next_step))
            .col_expr(provider_keys::Column::CooldownUntil, Expr::value(until))
            .filter(provider_keys::Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// 成功后清零密钥冷却
    pub async fn on_success(&self, key_id: i32) -> Result<()> {
        ProviderKeys::update_many()
            .col_expr(provider_keys::Column::CooldownStep, Expr::value(0))
            .col_expr(
                provider_keys::Column::CooldownUntil,
                Expr::value(Option::<NaiveDateTime>::None),
            )
            .filter(provider_keys::Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
