//! 缓存管理接口：统计查询与按租户/风格失效

use crate::cache::CacheStats;
use crate::error::{ProxyError, Result};
use crate::handler::AppState;
use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value as JsonValue, json};

/// 获取缓存统计信息
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

/// 按租户清空缓存
pub async fn cache_delete_by_auth_key(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Json<JsonValue> {
    state.cache.delete_by_auth_key(id);
    Json(json!({ "message": "cache cleared successfully" }))
}

/// 按请求风格清空缓存
pub async fn cache_delete_by_style(
    State(state): State<AppState>,
    Path(style): Path<String>,
) -> Result<Json<JsonValue>> {
    if style.is_empty() {
        return Err(ProxyError::business("style cannot be empty"));
    }
    state.cache.delete_by_style(&style);
    Ok(Json(json!({ "message": "cache cleared successfully" })))
}
