//! # HTTP 入口模块
//!
//! 路由装配与共享应用状态

mod cache;
mod chat;

pub use cache::{cache_delete_by_auth_key, cache_delete_by_style, cache_stats};
pub use chat::{chat_completions_handler, messages_handler, responses_handler};

use crate::cache::MemoryCache;
use crate::config::AppConfig;
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;

/// 共享应用状态
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<AppConfig>,
    pub cache: Arc<MemoryCache>,
}

/// 创建所有路由。/v1 下的路由全部挂认证中间件
pub fn create_routes(state: AppState) -> Router {
    let public_routes = Router::new().route("/ping", get(ping_handler));

    let protected_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/responses", post(responses_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/auth-key/{id}", delete(cache_delete_by_auth_key))
        .route("/v1/cache/style/{style}", delete(cache_delete_by_style))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}

/// 存活探针
async fn ping_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "pong" }))
}
