//! # llmio
//!
//! 多租户 LLM 代理网关服务入口

use llmio::cache::{MemoryCache, Options, ReadPolicy};
use llmio::handler::{AppState, create_routes};
use llmio::logging::{LogComponent, LogStage};
use llmio::{linfo, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    llmio::logging::init_tracing();

    let config = llmio::config::load_config()?;
    linfo!(
        "startup",
        LogStage::Startup,
        LogComponent::Main,
        "config_loaded",
        "configuration loaded",
        host = %config.server.host,
        port = config.server.port
    );

    let db = llmio::database::init_database(&config.database.url)
        .await
        .map_err(|e| llmio::ProxyError::database_with_source("数据库连接失败", e.into()))?;
    llmio::database::run_migrations(&db)
        .await
        .map_err(|e| llmio::ProxyError::database_with_source("数据库迁移失败", e.into()))?;

    let read_policy = if config.cache.read_policy == "share-read-only" {
        ReadPolicy::ShareReadOnly
    } else {
        ReadPolicy::Clone
    };
    let cache = Arc::new(MemoryCache::with_options(Options {
        max_entries: config.cache.max_entries,
        read_policy,
        share_threshold: config.cache.share_threshold,
    }));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        db,
        config: Arc::new(config),
        cache,
    };

    let app = create_routes(state);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| llmio::ProxyError::internal_with_source(format!("监听失败 {addr}"), e.into()))?;

    linfo!(
        "startup",
        LogStage::Startup,
        LogComponent::Main,
        "serving",
        "llmio gateway listening",
        addr = %addr
    );

    axum::serve(listener, app)
        .await
        .map_err(|e| llmio::ProxyError::internal_with_source("服务异常退出", e.into()))?;

    Ok(())
}
