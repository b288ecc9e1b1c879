//! 审计落库：成功/失败/缓存命中日志、IO 记录与流处理后的遥测回填

use crate::cache;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::service::chat::{ReqMeta, StreamContext};
use crate::service::process::{
    OutputUnion, ProcessError, ProcessStats, classify_process_error, process_anthropic,
    process_openai, process_openai_res,
};
use crate::{consts, lerror, lwarn};
use bytes::Bytes;
use chrono::Utc;
use entity::{chat_ios, chat_logs};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// 一条待写入的审计日志
#[derive(Debug, Clone)]
pub struct ChatLogRow {
    pub name: String,
    pub provider_model: Option<String>,
    pub provider_name: Option<String>,
    pub status: String,
    pub style: String,
    pub user_agent: Option<String>,
    pub remote_ip: Option<String>,
    pub auth_key_id: i32,
    pub provider_key_id: i32,
    pub chat_io: bool,
    pub error: Option<String>,
    pub retry: i32,
    pub proxy_time_ms: i64,
    pub size: i64,
    pub cached: bool,
    pub cached_from_log_id: Option<i32>,
}

impl Default for ChatLogRow {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider_model: None,
            provider_name: None,
            status: "success".to_string(),
            style: String::new(),
            user_agent: None,
            remote_ip: None,
            auth_key_id: 0,
            provider_key_id: 0,
            chat_io: false,
            error: None,
            retry: 0,
            proxy_time_ms: 0,
            size: 0,
            cached: false,
            cached_from_log_id: None,
        }
    }
}

impl ChatLogRow {
    /// 标记为失败日志
    #[must_use]
    pub fn with_error(&self, message: &str) -> Self {
        let mut row = self.clone();
        row.status = "error".to_string();
        row.error = Some(message.to_string());
        row
    }
}

/// 写入一条审计日志并返回其 ID
pub async fn save_chat_log(db: &DatabaseConnection, row: ChatLogRow) -> Result<i32> {
    let now = Utc::now().naive_utc();
    let active = chat_logs::ActiveModel {
        name: Set(row.name),
        provider_model: Set(row.provider_model),
        provider_name: Set(row.provider_name),
        status: Set(row.status),
        style: Set(row.style),
        user_agent: Set(row.user_agent),
        remote_ip: Set(row.remote_ip),
        auth_key_id: Set(row.auth_key_id),
        provider_key_id: Set(row.provider_key_id),
        chat_io: Set(row.chat_io),
        error: Set(row.error),
        retry: Set(row.retry),
        proxy_time_ms: Set(row.proxy_time_ms),
        first_chunk_time_ms: Set(0),
        chunk_time_ms: Set(0),
        tps: Set(0.0),
        size: Set(row.size),
        prompt_tokens: Set(0),
        completion_tokens: Set(0),
        total_tokens: Set(0),
        prompt_tokens_details: Set(None),
        cached: Set(row.cached),
        cached_from_log_id: Set(row.cached_from_log_id),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    let inserted = chat_logs::Entity::insert(active).exec(db).await?;
    Ok(inserted.last_insert_id)
}

/// 后台排空重试失败日志通道
pub async fn record_retry_logs(db: DatabaseConnection, mut rx: mpsc::Receiver<ChatLogRow>) {
    while let Some(row) = rx.recv().await {
        if let Err(err) = save_chat_log(&db, row).await {
            lerror!(
                "retry_log",
                LogStage::BackgroundTask,
                LogComponent::ChatLog,
                "save_failed",
                "save chat log error",
                error = %err
            );
        }
    }
}

/// 按风格分发流处理器
pub async fn process_for_style<R: AsyncRead + Unpin>(
    style: &str,
    reader: R,
    stream: bool,
    start: Instant,
) -> std::result::Result<(ProcessStats, OutputUnion), ProcessError> {
    match style {
        consts::STYLE_OPENAI_RES => process_openai_res(reader, stream, start).await,
        consts::STYLE_ANTHROPIC => process_anthropic(reader, stream, start).await,
        _ => process_openai(reader, stream, start).await,
    }
}

/// 流处理收尾：解析遥测并回填日志行，处理器报错时回写冷却反馈并翻转日志状态。
/// 整个过程运行在独立任务里，客户端断开不会中止这里的落库
pub async fn record_log<R: AsyncRead + Unpin>(
    db: DatabaseConnection,
    stream_ctx: StreamContext,
    start: Instant,
    reader: R,
    style: String,
    log_id: i32,
    stream: bool,
    io_log: bool,
    input: Bytes,
) {
    if io_log
        && let Err(err) = insert_chat_io(&db, log_id, &input).await
    {
        lerror!(
            "record",
            LogStage::Db,
            LogComponent::ChatLog,
            "chat_io_insert_failed",
            "insert chat io error",
            error = %err
        );
    }

    match process_for_style(&style, reader, stream, start).await {
        Err(err) => {
            handle_stream_error(&stream_ctx, &err).await;
            let update = chat_logs::Entity::update_many()
                .col_expr(chat_logs::Column::Status, Expr::value("error"))
                .col_expr(chat_logs::Column::Error, Expr::value(err.to_string()))
                .filter(chat_logs::Column::Id.eq(log_id))
                .exec(&db)
                .await;
            if let Err(update_err) = update {
                lerror!(
                    "record",
                    LogStage::Db,
                    LogComponent::ChatLog,
                    "status_update_failed",
                    "update chat log error status failed",
                    error = %update_err
                );
            }
        }
        Ok((stats, output)) => {
            handle_stream_success(&stream_ctx).await;

            let details_json = serde_json::to_string(&stats.usage.prompt_tokens_details).ok();
            let update = chat_logs::Entity::update_many()
                .col_expr(
                    chat_logs::Column::FirstChunkTimeMs,
                    Expr::value(stats.first_chunk_time.as_millis() as i64),
                )
                .col_expr(
                    chat_logs::Column::ChunkTimeMs,
                    Expr::value(stats.chunk_time.as_millis() as i64),
                )
                .col_expr(chat_logs::Column::Tps, Expr::value(stats.tps))
                .col_expr(chat_logs::Column::Size, Expr::value(stats.size))
                .col_expr(
                    chat_logs::Column::PromptTokens,
                    Expr::value(stats.usage.prompt_tokens),
                )
                .col_expr(
                    chat_logs::Column::CompletionTokens,
                    Expr::value(stats.usage.completion_tokens),
                )
                .col_expr(
                    chat_logs::Column::TotalTokens,
                    Expr::value(stats.usage.total_tokens),
                )
                .col_expr(
                    chat_logs::Column::PromptTokensDetails,
                    Expr::value(details_json),
                )
                .filter(chat_logs::Column::Id.eq(log_id))
                .exec(&db)
                .await;
            if let Err(err) = update {
                lerror!(
                    "record",
                    LogStage::Db,
                    LogComponent::ChatLog,
                    "telemetry_update_failed",
                    "update chat log telemetry failed",
                    error = %err
                );
            }

            if io_log
                && let Err(err) = update_chat_io_output(&db, log_id, &output).await
            {
                lerror!(
                    "record",
                    LogStage::Db,
                    LogComponent::ChatLog,
                    "chat_io_update_failed",
                    "update chat io output error",
                    error = %err
                );
            }
        }
    }
}

async fn insert_chat_io(db: &DatabaseConnection, log_id: i32, input: &Bytes) -> Result<()> {
    let now = Utc::now().naive_utc();
    let active = chat_ios::ActiveModel {
        log_id: Set(log_id),
        input: Set(String::from_utf8_lossy(input).to_string()),
        of_string: Set(None),
        of_string_array: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    chat_ios::Entity::insert(active).exec(db).await?;
    Ok(())
}

async fn update_chat_io_output(
    db: &DatabaseConnection,
    log_id: i32,
    output: &OutputUnion,
) -> Result<()> {
    let frames_json = if output.of_string_array.is_empty() {
        None
    } else {
        serde_json::to_string(&output.of_string_array).ok()
    };
    let of_string = if output.of_string.is_empty() {
        None
    } else {
        Some(output.of_string.clone())
    };
    chat_ios::Entity::update_many()
        .col_expr(chat_ios::Column::OfString, Expr::value(of_string))
        .col_expr(chat_ios::Column::OfStringArray, Expr::value(frames_json))
        .filter(chat_ios::Column::LogId.eq(log_id))
        .exec(db)
        .await?;
    Ok(())
}

/// 流处理成功：清零关联与密钥冷却
async fn handle_stream_success(stream_ctx: &StreamContext) {
    if let Err(err) = stream_ctx.cooldown.on_success(&stream_ctx.assoc).await {
        lerror!(
            "record",
            LogStage::Db,
            LogComponent::Cooldown,
            "on_success_failed",
            "clear cooldown error",
            error = %err
        );
    }
    if stream_ctx.key_id > 0
        && let Err(err) = stream_ctx.key_pool.on_success(stream_ctx.key_id).await
    {
        lerror!(
            "record",
            LogStage::Db,
            LogComponent::KeyPool,
            "on_success_failed",
            "key pool on success",
            error = %err
        );
    }
}

/// 流处理失败：按错误类别回写冷却与密钥反馈
async fn handle_stream_error(stream_ctx: &StreamContext, err: &ProcessError) {
    let category = classify_process_error(err);
    if let Err(update_err) = stream_ctx.cooldown.on_error(&stream_ctx.assoc, category).await {
        lerror!(
            "record",
            LogStage::Db,
            LogComponent::Cooldown,
            "on_error_failed",
            "update cooldown error",
            error = %update_err
        );
    }
    if stream_ctx.key_id > 0
        && let Err(update_err) = stream_ctx
            .key_pool
            .on_error(stream_ctx.key_id, category)
            .await
    {
        lerror!(
            "record",
            LogStage::Db,
            LogComponent::KeyPool,
            "on_error_failed",
            "key pool on error",
            error = %update_err
        );
    }
}

/// 缓存命中审计：异步落一条 cached=true 的日志，指回源日志 ID
pub fn record_cache_hit(
    db: DatabaseConnection,
    key: cache::Key,
    value: &cache::Value,
    req_meta: &ReqMeta,
) {
    let row = ChatLogRow {
        name: key.scope.model.clone(),
        provider_model: Some(value.provider_model.clone()),
        provider_name: Some(value.provider_name.clone()),
        status: "success".to_string(),
        style: key.scope.style.clone(),
        user_agent: req_meta.user_agent.clone(),
        remote_ip: req_meta.remote_ip.clone(),
        auth_key_id: key.scope.auth_key_id,
        chat_io: false,
        size: value.body.len() as i64,
        cached: true,
        cached_from_log_id: Some(value.source_log_id),
        ..ChatLogRow::default()
    };
    tokio::spawn(async move {
        if let Err(err) = save_chat_log(&db, row).await {
            lwarn!(
                "cache_hit",
                LogStage::BackgroundTask,
                LogComponent::ChatLog,
                "save_failed",
                "record cache hit log error",
                error = %err
            );
        }
    });
}
