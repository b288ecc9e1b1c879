//! 聊天转发入口：权限校验、缓存命中短路、上游转发与三路分流
//!
//! 上游响应体按块流向客户端，同时喂给后台流处理器，非流式另存一份
//! 用于缓存回填。客户端永远不等待处理器或缓存；缓存写入严格发生在
//! 客户端收完整个响应之后

use crate::auth::AuthContext;
use crate::cache::{self, MemoryCache, build_cache_key};
use crate::consts;
use crate::error::{ProxyError, Result};
use crate::handler::AppState;
use crate::logging::{LogComponent, LogStage};
use crate::service::{
    ReqMeta, balance_chat, before_for_style, providers_with_meta_by_model_name, record_cache_hit,
    record_log,
};
use crate::{ldebug, lwarn};
use axum::Json;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, TRANSFER_ENCODING, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::StreamReader;

/// OpenAI chat completions 入口
pub async fn chat_completions_handler(
    State(state): State<AppState>,
    request: Request,
) -> Response {
    chat_handler(state, consts::STYLE_OPENAI, request).await
}

/// OpenAI Responses 入口
pub async fn responses_handler(State(state): State<AppState>, request: Request) -> Response {
    chat_handler(state, consts::STYLE_OPENAI_RES, request).await
}

/// Anthropic Messages 入口
pub async fn messages_handler(State(state): State<AppState>, request: Request) -> Response {
    chat_handler(state, consts::STYLE_ANTHROPIC, request).await
}

async fn chat_handler(state: AppState, style: &'static str, request: Request) -> Response {
    match chat_handler_inner(state, style, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn chat_handler_inner(
    state: AppState,
    style: &'static str,
    request: Request,
) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let auth = parts
        .extensions
        .get::<AuthContext>()
        .cloned()
        .ok_or_else(|| ProxyError::auth("invalid auth key"))?;

    let raw = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::internal_with_source("读取请求正文失败", e.into()))?;

    let before = before_for_style(style, raw)?;

    if !auth.allows_model(&before.model) {
        return Ok((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "auth key has no permission to use this model" })),
        )
            .into_response());
    }

    let req_meta = ReqMeta {
        user_agent: parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        remote_ip: client_ip(&parts.headers),
        header: parts.headers.clone(),
    };

    // 仅非流式且租户非零的请求参与缓存
    let cache_key = build_cache_key(
        auth.auth_key_id,
        style,
        &before.model,
        before.stream,
        &before.raw,
    );
    if let Some(key) = &cache_key
        && let Some(value) = state.cache.get(key)
    {
        ldebug!(
            "handler",
            LogStage::CacheLookup,
            LogComponent::Cache,
            "hit",
            "serving response from cache",
            model = %before.model,
            auth_key_id = auth.auth_key_id
        );
        record_cache_hit(state.db.clone(), key.clone(), &value, &req_meta);
        return Ok(cached_response(&value));
    }

    let meta = providers_with_meta_by_model_name(&state.db, style, &before).await?;

    let start = Instant::now();
    let (upstream, log_id, stream_ctx) = balance_chat(
        &state.db,
        start,
        style,
        &before,
        &meta,
        &req_meta,
        auth.auth_key_id,
    )
    .await?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    // 处理器管道：无界通道保证客户端转发永不被处理器背压
    let (proc_tx, proc_rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
    tokio::spawn(record_log(
        state.db.clone(),
        stream_ctx.clone(),
        start,
        StreamReader::new(UnboundedReceiverStream::new(proc_rx)),
        style.to_string(),
        log_id,
        before.stream,
        meta.io_log,
        before.raw.clone(),
    ));

    let cache_plan = cache_key.as_ref().filter(|_| !before.stream).map(|key| {
        let provider_name = meta
            .providers
            .get(&stream_ctx.assoc.provider_id)
            .map(|provider| provider.name.clone())
            .unwrap_or_default();
        CacheWritePlan {
            cache: state.cache.clone(),
            key: (*key).clone(),
            status_code: status.as_u16(),
            header: upstream_headers.clone(),
            provider_name,
            provider_model: stream_ctx.assoc.provider_model.clone(),
            source_log_id: log_id,
            ttl: Duration::from_secs(state.config.cache.default_ttl_secs),
        }
    });

    let forward = ForwardStream {
        inner: upstream.bytes_stream().boxed(),
        proc_tx: Some(proc_tx),
        capture: cache_plan.as_ref().map(|_| BytesMut::new()),
        cache_plan,
    };

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        copy_upstream_headers(headers, &upstream_headers);
        if before.stream {
            headers.insert("content-type", static_value("text/event-stream"));
            headers.insert("cache-control", static_value("no-cache"));
            headers.insert(CONNECTION, static_value("keep-alive"));
            headers.insert("x-accel-buffering", static_value("no"));
        }
    }
    response
        .body(Body::from_stream(forward))
        .map_err(|e| ProxyError::internal_with_source("构建响应失败", e.into()))
}

/// 缓存命中的响应：回放缓存头与正文并附加缓存标识头
fn cached_response(value: &cache::Value) -> Response {
    let mut response = Response::builder().status(value.status_code);
    if let Some(headers) = response.headers_mut() {
        copy_upstream_headers(headers, &value.header);
        headers.insert("x-cache", static_value("HIT"));
        if let Ok(created) = value.created_at.to_rfc3339().parse() {
            headers.insert("x-cache-created", created);
        }
    }
    response
        .body(Body::from(value.body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// 透传上游响应头，逐跳头由本地连接自行管理
fn copy_upstream_headers(target: &mut HeaderMap, source: &HeaderMap) {
    for (name, value) in source {
        if name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        target.append(name.clone(), value.clone());
    }
}

fn static_value(value: &'static str) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_static(value)
}

/// 客户端 IP：优先代理头
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
}

/// 完整收到响应后回填缓存的计划
struct CacheWritePlan {
    cache: Arc<MemoryCache>,
    key: cache::Key,
    status_code: u16,
    header: HeaderMap,
    provider_name: String,
    provider_model: String,
    source_log_id: i32,
    ttl: Duration,
}

impl CacheWritePlan {
    /// 异步写缓存，客户端路径不等待
    fn execute(self, body: Bytes) {
        tokio::spawn(async move {
            let now = Utc::now();
            let value = cache::Value {
                status_code: self.status_code,
                header: self.header,
                body,
                created_at: now,
                expires_at: now,
                source_log_id: self.source_log_id,
                provider_name: self.provider_name,
                provider_model: self.provider_model,
                shared: false,
            };
            if let Err(err) = self.cache.set(&self.key, value, self.ttl) {
                lwarn!(
                    "cache_write",
                    LogStage::BackgroundTask,
                    LogComponent::Cache,
                    "set_failed",
                    "cache write error",
                    error = %err
                );
            }
        });
    }
}

/// 上游响应体的三路分流器：客户端、流处理器、缓存捕获
struct ForwardStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    proc_tx: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    capture: Option<BytesMut>,
    cache_plan: Option<CacheWritePlan>,
}

impl Stream for ForwardStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tx) = &this.proc_tx {
                    let _ = tx.send(Ok(chunk.clone()));
                }
                if let Some(capture) = &mut this.capture {
                    capture.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                // 转发失败以错误收尾处理管道，残缺正文不回填缓存
                if let Some(tx) = this.proc_tx.take() {
                    let _ = tx.send(Err(io::Error::other(err.to_string())));
                }
                this.cache_plan = None;
                this.capture = None;
                Poll::Ready(Some(Err(io::Error::other(err.to_string()))))
            }
            Poll::Ready(None) => {
                // 正常收尾：关闭处理器写端，触发缓存回填
                this.proc_tx.take();
                if let Some(plan) = this.cache_plan.take() {
                    let body = this.capture.take().unwrap_or_default().freeze();
                    if !body.is_empty() {
                        plan.execute(body);
                    }
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ForwardStream {
    fn drop(&mut self) {
        // 客户端提前断开：给处理器一个取消信号，已有数据照常落日志
        if let Some(tx) = self.proc_tx.take() {
            let _ = tx.send(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "client disconnected",
            )));
        }
    }
}
