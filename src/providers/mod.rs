//! # 上游请求构建模块
//!
//! 按风格把入站请求改写为上游 HTTP 请求：改写模型名、补默认凭证、拼接端点

use crate::consts;
use crate::error::{ProxyError, Result};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::LazyLock;
use std::time::Duration;

/// Anthropic 默认协议版本
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// 共享上游客户端。响应头超时由调度器按次封装，这里只管连接池
static HTTP_CLIENT: LazyLock<Client> = LazyLock::new(|| {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("failed to build upstream http client")
});

#[must_use]
pub fn http_client() -> &'static Client {
    &HTTP_CLIENT
}

/// 渠道配置，providers.config 字段的 JSON 结构
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    /// 渠道自带的默认凭证，密钥池取 key 失败时兜底
    #[serde(default)]
    pub api_key: String,
    /// anthropic 风格的协议版本
    #[serde(default)]
    pub version: Option<String>,
}

impl ProviderConfig {
    /// 解析渠道配置 JSON
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ProxyError::serialization_with_source("渠道配置解析失败", e.into()))
    }
}

/// 按风格返回聊天端点路径
#[must_use]
pub fn endpoint_for_style(style: &str) -> &'static str {
    match style {
        consts::STYLE_ANTHROPIC => "/messages",
        consts::STYLE_OPENAI_RES => "/responses",
        _ => "/chat/completions",
    }
}

/// 构建上游请求。正文中的 model 字段改写为渠道的真实模型名，
/// 调用方未携带凭证时补渠道默认凭证
pub fn build_chat_request(
    style: &str,
    config: &ProviderConfig,
    mut headers: HeaderMap,
    provider_model: &str,
    raw_body: &[u8],
) -> Result<reqwest::RequestBuilder> {
    let body = rewrite_model(raw_body, provider_model)?;
    let url = format!(
        "{}{}",
        config.base_url.trim_end_matches('/'),
        endpoint_for_style(style)
    );

    match style {
        consts::STYLE_ANTHROPIC => {
            if !headers.contains_key("x-api-key") && !config.api_key.is_empty() {
                headers.insert("x-api-key", parse_header_value(&config.api_key)?);
            }
            if !headers.contains_key("anthropic-version") {
                let version = config
                    .version
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
                headers.insert("anthropic-version", parse_header_value(version)?);
            }
        }
        _ => {
            if !headers.contains_key(AUTHORIZATION) && !config.api_key.is_empty() {
                headers.insert(
                    AUTHORIZATION,
                    parse_header_value(&format!("Bearer {}", config.api_key))?,
                );
            }
        }
    }
    headers.insert("content-type", parse_header_value("application/json")?);

    Ok(http_client().post(url).headers(headers).body(body))
}

/// 把正文 model 字段替换为上游真实模型名
fn rewrite_model(raw_body: &[u8], provider_model: &str) -> Result<Vec<u8>> {
    let mut parsed: JsonValue = serde_json::from_slice(raw_body)
        .map_err(|e| ProxyError::serialization_with_source("请求正文不是合法 JSON", e.into()))?;
    if let Some(object) = parsed.as_object_mut() {
        object.insert(
            "model".to_string(),
            JsonValue::String(provider_model.to_string()),
        );
    }
    serde_json::to_vec(&parsed)
        .map_err(|e| ProxyError::serialization_with_source("请求正文编码失败", e.into()))
}

fn parse_header_value(value: &str) -> Result<axum::http::HeaderValue> {
    value
        .parse()
        .map_err(|_| ProxyError::upstream(format!("invalid header value: {value}")))
}
