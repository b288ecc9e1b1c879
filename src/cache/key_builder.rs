//! 缓存键构造：把请求正文投影到语义字段白名单并做稳定哈希

use super::{Key, Scope};
use crate::consts;
use crate::error::{ProxyError, Result};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// 影响模型输出的语义字段白名单，覆盖三种上游风格
const SEMANTIC_FIELDS: &[&str] = &[
    // 基本字段
    "model",
    "messages",
    "input",
    "stream",
    // 输出数量/长度控制
    "max_tokens",
    "max_tokens_to_sample",
    "max_completion_tokens",
    "n",
    "stop",
    "stop_sequences",
    // 采样控制
    "temperature",
    "top_p",
    "top_k",
    "seed",
    "presence_penalty",
    "frequency_penalty",
    // 结果形式/结构
    "response_format",
    "tool_choice",
    "tool_choice_type",
    "tools",
    "function_call",
    "functions",
    // logprob 相关
    "logprobs",
    "top_logprobs",
    "logit_bias",
    // 角色/指令补充
    "system",
    "user",
    "metadata",
    "parallel_tool_calls",
    "reasoning_effort",
    "modalities",
    "audio",
    "vision",
];

/// 构造缓存键。仅非流式请求且租户非零才参与缓存，返回 None 表示不缓存
#[must_use]
pub fn build_cache_key(
    auth_key_id: i32,
    style: &str,
    model: &str,
    stream: bool,
    raw_body: &[u8],
) -> Option<Key> {
    // 流式响应不做缓存，避免 SSE 重放问题
    if stream {
        return None;
    }
    // 零租户是管理员身份，不参与缓存
    if auth_key_id == 0 {
        return None;
    }

    let body_hash = normalize_and_hash(raw_body).ok()?;

    Some(Key {
        scope: Scope {
            auth_key_id,
            style: style.to_string(),
            model: model.to_string(),
            mode: mode_for_style(style).to_string(),
            stream,
        },
        body_hash,
    })
}

/// 规范化请求正文并生成哈希：白名单投影、顶层键排序、SHA-256 小写十六进制
pub fn normalize_and_hash(raw_body: &[u8]) -> Result<String> {
    let parsed: JsonValue = serde_json::from_slice(raw_body)
        .map_err(|e| ProxyError::serialization_with_source("请求正文不是合法 JSON", e.into()))?;
    let JsonValue::Object(object) = parsed else {
        return Err(ProxyError::cache("request body is not a JSON object"));
    };

    // BTreeMap 保证顶层键的字典序；数组保持语义顺序原样保留
    let mut normalized = BTreeMap::new();
    for &field in SEMANTIC_FIELDS {
        if let Some(value) = object.get(field) {
            normalized.insert(field.to_string(), value.clone());
        }
    }

    let encoded = serde_json::to_vec(&normalized)
        .map_err(|e| ProxyError::serialization_with_source("规范化正文编码失败", e.into()))?;
    let digest = Sha256::digest(&encoded);
    Ok(format!("{digest:x}"))
}

/// style 到缓存模式标识的映射，未知风格原样透传便于扩展
#[must_use]
pub fn mode_for_style(style: &str) -> &str {
    match style {
        consts::STYLE_OPENAI => "chat_completions",
        consts::STYLE_OPENAI_RES => "responses",
        consts::STYLE_ANTHROPIC => "messages",
        other => other,
    }
}

/// 校验缓存键的有效性
pub fn validate_key(key: &Key) -> Result<()> {
    if key.scope.auth_key_id == 0 {
        return Err(ProxyError::cache("auth key id cannot be zero"));
    }
    if key.scope.style.is_empty() {
        return Err(ProxyError::cache("style cannot be empty"));
    }
    if key.scope.model.is_empty() {
        return Err(ProxyError::cache("model cannot be empty"));
    }
    if key.body_hash.is_empty() {
        return Err(ProxyError::cache("body hash cannot be empty"));
    }
    Ok(())
}
