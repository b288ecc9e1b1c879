//! 请求预处理：从原始正文提取路由所需的模型名、流式开关与能力需求

use crate::consts;
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use serde_json::Value as JsonValue;

/// 预处理结果，原始正文保持不动用于透传
#[derive(Debug, Clone)]
pub struct Before {
    pub model: String,
    pub stream: bool,
    pub tool_call: bool,
    pub structured_output: bool,
    pub image: bool,
    pub raw: Bytes,
}

/// 按风格分发预处理
pub fn before_for_style(style: &str, raw: Bytes) -> Result<Before> {
    match style {
        consts::STYLE_OPENAI_RES => before_openai_res(raw),
        consts::STYLE_ANTHROPIC => before_anthropic(raw),
        _ => before_openai(raw),
    }
}

/// OpenAI chat completions 风格
pub fn before_openai(raw: Bytes) -> Result<Before> {
    let parsed = parse_object(&raw)?;
    let tool_call = has_non_empty_array(&parsed, "tools") || has_non_empty_array(&parsed, "functions");
    let structured_output = matches!(
        parsed.pointer("/response_format/type").and_then(JsonValue::as_str),
        Some("json_schema" | "json_object")
    );
    let image = messages_contain_part(&parsed, "messages", "image_url");

    Ok(Before {
        model: required_model(&parsed)?,
        stream: parsed["stream"].as_bool().unwrap_or(false),
        tool_call,
        structured_output,
        image,
        raw,
    })
}

/// OpenAI Responses 风格
pub fn before_openai_res(raw: Bytes) -> Result<Before> {
    let parsed = parse_object(&raw)?;
    let tool_call = has_non_empty_array(&parsed, "tools");
    let structured_output = matches!(
        parsed.pointer("/text/format/type").and_then(JsonValue::as_str),
        Some("json_schema" | "json_object")
    );
    let image = messages_contain_part(&parsed, "input", "input_image");

    Ok(Before {
        model: required_model(&parsed)?,
        stream: parsed["stream"].as_bool().unwrap_or(false),
        tool_call,
        structured_output,
        image,
        raw,
    })
}

/// Anthropic Messages 风格
pub fn before_anthropic(raw: Bytes) -> Result<Before> {
    let parsed = parse_object(&raw)?;
    let tool_call = has_non_empty_array(&parsed, "tools");
    // anthropic 通过 tool 强制 json 输出，没有独立的结构化输出开关
    let structured_output = false;
    let image = messages_contain_part(&parsed, "messages", "image");

    Ok(Before {
        model: required_model(&parsed)?,
        stream: parsed["stream"].as_bool().unwrap_or(false),
        tool_call,
        structured_output,
        image,
        raw,
    })
}

fn parse_object(raw: &[u8]) -> Result<JsonValue> {
    let parsed: JsonValue = serde_json::from_slice(raw)
        .map_err(|e| ProxyError::serialization_with_source("请求正文不是合法 JSON", e.into()))?;
    if !parsed.is_object() {
        return Err(ProxyError::business("request body must be a JSON object"));
    }
    Ok(parsed)
}

fn required_model(parsed: &JsonValue) -> Result<String> {
    parsed["model"]
        .as_str()
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::business("missing model field"))
}

fn has_non_empty_array(parsed: &JsonValue, field: &str) -> bool {
    parsed[field].as_array().is_some_and(|items| !items.is_empty())
}

/// 消息列表中是否出现指定类型的内容分片
fn messages_contain_part(parsed: &JsonValue, list_field: &str, part_type: &str) -> bool {
    let Some(items) = parsed[list_field].as_array() else {
        return false;
    };
    items.iter().any(|item| {
        item["content"].as_array().is_some_and(|parts| {
            parts
                .iter()
                .any(|part| part["type"].as_str() == Some(part_type))
        })
    })
}
