//! 响应流处理：边转发边解析用量、首字时延与 TPS，不缓冲整个流
//!
//! 三种风格各一个处理器，共享行扫描器与带内错误识别

use crate::cooldown::{Category, classify_status};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// 扫描器初始缓冲
pub const INIT_SCANNER_BUFFER_SIZE: usize = 1024 * 8;
/// 单帧最大长度
pub const MAX_SCANNER_BUFFER_SIZE: usize = 1024 * 1024 * 64;

/// token 用量统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
}

/// 提示词用量明细
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
    #[serde(default)]
    pub audio_tokens: i64,
}

/// 处理器捕获的响应正文，非流式为单字符串，流式为帧序列
#[derive(Debug, Clone, Default)]
pub struct OutputUnion {
    pub of_string: String,
    pub of_string_array: Vec<String>,
}

/// 处理器产出的遥测数据
#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub first_chunk_time: Duration,
    pub chunk_time: Duration,
    pub usage: Usage,
    pub tps: f64,
    pub size: i64,
}

/// SSE 流中的带内结构化错误
#[derive(Debug, Clone)]
pub struct StreamError {
    pub message: String,
    pub error_type: String,
    pub code: String,
    pub status: u16,
    pub category: Category,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = if self.message.is_empty() {
            "stream error".to_string()
        } else {
            self.message.clone()
        };
        if !self.code.is_empty() {
            msg.push_str(&format!(" code={}", self.code));
        }
        if !self.error_type.is_empty() {
            msg.push_str(&format!(" type={}", self.error_type));
        }
        if self.status != 0 {
            msg.push_str(&format!(" status={}", self.status));
        }
        f.write_str(&msg)
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    /// 状态码优先，其次按错误码与类型的启发式归类
    fn resolve_category(&mut self) {
        if self.status != 0 {
            self.category = classify_status(self.status);
            return;
        }
        self.category = match (self.code.as_str(), self.error_type.as_str()) {
            (
                "insufficient_quota" | "invalid_api_key" | "rate_limit_exceeded"
                | "billing_hard_limit_reached" | "quota_exceeded" | "authentication_error",
                _,
            ) => Category::Key,
            (_, error_type) if error_type.starts_with("server_error") => Category::Provider,
            (_, "overloaded_error") => Category::Provider,
            (_, "invalid_request_error") => Category::Client,
            _ => Category::Provider,
        };
    }
}

/// 处理器错误
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0}")]
    Stream(StreamError),
    #[error("client canceled")]
    Canceled,
    #[error("扫描响应流失败: {0}")]
    Scan(String),
    #[error("解析响应失败: {0}")]
    Parse(String),
}

impl From<LinesCodecError> for ProcessError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::Io(io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionAborted =>
            {
                Self::Canceled
            }
            other => Self::Scan(other.to_string()),
        }
    }
}

/// 处理器错误到冷却类别的映射。客户端主动放弃不迁怒上游
#[must_use]
pub fn classify_process_error(err: &ProcessError) -> Category {
    match err {
        ProcessError::Stream(stream_err) => {
            if stream_err.category == Category::None {
                Category::Provider
            } else {
                stream_err.category
            }
        }
        ProcessError::Canceled => Category::Client,
        ProcessError::Scan(_) | ProcessError::Parse(_) => Category::Provider,
    }
}

/// 识别帧中的带内错误对象
fn parse_stream_error(frame: &JsonValue) -> Result<(), StreamError> {
    let Some(error) = frame.get("error").filter(|e| !e.is_null()) else {
        return Ok(());
    };
    let mut stream_err = StreamError {
        message: error["message"].as_str().unwrap_or_default().to_string(),
        error_type: error["type"].as_str().unwrap_or_default().to_string(),
        code: error["code"].as_str().unwrap_or_default().to_string(),
        status: error["status"].as_u64().unwrap_or(0) as u16,
        category: Category::None,
    };
    if stream_err.message.is_empty() {
        stream_err.message = error.to_string();
    }
    stream_err.resolve_category();
    Err(stream_err)
}

fn parse_frame(raw: &str) -> Option<JsonValue> {
    serde_json::from_str(raw).ok()
}

/// 首个非空行记一次首字时延
struct FirstChunkOnce {
    start: Instant,
    value: Option<Duration>,
}

impl FirstChunkOnce {
    const fn new(start: Instant) -> Self {
        Self { start, value: None }
    }

    fn touch(&mut self) {
        if self.value.is_none() {
            self.value = Some(self.start.elapsed());
        }
    }

    fn get(&self) -> Duration {
        self.value.unwrap_or_default()
    }
}

fn finalize_stats(
    start: Instant,
    first_chunk: &FirstChunkOnce,
    usage: Usage,
    size: i64,
) -> ProcessStats {
    let first_chunk_time = first_chunk.get();
    let chunk_time = start.elapsed().saturating_sub(first_chunk_time);
    let seconds = chunk_time.as_secs_f64();
    let tps = if seconds > 0.0 {
        usage.total_tokens as f64 / seconds
    } else {
        0.0
    };
    ProcessStats {
        first_chunk_time,
        chunk_time,
        usage,
        tps,
        size,
    }
}

fn scanner<R: AsyncRead + Unpin>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::with_capacity(
        reader,
        LinesCodec::new_with_max_length(MAX_SCANNER_BUFFER_SIZE),
        INIT_SCANNER_BUFFER_SIZE,
    )
}

/// OpenAI chat completions 处理器
pub async fn process_openai<R: AsyncRead + Unpin>(
    reader: R,
    stream: bool,
    start: Instant,
) -> Result<(ProcessStats, OutputUnion), ProcessError> {
    let mut first_chunk = FirstChunkOnce::new(start);
    let mut output = OutputUnion::default();
    let mut usage = Usage::default();
    let mut size: i64 = 0;

    let mut lines = scanner(reader);
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        size += line.len() as i64;
        first_chunk.touch();

        if !stream {
            // 整个正文视作一个 JSON 文档
            if output.of_string.is_empty() {
                output.of_string = line.clone();
            } else {
                output.of_string.push('\n');
                output.of_string.push_str(&line);
            }
            continue;
        }

        let chunk = line.strip_prefix("data: ").unwrap_or(&line);
        if chunk == "[DONE]" {
            break;
        }
        let Some(frame) = parse_frame(chunk) else {
            continue;
        };
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        output.of_string_array.push(chunk.to_string());

        // 部分厂商在每帧都带 usage，以最后一个 total_tokens 非零的为准
        if let Some(frame_usage) = frame.get("usage")
            && frame_usage["total_tokens"].as_i64().unwrap_or(0) != 0
            && let Ok(parsed) = serde_json::from_value::<Usage>(frame_usage.clone())
        {
            usage = parsed;
        }
    }

    if !stream && !output.of_string.is_empty() {
        let frame = parse_frame(&output.of_string)
            .ok_or_else(|| ProcessError::Parse("response is not valid JSON".to_string()))?;
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        if let Some(body_usage) = frame.get("usage")
            && let Ok(parsed) = serde_json::from_value::<Usage>(body_usage.clone())
        {
            usage = parsed;
        }
    }

    Ok((finalize_stats(start, &first_chunk, usage, size), output))
}

/// OpenAI Responses 用量结构
#[derive(Debug, Default, Deserialize)]
struct OpenAiResUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
    #[serde(default)]
    input_tokens_details: InputTokensDetails,
}

#[derive(Debug, Default, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: i64,
}

impl From<OpenAiResUsage> for Usage {
    fn from(res_usage: OpenAiResUsage) -> Self {
        Self {
            prompt_tokens: res_usage.input_tokens,
            completion_tokens: res_usage.output_tokens,
            total_tokens: res_usage.total_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: res_usage.input_tokens_details.cached_tokens,
                audio_tokens: 0,
            },
        }
    }
}

/// OpenAI Responses 处理器，事件名决定在哪一帧取用量
pub async fn process_openai_res<R: AsyncRead + Unpin>(
    reader: R,
    stream: bool,
    start: Instant,
) -> Result<(ProcessStats, OutputUnion), ProcessError> {
    let mut first_chunk = FirstChunkOnce::new(start);
    let mut output = OutputUnion::default();
    let mut usage = Usage::default();
    let mut size: i64 = 0;
    let mut event = String::new();

    let mut lines = scanner(reader);
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        size += line.len() as i64;
        first_chunk.touch();

        if !stream {
            if output.of_string.is_empty() {
                output.of_string = line.clone();
            } else {
                output.of_string.push('\n');
                output.of_string.push_str(&line);
            }
            continue;
        }

        if let Some(name) = line.strip_prefix("event: ") {
            event = name.to_string();
            continue;
        }
        let content = line.strip_prefix("data: ").unwrap_or(&line);
        if content.is_empty() {
            continue;
        }
        let Some(frame) = parse_frame(content) else {
            continue;
        };
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        output.of_string_array.push(content.to_string());

        if event == "response.completed"
            && let Some(res_usage) = frame.pointer("/response/usage")
            && let Ok(parsed) = serde_json::from_value::<OpenAiResUsage>(res_usage.clone())
        {
            usage = parsed.into();
        }
    }

    if !stream && !output.of_string.is_empty() {
        let frame = parse_frame(&output.of_string)
            .ok_or_else(|| ProcessError::Parse("response is not valid JSON".to_string()))?;
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        if let Some(body_usage) = frame.get("usage")
            && let Ok(parsed) = serde_json::from_value::<OpenAiResUsage>(body_usage.clone())
        {
            usage = parsed.into();
        }
    }

    Ok((finalize_stats(start, &first_chunk, usage, size), output))
}

/// Anthropic 用量累计，跨帧按字段求和
#[derive(Debug, Default)]
struct AnthropicUsage {
    input_tokens: i64,
    cache_creation_input_tokens: i64,
    cache_read_input_tokens: i64,
    output_tokens: i64,
}

impl AnthropicUsage {
    fn merge(&mut self, source: &JsonValue) {
        for (field, slot) in [
            ("input_tokens", &mut self.input_tokens),
            (
                "cache_creation_input_tokens",
                &mut self.cache_creation_input_tokens,
            ),
            ("cache_read_input_tokens", &mut self.cache_read_input_tokens),
            ("output_tokens", &mut self.output_tokens),
        ] {
            let value = source[field].as_i64().unwrap_or(0);
            if value > 0 {
                *slot += value;
            }
        }
    }

    fn into_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: self.cache_read_input_tokens,
                audio_tokens: 0,
            },
        }
    }
}

/// Anthropic Messages 处理器，用量分散在多个事件里需要累加
pub async fn process_anthropic<R: AsyncRead + Unpin>(
    reader: R,
    stream: bool,
    start: Instant,
) -> Result<(ProcessStats, OutputUnion), ProcessError> {
    let mut first_chunk = FirstChunkOnce::new(start);
    let mut output = OutputUnion::default();
    let mut usage = AnthropicUsage::default();
    let mut size: i64 = 0;

    let mut lines = scanner(reader);
    while let Some(line) = lines.next().await {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        size += line.len() as i64;
        first_chunk.touch();

        if !stream {
            if output.of_string.is_empty() {
                output.of_string = line.clone();
            } else {
                output.of_string.push('\n');
                output.of_string.push_str(&line);
            }
            continue;
        }

        if line.starts_with("event: ") {
            continue;
        }
        let Some(content) = line.strip_prefix("data: ") else {
            continue;
        };
        let Some(frame) = parse_frame(content) else {
            continue;
        };
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        output.of_string_array.push(content.to_string());

        if let Some(top_usage) = frame.get("usage") {
            usage.merge(top_usage);
        }
        if let Some(message_usage) = frame.pointer("/message/usage") {
            usage.merge(message_usage);
        }
    }

    if !stream && !output.of_string.is_empty() {
        let frame = parse_frame(&output.of_string)
            .ok_or_else(|| ProcessError::Parse("response is not valid JSON".to_string()))?;
        parse_stream_error(&frame).map_err(ProcessError::Stream)?;
        if let Some(body_usage) = frame.get("usage") {
            usage.merge(body_usage);
        }
    }

    Ok((finalize_stats(start, &first_chunk, usage.into_usage(), size), output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn openai_stream_takes_last_usage_frame() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}],\"usage\":null}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}\n\n",
            "data: [DONE]\n\n",
        );
        let (stats, output) = process_openai(body.as_bytes(), true, Instant::now())
            .await
            .unwrap();
        assert_eq!(stats.usage.total_tokens, 8);
        assert_eq!(stats.usage.prompt_tokens, 3);
        assert_eq!(output.of_string_array.len(), 2);
        assert!(stats.size > 0);
    }

    #[tokio::test]
    async fn openai_non_stream_reads_body_usage() {
        let body = r#"{"id":"x","usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3,"prompt_tokens_details":{"cached_tokens":1}}}"#;
        let (stats, output) = process_openai(body.as_bytes(), false, Instant::now())
            .await
            .unwrap();
        assert_eq!(stats.usage.total_tokens, 3);
        assert_eq!(stats.usage.prompt_tokens_details.cached_tokens, 1);
        assert_eq!(output.of_string, body);
        assert!(output.of_string_array.is_empty());
    }

    #[tokio::test]
    async fn openai_stream_error_frame_raises_key_category() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n",
            "data: {\"error\":{\"code\":\"rate_limit_exceeded\",\"type\":\"rate_limit\"}}\n\n",
        );
        let err = process_openai(body.as_bytes(), true, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(classify_process_error(&err), Category::Key);
    }

    #[tokio::test]
    async fn stream_error_with_status_uses_status_table() {
        let body = "data: {\"error\":{\"message\":\"boom\",\"status\":503}}\n\n";
        let err = process_openai(body.as_bytes(), true, Instant::now())
            .await
            .unwrap_err();
        assert_eq!(classify_process_error(&err), Category::Provider);
    }

    #[tokio::test]
    async fn responses_usage_comes_from_completed_event() {
        let body = concat!(
            "event: response.output_text.delta\n",
            "data: {\"delta\":\"hel\"}\n\n",
            "event: response.completed\n",
            "data: {\"response\":{\"usage\":{\"input_tokens\":10,\"output_tokens\":4,\"total_tokens\":14,\"input_tokens_details\":{\"cached_tokens\":2}}}}\n\n",
        );
        let (stats, output) = process_openai_res(body.as_bytes(), true, Instant::now())
            .await
            .unwrap();
        assert_eq!(stats.usage.prompt_tokens, 10);
        assert_eq!(stats.usage.completion_tokens, 4);
        assert_eq!(stats.usage.total_tokens, 14);
        assert_eq!(stats.usage.prompt_tokens_details.cached_tokens, 2);
        assert_eq!(output.of_string_array.len(), 2);
    }

    #[tokio::test]
    async fn anthropic_accumulates_usage_across_events() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":25,\"cache_read_input_tokens\":7}}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":12}}\n\n",
        );
        let (stats, _) = process_anthropic(body.as_bytes(), true, Instant::now())
            .await
            .unwrap();
        assert_eq!(stats.usage.prompt_tokens, 25);
        assert_eq!(stats.usage.completion_tokens, 12);
        assert_eq!(stats.usage.total_tokens, 37);
        assert_eq!(stats.usage.prompt_tokens_details.cached_tokens, 7);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_tps_guarded() {
        let body = "\n\n\n";
        let (stats, output) = process_openai(body.as_bytes(), true, Instant::now())
            .await
            .unwrap();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.tps, 0.0);
        assert!(output.of_string_array.is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_surfaces_scan_error() {
        let mut body = String::from("data: {\"pad\":\"");
        body.push_str(&"a".repeat(MAX_SCANNER_BUFFER_SIZE + 16));
        body.push_str("\"}\n");
        let err = process_openai(body.as_bytes(), true, Instant::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Scan(_)));
        assert_eq!(classify_process_error(&err), Category::Provider);
    }
}
