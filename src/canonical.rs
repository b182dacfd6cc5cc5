//! Provider-neutral in-memory representation of a chat-completion
//! request/response, plus the wire-format enum transformers key off of.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Which provider wire format a transformer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiFormat {
    OpenAiChatCompletions,
    AnthropicMessages,
    GeminiGenerateContent,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAiChatCompletions => "openai-chat-completions",
            ApiFormat::AnthropicMessages => "anthropic-messages",
            ApiFormat::GeminiGenerateContent => "gemini-generate-content",
        }
    }
}

/// A single message in a canonical request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Provider-neutral request built once by the inbound transformer and
/// mutated only by inbound middlewares (see invariants in the data
/// model section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    #[serde(default)]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
    /// Opaque raw body bytes as received from the client, kept around so
    /// transformers can recover provider-specific fields the canonical
    /// model doesn't capture.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

/// A single completion choice in a canonical response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalChoice {
    pub index: u32,
    pub role: String,
    pub content: serde_json::Value,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Provider-neutral response, built by the outbound transformer from a
/// non-stream upstream reply or aggregated from stream chunks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<CanonicalChoice>,
    pub usage: Option<Usage>,
    /// Set when this response carries the first content of a stream;
    /// latency metrics populated from the `PerformanceRecord` on close.
    #[serde(default)]
    pub first_token_latency_ms: Option<u64>,
}

/// Raw upstream/client event: a single SSE frame of bytes plus its
/// optional `event:` type.
#[derive(Debug, Clone)]
pub struct HttpEvent {
    pub data: Vec<u8>,
    pub event_type: Option<String>,
}

impl HttpEvent {
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            event_type: None,
        }
    }

    pub fn typed(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            event_type: Some(event_type.into()),
        }
    }
}

/// A raw HTTP-shaped message used between outbound transformers and the
/// executor: method-less since the executor owns verb/URL, just the
/// body bytes plus headers to merge into the upstream request.
#[derive(Debug, Clone, Default)]
pub struct RawHttpRequest {
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RawHttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Aggregated metadata produced by `aggregate_stream_chunks`: enough to
/// write a final persisted body plus pull out an id/usage without
/// re-parsing the whole aggregated payload.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub id: Option<String>,
    pub usage: Option<Usage>,
}

/// One attempt's timing/outcome, owned exclusively by the `PipelineState`
/// for the duration of that attempt.
#[derive(Debug, Clone)]
pub struct PerformanceRecord {
    pub channel_id: String,
    pub start: Instant,
    pub first_token_at: Option<Instant>,
    pub end: Option<Instant>,
    pub success: bool,
    pub request_completed: bool,
    pub token_count: Option<u64>,
    pub error_status_code: Option<u16>,
    pub stream: bool,
}

impl PerformanceRecord {
    pub fn start(channel_id: impl Into<String>, stream: bool) -> Self {
        Self {
            channel_id: channel_id.into(),
            start: Instant::now(),
            first_token_at: None,
            end: None,
            success: false,
            request_completed: false,
            token_count: None,
            error_status_code: None,
            stream,
        }
    }

    /// Sets first-token time once; idempotent.
    pub fn mark_first_token(&mut self) {
        if self.first_token_at.is_none() {
            self.first_token_at = Some(Instant::now());
        }
    }

    pub fn mark_success(&mut self, token_count: Option<u64>) {
        self.end = Some(Instant::now());
        self.success = true;
        self.request_completed = true;
        self.token_count = token_count;
    }

    pub fn mark_failed(&mut self, status_code: u16) {
        self.end = Some(Instant::now());
        self.success = false;
        self.error_status_code = Some(status_code);
    }

    /// Returns `(first_token_latency_ms, request_latency_ms, tokens)`.
    pub fn calculate(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let first_token_ms = self
            .first_token_at
            .map(|t| t.duration_since(self.start).as_millis() as u64);
        let request_ms = self
            .end
            .map(|t| t.duration_since(self.start).as_millis() as u64);
        (first_token_ms, request_ms, self.token_count)
    }
}
