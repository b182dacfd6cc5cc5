//! Transformer contract: bridges provider wire formats to the canonical
//! request/response model and back.
//!
//! `Inbound` speaks the client-facing format (what the caller sent,
//! what the caller expects back); `Outbound` speaks the upstream
//! provider's format. A given wire format (e.g. OpenAI chat completions)
//! typically implements both, since the same JSON shape is used on
//! either side of the pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::canonical::{
    ApiFormat, CanonicalChoice, CanonicalMessage, CanonicalRequest, CanonicalResponse,
    HttpEvent, RawHttpRequest, RawHttpResponse, ResponseMeta, Usage,
};
use crate::error::{extract_error_message, GatewayError};

/// Faces the client: parses what the caller sent, renders what the
/// caller expects back.
#[async_trait]
pub trait Inbound: Send + Sync {
    fn api_format(&self) -> ApiFormat;
    fn transform_request(&self, raw: &RawHttpRequest) -> Result<CanonicalRequest, GatewayError>;
    fn transform_response(&self, response: &CanonicalResponse) -> Result<RawHttpResponse, GatewayError>;
    fn transform_stream_event(&self, response: &CanonicalResponse) -> Result<HttpEvent, GatewayError>;
    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError>;
    fn transform_error(&self, err: &GatewayError) -> RawHttpResponse;
}

/// Faces the upstream provider: renders the outgoing request, parses
/// the incoming response.
#[async_trait]
pub trait Outbound: Send + Sync {
    fn api_format(&self) -> ApiFormat;
    fn transform_request(&self, canonical: &CanonicalRequest) -> Result<RawHttpRequest, GatewayError>;
    fn transform_response(&self, raw: &RawHttpResponse) -> Result<CanonicalResponse, GatewayError>;
    fn transform_stream_event(&self, event: &HttpEvent) -> Result<Option<CanonicalResponse>, GatewayError>;
    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError>;
    fn transform_error(&self, raw: &RawHttpResponse) -> GatewayError;
}

fn sse_data_lines(chunk: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(chunk) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let data = line.strip_prefix("data:").or_else(|| line.strip_prefix("data: "))?;
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                None
            } else {
                Some(data.to_string())
            }
        })
        .collect()
}

fn gateway_error_from_status(status: u16, body: String) -> GatewayError {
    if (500..600).contains(&status) {
        GatewayError::Upstream5xx { status, body }
    } else {
        GatewayError::Upstream4xx { status, body }
    }
}

// ---------------------------------------------------------------------------
// OpenAI chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct OpenAiChatTransformer;

impl OpenAiChatTransformer {
    fn parse_messages(value: &Value) -> Vec<CanonicalMessage> {
        value
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|m| CanonicalMessage {
                        role: m.get("role").and_then(|r| r.as_str()).unwrap_or("user").to_string(),
                        content: m.get("content").cloned().unwrap_or(Value::Null),
                        tool_call_id: m
                            .get("tool_call_id")
                            .and_then(|t| t.as_str())
                            .map(|s| s.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn render_messages(messages: &[CanonicalMessage]) -> Value {
        Value::Array(
            messages
                .iter()
                .map(|m| {
                    let mut obj = json!({ "role": m.role, "content": m.content });
                    if let Some(id) = &m.tool_call_id {
                        obj["tool_call_id"] = json!(id);
                    }
                    obj
                })
                .collect(),
        )
    }

    fn choice_from_openai(choice: &Value) -> CanonicalChoice {
        let message = choice.get("message").cloned().unwrap_or(Value::Null);
        CanonicalChoice {
            index: choice.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
            role: message.get("role").and_then(|r| r.as_str()).unwrap_or("assistant").to_string(),
            content: message.get("content").cloned().unwrap_or(Value::Null),
            finish_reason: choice
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .map(|s| s.to_string()),
        }
    }

    fn usage_from_openai(value: &Value) -> Option<Usage> {
        let usage = value.get("usage")?;
        Some(Usage::new(
            usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        ))
    }
}

#[async_trait]
impl Inbound for OpenAiChatTransformer {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiChatCompletions
    }

    fn transform_request(&self, raw: &RawHttpRequest) -> Result<CanonicalRequest, GatewayError> {
        let value: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| GatewayError::Internal(format!("invalid request body: {e}")))?;
        let model = value
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| GatewayError::InvalidModel("request missing model".to_string()))?
            .to_string();
        Ok(CanonicalRequest {
            model,
            messages: Self::parse_messages(&value),
            tools: value.get("tools").and_then(|t| t.as_array()).cloned(),
            max_tokens: value.get("max_tokens").and_then(|v| v.as_u64()).map(|v| v as u32),
            temperature: value.get("temperature").and_then(|v| v.as_f64()).map(|v| v as f32),
            stream: value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            raw: raw.body.clone(),
        })
    }

    fn transform_response(&self, response: &CanonicalResponse) -> Result<RawHttpResponse, GatewayError> {
        let body = json!({
            "id": response.id,
            "object": "chat.completion",
            "model": response.model,
            "choices": response.choices.iter().map(|c| json!({
                "index": c.index,
                "message": { "role": c.role, "content": c.content },
                "finish_reason": c.finish_reason,
            })).collect::<Vec<_>>(),
            "usage": response.usage.map(|u| json!({
                "prompt_tokens": u.prompt_tokens,
                "completion_tokens": u.completion_tokens,
                "total_tokens": u.total_tokens,
            })),
        });
        Ok(RawHttpResponse {
            status: 200,
            body: serde_json::to_vec(&body).unwrap_or_default(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        })
    }

    fn transform_stream_event(&self, response: &CanonicalResponse) -> Result<HttpEvent, GatewayError> {
        let chunk = json!({
            "id": response.id,
            "object": "chat.completion.chunk",
            "model": response.model,
            "choices": response.choices.iter().map(|c| json!({
                "index": c.index,
                "delta": { "role": c.role, "content": c.content },
                "finish_reason": c.finish_reason,
            })).collect::<Vec<_>>(),
        });
        let data = format!("data: {}\n\n", serde_json::to_string(&chunk).unwrap_or_default());
        Ok(HttpEvent::data(data.into_bytes()))
    }

    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError> {
        let mut id = None;
        let mut usage = None;
        let mut content = String::new();
        for chunk in events {
            for line in sse_data_lines(chunk) {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    if id.is_none() {
                        id = value.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
                    }
                    if let Some(u) = Self::usage_from_openai(&value) {
                        usage = Some(u);
                    }
                    if let Some(piece) = value
                        .get("choices")
                        .and_then(|c| c.as_array())
                        .and_then(|a| a.first())
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(|c| c.as_str())
                    {
                        content.push_str(piece);
                    }
                }
            }
        }
        let body = json!({
            "id": id.clone().unwrap_or_default(),
            "object": "chat.completion",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }],
            "usage": usage.map(|u| json!({
                "prompt_tokens": u.prompt_tokens,
                "completion_tokens": u.completion_tokens,
                "total_tokens": u.total_tokens,
            })),
        });
        Ok((serde_json::to_vec(&body).unwrap_or_default(), ResponseMeta { id, usage }))
    }

    fn transform_error(&self, err: &GatewayError) -> RawHttpResponse {
        let body = json!({ "error": { "message": err.to_string(), "type": "gateway_error" } });
        RawHttpResponse {
            status: err.status_code(),
            body: serde_json::to_vec(&body).unwrap_or_default(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        }
    }
}

#[async_trait]
impl Outbound for OpenAiChatTransformer {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiChatCompletions
    }

    fn transform_request(&self, canonical: &CanonicalRequest) -> Result<RawHttpRequest, GatewayError> {
        let body = json!({
            "model": canonical.model,
            "messages": Self::render_messages(&canonical.messages),
            "tools": canonical.tools,
            "max_tokens": canonical.max_tokens,
            "temperature": canonical.temperature,
            "stream": canonical.stream,
        });
        Ok(RawHttpRequest {
            body: serde_json::to_vec(&body).map_err(|e| GatewayError::Internal(e.to_string()))?,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        })
    }

    fn transform_response(&self, raw: &RawHttpResponse) -> Result<CanonicalResponse, GatewayError> {
        if raw.status >= 400 {
            return Err(self.transform_error(raw));
        }
        let value: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| GatewayError::Internal(format!("invalid upstream body: {e}")))?;
        Ok(CanonicalResponse {
            id: value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            model: value.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            choices: value
                .get("choices")
                .and_then(|c| c.as_array())
                .map(|arr| arr.iter().map(Self::choice_from_openai).collect())
                .unwrap_or_default(),
            usage: Self::usage_from_openai(&value),
            first_token_latency_ms: None,
        })
    }

    fn transform_stream_event(&self, event: &HttpEvent) -> Result<Option<CanonicalResponse>, GatewayError> {
        for line in sse_data_lines(&event.data) {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let choices = value
                .get("choices")
                .and_then(|c| c.as_array())
                .map(|arr| {
                    arr.iter()
                        .map(|c| CanonicalChoice {
                            index: c.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as u32,
                            role: c
                                .get("delta")
                                .and_then(|d| d.get("role"))
                                .and_then(|r| r.as_str())
                                .unwrap_or("assistant")
                                .to_string(),
                            content: c
                                .get("delta")
                                .and_then(|d| d.get("content"))
                                .cloned()
                                .unwrap_or(Value::Null),
                            finish_reason: c
                                .get("finish_reason")
                                .and_then(|f| f.as_str())
                                .map(|s| s.to_string()),
                        })
                        .collect()
                })
                .unwrap_or_default();
            return Ok(Some(CanonicalResponse {
                id: value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                model: value.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                choices,
                usage: Self::usage_from_openai(&value),
                first_token_latency_ms: None,
            }));
        }
        Ok(None)
    }

    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError> {
        Inbound::aggregate_stream_chunks(self, events)
    }

    fn transform_error(&self, raw: &RawHttpResponse) -> GatewayError {
        let message = extract_error_message(&raw.body, &format!("http {}", raw.status));
        gateway_error_from_status(raw.status, message)
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct AnthropicMessagesTransformer;

impl AnthropicMessagesTransformer {
    fn parse_messages(value: &Value) -> Vec<CanonicalMessage> {
        let mut messages = Vec::new();
        if let Some(system) = value.get("system") {
            messages.push(CanonicalMessage {
                role: "system".to_string(),
                content: system.clone(),
                tool_call_id: None,
            });
        }
        if let Some(arr) = value.get("messages").and_then(|m| m.as_array()) {
            for m in arr {
                messages.push(CanonicalMessage {
                    role: m.get("role").and_then(|r| r.as_str()).unwrap_or("user").to_string(),
                    content: m.get("content").cloned().unwrap_or(Value::Null),
                    tool_call_id: None,
                });
            }
        }
        messages
    }

    fn render_messages(messages: &[CanonicalMessage]) -> (Option<Value>, Value) {
        let mut system = None;
        let mut rendered = Vec::new();
        for m in messages {
            if m.role == "system" {
                system = Some(m.content.clone());
            } else {
                rendered.push(json!({ "role": m.role, "content": m.content }));
            }
        }
        (system, Value::Array(rendered))
    }

    fn usage_from_anthropic(value: &Value) -> Option<Usage> {
        let usage = value.get("usage")?;
        Some(Usage::new(
            usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        ))
    }
}

#[async_trait]
impl Inbound for AnthropicMessagesTransformer {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::AnthropicMessages
    }

    fn transform_request(&self, raw: &RawHttpRequest) -> Result<CanonicalRequest, GatewayError> {
        let value: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| GatewayError::Internal(format!("invalid request body: {e}")))?;
        let model = value
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| GatewayError::InvalidModel("request missing model".to_string()))?
            .to_string();
        Ok(CanonicalRequest {
            model,
            messages: Self::parse_messages(&value),
            tools: value.get("tools").and_then(|t| t.as_array()).cloned(),
            max_tokens: value.get("max_tokens").and_then(|v| v.as_u64()).map(|v| v as u32),
            temperature: value.get("temperature").and_then(|v| v.as_f64()).map(|v| v as f32),
            stream: value.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
            raw: raw.body.clone(),
        })
    }

    fn transform_response(&self, response: &CanonicalResponse) -> Result<RawHttpResponse, GatewayError> {
        let content = response
            .choices
            .first()
            .map(|c| c.content.clone())
            .unwrap_or(Value::Null);
        let body = json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": content,
            "stop_reason": response.choices.first().and_then(|c| c.finish_reason.clone()),
            "usage": response.usage.map(|u| json!({
                "input_tokens": u.prompt_tokens,
                "output_tokens": u.completion_tokens,
            })),
        });
        Ok(RawHttpResponse {
            status: 200,
            body: serde_json::to_vec(&body).unwrap_or_default(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        })
    }

    fn transform_stream_event(&self, response: &CanonicalResponse) -> Result<HttpEvent, GatewayError> {
        let content = response.choices.first().map(|c| c.content.clone()).unwrap_or(Value::Null);
        let chunk = json!({
            "type": "content_block_delta",
            "delta": { "type": "text_delta", "text": content },
        });
        let data = format!(
            "event: content_block_delta\ndata: {}\n\n",
            serde_json::to_string(&chunk).unwrap_or_default()
        );
        Ok(HttpEvent::typed("content_block_delta", data.into_bytes()))
    }

    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError> {
        let mut id = None;
        let mut usage = None;
        let mut content = String::new();
        for chunk in events {
            for line in sse_data_lines(chunk) {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    if id.is_none() {
                        id = value.get("message").and_then(|m| m.get("id")).and_then(|v| v.as_str()).map(|s| s.to_string());
                    }
                    if let Some(u) = Self::usage_from_anthropic(&value) {
                        usage = Some(u);
                    }
                    if let Some(text) = value
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(|t| t.as_str())
                    {
                        content.push_str(text);
                    }
                }
            }
        }
        let body = json!({
            "id": id.clone().unwrap_or_default(),
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": content }],
            "usage": usage.map(|u| json!({ "input_tokens": u.prompt_tokens, "output_tokens": u.completion_tokens })),
        });
        Ok((serde_json::to_vec(&body).unwrap_or_default(), ResponseMeta { id, usage }))
    }

    fn transform_error(&self, err: &GatewayError) -> RawHttpResponse {
        let body = json!({ "type": "error", "error": { "type": "gateway_error", "message": err.to_string() } });
        RawHttpResponse {
            status: err.status_code(),
            body: serde_json::to_vec(&body).unwrap_or_default(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
        }
    }
}

#[async_trait]
impl Outbound for AnthropicMessagesTransformer {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::AnthropicMessages
    }

    fn transform_request(&self, canonical: &CanonicalRequest) -> Result<RawHttpRequest, GatewayError> {
        let (system, messages) = Self::render_messages(&canonical.messages);
        let mut body = json!({
            "model": canonical.model,
            "messages": messages,
            "max_tokens": canonical.max_tokens.unwrap_or(4096),
            "stream": canonical.stream,
        });
        if let Some(system) = system {
            body["system"] = system;
        }
        if let Some(temperature) = canonical.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(tools) = &canonical.tools {
            body["tools"] = json!(tools);
        }
        Ok(RawHttpRequest {
            body: serde_json::to_vec(&body).map_err(|e| GatewayError::Internal(e.to_string()))?,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("anthropic-version".to_string(), "2023-06-01".to_string()),
            ],
        })
    }

    fn transform_response(&self, raw: &RawHttpResponse) -> Result<CanonicalResponse, GatewayError> {
        if raw.status >= 400 {
            return Err(self.transform_error(raw));
        }
        let value: Value = serde_json::from_slice(&raw.body)
            .map_err(|e| GatewayError::Internal(format!("invalid upstream body: {e}")))?;
        let content = value.get("content").cloned().unwrap_or(Value::Null);
        let choice = CanonicalChoice {
            index: 0,
            role: "assistant".to_string(),
            content,
            finish_reason: value.get("stop_reason").and_then(|s| s.as_str()).map(|s| s.to_string()),
        };
        Ok(CanonicalResponse {
            id: value
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            model: value.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            choices: vec![choice],
            usage: Self::usage_from_anthropic(&value),
            first_token_latency_ms: None,
        })
    }

    fn transform_stream_event(&self, event: &HttpEvent) -> Result<Option<CanonicalResponse>, GatewayError> {
        for line in sse_data_lines(&event.data) {
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            if let Some(text) = value.get("delta").and_then(|d| d.get("text")).and_then(|t| t.as_str()) {
                return Ok(Some(CanonicalResponse {
                    id: String::new(),
                    model: String::new(),
                    choices: vec![CanonicalChoice {
                        index: 0,
                        role: "assistant".to_string(),
                        content: json!(text),
                        finish_reason: None,
                    }],
                    usage: Self::usage_from_anthropic(&value),
                    first_token_latency_ms: None,
                }));
            }
            if let Some(usage) = Self::usage_from_anthropic(&value) {
                return Ok(Some(CanonicalResponse {
                    id: String::new(),
                    model: String::new(),
                    choices: vec![],
                    usage: Some(usage),
                    first_token_latency_ms: None,
                }));
            }
        }
        Ok(None)
    }

    fn aggregate_stream_chunks(&self, events: &[Bytes]) -> Result<(Vec<u8>, ResponseMeta), GatewayError> {
        Inbound::aggregate_stream_chunks(self, events)
    }

    fn transform_error(&self, raw: &RawHttpResponse) -> GatewayError {
        let message = extract_error_message(&raw.body, &format!("http {}", raw.status));
        gateway_error_from_status(raw.status, message)
    }
}

/// Resolves the `Inbound`+`Outbound` pair for a wire format name, used
/// when building the processor for a given HTTP route.
pub fn transformer_for(format: ApiFormat) -> (Box<dyn Inbound>, Box<dyn Outbound>) {
    match format {
        ApiFormat::OpenAiChatCompletions => (
            Box::new(OpenAiChatTransformer),
            Box::new(OpenAiChatTransformer),
        ),
        ApiFormat::AnthropicMessages => (
            Box::new(AnthropicMessagesTransformer),
            Box::new(AnthropicMessagesTransformer),
        ),
        ApiFormat::GeminiGenerateContent => (
            Box::new(OpenAiChatTransformer),
            Box::new(OpenAiChatTransformer),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_inbound_parses_request() {
        let transformer = OpenAiChatTransformer;
        let raw = RawHttpRequest {
            body: br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
            headers: vec![],
        };
        let canonical = Inbound::transform_request(&transformer, &raw).unwrap();
        assert_eq!(canonical.model, "gpt-4");
        assert_eq!(canonical.messages.len(), 1);
    }

    #[test]
    fn openai_inbound_missing_model_is_invalid() {
        let transformer = OpenAiChatTransformer;
        let raw = RawHttpRequest {
            body: br#"{"messages":[]}"#.to_vec(),
            headers: vec![],
        };
        let err = Inbound::transform_request(&transformer, &raw).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidModel(_)));
    }

    #[test]
    fn openai_outbound_renders_request_body() {
        let transformer = OpenAiChatTransformer;
        let canonical = CanonicalRequest {
            model: "gpt-4".to_string(),
            messages: vec![CanonicalMessage {
                role: "user".to_string(),
                content: json!("hi"),
                tool_call_id: None,
            }],
            tools: None,
            max_tokens: Some(100),
            temperature: None,
            stream: false,
            raw: vec![],
        };
        let raw = Outbound::transform_request(&transformer, &canonical).unwrap();
        let value: Value = serde_json::from_slice(&raw.body).unwrap();
        assert_eq!(value["model"], "gpt-4");
    }

    #[test]
    fn openai_outbound_maps_5xx_to_retryable_error() {
        let transformer = OpenAiChatTransformer;
        let raw = RawHttpResponse {
            status: 502,
            body: br#"{"error":{"message":"bad gateway"}}"#.to_vec(),
            headers: vec![],
        };
        let err = Outbound::transform_error(&transformer, &raw);
        assert!(err.is_retryable());
    }

    #[test]
    fn openai_outbound_maps_4xx_to_non_retryable_error() {
        let transformer = OpenAiChatTransformer;
        let raw = RawHttpResponse {
            status: 400,
            body: br#"{"error":{"message":"bad request"}}"#.to_vec(),
            headers: vec![],
        };
        let err = Outbound::transform_error(&transformer, &raw);
        assert!(!err.is_retryable());
    }

    #[test]
    fn anthropic_inbound_extracts_system_message() {
        let transformer = AnthropicMessagesTransformer;
        let raw = RawHttpRequest {
            body: br#"{"model":"claude-3","system":"be nice","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
            headers: vec![],
        };
        let canonical = Inbound::transform_request(&transformer, &raw).unwrap();
        assert_eq!(canonical.messages[0].role, "system");
        assert_eq!(canonical.messages[1].role, "user");
    }

    #[test]
    fn anthropic_outbound_round_trips_response() {
        let transformer = AnthropicMessagesTransformer;
        let raw = RawHttpResponse {
            status: 200,
            body: br#"{"id":"msg_1","model":"claude-3","content":[{"type":"text","text":"hi"}],"usage":{"input_tokens":5,"output_tokens":3}}"#.to_vec(),
            headers: vec![],
        };
        let canonical = Outbound::transform_response(&transformer, &raw).unwrap();
        assert_eq!(canonical.id, "msg_1");
        assert_eq!(canonical.usage.unwrap().total_tokens, 8);
    }

    #[test]
    fn aggregate_stream_chunks_concatenates_openai_deltas() {
        let transformer = OpenAiChatTransformer;
        let events: Vec<Bytes> = vec![
            Bytes::from_static(b"data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n"),
            Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n"),
            Bytes::from_static(b"data: [DONE]\n\n"),
        ];
        let (body, meta) = Inbound::aggregate_stream_chunks(&transformer, &events).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "Hello");
        assert_eq!(meta.id.as_deref(), Some("1"));
    }
}
