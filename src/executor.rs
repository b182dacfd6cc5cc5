//! The HTTP upstream executor contract and two implementations: a real
//! `reqwest`-backed one and an in-memory mock for tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::canonical::{HttpEvent, RawHttpRequest, RawHttpResponse};
use crate::channel::Channel;
use crate::error::GatewayError;

pub type EventStream = std::pin::Pin<Box<dyn futures::Stream<Item = Result<HttpEvent, GatewayError>> + Send>>;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn do_request(&self, channel: &Channel, request: &RawHttpRequest) -> Result<RawHttpResponse, GatewayError>;
    async fn do_stream(&self, channel: &Channel, request: &RawHttpRequest) -> Result<EventStream, GatewayError>;
}

fn build_url(channel: &Channel, path: &str) -> String {
    let base = channel.base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.ends_with(path) {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

fn endpoint_path(channel: &Channel) -> &'static str {
    match channel.provider_type.as_str() {
        "anthropic" => "messages",
        "gemini" => "models:generateContent",
        _ => "chat/completions",
    }
}

fn auth_header(channel: &Channel) -> Result<(String, String), GatewayError> {
    match &channel.credential {
        crate::channel::Credential::Bearer { token } => {
            Ok(("authorization".to_string(), format!("Bearer {token}")))
        }
        crate::channel::Credential::OAuth { access_token, .. } => {
            Ok(("authorization".to_string(), format!("Bearer {access_token}")))
        }
        crate::channel::Credential::AwsKeys { .. } => Err(GatewayError::Internal(
            "AWS SigV4 signing is not implemented by the reqwest executor".to_string(),
        )),
    }
}

/// Real upstream dispatch via `reqwest`. Mirrors the teacher's direct
/// `reqwest::Client` usage: one shared client, headers built per
/// channel credential, 5xx/connection failures classified for retry.
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(
        &self,
        channel: &Channel,
        request: &RawHttpRequest,
    ) -> Result<reqwest::RequestBuilder, GatewayError> {
        let url = build_url(channel, endpoint_path(channel));
        let mut builder = self.client.post(url).body(request.body.clone());
        let (name, value) = auth_header(channel)?;
        builder = builder.header(name, value);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        Ok(builder)
    }
}

#[async_trait]
impl Executor for ReqwestExecutor {
    async fn do_request(&self, channel: &Channel, request: &RawHttpRequest) -> Result<RawHttpResponse, GatewayError> {
        let builder = self.build_request(channel, request)?;
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::ConnectionError(e.to_string()))?
            .to_vec();
        Ok(RawHttpResponse { status, body, headers })
    }

    async fn do_stream(&self, channel: &Channel, request: &RawHttpRequest) -> Result<EventStream, GatewayError> {
        let builder = self.build_request(channel, request)?;
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| GatewayError::ConnectionError(e.to_string()))?;
            let message = crate::error::extract_error_message(&body, &format!("http {status}"));
            return Err(if (500..600).contains(&status) {
                GatewayError::Upstream5xx { status, body: message }
            } else {
                GatewayError::Upstream4xx { status, body: message }
            });
        }

        let (tx, rx) = mpsc::channel::<Result<HttpEvent, GatewayError>>(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            while let Some(chunk) = byte_stream.next().await {
                let event = match chunk {
                    Ok(bytes) => Ok(HttpEvent::data(bytes.to_vec())),
                    Err(e) => Err(GatewayError::StreamError(e.to_string())),
                };
                let is_err = event.is_err();
                if tx.send(event).await.is_err() || is_err {
                    break;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// A scripted upstream response, used by `MockExecutor` in tests.
pub enum MockResponse {
    Response(RawHttpResponse),
    Stream(Vec<HttpEvent>),
    ConnectionError(String),
}

/// In-memory executor: returns pre-scripted responses keyed by channel
/// id, in FIFO order per channel. Used by unit and integration tests
/// in place of a live upstream.
#[derive(Default)]
pub struct MockExecutor {
    responses: parking_lot::Mutex<std::collections::HashMap<String, std::collections::VecDeque<MockResponse>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, channel_id: impl Into<String>, response: MockResponse) {
        self.responses
            .lock()
            .entry(channel_id.into())
            .or_default()
            .push_back(response);
    }

    fn pop(&self, channel_id: &str) -> Option<MockResponse> {
        self.responses.lock().get_mut(channel_id).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn do_request(&self, channel: &Channel, _request: &RawHttpRequest) -> Result<RawHttpResponse, GatewayError> {
        match self.pop(&channel.id) {
            Some(MockResponse::Response(resp)) => Ok(resp),
            Some(MockResponse::ConnectionError(msg)) => Err(GatewayError::ConnectionError(msg)),
            Some(MockResponse::Stream(_)) => Err(GatewayError::Internal(
                "scripted a stream response for a non-stream call".to_string(),
            )),
            None => Err(GatewayError::Internal(format!("no scripted response for channel {}", channel.id))),
        }
    }

    async fn do_stream(&self, channel: &Channel, _request: &RawHttpRequest) -> Result<EventStream, GatewayError> {
        match self.pop(&channel.id) {
            Some(MockResponse::Stream(events)) => {
                let (tx, rx) = mpsc::channel::<Result<HttpEvent, GatewayError>>(events.len().max(1));
                for event in events {
                    let _ = tx.send(Ok(event)).await;
                }
                Ok(Box::pin(ReceiverStream::new(rx)))
            }
            Some(MockResponse::ConnectionError(msg)) => Err(GatewayError::ConnectionError(msg)),
            Some(MockResponse::Response(_)) => Err(GatewayError::Internal(
                "scripted a non-stream response for a stream call".to_string(),
            )),
            None => Err(GatewayError::Internal(format!("no scripted response for channel {}", channel.id))),
        }
    }
}

#[allow(dead_code)]
fn unused_bytes_hint(_b: Bytes) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, Credential};
    use std::collections::BTreeSet;

    fn test_channel() -> Channel {
        Channel {
            id: "ch1".into(),
            name: "test".into(),
            provider_type: "openai".into(),
            base_url: "https://api.example.com".into(),
            credential: Credential::Bearer { token: "sk-test".into() },
            supported_models: BTreeSet::from(["gpt-4".to_string()]),
            model_mappings: Default::default(),
            model_prefix: None,
            weight: 100,
            tags: Default::default(),
            status: ChannelStatus::Enabled,
            override_parameters: Default::default(),
            override_headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn mock_executor_returns_scripted_response() {
        let executor = MockExecutor::new();
        executor.push_response(
            "ch1",
            MockResponse::Response(RawHttpResponse {
                status: 200,
                body: b"{}".to_vec(),
                headers: vec![],
            }),
        );
        let channel = test_channel();
        let request = RawHttpRequest::default();
        let response = executor.do_request(&channel, &request).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn mock_executor_responses_are_fifo_per_channel() {
        let executor = MockExecutor::new();
        executor.push_response("ch1", MockResponse::ConnectionError("first".to_string()));
        executor.push_response("ch1", MockResponse::ConnectionError("second".to_string()));
        let channel = test_channel();
        let request = RawHttpRequest::default();

        let first = executor.do_request(&channel, &request).await.unwrap_err();
        assert!(matches!(first, GatewayError::ConnectionError(m) if m == "first"));
        let second = executor.do_request(&channel, &request).await.unwrap_err();
        assert!(matches!(second, GatewayError::ConnectionError(m) if m == "second"));
    }

    #[tokio::test]
    async fn mock_executor_errors_when_no_scripted_response() {
        let executor = MockExecutor::new();
        let channel = test_channel();
        let request = RawHttpRequest::default();
        let err = executor.do_request(&channel, &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn mock_executor_streams_scripted_events() {
        let executor = MockExecutor::new();
        executor.push_response(
            "ch1",
            MockResponse::Stream(vec![HttpEvent::data(b"data: hi\n\n".to_vec())]),
        );
        let channel = test_channel();
        let request = RawHttpRequest::default();
        let mut stream = executor.do_stream(&channel, &request).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"data: hi\n\n");
    }

    #[test]
    fn build_url_avoids_duplicate_path_suffix() {
        let mut channel = test_channel();
        channel.base_url = "https://api.example.com/v1/chat/completions".to_string();
        assert_eq!(
            build_url(&channel, "chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
