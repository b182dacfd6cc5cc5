//! Streaming persistence wrappers: buffer chunks as they pass through,
//! persist best-effort on each chunk, then aggregate and finalize on
//! close. Both guard against double-close and survive aggregation
//! panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;

use crate::canonical::PerformanceRecord;
use crate::error::extract_error_message;
use crate::metrics_store::MetricsStore;
use crate::store::{LatencyMetrics, Store};
use crate::transformer::{Inbound, Outbound};

const TERMINAL_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps the upstream byte-event stream. Buffers every chunk and
/// best-effort-appends it to the execution row; on close, aggregates
/// the buffer into a final body via the outbound transformer and marks
/// the execution completed (or failed, if the upstream stream errored).
pub struct OutboundPersistentStream {
    store: Arc<dyn Store>,
    outbound: Arc<dyn Outbound>,
    execution_id: String,
    buffer: Vec<Bytes>,
    closed: bool,
}

impl OutboundPersistentStream {
    pub fn new(store: Arc<dyn Store>, outbound: Arc<dyn Outbound>, execution_id: impl Into<String>) -> Self {
        Self {
            store,
            outbound,
            execution_id: execution_id.into(),
            buffer: Vec::new(),
            closed: false,
        }
    }

    /// Called for each chunk observed on the wire, in order.
    pub async fn on_chunk(&mut self, chunk: Bytes) {
        self.buffer.push(chunk.clone());
        self.store.append_request_execution_chunk(&self.execution_id, &chunk).await;
    }

    /// Finalizes the stream. `upstream_error`, if set, short-circuits
    /// aggregation and marks the execution failed directly.
    pub async fn close(&mut self, upstream_error: Option<&str>) -> Option<(Vec<u8>, crate::canonical::ResponseMeta)> {
        if self.closed {
            return None;
        }
        self.closed = true;

        if let Some(message) = upstream_error {
            let _ = tokio::time::timeout(
                TERMINAL_PERSIST_TIMEOUT,
                self.store
                    .update_request_execution_status_from_error(&self.execution_id, message),
            )
            .await;
            return None;
        }

        let outbound = self.outbound.clone();
        let buffer = self.buffer.clone();
        let aggregated = AssertUnwindSafe(|| outbound.aggregate_stream_chunks(&buffer))
            .catch_unwind()
            .await;

        match aggregated {
            Ok(Ok((body, meta))) => {
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store
                        .update_request_execution_completed(&self.execution_id, meta.id.as_deref(), &body),
                )
                .await;
                Some((body, meta))
            }
            Ok(Err(err)) => {
                tracing::warn!(execution_id = %self.execution_id, error = %err, "stream aggregation failed");
                let message = err.to_string();
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store
                        .update_request_execution_status_from_error(&self.execution_id, &message),
                )
                .await;
                None
            }
            Err(_) => {
                tracing::error!(execution_id = %self.execution_id, "panic during stream aggregation, recovered");
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store.update_request_execution_status_from_error(
                        &self.execution_id,
                        "internal error aggregating stream",
                    ),
                )
                .await;
                None
            }
        }
    }
}

impl Drop for OutboundPersistentStream {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(execution_id = %self.execution_id, "outbound stream dropped without explicit close");
        }
    }
}

/// Wraps the client-facing canonical-event stream. Buffers client-format
/// chunks and on `close()` aggregates via the inbound transformer,
/// updating the request row with the normalized body and latency
/// metrics taken from the `PerformanceRecord`.
pub struct InboundPersistentStream {
    store: Arc<dyn Store>,
    inbound: Arc<dyn Inbound>,
    metrics: Arc<MetricsStore>,
    request_id: String,
    buffer: Vec<Bytes>,
    closed: bool,
}

impl InboundPersistentStream {
    pub fn new(
        store: Arc<dyn Store>,
        inbound: Arc<dyn Inbound>,
        metrics: Arc<MetricsStore>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            inbound,
            metrics,
            request_id: request_id.into(),
            buffer: Vec::new(),
            closed: false,
        }
    }

    pub async fn on_chunk(&mut self, chunk: Bytes) {
        self.buffer.push(chunk.clone());
        self.store.append_request_chunk(&self.request_id, &chunk).await;
    }

    pub async fn close(&mut self, record: &mut PerformanceRecord, cancelled_with_error: Option<&str>) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(message) = cancelled_with_error {
            record.mark_failed(0);
            self.metrics.record(record);
            let _ = tokio::time::timeout(
                TERMINAL_PERSIST_TIMEOUT,
                self.store.update_request_status_from_error(&self.request_id, message),
            )
            .await;
            return;
        }

        let inbound = self.inbound.clone();
        let buffer = self.buffer.clone();
        let aggregated = AssertUnwindSafe(|| inbound.aggregate_stream_chunks(&buffer))
            .catch_unwind()
            .await;

        let (first_token_ms, request_ms, tokens) = record.calculate();
        record.mark_success(tokens);
        self.metrics.record(record);

        match aggregated {
            Ok(Ok((body, meta))) => {
                let latency = crate::store::latency_metrics_from(first_token_ms, request_ms);
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store
                        .update_request_completed(&self.request_id, meta.id.as_deref(), &body, latency),
                )
                .await;
            }
            Ok(Err(err)) => {
                let message = extract_error_message(b"", &err);
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store.update_request_status_from_error(&self.request_id, &message),
                )
                .await;
            }
            Err(_) => {
                tracing::error!(request_id = %self.request_id, "panic during inbound aggregation, recovered");
                let _ = tokio::time::timeout(
                    TERMINAL_PERSIST_TIMEOUT,
                    self.store.update_request_status_from_error(
                        &self.request_id,
                        "internal error aggregating stream",
                    ),
                )
                .await;
            }
        }
    }
}

impl Drop for InboundPersistentStream {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(request_id = %self.request_id, "inbound stream dropped without explicit close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::transformer::OpenAiChatTransformer;

    #[tokio::test]
    async fn outbound_stream_closes_at_most_once() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let outbound: Arc<dyn Outbound> = Arc::new(OpenAiChatTransformer);
        let request = store
            .create_request(
                &crate::canonical::CanonicalRequest {
                    model: "gpt-4".to_string(),
                    messages: vec![],
                    tools: None,
                    max_tokens: None,
                    temperature: None,
                    stream: true,
                    raw: vec![],
                },
                b"{}",
                crate::canonical::ApiFormat::OpenAiChatCompletions,
            )
            .await
            .unwrap();
        let execution = store
            .create_request_execution(
                &test_channel(),
                "gpt-4",
                &request.id,
                b"{}",
                crate::canonical::ApiFormat::OpenAiChatCompletions,
            )
            .await
            .unwrap();

        let mut stream = OutboundPersistentStream::new(store.clone(), outbound, execution.id.clone());
        stream
            .on_chunk(Bytes::from_static(
                b"data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            ))
            .await;

        let first = stream.close(None).await;
        assert!(first.is_some());
        let second = stream.close(None).await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn outbound_stream_marks_failed_on_upstream_error() {
        let inmemory = Arc::new(InMemoryStore::new());
        let store: Arc<dyn Store> = inmemory.clone();
        let outbound: Arc<dyn Outbound> = Arc::new(OpenAiChatTransformer);
        let request = store
            .create_request(
                &crate::canonical::CanonicalRequest {
                    model: "gpt-4".to_string(),
                    messages: vec![],
                    tools: None,
                    max_tokens: None,
                    temperature: None,
                    stream: true,
                    raw: vec![],
                },
                b"{}",
                crate::canonical::ApiFormat::OpenAiChatCompletions,
            )
            .await
            .unwrap();
        let execution = store
            .create_request_execution(
                &test_channel(),
                "gpt-4",
                &request.id,
                b"{}",
                crate::canonical::ApiFormat::OpenAiChatCompletions,
            )
            .await
            .unwrap();

        let mut stream = OutboundPersistentStream::new(store.clone(), outbound, execution.id.clone());
        stream.close(Some("connection reset")).await;

        let row = inmemory.get_execution(&execution.id).unwrap();
        assert_eq!(row.error_message.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn inbound_stream_aggregates_and_records_first_token_latency_after_client_cancel() {
        let inmemory = Arc::new(InMemoryStore::new());
        let store: Arc<dyn Store> = inmemory.clone();
        let inbound: Arc<dyn Inbound> = Arc::new(OpenAiChatTransformer);
        let metrics = Arc::new(MetricsStore::new());

        let request = store
            .create_request(
                &crate::canonical::CanonicalRequest {
                    model: "gpt-4".to_string(),
                    messages: vec![],
                    tools: None,
                    max_tokens: None,
                    temperature: None,
                    stream: true,
                    raw: vec![],
                },
                b"{}",
                crate::canonical::ApiFormat::OpenAiChatCompletions,
            )
            .await
            .unwrap();

        let mut stream = InboundPersistentStream::new(store.clone(), inbound, metrics, request.id.clone());
        let mut record = PerformanceRecord::start("ch1", true);

        // Client receives two of the four upstream chunks before cancelling;
        // the wrapper still aggregates and persists whatever was buffered.
        stream
            .on_chunk(Bytes::from_static(
                b"data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
            ))
            .await;
        record.mark_first_token();
        stream
            .on_chunk(Bytes::from_static(
                b"data: {\"id\":\"1\",\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
            ))
            .await;

        stream.close(&mut record, None).await;

        let row = inmemory.get_request(&request.id).unwrap();
        assert_eq!(row.status, crate::store::RowStatus::Completed);
        assert!(row.body.is_some());
        assert!(record.calculate().0.is_some(), "first_token_latency_ms should be set");

        // Closing again after cancel must still be a no-op, never double-persisting.
        stream.close(&mut record, None).await;
    }

    fn test_channel() -> crate::channel::Channel {
        crate::channel::Channel {
            id: "ch1".into(),
            name: "test".into(),
            provider_type: "openai".into(),
            base_url: "https://api.example.com".into(),
            credential: crate::channel::Credential::Bearer { token: "x".into() },
            supported_models: std::collections::BTreeSet::from(["gpt-4".to_string()]),
            model_mappings: Default::default(),
            model_prefix: None,
            weight: 100,
            tags: Default::default(),
            status: crate::channel::ChannelStatus::Enabled,
            override_parameters: Default::default(),
            override_headers: Vec::new(),
        }
    }
}
