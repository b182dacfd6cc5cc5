//! Persistence contract and an in-memory reference implementation.
//!
//! Mirrors the teacher's direct-`reqwest` / in-process bookkeeping style:
//! no external database is required to exercise the pipeline end to end,
//! but the trait boundary is where a real backend (Postgres, etc.) would
//! plug in.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::canonical::{ApiFormat, CanonicalRequest, ResponseMeta, Usage};
use crate::channel::Channel;
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: String,
    pub model: String,
    pub channel_id: Option<String>,
    pub api_format: ApiFormat,
    pub status: RowStatus,
    pub external_id: Option<String>,
    pub body: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRow {
    pub id: String,
    pub request_id: String,
    pub channel_id: String,
    pub model: String,
    pub api_format: ApiFormat,
    pub status: RowStatus,
    pub external_id: Option<String>,
    pub body: Option<Vec<u8>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UsageLogRow {
    pub id: String,
    pub request_id: String,
    pub execution_id: String,
    pub channel_id: String,
    pub model: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
}

/// Per-attempt latency numbers handed to `update_request_completed`.
#[derive(Debug, Clone, Default)]
pub struct LatencyMetrics {
    pub first_token_latency_ms: Option<u64>,
    pub request_latency_ms: Option<u64>,
}

/// The persistence contract from the external interfaces section: a
/// minimal set of operations the pipeline needs to record request and
/// execution lifecycle, independent of backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_request(
        &self,
        canonical: &CanonicalRequest,
        raw: &[u8],
        api_format: ApiFormat,
    ) -> Result<RequestRow, GatewayError>;

    async fn append_request_chunk(&self, request_id: &str, chunk: &[u8]);

    async fn update_request_completed(
        &self,
        request_id: &str,
        external_id: Option<&str>,
        body: &[u8],
        latency: LatencyMetrics,
    ) -> Result<(), GatewayError>;

    async fn update_request_status_from_error(&self, request_id: &str, message: &str);

    async fn create_request_execution(
        &self,
        channel: &Channel,
        model: &str,
        request_id: &str,
        upstream_raw: &[u8],
        api_format: ApiFormat,
    ) -> Result<ExecutionRow, GatewayError>;

    async fn append_request_execution_chunk(&self, execution_id: &str, chunk: &[u8]);

    async fn update_request_execution_completed(
        &self,
        execution_id: &str,
        external_id: Option<&str>,
        body: &[u8],
    ) -> Result<(), GatewayError>;

    async fn update_request_execution_status_from_error(&self, execution_id: &str, message: &str);

    async fn update_request_channel_id(&self, request_id: &str, channel_id: &str, trace_id: &str);

    async fn create_usage_log_from_request(
        &self,
        request_id: &str,
        execution_id: &str,
        channel_id: &str,
        model: &str,
        usage: Usage,
    ) -> Result<UsageLogRow, GatewayError>;

    async fn get_last_successful_channel_id(&self, trace_id: &str) -> Option<String>;
}

/// Channel directory read by the selector chain. Kept separate from
/// `Store` since a real deployment backs channel config with a cached
/// admin-managed table, not the request/execution log.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn list_enabled_channels(&self) -> Vec<Channel>;
    async fn get_channel(&self, id: &str) -> Option<Channel>;
}

/// Reference in-memory implementation of both contracts, suitable for
/// tests and the bundled example server.
#[derive(Default)]
pub struct InMemoryStore {
    channels: RwLock<HashMap<String, Channel>>,
    requests: RwLock<HashMap<String, RequestRow>>,
    executions: RwLock<HashMap<String, ExecutionRow>>,
    usage_logs: RwLock<HashMap<String, UsageLogRow>>,
    last_successful_channel: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Vec<Channel>) -> Self {
        let store = Self::new();
        {
            let mut map = store.channels.write();
            for channel in channels {
                map.insert(channel.id.clone(), channel);
            }
        }
        store
    }

    pub fn insert_channel(&self, channel: Channel) {
        self.channels.write().insert(channel.id.clone(), channel);
    }

    pub fn note_successful_channel(&self, trace_id: &str, channel_id: &str) {
        self.last_successful_channel
            .write()
            .insert(trace_id.to_string(), channel_id.to_string());
    }

    pub fn get_request(&self, request_id: &str) -> Option<RequestRow> {
        self.requests.read().get(request_id).cloned()
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRow> {
        self.executions.read().get(execution_id).cloned()
    }

    pub fn all_requests(&self) -> Vec<RequestRow> {
        self.requests.read().values().cloned().collect()
    }

    pub fn all_executions(&self) -> Vec<ExecutionRow> {
        self.executions.read().values().cloned().collect()
    }
}

#[async_trait]
impl ChannelRepository for InMemoryStore {
    async fn list_enabled_channels(&self) -> Vec<Channel> {
        self.channels
            .read()
            .values()
            .filter(|c| c.is_enabled())
            .cloned()
            .collect()
    }

    async fn get_channel(&self, id: &str) -> Option<Channel> {
        self.channels.read().get(id).cloned()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_request(
        &self,
        canonical: &CanonicalRequest,
        raw: &[u8],
        api_format: ApiFormat,
    ) -> Result<RequestRow, GatewayError> {
        let row = RequestRow {
            id: Uuid::new_v4().to_string(),
            model: canonical.model.clone(),
            channel_id: None,
            api_format,
            status: RowStatus::Pending,
            external_id: None,
            body: Some(raw.to_vec()),
            error_message: None,
            created_at: Utc::now(),
        };
        self.requests.write().insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn append_request_chunk(&self, request_id: &str, _chunk: &[u8]) {
        if !self.requests.read().contains_key(request_id) {
            tracing::warn!(request_id, "append_request_chunk on unknown request");
        }
    }

    async fn update_request_completed(
        &self,
        request_id: &str,
        external_id: Option<&str>,
        body: &[u8],
        _latency: LatencyMetrics,
    ) -> Result<(), GatewayError> {
        let mut requests = self.requests.write();
        let row = requests
            .get_mut(request_id)
            .ok_or_else(|| GatewayError::Internal(format!("unknown request {request_id}")))?;
        row.status = RowStatus::Completed;
        row.external_id = external_id.map(|s| s.to_string());
        row.body = Some(body.to_vec());
        Ok(())
    }

    async fn update_request_status_from_error(&self, request_id: &str, message: &str) {
        if let Some(row) = self.requests.write().get_mut(request_id) {
            row.status = RowStatus::Failed;
            row.error_message = Some(message.to_string());
        }
    }

    async fn create_request_execution(
        &self,
        channel: &Channel,
        model: &str,
        request_id: &str,
        upstream_raw: &[u8],
        api_format: ApiFormat,
    ) -> Result<ExecutionRow, GatewayError> {
        let row = ExecutionRow {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            channel_id: channel.id.clone(),
            model: model.to_string(),
            api_format,
            status: RowStatus::InProgress,
            external_id: None,
            body: Some(upstream_raw.to_vec()),
            error_message: None,
            created_at: Utc::now(),
        };
        self.executions.write().insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn append_request_execution_chunk(&self, execution_id: &str, _chunk: &[u8]) {
        if !self.executions.read().contains_key(execution_id) {
            tracing::warn!(execution_id, "append_request_execution_chunk on unknown execution");
        }
    }

    async fn update_request_execution_completed(
        &self,
        execution_id: &str,
        external_id: Option<&str>,
        body: &[u8],
    ) -> Result<(), GatewayError> {
        let mut executions = self.executions.write();
        let row = executions.get_mut(execution_id).ok_or_else(|| {
            GatewayError::Internal(format!("unknown execution {execution_id}"))
        })?;
        row.status = RowStatus::Completed;
        row.external_id = external_id.map(|s| s.to_string());
        row.body = Some(body.to_vec());
        Ok(())
    }

    async fn update_request_execution_status_from_error(&self, execution_id: &str, message: &str) {
        if let Some(row) = self.executions.write().get_mut(execution_id) {
            row.status = RowStatus::Failed;
            row.error_message = Some(message.to_string());
        }
    }

    async fn update_request_channel_id(&self, request_id: &str, channel_id: &str, trace_id: &str) {
        if let Some(row) = self.requests.write().get_mut(request_id) {
            row.channel_id = Some(channel_id.to_string());
        }
        self.note_successful_channel(trace_id, channel_id);
    }

    async fn create_usage_log_from_request(
        &self,
        request_id: &str,
        execution_id: &str,
        channel_id: &str,
        model: &str,
        usage: Usage,
    ) -> Result<UsageLogRow, GatewayError> {
        let row = UsageLogRow {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            execution_id: execution_id.to_string(),
            channel_id: channel_id.to_string(),
            model: model.to_string(),
            usage,
            created_at: Utc::now(),
        };
        self.usage_logs.write().insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_last_successful_channel_id(&self, trace_id: &str) -> Option<String> {
        self.last_successful_channel.read().get(trace_id).cloned()
    }
}

/// Helper used by `ResponseMeta` consumers to build a `LatencyMetrics`
/// from a calculated `PerformanceRecord`.
pub fn latency_metrics_from(first_token_ms: Option<u64>, request_ms: Option<u64>) -> LatencyMetrics {
    LatencyMetrics {
        first_token_latency_ms: first_token_ms,
        request_latency_ms: request_ms,
    }
}

#[allow(dead_code)]
fn unused_response_meta_hint(_meta: &ResponseMeta) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, Credential};
    use std::collections::BTreeSet;

    fn test_channel(id: &str) -> Channel {
        Channel {
            id: id.into(),
            name: id.into(),
            provider_type: "openai".into(),
            base_url: "https://api.example.com".into(),
            credential: Credential::Bearer { token: "x".into() },
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

    fn test_request() -> CanonicalRequest {
        CanonicalRequest {
            model: "gpt-4".into(),
            messages: vec![],
            tools: None,
            max_tokens: None,
            temperature: None,
            stream: false,
            raw: vec![],
        }
    }

    #[tokio::test]
    async fn list_enabled_channels_filters_disabled() {
        let store = InMemoryStore::new();
        store.insert_channel(test_channel("ch1"));
        let mut disabled = test_channel("ch2");
        disabled.status = ChannelStatus::Disabled;
        store.insert_channel(disabled);

        let enabled = store.list_enabled_channels().await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "ch1");
    }

    #[tokio::test]
    async fn create_and_complete_request_round_trip() {
        let store = InMemoryStore::new();
        let row = store
            .create_request(&test_request(), b"{}", ApiFormat::OpenAiChatCompletions)
            .await
            .unwrap();
        assert_eq!(row.status, RowStatus::Pending);

        store
            .update_request_completed(&row.id, Some("ext-1"), b"{\"ok\":true}", LatencyMetrics::default())
            .await
            .unwrap();
        let updated = store.get_request(&row.id).unwrap();
        assert_eq!(updated.status, RowStatus::Completed);
        assert_eq!(updated.external_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn update_completed_on_unknown_request_errors() {
        let store = InMemoryStore::new();
        let result = store
            .update_request_completed("missing", None, b"{}", LatencyMetrics::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execution_lifecycle_round_trip() {
        let store = InMemoryStore::new();
        let channel = test_channel("ch1");
        let request = store
            .create_request(&test_request(), b"{}", ApiFormat::OpenAiChatCompletions)
            .await
            .unwrap();
        let execution = store
            .create_request_execution(&channel, "gpt-4", &request.id, b"{}", ApiFormat::OpenAiChatCompletions)
            .await
            .unwrap();
        store
            .update_request_execution_completed(&execution.id, None, b"{}")
            .await
            .unwrap();
        assert_eq!(store.get_execution(&execution.id).unwrap().status, RowStatus::Completed);
    }

    #[tokio::test]
    async fn status_from_error_marks_failed() {
        let store = InMemoryStore::new();
        let request = store
            .create_request(&test_request(), b"{}", ApiFormat::OpenAiChatCompletions)
            .await
            .unwrap();
        store
            .update_request_status_from_error(&request.id, "upstream 502")
            .await;
        let row = store.get_request(&request.id).unwrap();
        assert_eq!(row.status, RowStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("upstream 502"));
    }

    #[tokio::test]
    async fn last_successful_channel_tracks_per_trace() {
        let store = InMemoryStore::new();
        store.note_successful_channel("trace-1", "ch1");
        assert_eq!(
            store.get_last_successful_channel_id("trace-1").await,
            Some("ch1".to_string())
        );
        assert_eq!(store.get_last_successful_channel_id("trace-2").await, None);
    }
}
