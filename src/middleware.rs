//! The middleware chain hooked into specific pipeline phases.
//!
//! Each middleware implements whichever hooks it needs; unimplemented
//! hooks default to identity. `default_chain()` builds the nine
//! built-ins in their required order.

use std::sync::Arc;

use crate::canonical::{CanonicalRequest, CanonicalResponse, PerformanceRecord, RawHttpRequest, RawHttpResponse};
use crate::channel::Channel;
use crate::connection_tracker::ConnectionTracker;
use crate::error::GatewayError;
use crate::metrics_store::MetricsStore;
use crate::model_mapper::ModelMapper;
use crate::selector::ChannelSelector;
use crate::store::Store;

/// Mutable state a middleware chain reads and writes over one attempt.
/// Owned exclusively by the pipeline for the attempt's duration.
pub struct MiddlewareState<'a> {
    pub request_id: Option<String>,
    pub execution_id: Option<String>,
    pub original_model: Option<String>,
    pub channel: Option<Channel>,
    pub performance: Option<PerformanceRecord>,
    pub store: &'a dyn Store,
    pub metrics: &'a MetricsStore,
    pub connections: &'a ConnectionTracker,
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_inbound_llm_request(
        &self,
        _state: &mut MiddlewareState<'_>,
        request: CanonicalRequest,
    ) -> Result<CanonicalRequest, GatewayError> {
        Ok(request)
    }

    async fn on_raw_request(
        &self,
        _state: &mut MiddlewareState<'_>,
        request: RawHttpRequest,
    ) -> Result<RawHttpRequest, GatewayError> {
        Ok(request)
    }

    async fn on_outbound_raw_response(
        &self,
        _state: &mut MiddlewareState<'_>,
        response: RawHttpResponse,
    ) -> Result<RawHttpResponse, GatewayError> {
        Ok(response)
    }

    async fn on_outbound_llm_response(
        &self,
        _state: &mut MiddlewareState<'_>,
        response: CanonicalResponse,
    ) -> Result<CanonicalResponse, GatewayError> {
        Ok(response)
    }

    async fn on_outbound_raw_error(&self, _state: &mut MiddlewareState<'_>, _err: &GatewayError) {}
}

/// Ensures a terminal stream chunk carries usage even when the upstream
/// omits one; best-effort, never fails the pipeline.
pub struct EnsureUsage;

#[async_trait::async_trait]
impl Middleware for EnsureUsage {
    fn name(&self) -> &'static str {
        "ensure_usage"
    }

    async fn on_outbound_llm_response(
        &self,
        _state: &mut MiddlewareState<'_>,
        mut response: CanonicalResponse,
    ) -> Result<CanonicalResponse, GatewayError> {
        if response.usage.is_none() {
            response.usage = Some(crate::canonical::Usage::default());
        }
        Ok(response)
    }
}

/// Rewrites the canonical model per the caller's API-key profile,
/// caching the pre-rewrite name once in `MiddlewareState.original_model`.
pub struct ApplyApiKeyModelMapping {
    pub mapper: ModelMapper,
}

#[async_trait::async_trait]
impl Middleware for ApplyApiKeyModelMapping {
    fn name(&self) -> &'static str {
        "apply_api_key_model_mapping"
    }

    async fn on_inbound_llm_request(
        &self,
        state: &mut MiddlewareState<'_>,
        mut request: CanonicalRequest,
    ) -> Result<CanonicalRequest, GatewayError> {
        let (mapped, original) = self.mapper.apply(&request.model);
        if let Some(original) = original {
            if state.original_model.is_none() {
                state.original_model = Some(original);
            }
            request.model = mapped;
        }
        Ok(request)
    }
}

/// Invokes the composed selector once; an empty result is an
/// *invalid-model* error.
pub struct SelectChannels {
    pub selector: Arc<dyn ChannelSelector>,
}

impl SelectChannels {
    /// Runs the selector for the canonical request's model, returning
    /// the ordered candidate list. Separate from the `Middleware` hooks
    /// since channel selection isn't keyed to a single-value transform.
    pub async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let channels = self.selector.select(model).await?;
        if channels.is_empty() {
            return Err(GatewayError::InvalidModel(model.to_string()));
        }
        Ok(channels)
    }
}

/// Creates the `RequestRow` once, before any channel-specific work.
pub struct PersistRequest;

impl PersistRequest {
    pub async fn persist(
        store: &dyn Store,
        canonical: &CanonicalRequest,
        raw: &[u8],
        api_format: crate::canonical::ApiFormat,
    ) -> Result<crate::store::RequestRow, GatewayError> {
        store.create_request(canonical, raw, api_format).await
    }
}

/// Applies channel body-JSON overrides to the outgoing raw request.
pub struct ApplyOverrideRequestBody;

#[async_trait::async_trait]
impl Middleware for ApplyOverrideRequestBody {
    fn name(&self) -> &'static str {
        "apply_override_request_body"
    }

    async fn on_raw_request(
        &self,
        state: &mut MiddlewareState<'_>,
        mut request: RawHttpRequest,
    ) -> Result<RawHttpRequest, GatewayError> {
        let Some(channel) = &state.channel else {
            return Ok(request);
        };
        if channel.override_parameters.is_empty() {
            return Ok(request);
        }
        let mut body: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| GatewayError::Internal(format!("invalid raw request body: {e}")))?;
        channel.apply_override_parameters(&mut body);
        request.body = serde_json::to_vec(&body).map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(request)
    }
}

/// Applies channel header overrides, honoring the hop-by-hop deny-list.
pub struct ApplyOverrideRequestHeaders;

#[async_trait::async_trait]
impl Middleware for ApplyOverrideRequestHeaders {
    fn name(&self) -> &'static str {
        "apply_override_request_headers"
    }

    async fn on_raw_request(
        &self,
        state: &mut MiddlewareState<'_>,
        mut request: RawHttpRequest,
    ) -> Result<RawHttpRequest, GatewayError> {
        if let Some(channel) = &state.channel {
            channel.apply_override_headers(&mut request.headers);
        }
        Ok(request)
    }
}

/// Creates the `ExecutionRow` right before dispatch; on error, the
/// pipeline records the failure message via `store.update_request_execution_status_from_error`.
pub struct PersistRequestExecution;

impl PersistRequestExecution {
    pub async fn persist(
        store: &dyn Store,
        channel: &Channel,
        model: &str,
        request_id: &str,
        upstream_raw: &[u8],
        api_format: crate::canonical::ApiFormat,
    ) -> Result<crate::store::ExecutionRow, GatewayError> {
        store
            .create_request_execution(channel, model, request_id, upstream_raw, api_format)
            .await
    }
}

/// Starts timing on raw request, records first-token on first streamed
/// canonical response, and marks success/failure on completion.
pub struct WithPerformanceRecording;

impl WithPerformanceRecording {
    pub fn start(channel_id: &str, stream: bool) -> PerformanceRecord {
        PerformanceRecord::start(channel_id, stream)
    }
}

/// Increments the connection counter on raw request; the matching
/// decrement is owned by a `ConnectionGuard` created alongside it so it
/// fires at most once regardless of completion path.
pub struct WithConnectionTracking;
