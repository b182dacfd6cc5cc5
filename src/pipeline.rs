//! The linear per-attempt state machine: transform in, run middlewares,
//! transform out, dispatch, transform back, with a retry loop across
//! channels per the configured policy.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::canonical::{ApiFormat, CanonicalRequest, PerformanceRecord, RawHttpRequest, RawHttpResponse};
use crate::channel::Channel;
use crate::connection_tracker::{ConnectionGuard, ConnectionTracker, OwnedConnectionGuard};
use crate::error::{extract_error_message, GatewayError};
use crate::executor::{Executor, EventStream};
use crate::metrics_store::MetricsStore;
use crate::middleware::{ApplyOverrideRequestBody, ApplyOverrideRequestHeaders, Middleware, MiddlewareState};
use crate::model_mapper::ModelMapper;
use crate::selector::{
    ChannelSelector, DefaultSelector, LoadBalancedSelector, SelectedChannelsSelector, TagsFilterSelector,
};
use crate::store::{ChannelRepository, LatencyMetrics, RequestRow, Store};
use crate::strategy::{LoadBalancer, RoutingContext};
use crate::stream_persist::{InboundPersistentStream, OutboundPersistentStream};
use crate::transformer::{Inbound, Outbound};

/// Client-supplied trace id header, used to key `TraceAwareStrategy`'s
/// last-successful-channel lookup. Distinct from `request_id`.
const TRACE_ID_HEADER: &str = "ah-trace-id";

fn extract_trace_id(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(TRACE_ID_HEADER))
        .map(|(_, value)| value.clone())
        .filter(|v| !v.is_empty())
}

/// Restores the pre-mapping model name for the outbound transform
/// (invariant 5), letting a channel-local mapping remap it further.
fn restore_original_model(canonical_model: &str, original_model: Option<&str>, channel: &Channel) -> String {
    let Some(original) = original_model else {
        return canonical_model.to_string();
    };
    channel
        .model_mappings
        .get(original)
        .cloned()
        .unwrap_or_else(|| original.to_string())
}

/// `max_channel_retries` switches to a new channel; `max_single_channel_retries`
/// retries the same channel; `retry_delay` is applied between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_channel_retries: usize,
    pub max_single_channel_retries: usize,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_channel_retries: 2,
            max_single_channel_retries: 1,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Tracks progress through the candidate channel list and the retry
/// budgets, owned by one `Pipeline::run` call.
struct RetryState {
    candidates: Vec<Channel>,
    channel_index: usize,
    channel_retries_left: usize,
    single_channel_retries_left: usize,
    policy: RetryPolicy,
    attempts: usize,
}

impl RetryState {
    fn new(candidates: Vec<Channel>, policy: RetryPolicy) -> Self {
        Self {
            candidates,
            channel_index: 0,
            channel_retries_left: policy.max_channel_retries,
            single_channel_retries_left: policy.max_single_channel_retries,
            policy,
            attempts: 0,
        }
    }

    fn current_channel(&self) -> &Channel {
        &self.candidates[self.channel_index]
    }

    fn has_more_channels(&self) -> bool {
        self.channel_index + 1 < self.candidates.len()
    }

    fn next_channel(&mut self) {
        self.channel_index += 1;
        self.single_channel_retries_left = self.policy.max_single_channel_retries;
    }

    fn prepare_for_retry(&mut self) {
        self.single_channel_retries_left -= 1;
    }
}

fn provider_type_to_api_format(provider_type: &str) -> ApiFormat {
    match provider_type {
        "anthropic" => ApiFormat::AnthropicMessages,
        "gemini" => ApiFormat::GeminiGenerateContent,
        _ => ApiFormat::OpenAiChatCompletions,
    }
}

pub struct Pipeline {
    pub inbound: Arc<dyn Inbound>,
    pub repo: Arc<dyn ChannelRepository>,
    pub allowed_channel_ids: Vec<String>,
    pub tags: Vec<String>,
    pub balancer: Arc<LoadBalancer>,
    pub executor: Arc<dyn Executor>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<MetricsStore>,
    pub connections: Arc<ConnectionTracker>,
    pub model_mapper: ModelMapper,
    pub retry_policy: RetryPolicy,
}

/// The outcome of a completed (non-streaming) pipeline run.
pub struct PipelineResult {
    pub response: RawHttpResponse,
    pub request_id: String,
    pub channel_id: String,
}

/// A live, client-facing SSE byte stream plus the bookkeeping the HTTP
/// layer needs to build the response. Persistence continues in a
/// detached task regardless of whether `events` is fully drained.
pub struct StreamingResult {
    pub request_id: String,
    pub channel_id: String,
    pub content_type: &'static str,
    pub events: std::pin::Pin<Box<dyn futures::Stream<Item = Result<Bytes, GatewayError>> + Send>>,
}

/// `Process(ctx, raw_http) -> {response} | {stream}` from the component
/// design: a pipeline run ends in exactly one of these two shapes.
pub enum PipelineOutcome {
    Response(PipelineResult),
    Stream(StreamingResult),
}

impl Pipeline {
    /// Runs phase 1-2 common to both request shapes, then dispatches to
    /// the buffered or streaming continuation based on `canonical.stream`.
    pub async fn run(&self, raw: RawHttpRequest) -> Result<PipelineOutcome, GatewayError> {
        // Phase 1: inbound.transform_request
        let mut canonical = self.inbound.transform_request(&raw)?;

        let mut original_model = None;
        let (mapped, original) = self.model_mapper.apply(&canonical.model);
        if let Some(original) = original {
            original_model = Some(original);
            canonical.model = mapped;
        }

        let trace_id = extract_trace_id(&raw.headers);

        // Phase 2 (selectChannels, part of the inbound middleware phase):
        // full decorator chain, including the load balancer. Built fresh
        // here since `LoadBalancedSelector` borrows the routing context
        // and can't live in a `'static` field.
        let last_successful = match &trace_id {
            Some(id) => self.store.get_last_successful_channel_id(id).await,
            None => None,
        };
        let resolver = move |_: &str| last_successful.clone();
        let ctx = RoutingContext {
            trace_id: trace_id.clone(),
            metrics: self.metrics.as_ref(),
            connections: self.connections.as_ref(),
            last_successful_channel: &resolver,
        };
        let base: Box<dyn ChannelSelector> = Box::new(DefaultSelector::new(self.repo.clone()));
        let selected: Box<dyn ChannelSelector> =
            Box::new(SelectedChannelsSelector::new(self.allowed_channel_ids.clone(), base));
        let tagged: Box<dyn ChannelSelector> = Box::new(TagsFilterSelector::new(self.tags.clone(), selected));
        let selector = LoadBalancedSelector::new(tagged, self.balancer.as_ref(), ctx);

        let candidates = selector.select(&canonical.model).await?;
        if candidates.is_empty() {
            return Err(GatewayError::InvalidModel(canonical.model.clone()));
        }

        let request_row = self
            .store
            .create_request(&canonical, &raw.body, self.inbound.api_format())
            .await?;

        if canonical.stream {
            self.run_stream(canonical, candidates, request_row, original_model, trace_id)
                .await
        } else {
            self.run_response(canonical, candidates, request_row, original_model, trace_id)
                .await
        }
    }

    /// Runs phases 3-9 for a non-streaming request, including the retry
    /// loop across channels on retryable errors.
    async fn run_response(
        &self,
        canonical: CanonicalRequest,
        candidates: Vec<Channel>,
        request_row: RequestRow,
        original_model: Option<String>,
        trace_id: Option<String>,
    ) -> Result<PipelineOutcome, GatewayError> {
        let mut retry_state = RetryState::new(candidates, self.retry_policy);

        loop {
            retry_state.attempts += 1;
            let channel = retry_state.current_channel().clone();

            match self
                .attempt(&canonical, &channel, &request_row.id, original_model.as_deref())
                .await
            {
                Ok((response, execution_id)) => {
                    self.store
                        .update_request_channel_id(&request_row.id, &channel.id, trace_id.as_deref().unwrap_or(""))
                        .await;
                    let mut canonical_response = self.outbound_for(&channel).transform_response(&response)?;
                    if canonical_response.usage.is_none() {
                        canonical_response.usage = Some(crate::canonical::Usage::default());
                    }
                    let body = self.inbound.transform_response(&canonical_response)?;
                    self.store
                        .update_request_completed(
                            &request_row.id,
                            Some(canonical_response.id.as_str()),
                            &body.body,
                            LatencyMetrics::default(),
                        )
                        .await?;
                    let _ = execution_id;
                    return Ok(PipelineOutcome::Response(PipelineResult {
                        response: body,
                        request_id: request_row.id,
                        channel_id: channel.id,
                    }));
                }
                Err(err) if err.is_retryable() => {
                    if retry_state.single_channel_retries_left > 0 {
                        retry_state.prepare_for_retry();
                        tokio::time::sleep(retry_state.policy.retry_delay).await;
                        continue;
                    }
                    if retry_state.channel_retries_left > 0 && retry_state.has_more_channels() {
                        retry_state.channel_retries_left -= 1;
                        retry_state.next_channel();
                        tokio::time::sleep(retry_state.policy.retry_delay).await;
                        continue;
                    }
                    self.persist_terminal_failure(&request_row.id, &err).await;
                    return Err(GatewayError::AllChannelsExhausted {
                        attempts: retry_state.attempts,
                    });
                }
                Err(err) => {
                    self.persist_terminal_failure(&request_row.id, &err).await;
                    return Err(err);
                }
            }
        }
    }

    /// Runs phases 3-5 for a streaming request: retries apply only to
    /// establishing the upstream stream. Once established, hands the
    /// client a live byte stream and detaches persistence (phases 6-9,
    /// driven by `OutboundPersistentStream`/`InboundPersistentStream`)
    /// into its own task so a client disconnect can't cut it short.
    async fn run_stream(
        &self,
        canonical: CanonicalRequest,
        candidates: Vec<Channel>,
        request_row: RequestRow,
        original_model: Option<String>,
        trace_id: Option<String>,
    ) -> Result<PipelineOutcome, GatewayError> {
        let mut retry_state = RetryState::new(candidates, self.retry_policy);

        loop {
            retry_state.attempts += 1;
            let channel = retry_state.current_channel().clone();

            match self
                .attempt_stream(&canonical, &channel, &request_row.id, original_model.as_deref())
                .await
            {
                Ok((event_stream, execution_id, record, outbound)) => {
                    self.store
                        .update_request_channel_id(&request_row.id, &channel.id, trace_id.as_deref().unwrap_or(""))
                        .await;

                    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, GatewayError>>(64);
                    self.spawn_stream_persistence(
                        event_stream,
                        execution_id,
                        record,
                        outbound,
                        channel.id.clone(),
                        request_row.id.clone(),
                        tx,
                    );

                    return Ok(PipelineOutcome::Stream(StreamingResult {
                        request_id: request_row.id,
                        channel_id: channel.id,
                        content_type: "text/event-stream",
                        events: Box::pin(ReceiverStream::new(rx)),
                    }));
                }
                Err(err) if err.is_retryable() => {
                    if retry_state.single_channel_retries_left > 0 {
                        retry_state.prepare_for_retry();
                        tokio::time::sleep(retry_state.policy.retry_delay).await;
                        continue;
                    }
                    if retry_state.channel_retries_left > 0 && retry_state.has_more_channels() {
                        retry_state.channel_retries_left -= 1;
                        retry_state.next_channel();
                        tokio::time::sleep(retry_state.policy.retry_delay).await;
                        continue;
                    }
                    self.persist_terminal_failure(&request_row.id, &err).await;
                    return Err(GatewayError::AllChannelsExhausted {
                        attempts: retry_state.attempts,
                    });
                }
                Err(err) => {
                    self.persist_terminal_failure(&request_row.id, &err).await;
                    return Err(err);
                }
            }
        }
    }

    fn outbound_for(&self, channel: &Channel) -> Box<dyn Outbound> {
        crate::transformer::transformer_for(provider_type_to_api_format(&channel.provider_type)).1
    }

    /// Runs phases 3-7 for a single attempt against one channel.
    async fn attempt(
        &self,
        canonical: &CanonicalRequest,
        channel: &Channel,
        request_id: &str,
        original_model: Option<&str>,
    ) -> Result<(RawHttpResponse, String), GatewayError> {
        let outbound = self.outbound_for(channel);

        // Phase 3: outbound.transform_request, with invariant 5's
        // pre-mapping model restored so a channel-local remap applies.
        let mut upstream_canonical = canonical.clone();
        upstream_canonical.model = restore_original_model(&canonical.model, original_model, channel);
        let mut upstream_raw = outbound.transform_request(&upstream_canonical)?;

        // Phase 4: outbound raw-request middlewares (body then header overrides)
        let mut state = MiddlewareState {
            request_id: Some(request_id.to_string()),
            execution_id: None,
            original_model: original_model.map(str::to_string),
            channel: Some(channel.clone()),
            performance: Some(PerformanceRecord::start(&channel.id, canonical.stream)),
            store: self.store.as_ref(),
            metrics: self.metrics.as_ref(),
            connections: self.connections.as_ref(),
        };
        upstream_raw = ApplyOverrideRequestBody.on_raw_request(&mut state, upstream_raw).await?;
        upstream_raw = ApplyOverrideRequestHeaders
            .on_raw_request(&mut state, upstream_raw)
            .await?;

        let execution = self
            .store
            .create_request_execution(
                channel,
                &canonical.model,
                request_id,
                &upstream_raw.body,
                outbound.api_format(),
            )
            .await?;

        let mut guard = ConnectionGuard::acquire(&self.connections, channel.id.clone());
        let mut record = state.performance.take().unwrap_or_else(|| PerformanceRecord::start(&channel.id, false));

        // Phase 5: executor.do
        let result = self.executor.do_request(channel, &upstream_raw).await;
        guard.release();

        match result {
            Ok(response) if response.status < 400 => {
                record.mark_success(None);
                self.metrics.record(&record);
                self.store
                    .update_request_execution_completed(&execution.id, None, &response.body)
                    .await?;
                Ok((response, execution.id))
            }
            Ok(response) => {
                let err = outbound.transform_error(&response);
                let message = extract_error_message(&response.body, &err);
                record.mark_failed(response.status);
                self.metrics.record(&record);
                self.store
                    .update_request_execution_status_from_error(&execution.id, &message)
                    .await;
                Err(err)
            }
            Err(err) => {
                record.mark_failed(err.status_code());
                self.metrics.record(&record);
                self.store
                    .update_request_execution_status_from_error(&execution.id, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// Phases 3-5 for a single streaming attempt: establishes the
    /// upstream stream. The connection counter is acquired here but
    /// released by the spawned persistence task, not on return, since
    /// the attempt's caller no longer holds the connection's lifetime.
    async fn attempt_stream(
        &self,
        canonical: &CanonicalRequest,
        channel: &Channel,
        request_id: &str,
        original_model: Option<&str>,
    ) -> Result<(EventStream, String, PerformanceRecord, Arc<dyn Outbound>), GatewayError> {
        let outbound: Arc<dyn Outbound> = crate::transformer::transformer_for(provider_type_to_api_format(
            &channel.provider_type,
        ))
        .1
        .into();

        let mut upstream_canonical = canonical.clone();
        upstream_canonical.model = restore_original_model(&canonical.model, original_model, channel);
        let mut upstream_raw = outbound.transform_request(&upstream_canonical)?;

        let mut state = MiddlewareState {
            request_id: Some(request_id.to_string()),
            execution_id: None,
            original_model: original_model.map(str::to_string),
            channel: Some(channel.clone()),
            performance: Some(PerformanceRecord::start(&channel.id, true)),
            store: self.store.as_ref(),
            metrics: self.metrics.as_ref(),
            connections: self.connections.as_ref(),
        };
        upstream_raw = ApplyOverrideRequestBody.on_raw_request(&mut state, upstream_raw).await?;
        upstream_raw = ApplyOverrideRequestHeaders
            .on_raw_request(&mut state, upstream_raw)
            .await?;

        let execution = self
            .store
            .create_request_execution(
                channel,
                &canonical.model,
                request_id,
                &upstream_raw.body,
                outbound.api_format(),
            )
            .await?;

        let record = state.performance.take().unwrap_or_else(|| PerformanceRecord::start(&channel.id, true));

        match self.executor.do_stream(channel, &upstream_raw).await {
            Ok(stream) => Ok((stream, execution.id, record, outbound)),
            Err(err) => {
                self.store
                    .update_request_execution_status_from_error(&execution.id, &err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// Drains the upstream event stream, feeding both persistence
    /// wrappers and the client-facing channel, in a detached task that
    /// outlives the HTTP response if the client disconnects.
    #[allow(clippy::too_many_arguments)]
    fn spawn_stream_persistence(
        &self,
        mut event_stream: EventStream,
        execution_id: String,
        mut record: PerformanceRecord,
        outbound: Arc<dyn Outbound>,
        channel_id: String,
        request_id: String,
        tx: tokio::sync::mpsc::Sender<Result<Bytes, GatewayError>>,
    ) {
        let store = self.store.clone();
        let inbound = self.inbound.clone();
        let metrics = self.metrics.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            let _guard = OwnedConnectionGuard::acquire(connections, channel_id);
            let mut outbound_persist = OutboundPersistentStream::new(store.clone(), outbound.clone(), execution_id);
            let mut inbound_persist = InboundPersistentStream::new(store, inbound.clone(), metrics, request_id);
            let mut upstream_error: Option<String> = None;

            loop {
                match event_stream.next().await {
                    Some(Ok(event)) => {
                        outbound_persist.on_chunk(Bytes::from(event.data.clone())).await;
                        match outbound.transform_stream_event(&event) {
                            Ok(Some(canonical_chunk)) => {
                                if !canonical_chunk.choices.is_empty() {
                                    record.mark_first_token();
                                }
                                match inbound.transform_stream_event(&canonical_chunk) {
                                    Ok(client_event) => {
                                        inbound_persist.on_chunk(Bytes::from(client_event.data.clone())).await;
                                        // Ignore send failures: the client disconnected, but
                                        // upstream draining and persistence continue.
                                        let _ = tx.send(Ok(Bytes::from(client_event.data))).await;
                                    }
                                    Err(err) => {
                                        tracing::warn!(error = %err, "inbound transform_stream_event failed");
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(error = %err, "outbound transform_stream_event failed");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        upstream_error = Some(err.to_string());
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                    None => break,
                }
            }

            outbound_persist.close(upstream_error.as_deref()).await;
            inbound_persist.close(&mut record, upstream_error.as_deref()).await;
        });
    }

    /// Best-effort terminal persistence, run with a 10-second detached
    /// budget in a real deployment; here the caller already holds the
    /// non-cancellable task context, so we just apply the timeout.
    async fn persist_terminal_failure(&self, request_id: &str, err: &GatewayError) {
        let message = err.to_string();
        let _ = tokio::time::timeout(
            Duration::from_secs(10),
            self.store.update_request_status_from_error(request_id, &message),
        )
        .await;
    }
}
