//! Axum handlers wiring the pipeline to the external HTTP surface.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::canonical::{ApiFormat, RawHttpRequest};
use crate::connection_tracker::ConnectionTracker;
use crate::error::GatewayError;
use crate::executor::Executor;
use crate::metrics_store::MetricsStore;
use crate::pipeline::PipelineOutcome;
use crate::processor::{ChatCompletionProcessor, TestChannelProcessor};
use crate::store::{ChannelRepository, Store};
use crate::transformer::transformer_for;

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn ChannelRepository>,
    pub store: Arc<dyn Store>,
    pub executor: Arc<dyn Executor>,
    pub metrics: Arc<MetricsStore>,
    pub connections: Arc<ConnectionTracker>,
}

impl AppState {
    fn processor(&self) -> ChatCompletionProcessor {
        ChatCompletionProcessor::new(
            self.repo.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.metrics.clone(),
            self.connections.clone(),
        )
    }
}

fn error_response(inbound_format: ApiFormat, err: GatewayError) -> Response {
    let (inbound, _) = transformer_for(inbound_format);
    let raw = crate::transformer::Inbound::transform_error(inbound.as_ref(), &err);
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, raw.body).into_response()
}

/// Builds the client-facing response for either pipeline outcome: a
/// plain body for `Response`, or a chunked SSE body for `Stream`.
fn outcome_into_response(route: &'static str, outcome: PipelineOutcome) -> Response {
    match outcome {
        PipelineOutcome::Response(result) => {
            crate::metrics::record_http_request(route, result.response.status);
            (
                StatusCode::from_u16(result.response.status).unwrap_or(StatusCode::OK),
                result.response.body,
            )
                .into_response()
        }
        PipelineOutcome::Stream(streaming) => {
            crate::metrics::record_http_request(route, 200);
            let body_stream = streaming.events.map(|chunk| match chunk {
                Ok(bytes) => Ok(bytes),
                Err(err) => Err(std::io::Error::other(err.to_string())),
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", streaming.content_type)
                .body(Body::from_stream(body_stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

pub async fn handle_openai_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = RawHttpRequest { body: body.to_vec(), headers: header_pairs(&headers) };
    let (inbound, _) = transformer_for(ApiFormat::OpenAiChatCompletions);
    match state.processor().process(inbound.into(), raw).await {
        Ok(outcome) => outcome_into_response("/v1/chat/completions", outcome),
        Err(err) => {
            crate::metrics::record_http_request("/v1/chat/completions", err.status_code());
            error_response(ApiFormat::OpenAiChatCompletions, err)
        }
    }
}

pub async fn handle_anthropic_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw = RawHttpRequest { body: body.to_vec(), headers: header_pairs(&headers) };
    let (inbound, _) = transformer_for(ApiFormat::AnthropicMessages);
    match state.processor().process(inbound.into(), raw).await {
        Ok(outcome) => outcome_into_response("/v1/messages", outcome),
        Err(err) => {
            crate::metrics::record_http_request("/v1/messages", err.status_code());
            error_response(ApiFormat::AnthropicMessages, err)
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct ChannelTestQuery {
    model: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelTestResponse {
    latency_seconds: f64,
    success: bool,
    message: Option<String>,
}

pub async fn test_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<ChannelTestQuery>,
) -> impl IntoResponse {
    let processor = TestChannelProcessor::new(state.repo.clone(), state.executor.clone());
    match processor.ping(&channel_id, &query.model).await {
        Ok(result) => Json(ChannelTestResponse {
            latency_seconds: result.latency_seconds,
            success: result.success,
            message: result.message,
        })
        .into_response(),
        Err(err) => (
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(ChannelTestResponse {
                latency_seconds: 0.0,
                success: false,
                message: Some(err.to_string()),
            }),
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", axum::routing::post(handle_openai_chat_completions))
        .route("/v1/messages", axum::routing::post(handle_anthropic_messages))
        .route("/v1/channels/:id/test", axum::routing::post(test_channel))
        .route("/health", axum::routing::get(health))
        .route("/metrics", axum::routing::get(crate::metrics::metrics_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
