//! Assembles the pipeline components per-process and exposes the
//! fluent builder the HTTP layer drives.

use std::sync::Arc;
use std::time::Instant;

use crate::canonical::RawHttpRequest;
use crate::channel::Channel;
use crate::connection_tracker::ConnectionTracker;
use crate::error::GatewayError;
use crate::executor::Executor;
use crate::metrics_store::MetricsStore;
use crate::model_mapper::ModelMapper;
use crate::pipeline::{Pipeline, PipelineOutcome, RetryPolicy};
use crate::selector::SpecifiedChannelSelector;
use crate::store::{ChannelRepository, Store};
use crate::strategy::{CompositeStrategy, LoadBalancer};
use crate::transformer::Inbound;

/// Builds a `Pipeline` for one request, with fluent overrides for
/// channel selection and allow-listing. `with_*` methods return shallow
/// copies, matching the processor's immutable-builder usage pattern.
#[derive(Clone)]
pub struct ChatCompletionProcessor {
    pub repo: Arc<dyn ChannelRepository>,
    pub store: Arc<dyn Store>,
    pub executor: Arc<dyn Executor>,
    pub metrics: Arc<MetricsStore>,
    pub connections: Arc<ConnectionTracker>,
    pub model_mapper: ModelMapper,
    pub retry_policy: RetryPolicy,
    pub balancer: Arc<LoadBalancer>,
    allowed_channel_ids: Vec<String>,
    tags: Vec<String>,
}

impl ChatCompletionProcessor {
    pub fn new(
        repo: Arc<dyn ChannelRepository>,
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        metrics: Arc<MetricsStore>,
        connections: Arc<ConnectionTracker>,
    ) -> Self {
        Self {
            repo,
            store,
            executor,
            metrics,
            connections,
            model_mapper: ModelMapper::new(vec![]),
            retry_policy: RetryPolicy::default(),
            balancer: Arc::new(LoadBalancer::new(CompositeStrategy::default_composition())),
            allowed_channel_ids: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_allowed_channels(mut self, ids: Vec<String>) -> Self {
        self.allowed_channel_ids = ids;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_model_mapper(mut self, mapper: ModelMapper) -> Self {
        self.model_mapper = mapper;
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    fn build_pipeline(&self, inbound: Arc<dyn Inbound>) -> Pipeline {
        Pipeline {
            inbound,
            repo: self.repo.clone(),
            allowed_channel_ids: self.allowed_channel_ids.clone(),
            tags: self.tags.clone(),
            balancer: self.balancer.clone(),
            executor: self.executor.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            connections: self.connections.clone(),
            model_mapper: self.model_mapper.clone(),
            retry_policy: self.retry_policy,
        }
    }

    pub async fn process(
        &self,
        inbound: Arc<dyn Inbound>,
        raw: RawHttpRequest,
    ) -> Result<PipelineOutcome, GatewayError> {
        let pipeline = self.build_pipeline(inbound);
        pipeline.run(raw).await
    }
}

/// Synthetic single-channel ping used by admin channel-test requests.
/// Wraps `ChatCompletionProcessor` with a `SpecifiedChannelSelector` so
/// the request bypasses status/model filtering for the named channel.
pub struct TestChannelProcessor {
    repo: Arc<dyn ChannelRepository>,
    executor: Arc<dyn Executor>,
}

pub struct TestChannelResult {
    pub latency_seconds: f64,
    pub success: bool,
    pub message: Option<String>,
}

impl TestChannelProcessor {
    pub fn new(repo: Arc<dyn ChannelRepository>, executor: Arc<dyn Executor>) -> Self {
        Self { repo, executor }
    }

    pub async fn ping(&self, channel_id: &str, model: &str) -> Result<TestChannelResult, GatewayError> {
        let selector = SpecifiedChannelSelector::new(self.repo.clone(), channel_id);
        let candidates = selector.select(model).await?;
        let channel: Channel = candidates
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::ChannelUnavailable(channel_id.to_string()))?;

        let outbound = crate::transformer::transformer_for(ApiFormatFor(&channel).into())
            .1;
        let canonical = crate::canonical::CanonicalRequest {
            model: model.to_string(),
            messages: vec![crate::canonical::CanonicalMessage {
                role: "user".to_string(),
                content: serde_json::json!("ping"),
                tool_call_id: None,
            }],
            tools: None,
            max_tokens: Some(1),
            temperature: None,
            stream: false,
            raw: vec![],
        };
        let request = outbound.transform_request(&canonical)?;

        let start = Instant::now();
        let result = self.executor.do_request(&channel, &request).await;
        let latency_seconds = start.elapsed().as_secs_f64();

        Ok(match result {
            Ok(response) if response.status < 400 => TestChannelResult {
                latency_seconds,
                success: true,
                message: None,
            },
            Ok(response) => TestChannelResult {
                latency_seconds,
                success: false,
                message: Some(crate::error::extract_error_message(&response.body, &response.status)),
            },
            Err(err) => TestChannelResult {
                latency_seconds,
                success: false,
                message: Some(err.to_string()),
            },
        })
    }
}

struct ApiFormatFor<'a>(&'a Channel);

impl From<ApiFormatFor<'_>> for crate::canonical::ApiFormat {
    fn from(value: ApiFormatFor<'_>) -> Self {
        match value.0.provider_type.as_str() {
            "anthropic" => crate::canonical::ApiFormat::AnthropicMessages,
            "gemini" => crate::canonical::ApiFormat::GeminiGenerateContent,
            _ => crate::canonical::ApiFormat::OpenAiChatCompletions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, Credential};
    use crate::executor::{MockExecutor, MockResponse};
    use crate::store::InMemoryStore;
    use std::collections::BTreeSet;

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.into(),
            name: id.into(),
            provider_type: "openai".into(),
            base_url: "https://api.example.com".into(),
            credential: Credential::Bearer { token: "sk-test".into() },
            supported_models: BTreeSet::from(["gpt-4".to_string()]),
            model_mappings: Default::default(),
            model_prefix: None,
            weight: 100,
            tags: Default::default(),
            status: ChannelStatus::Disabled,
            override_parameters: Default::default(),
            override_headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_channel_processor_pings_disabled_channel() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_channel(channel("ch1"));
        let executor = Arc::new(MockExecutor::new());
        executor.push_response(
            "ch1",
            MockResponse::Response(crate::canonical::RawHttpResponse {
                status: 200,
                body: br#"{"id":"1","choices":[]}"#.to_vec(),
                headers: vec![],
            }),
        );
        let processor = TestChannelProcessor::new(store, executor);
        let result = processor.ping("ch1", "gpt-4").await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_channel_processor_fails_unsupported_model() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_channel(channel("ch1"));
        let executor = Arc::new(MockExecutor::new());
        let processor = TestChannelProcessor::new(store, executor);
        let err = processor.ping("ch1", "claude-3").await.unwrap_err();
        assert!(matches!(err, GatewayError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn processor_allowed_channels_restricts_candidates() {
        let store = Arc::new(InMemoryStore::new());
        let mut enabled = channel("ch1");
        enabled.status = ChannelStatus::Enabled;
        store.insert_channel(enabled);
        let mut enabled2 = channel("ch2");
        enabled2.status = ChannelStatus::Enabled;
        store.insert_channel(enabled2);

        let executor = Arc::new(MockExecutor::new());
        executor.push_response(
            "ch2",
            MockResponse::Response(crate::canonical::RawHttpResponse {
                status: 200,
                body: br#"{"id":"1","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}]}"#.to_vec(),
                headers: vec![],
            }),
        );

        let processor = ChatCompletionProcessor::new(
            store.clone(),
            store.clone(),
            executor,
            Arc::new(MetricsStore::new()),
            Arc::new(ConnectionTracker::new(0)),
        )
        .with_allowed_channels(vec!["ch2".to_string()]);

        let raw = RawHttpRequest {
            body: br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
            headers: vec![],
        };
        let outcome = processor
            .process(Arc::new(crate::transformer::OpenAiChatTransformer), raw)
            .await
            .unwrap();
        let result = match outcome {
            PipelineOutcome::Response(result) => result,
            PipelineOutcome::Stream(_) => panic!("expected a buffered response"),
        };
        assert_eq!(result.channel_id, "ch2");
    }

    #[tokio::test]
    async fn processor_with_tags_restricts_candidates_to_matching_channels() {
        let store = Arc::new(InMemoryStore::new());
        let mut eu = channel("ch-eu");
        eu.status = ChannelStatus::Enabled;
        eu.tags = BTreeSet::from(["eu".to_string()]);
        store.insert_channel(eu);
        let mut us = channel("ch-us");
        us.status = ChannelStatus::Enabled;
        us.tags = BTreeSet::from(["us".to_string()]);
        store.insert_channel(us);

        let executor = Arc::new(MockExecutor::new());
        executor.push_response(
            "ch-us",
            MockResponse::Response(crate::canonical::RawHttpResponse {
                status: 200,
                body: br#"{"id":"1","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}]}"#.to_vec(),
                headers: vec![],
            }),
        );

        let processor = ChatCompletionProcessor::new(
            store.clone(),
            store.clone(),
            executor,
            Arc::new(MetricsStore::new()),
            Arc::new(ConnectionTracker::new(0)),
        )
        .with_tags(vec!["us".to_string()]);

        let raw = RawHttpRequest {
            body: br#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#.to_vec(),
            headers: vec![],
        };
        let outcome = processor
            .process(Arc::new(crate::transformer::OpenAiChatTransformer), raw)
            .await
            .unwrap();
        let result = match outcome {
            PipelineOutcome::Response(result) => result,
            PipelineOutcome::Stream(_) => panic!("expected a buffered response"),
        };
        assert_eq!(result.channel_id, "ch-us");
    }
}
