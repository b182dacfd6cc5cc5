//! Decorator chain that narrows the channel directory down to an
//! ordered candidate list for a single request.
//!
//! Each layer wraps an inner `ChannelSelector` and either filters or
//! reorders its result; composition reads outer-wraps-inner, e.g.
//! `LoadBalancedSelector::new(TagsFilterSelector::new(tags, SelectedChannelsSelector::new(ids, DefaultSelector::new(repo))))`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::error::GatewayError;
use crate::store::ChannelRepository;
use crate::strategy::{LoadBalancer, RoutingContext};

#[async_trait]
pub trait ChannelSelector: Send + Sync {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError>;
}

/// Base of the chain: enabled channels whose supported-model set
/// contains the requested model.
pub struct DefaultSelector {
    repo: Arc<dyn ChannelRepository>,
}

impl DefaultSelector {
    pub fn new(repo: Arc<dyn ChannelRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ChannelSelector for DefaultSelector {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let channels = self
            .repo
            .list_enabled_channels()
            .await
            .into_iter()
            .filter(|c| c.supports_model(model))
            .collect();
        Ok(channels)
    }
}

/// Intersects the inner result by channel id. An empty `allowed_ids`
/// passes through unchanged (no restriction configured).
pub struct SelectedChannelsSelector {
    inner: Box<dyn ChannelSelector>,
    allowed_ids: HashSet<String>,
}

impl SelectedChannelsSelector {
    pub fn new(allowed_ids: Vec<String>, inner: Box<dyn ChannelSelector>) -> Self {
        Self {
            inner,
            allowed_ids: allowed_ids.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChannelSelector for SelectedChannelsSelector {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let inner = self.inner.select(model).await?;
        if self.allowed_ids.is_empty() {
            return Ok(inner);
        }
        let filtered: Vec<Channel> = inner
            .iter()
            .filter(|c| self.allowed_ids.contains(&c.id))
            .cloned()
            .collect();
        if filtered.is_empty() {
            if inner.is_empty() {
                return Err(GatewayError::InvalidModel(model.to_string()));
            }
            return Err(GatewayError::ChannelUnavailable(
                "none of the specified channels support this model".to_string(),
            ));
        }
        Ok(filtered)
    }
}

/// Keeps channels whose tag set intersects the requested tags. An empty
/// tag filter passes through unchanged.
pub struct TagsFilterSelector {
    inner: Box<dyn ChannelSelector>,
    tags: HashSet<String>,
}

impl TagsFilterSelector {
    pub fn new(tags: Vec<String>, inner: Box<dyn ChannelSelector>) -> Self {
        Self {
            inner,
            tags: tags.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ChannelSelector for TagsFilterSelector {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let inner = self.inner.select(model).await?;
        if self.tags.is_empty() {
            return Ok(inner);
        }
        Ok(inner
            .into_iter()
            .filter(|c| c.tags.iter().any(|t| self.tags.contains(t)))
            .collect())
    }
}

/// Invokes the `LoadBalancer` to sort the filtered candidate list.
pub struct LoadBalancedSelector<'a> {
    inner: Box<dyn ChannelSelector>,
    balancer: &'a LoadBalancer,
    ctx: RoutingContext<'a>,
}

impl<'a> LoadBalancedSelector<'a> {
    pub fn new(
        inner: Box<dyn ChannelSelector>,
        balancer: &'a LoadBalancer,
        ctx: RoutingContext<'a>,
    ) -> Self {
        Self {
            inner,
            balancer,
            ctx,
        }
    }
}

#[async_trait]
impl<'a> ChannelSelector for LoadBalancedSelector<'a> {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let inner = self.inner.select(model).await?;
        Ok(self.balancer.sort(&self.ctx, inner))
    }
}

/// Bypasses status/model filtering entirely: fetches one channel by id
/// regardless of `Enabled`/`Disabled`, used by admin channel-test
/// requests. Fails if the channel doesn't support the model.
pub struct SpecifiedChannelSelector {
    repo: Arc<dyn ChannelRepository>,
    channel_id: String,
}

impl SpecifiedChannelSelector {
    pub fn new(repo: Arc<dyn ChannelRepository>, channel_id: impl Into<String>) -> Self {
        Self {
            repo,
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl ChannelSelector for SpecifiedChannelSelector {
    async fn select(&self, model: &str) -> Result<Vec<Channel>, GatewayError> {
        let channel = self
            .repo
            .get_channel(&self.channel_id)
            .await
            .ok_or_else(|| GatewayError::ChannelUnavailable(self.channel_id.clone()))?;
        if !channel.supports_model(model) {
            return Err(GatewayError::ChannelUnavailable(format!(
                "channel {} does not support model {}",
                self.channel_id, model
            )));
        }
        Ok(vec![channel])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, Credential};
    use crate::connection_tracker::ConnectionTracker;
    use crate::metrics_store::MetricsStore;
    use crate::store::InMemoryStore;
    use std::collections::BTreeSet;

    fn channel(id: &str, model: &str, tags: &[&str], enabled: bool) -> Channel {
        Channel {
            id: id.into(),
            name: id.into(),
            provider_type: "openai".into(),
            base_url: "https://api.example.com".into(),
            credential: Credential::Bearer { token: "x".into() },
            supported_models: BTreeSet::from([model.to_string()]),
            model_mappings: Default::default(),
            model_prefix: None,
            weight: 100,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            status: if enabled {
                ChannelStatus::Enabled
            } else {
                ChannelStatus::Disabled
            },
            override_parameters: Default::default(),
            override_headers: Vec::new(),
        }
    }

    fn no_trace(_trace_id: &str) -> Option<String> {
        None
    }

    #[tokio::test]
    async fn default_selector_filters_by_model_and_status() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], true));
        store.insert_channel(channel("ch2", "gpt-3.5", &[], true));
        store.insert_channel(channel("ch3", "gpt-4", &[], false));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = DefaultSelector::new(repo);
        let result = selector.select("gpt-4").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "ch1");
    }

    #[tokio::test]
    async fn selected_channels_empty_allowlist_passes_through() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], true));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = SelectedChannelsSelector::new(vec![], Box::new(DefaultSelector::new(repo)));
        let result = selector.select("gpt-4").await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn selected_channels_empty_intersection_with_nonempty_inner_fails_unavailable() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], true));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = SelectedChannelsSelector::new(
            vec!["ch-missing".to_string()],
            Box::new(DefaultSelector::new(repo)),
        );
        let err = selector.select("gpt-4").await.unwrap_err();
        assert!(matches!(err, GatewayError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn selected_channels_with_empty_inner_fails_invalid_model() {
        let store = InMemoryStore::new();
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = SelectedChannelsSelector::new(
            vec!["ch-missing".to_string()],
            Box::new(DefaultSelector::new(repo)),
        );
        let err = selector.select("gpt-4").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidModel(_)));
    }

    #[tokio::test]
    async fn tags_filter_keeps_intersection() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &["eu"], true));
        store.insert_channel(channel("ch2", "gpt-4", &["us"], true));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = TagsFilterSelector::new(
            vec!["eu".to_string()],
            Box::new(DefaultSelector::new(repo)),
        );
        let result = selector.select("gpt-4").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "ch1");
    }

    #[tokio::test]
    async fn specified_channel_selector_bypasses_status() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], false));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = SpecifiedChannelSelector::new(repo, "ch1");
        let result = selector.select("gpt-4").await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn specified_channel_selector_fails_unsupported_model() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], true));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let selector = SpecifiedChannelSelector::new(repo, "ch1");
        let err = selector.select("claude-3").await.unwrap_err();
        assert!(matches!(err, GatewayError::ChannelUnavailable(_)));
    }

    #[tokio::test]
    async fn load_balanced_selector_sorts_candidates() {
        let store = InMemoryStore::new();
        store.insert_channel(channel("ch1", "gpt-4", &[], true));
        store.insert_channel(channel("ch2", "gpt-4", &[], true));
        let repo: Arc<dyn ChannelRepository> = Arc::new(store);

        let metrics = MetricsStore::new();
        let connections = ConnectionTracker::new(0);
        let balancer = LoadBalancer::new(crate::strategy::CompositeStrategy::default_composition());
        let ctx = RoutingContext {
            trace_id: None,
            metrics: &metrics,
            connections: &connections,
            last_successful_channel: &no_trace,
        };
        let selector = LoadBalancedSelector::new(Box::new(DefaultSelector::new(repo)), &balancer, ctx);
        let result = selector.select("gpt-4").await.unwrap();
        assert_eq!(result.len(), 2);
    }
}
