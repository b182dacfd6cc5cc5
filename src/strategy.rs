//! Load-balance scoring strategies and the composite `LoadBalancer`.
//!
//! Each strategy scores a single channel for a single request; the
//! balancer sums scores across strategies and stable-sorts descending.
//! A process-wide debug flag (or a per-request context flag) switches
//! every strategy to its `score_with_debug` variant, which must agree
//! with `score` exactly for non-time-varying inputs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::channel::Channel;
use crate::metrics_store::MetricsStore;
use crate::connection_tracker::ConnectionTracker;

/// Process-wide switch flipped by the `AXONHUB_ROUTING_DEBUG` env var or
/// an admin endpoint; makes every `LoadBalancer::sort` call emit a
/// `DecisionLog`.
static DEBUG_ROUTING: AtomicBool = AtomicBool::new(false);

pub fn set_debug_routing(enabled: bool) {
    DEBUG_ROUTING.store(enabled, Ordering::SeqCst);
}

pub fn debug_routing_enabled() -> bool {
    DEBUG_ROUTING.load(Ordering::SeqCst) || tracing::enabled!(tracing::Level::DEBUG)
}

/// Context threaded through scoring: the current trace id (for
/// `TraceAwareStrategy`) and shared references to the metrics/connection
/// stores strategies read from.
#[derive(Clone)]
pub struct RoutingContext<'a> {
    pub trace_id: Option<String>,
    pub metrics: &'a MetricsStore,
    pub connections: &'a ConnectionTracker,
    /// Resolves `trace_id -> last successful channel id`, backed by the
    /// persistence store's `GetLastSuccessfulChannelID`.
    pub last_successful_channel: &'a dyn Fn(&str) -> Option<String>,
}

/// One scoring factor's contribution, kept for the debug decision log.
#[derive(Debug, Clone)]
pub struct ScoreReport {
    pub strategy: &'static str,
    pub channel_id: String,
    pub score: f64,
    pub detail: String,
}

/// The full breakdown for one `LoadBalancer::sort` call, only populated
/// when routing debug is enabled.
#[derive(Debug, Clone, Default)]
pub struct DecisionLog {
    pub reports: Vec<ScoreReport>,
    pub final_order: Vec<String>,
}

pub trait LoadBalanceStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64;
    fn score_with_debug(&self, ctx: &RoutingContext, channel: &Channel) -> (f64, ScoreReport) {
        let score = self.score(ctx, channel);
        (
            score,
            ScoreReport {
                strategy: self.name(),
                channel_id: channel.id.clone(),
                score,
                detail: String::new(),
            },
        )
    }
}

const TRACE_BOOST: f64 = 1000.0;

pub struct TraceAwareStrategy;

impl LoadBalanceStrategy for TraceAwareStrategy {
    fn name(&self) -> &'static str {
        "trace_aware"
    }

    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64 {
        let Some(trace_id) = &ctx.trace_id else {
            return 0.0;
        };
        match (ctx.last_successful_channel)(trace_id) {
            Some(last) if last == channel.id => TRACE_BOOST,
            _ => 0.0,
        }
    }

    fn score_with_debug(&self, ctx: &RoutingContext, channel: &Channel) -> (f64, ScoreReport) {
        let score = self.score(ctx, channel);
        let detail = if score > 0.0 {
            "matched last successful channel in trace".to_string()
        } else {
            "no trace match".to_string()
        };
        (
            score,
            ScoreReport {
                strategy: self.name(),
                channel_id: channel.id.clone(),
                score,
                detail,
            },
        )
    }
}

const ERROR_AWARE_BASE: f64 = 200.0;
const ERROR_AWARE_FAILURE_PENALTY: f64 = 50.0;
const ERROR_AWARE_COOLDOWN_MINUTES: f64 = 5.0;
const ERROR_AWARE_COOLDOWN_PENALTY: f64 = 100.0;
const ERROR_AWARE_LOW_SUCCESS_PENALTY: f64 = 50.0;
const ERROR_AWARE_LOW_SUCCESS_THRESHOLD_COUNT: u64 = 5;
const ERROR_AWARE_LOW_SUCCESS_RATE: f64 = 0.5;

pub struct ErrorAwareStrategy;

impl LoadBalanceStrategy for ErrorAwareStrategy {
    fn name(&self) -> &'static str {
        "error_aware"
    }

    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64 {
        let metrics = ctx.metrics.get_channel_metrics(&channel.id);
        let mut score = ERROR_AWARE_BASE;
        score -= ERROR_AWARE_FAILURE_PENALTY * metrics.consecutive_failures as f64;

        if let Some(last_failure) = metrics.last_failure_at {
            let minutes_since = (chrono::Utc::now() - last_failure).num_seconds() as f64 / 60.0;
            if minutes_since >= 0.0 && minutes_since < ERROR_AWARE_COOLDOWN_MINUTES {
                score -= ERROR_AWARE_COOLDOWN_PENALTY
                    * (1.0 - minutes_since / ERROR_AWARE_COOLDOWN_MINUTES);
            }
        }

        if metrics.request_count >= ERROR_AWARE_LOW_SUCCESS_THRESHOLD_COUNT
            && metrics.success_rate() < ERROR_AWARE_LOW_SUCCESS_RATE
        {
            score -= ERROR_AWARE_LOW_SUCCESS_PENALTY;
        }

        score.max(0.0)
    }
}

const WRR_MAX_SCORE: f64 = 150.0;
const WRR_MIN_SCORE: f64 = 10.0;
const WRR_REQUEST_CAP: f64 = 1000.0;
const WRR_DECAY_SECONDS: f64 = 5.0 * 60.0;

pub struct WeightRoundRobinStrategy;

impl LoadBalanceStrategy for WeightRoundRobinStrategy {
    fn name(&self) -> &'static str {
        "weight_round_robin"
    }

    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64 {
        let metrics = ctx.metrics.get_channel_metrics(&channel.id);
        let weight_factor = (channel.weight as f64 / 100.0).max(0.01);
        let capped = (metrics.request_count as f64).min(WRR_REQUEST_CAP);

        let inactivity_seconds = metrics
            .last_success_at
            .or(metrics.last_failure_at)
            .map(|at| (chrono::Utc::now() - at).num_seconds().max(0) as f64)
            .unwrap_or(0.0);
        let decay_multiplier = if metrics.last_success_at.is_none() && metrics.last_failure_at.is_none() {
            1.0
        } else {
            (-inactivity_seconds / WRR_DECAY_SECONDS).exp()
        };

        let effective = capped * decay_multiplier;
        let normalized = effective / weight_factor;
        let score = WRR_MAX_SCORE * (-normalized / WRR_MAX_SCORE).exp();
        score.max(WRR_MIN_SCORE)
    }
}

pub struct ConnectionAwareStrategy;

impl LoadBalanceStrategy for ConnectionAwareStrategy {
    fn name(&self) -> &'static str {
        "connection_aware"
    }

    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64 {
        let max = ctx.connections.max(&channel.id);
        if max == 0 {
            return 50.0;
        }
        let active = ctx.connections.active(&channel.id) as f64;
        (50.0 * (1.0 - active / max as f64)).clamp(0.0, 50.0)
    }
}

struct WeightedStrategy {
    strategy: Box<dyn LoadBalanceStrategy>,
    weight: f64,
}

/// Sums the weighted contributions of its sub-strategies.
pub struct CompositeStrategy {
    strategies: Vec<WeightedStrategy>,
}

impl CompositeStrategy {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn LoadBalanceStrategy>) -> Self {
        self.strategies.push(WeightedStrategy {
            strategy,
            weight: 1.0,
        });
        self
    }

    pub fn with_weighted_strategy(mut self, strategy: Box<dyn LoadBalanceStrategy>, weight: f64) -> Self {
        self.strategies.push(WeightedStrategy { strategy, weight });
        self
    }

    /// The default composition: trace-aware, error-aware, weighted
    /// round robin, and connection-aware, all at weight 1.0.
    pub fn default_composition() -> Self {
        Self::new()
            .with_strategy(Box::new(TraceAwareStrategy))
            .with_strategy(Box::new(ErrorAwareStrategy))
            .with_strategy(Box::new(WeightRoundRobinStrategy))
            .with_strategy(Box::new(ConnectionAwareStrategy))
    }
}

impl Default for CompositeStrategy {
    fn default() -> Self {
        Self::default_composition()
    }
}

impl LoadBalanceStrategy for CompositeStrategy {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn score(&self, ctx: &RoutingContext, channel: &Channel) -> f64 {
        self.strategies
            .iter()
            .map(|w| w.weight * w.strategy.score(ctx, channel))
            .sum()
    }

    fn score_with_debug(&self, ctx: &RoutingContext, channel: &Channel) -> (f64, ScoreReport) {
        let mut total = 0.0;
        let mut details = Vec::new();
        for w in &self.strategies {
            let (score, report) = w.strategy.score_with_debug(ctx, channel);
            total += w.weight * score;
            details.push(format!("{}={:.2} ({})", report.strategy, score, report.detail));
        }
        (
            total,
            ScoreReport {
                strategy: self.name(),
                channel_id: channel.id.clone(),
                score: total,
                detail: details.join(", "),
            },
        )
    }
}

/// Sorts a candidate channel list by composite score, highest first.
pub struct LoadBalancer {
    strategy: CompositeStrategy,
}

impl LoadBalancer {
    pub fn new(strategy: CompositeStrategy) -> Self {
        Self { strategy }
    }

    pub fn sort(&self, ctx: &RoutingContext, channels: Vec<Channel>) -> Vec<Channel> {
        if channels.len() <= 1 {
            return channels;
        }

        let debug_mode = debug_routing_enabled();
        let mut decision_log = DecisionLog::default();

        let mut scored: Vec<(f64, Channel)> = channels
            .into_iter()
            .map(|channel| {
                let score = if debug_mode {
                    let (score, report) = self.strategy.score_with_debug(ctx, &channel);
                    decision_log.reports.push(report);
                    score
                } else {
                    self.strategy.score(ctx, &channel)
                };
                (score, channel)
            })
            .collect();

        // Stable sort descending: equal scores preserve input order.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        if debug_mode {
            decision_log.final_order = scored.iter().map(|(_, c)| c.id.clone()).collect();
            debug!(order = ?decision_log.final_order, "load balancer decision");
        }

        scored.into_iter().map(|(_, c)| c).collect()
    }
}

#[allow(dead_code)]
fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
