//! Connection selection strategies.
//!
//! A [`LoadBalanceStrategy`] picks one connection from the current candidate list. The
//! [`LoadBalancer`] wraps a strategy with the per-call hints (endpoint pinning, sticky
//! sessions) and forwards call outcomes back to strategies that learn from them.

use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::UpstreamConnection;

/// Per-call selection hints carried by the routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionHint {
    /// Restricts selection to the connection whose URI, or `ip:<host>`, matches.
    pub endpoint: Option<String>,
    /// Prefer the connection used by the previous sticky call while it stays active.
    pub sticky: bool,
}

impl SelectionHint {
    pub fn endpoint(endpoint: impl Into<String>) -> Self {
        Self { endpoint: Some(endpoint.into()), sticky: false }
    }

    pub fn sticky() -> Self {
        Self { endpoint: None, sticky: true }
    }
}

pub trait LoadBalanceStrategy: Send + Sync + 'static {
    fn select(&self, candidates: &[Arc<UpstreamConnection>]) -> Option<Arc<UpstreamConnection>>;

    fn record_success(&self, _uri: &str, _latency: Duration) {}

    fn record_error(&self, _uri: &str) {}

    /// Drops any state kept for a connection that left the pool.
    fn forget(&self, _uri: &str) {}

    fn name(&self) -> &'static str;
}

/// Uniform random choice.
#[derive(Debug, Default)]
pub struct RandomStrategy;

impl LoadBalanceStrategy for RandomStrategy {
    fn select(&self, candidates: &[Arc<UpstreamConnection>]) -> Option<Arc<UpstreamConnection>> {
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            len => Some(candidates[rand::rng().random_range(0..len)].clone()),
        }
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// `index mod len` over a single monotonically increasing counter.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl LoadBalanceStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[Arc<UpstreamConnection>]) -> Option<Arc<UpstreamConnection>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[derive(Debug, Clone)]
pub struct WeightedLatencyConfig {
    /// Weight of the newest sample in the moving averages.
    pub alpha: f64,
    /// How strongly the error rate inflates a connection's score.
    pub error_penalty: f64,
    /// Latency assumed for a connection with no samples yet.
    pub initial_latency: Duration,
}

impl Default for WeightedLatencyConfig {
    fn default() -> Self {
        Self { alpha: 0.3, error_penalty: 10.0, initial_latency: Duration::from_millis(50) }
    }
}

/// Moving averages stored as `f64` bits so updates stay lock-free.
struct ConnectionStats {
    latency_ms: AtomicU64,
    error_rate: AtomicU64,
}

impl ConnectionStats {
    fn new(initial_latency_ms: f64) -> Self {
        Self {
            latency_ms: AtomicU64::new(initial_latency_ms.to_bits()),
            error_rate: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn observe(cell: &AtomicU64, sample: f64, alpha: f64) {
        let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            let current = f64::from_bits(bits);
            Some((current + alpha * (sample - current)).to_bits())
        });
    }

    fn latency_ms(&self) -> f64 {
        f64::from_bits(self.latency_ms.load(Ordering::Acquire))
    }

    fn error_rate(&self) -> f64 {
        f64::from_bits(self.error_rate.load(Ordering::Acquire))
    }
}

/// Power-of-two-choices over EWMA latency inflated by the EWMA error rate.
pub struct WeightedLatencyStrategy {
    stats: DashMap<String, Arc<ConnectionStats>>,
    config: WeightedLatencyConfig,
}

impl WeightedLatencyStrategy {
    pub fn new(config: WeightedLatencyConfig) -> Self {
        Self { stats: DashMap::new(), config }
    }

    fn stats_for(&self, uri: &str) -> Arc<ConnectionStats> {
        if let Some(stats) = self.stats.get(uri) {
            return stats.clone();
        }
        self.stats
            .entry(uri.to_string())
            .or_insert_with(|| {
                Arc::new(ConnectionStats::new(self.config.initial_latency.as_secs_f64() * 1000.0))
            })
            .clone()
    }

    /// Current score for `uri`; lower is better.
    pub fn score(&self, uri: &str) -> f64 {
        let initial = self.config.initial_latency.as_secs_f64() * 1000.0;
        self.stats.get(uri).map_or(initial, |stats| {
            stats.latency_ms() * (1.0 + self.config.error_penalty * stats.error_rate())
        })
    }
}

impl Default for WeightedLatencyStrategy {
    fn default() -> Self {
        Self::new(WeightedLatencyConfig::default())
    }
}

impl LoadBalanceStrategy for WeightedLatencyStrategy {
    fn select(&self, candidates: &[Arc<UpstreamConnection>]) -> Option<Arc<UpstreamConnection>> {
        let len = candidates.len();
        match len {
            0 => None,
            1 => Some(candidates[0].clone()),
            _ => {
                let mut rng = rand::rng();
                let first = rng.random_range(0..len);
                let mut second = rng.random_range(0..len - 1);
                if second >= first {
                    second += 1;
                }
                let (a, b) = (&candidates[first], &candidates[second]);
                let (score_a, score_b) = (self.score(a.uri()), self.score(b.uri()));
                trace!(a = %a.uri(), score_a, b = %b.uri(), score_b, "weighted choice");
                Some(if score_b < score_a { b.clone() } else { a.clone() })
            }
        }
    }

    fn record_success(&self, uri: &str, latency: Duration) {
        let stats = self.stats_for(uri);
        ConnectionStats::observe(&stats.latency_ms, latency.as_secs_f64() * 1000.0, self.config.alpha);
        ConnectionStats::observe(&stats.error_rate, 0.0, self.config.alpha);
    }

    fn record_error(&self, uri: &str) {
        let stats = self.stats_for(uri);
        ConnectionStats::observe(&stats.error_rate, 1.0, self.config.alpha);
    }

    fn forget(&self, uri: &str) {
        self.stats.remove(uri);
    }

    fn name(&self) -> &'static str {
        "weighted-latency"
    }
}

/// Strategy selector as it appears in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceKind {
    Random,
    #[default]
    RoundRobin,
    WeightedLatency,
}

impl LoadBalanceKind {
    pub fn build(self) -> Arc<dyn LoadBalanceStrategy> {
        match self {
            Self::Random => Arc::new(RandomStrategy),
            Self::RoundRobin => Arc::new(RoundRobinStrategy::default()),
            Self::WeightedLatency => Arc::new(WeightedLatencyStrategy::default()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::RoundRobin => "round-robin",
            Self::WeightedLatency => "weighted-latency",
        }
    }
}

impl FromStr for LoadBalanceKind {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "random" => Ok(Self::Random),
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "weighted-latency" | "ewma" => Ok(Self::WeightedLatency),
            other => Err(format!("unknown load balance strategy '{other}'")),
        }
    }
}

impl fmt::Display for LoadBalanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy plus hint handling for one requester.
pub struct LoadBalancer {
    strategy: Arc<dyn LoadBalanceStrategy>,
    sticky: ArcSwapOption<UpstreamConnection>,
}

impl LoadBalancer {
    pub fn new(strategy: Arc<dyn LoadBalanceStrategy>) -> Self {
        Self { strategy, sticky: ArcSwapOption::empty() }
    }

    pub fn strategy(&self) -> &Arc<dyn LoadBalanceStrategy> {
        &self.strategy
    }

    pub fn select(
        &self,
        candidates: &[Arc<UpstreamConnection>],
        hint: &SelectionHint,
    ) -> Option<Arc<UpstreamConnection>> {
        if let Some(endpoint) = &hint.endpoint {
            let pinned = candidates.iter().find(|c| endpoint_matches(c.uri(), endpoint)).cloned();
            if pinned.is_none() {
                trace!(endpoint = %endpoint, "no connection matches endpoint hint");
            }
            return pinned;
        }

        if hint.sticky {
            if let Some(current) = self.sticky.load_full() {
                if current.is_available() && candidates.iter().any(|c| Arc::ptr_eq(c, &current)) {
                    return Some(current);
                }
            }
            let chosen = self.strategy.select(candidates)?;
            self.sticky.store(Some(chosen.clone()));
            return Some(chosen);
        }

        self.strategy.select(candidates)
    }

    pub fn record_success(&self, uri: &str, latency: Duration) {
        self.strategy.record_success(uri, latency);
    }

    pub fn record_error(&self, uri: &str) {
        self.strategy.record_error(uri);
    }

    pub fn forget(&self, uri: &str) {
        self.strategy.forget(uri);
        let stale = self.sticky.load().as_ref().is_some_and(|c| c.uri() == uri);
        if stale {
            self.sticky.store(None);
        }
    }
}

/// `endpoint` matches the full URI or, as `ip:<host>`, the URI's host.
fn endpoint_matches(uri: &str, endpoint: &str) -> bool {
    if uri == endpoint {
        return true;
    }
    match endpoint.strip_prefix("ip:") {
        Some(host) => url::Url::parse(uri)
            .ok()
            .and_then(|parsed| parsed.host_str().map(|h| h.trim_matches(['[', ']']) == host))
            .unwrap_or(false),
        None => false,
    }
}
