//! Multi-layer limiter.
//!
//! A request is admitted iff every enabled layer admits it; layers are
//! checked in ascending priority and the first denial wins, carrying its
//! layer in the decision.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{LayerConfig, LayeredConfig, LimitAlgorithm};
use crate::ratelimit::store::LimiterBackend;
use crate::ratelimit::{
    Decision, LimitLayer, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};

/// Identifiers for one admission check. The global layer needs none.
#[derive(Debug, Clone, Default)]
pub struct LayerIdentifiers {
    pub ip: Option<String>,
    pub connection: Option<String>,
    pub user: Option<String>,
    pub api_key: Option<String>,
    pub channel: Option<String>,
}

impl LayerIdentifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn connection(mut self, id: impl Into<String>) -> Self {
        self.connection = Some(id.into());
        self
    }

    pub fn user(mut self, id: impl Into<String>) -> Self {
        self.user = Some(id.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel = Some(name.into());
        self
    }

    fn for_layer(&self, layer: LimitLayer) -> Option<&str> {
        match layer {
            LimitLayer::Global => Some("global"),
            LimitLayer::Ip => self.ip.as_deref(),
            LimitLayer::Connection => self.connection.as_deref(),
            LimitLayer::User => self.user.as_deref(),
            LimitLayer::ApiKey => self.api_key.as_deref(),
            LimitLayer::Channel => self.channel.as_deref(),
        }
    }
}

pub struct LayeredRateLimiter {
    layers: Vec<(LimitLayer, Box<dyn RateLimiter>)>,
}

impl LayeredRateLimiter {
    pub fn from_config(
        config: &LayeredConfig,
        backend: Arc<dyn LimiterBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut layers = Vec::new();
        for layer in LimitLayer::ORDER {
            let layer_config = match layer {
                LimitLayer::Global => &config.global,
                LimitLayer::Ip => &config.ip,
                LimitLayer::Connection => &config.connection,
                LimitLayer::User => &config.user,
                LimitLayer::ApiKey => &config.api_key,
                LimitLayer::Channel => &config.channel,
            };
            if !layer_config.enabled {
                continue;
            }
            let limiter = build_limiter(layer, layer_config, backend.clone(), clock.clone());
            layers.push((layer, limiter));
        }
        Self { layers }
    }

    /// Check all enabled layers for which an identifier is present.
    pub fn attempt(&self, ids: &LayerIdentifiers, cost: u32) -> Decision {
        let mut min_remaining = u32::MAX;
        for (layer, limiter) in &self.layers {
            let Some(id) = ids.for_layer(*layer) else {
                continue;
            };
            match limiter.attempt(id, cost) {
                Decision::Allowed { remaining } => {
                    min_remaining = min_remaining.min(remaining);
                }
                Decision::Denied {
                    limit,
                    current,
                    retry_after_secs,
                    ..
                } => {
                    return Decision::Denied {
                        limit,
                        current,
                        retry_after_secs,
                        layer: Some(*layer),
                    };
                }
            }
        }
        Decision::Allowed {
            remaining: if min_remaining == u32::MAX { 0 } else { min_remaining },
        }
    }
}

impl RateLimiter for LayeredRateLimiter {
    fn attempt(&self, identifier: &str, cost: u32) -> Decision {
        // Bare identifiers check the connection layer; richer call sites
        // build LayerIdentifiers directly.
        let ids = LayerIdentifiers::new().connection(identifier);
        LayeredRateLimiter::attempt(self, &ids, cost)
    }
}

fn build_limiter(
    layer: LimitLayer,
    config: &LayerConfig,
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
) -> Box<dyn RateLimiter> {
    let algorithm = match config.algorithm {
        LimitAlgorithm::TokenBucket | LimitAlgorithm::SlidingWindow => config.algorithm,
        LimitAlgorithm::LeakyBucket => {
            log::warn!(
                "layer {}: leaky_bucket approximated by token_bucket",
                layer.as_str()
            );
            LimitAlgorithm::TokenBucket
        }
        LimitAlgorithm::FixedWindow => {
            log::warn!(
                "layer {}: fixed_window approximated by sliding_window",
                layer.as_str()
            );
            LimitAlgorithm::SlidingWindow
        }
    };
    let prefix = format!("rl:{}", layer.as_str());
    match algorithm {
        LimitAlgorithm::TokenBucket => {
            let refill = config.limit as f64 / config.window_secs.max(1) as f64;
            Box::new(
                TokenBucketLimiter::new(backend, clock, config.limit, refill)
                    .with_key_prefix(prefix),
            )
        }
        _ => Box::new(
            SlidingWindowLimiter::new(backend, clock, config.limit, config.window_secs)
                .with_key_prefix(prefix),
        ),
    }
}
