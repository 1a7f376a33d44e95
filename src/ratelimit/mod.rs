//! Layered admission control.
//!
//! Rate limiting is flow control, not a fault: every check returns a
//! [`Decision`] variant rather than an error. [`Error::RateLimitExceeded`]
//! exists only for surfacing a denial to a client.

pub mod adaptive;
pub mod layered;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use adaptive::{AdaptiveLimiter, LoadProbe, ProcLoadProbe};
pub use layered::{LayerIdentifiers, LayeredRateLimiter};
pub use sliding_window::SlidingWindowLimiter;
pub use store::{LimiterBackend, MemoryBackend, ScriptOutcome};
pub use token_bucket::TokenBucketLimiter;

/// Admission layers, in ascending check priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitLayer {
    Global,
    Ip,
    Connection,
    User,
    ApiKey,
    Channel,
}

impl LimitLayer {
    /// Check order: first denial wins.
    pub const ORDER: [LimitLayer; 6] = [
        LimitLayer::Global,
        LimitLayer::Ip,
        LimitLayer::Connection,
        LimitLayer::User,
        LimitLayer::ApiKey,
        LimitLayer::Channel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitLayer::Global => "global",
            LimitLayer::Ip => "ip",
            LimitLayer::Connection => "connection",
            LimitLayer::User => "user",
            LimitLayer::ApiKey => "api_key",
            LimitLayer::Channel => "channel",
        }
    }
}

/// Outcome of an admission attempt.
///
/// `retry_after_secs` is always >= 1 on a denial; zero never signals a
/// denied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        remaining: u32,
    },
    Denied {
        limit: u32,
        current: u32,
        retry_after_secs: u64,
        layer: Option<LimitLayer>,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Surface a denial as the client-visible error.
    pub fn into_error(self, identifier: &str) -> Option<Error> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied {
                limit,
                current,
                retry_after_secs,
                layer,
            } => Some(Error::RateLimitExceeded {
                identifier: identifier.to_string(),
                limit,
                current,
                retry_after_secs,
                layer: layer.map(|l| l.as_str().to_string()).unwrap_or_default(),
            }),
        }
    }
}

/// Capability set every limiter implements.
pub trait RateLimiter: Send + Sync {
    fn attempt(&self, identifier: &str, cost: u32) -> Decision;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_denials_surface_as_errors() {
        let allowed = Decision::Allowed { remaining: 3 };
        assert!(allowed.into_error("u1").is_none());

        let denied = Decision::Denied {
            limit: 10,
            current: 10,
            retry_after_secs: 4,
            layer: Some(LimitLayer::Ip),
        };
        match denied.into_error("u1") {
            Some(Error::RateLimitExceeded {
                identifier,
                retry_after_secs,
                layer,
                ..
            }) => {
                assert_eq!(identifier, "u1");
                assert_eq!(retry_after_secs, 4);
                assert_eq!(layer, "ip");
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }
}
