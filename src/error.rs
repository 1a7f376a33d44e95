//! Crate error taxonomy.
//!
//! Recoverable flow-control outcomes (rate-limit denial, handler failure)
//! are modelled as tagged result variants in their own modules; this enum
//! covers genuine faults that propagate across component boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A channel authorizer rejected the subscription. Not retried.
    #[error("authorization denied for channel '{channel}': {reason}")]
    AuthorizationDenied { channel: String, reason: String },

    /// Malformed channel or event name. Never reaches the broker.
    #[error("invalid channel or event name: {0}")]
    ChannelValidation(String),

    /// An admission check denied the request.
    #[error("rate limit exceeded for '{identifier}' (layer {layer}): {current}/{limit}, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        identifier: String,
        limit: u32,
        current: u32,
        retry_after_secs: u64,
        layer: String,
    },

    /// Broker connection or health failure.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Raised inside a message handler; recorded, never aborts the loop.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// A task-executor work unit failed.
    #[error("task '{key}' failed: {reason}")]
    TaskFailed {
        key: String,
        reason: String,
        exit_code: Option<i32>,
    },

    /// A work unit could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// Work-unit envelope signature did not verify.
    #[error("work unit signature invalid")]
    SignatureInvalid,

    /// A bounded operation exceeded its budget.
    #[error("timeout exceeded in {operation} after {budget_ms}ms")]
    TimeoutExceeded { operation: String, budget_ms: u64 },

    /// Unrecoverable configuration error; the process exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
