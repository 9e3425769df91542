//! Error types for identifier generation.
//!
//! [`Error`] is what every public generation API returns. Failures of the
//! coordination store itself are described by [`StoreError`]; the store client
//! retries those and only surfaces them, wrapped in
//! [`Error::CoordinationUnavailable`], once the retry budget is spent.

use std::io;
use thiserror::Error;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `distinctid` can surface to a caller.
///
/// No variant ever carries a partially generated identifier: a call either
/// returns every requested id or one of these errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was rejected before the store was contacted.
    ///
    /// Retrying with the same input cannot succeed.
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// The coordination store could not be reached after all retries.
    #[error("coordination store unavailable after {attempts} attempt(s): {source}")]
    CoordinationUnavailable {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The store answered an increment with a value lower than the increment
    /// itself: the counter was reset or written outside `INCRBY`. Values
    /// below the reset may already have been issued, so nothing is generated
    /// from it.
    #[error("counter `{key}` reads {value} after adding {increment}; it was reset or overwritten")]
    CounterReset {
        key: String,
        value: u64,
        increment: u64,
    },

    /// The clock moved backward further than the configured wait budget.
    #[error("clock moved backward by {behind_ms}ms (last seen {last_seen_ms}, now {now_ms})")]
    ClockSkew {
        last_seen_ms: u64,
        now_ms: u64,
        behind_ms: u64,
    },

    /// A field value does not fit its bit width in the configured layout.
    #[error("{field} value {value} exceeds its {bits}-bit field (max {max})")]
    EncodingRange {
        field: &'static str,
        value: u64,
        bits: u8,
        max: u64,
    },
}

impl Error {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the same call later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CoordinationUnavailable { .. } | Self::ClockSkew { .. }
        )
    }
}

/// Failures of a single round trip to the coordination store.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Connecting, reading or writing the socket failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operation did not complete within the socket timeout.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection mid-reply.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The reply could not be parsed or had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The store answered with an error reply (e.g. `-WRONGTYPE ...`).
    #[error("server error: {0}")]
    Server(String),

    /// No sentinel could name a reachable primary for the service.
    #[error("no primary found for service `{service}` via {sentinels} sentinel(s)")]
    NoPrimary { service: String, sentinels: usize },

    /// The connection pool was closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// The counter would overflow a 64-bit integer.
    #[error("counter overflow for key `{0}`")]
    Overflow(String),
}

impl StoreError {
    /// Whether the failure indicates the current connection or primary is
    /// unusable, so that pooled connections should be dropped and the
    /// topology re-resolved before retrying.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout | Self::ConnectionClosed | Self::NoPrimary { .. } => true,
            // A replica promoted away from primary answers writes with
            // `-READONLY`; treat it like a failover.
            Self::Server(msg) => msg.starts_with("READONLY") || msg.starts_with("LOADING"),
            Self::Protocol(_) | Self::PoolClosed | Self::Overflow(_) => false,
        }
    }

    /// Whether the store client should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server(_) => self.is_connection_failure(),
            Self::PoolClosed | Self::Overflow(_) => false,
            _ => true,
        }
    }
}
