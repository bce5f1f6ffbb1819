//! Crate-wide error types
//!
//! Every failure a coordinator can observe is converted into one of these
//! kinds before it crosses an API boundary, so the coordinators themselves
//! never die on a handler error.

use crate::envelope::RequestKind;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all broker-facing operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Broker refused the connection or the host is unreachable
    #[error("broker refused connection or host unreachable")]
    NoBroker,

    /// Broker accepted the connection but channel negotiation failed
    #[error("channel negotiation failed: {0}")]
    ChannelOpenFailed(String),

    /// Payload rejected by the request schema; nothing was published
    #[error("payload rejected by the {0} schema")]
    EnvelopeInvalid(RequestKind),

    /// No reply arrived within the per-call deadline
    #[error("no reply within the call deadline")]
    Timeout,

    /// The reserved-port pool is empty and a refill produced nothing
    #[error("no ports available in the configured range")]
    NoPorts,

    /// Media document does not exist
    #[error("media document not found")]
    NotFound,

    /// Media document exists but has nothing streamable
    #[error("media document has no streamable data")]
    NoData,

    /// The coordinator behind a handle is gone
    #[error("coordinator is no longer running")]
    Closed,

    /// Broker-side failure reported by an implementation
    #[error("broker failure: {0}")]
    Broker(String),

    /// AMQP transport error
    #[error("transport error: {0}")]
    Amqp(#[from] lapin::Error),

    /// JSON encode/decode failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket-level failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The error code carried by a media error reply envelope
    pub fn media_error_code(&self) -> &'static str {
        match self {
            Error::NotFound => "not_found",
            Error::NoData => "no_data",
            _ => "other",
        }
    }
}
