//! Internal error taxonomy for each component.
//!
//! These enums are rich on purpose: callers inside the crate match on
//! variants. The HTTP boundary in [`crate::rest`] is the only place they are
//! collapsed to the opaque strings the client is allowed to see.

use thiserror::Error;

/// Errors from [`crate::envelope`] decrypt/encrypt operations.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("replay rejected")]
    ReplayRejected,
    #[error("decrypt failed")]
    DecryptFailed,
    #[error("payload schema invalid")]
    SchemaInvalid,
}

/// Errors from [`crate::inference`] streaming.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("request budget exceeded")]
    Timeout,
    #[error("upstream failed: {0}")]
    UpstreamFailed(String),
    #[error("no upstream endpoint configured")]
    NoEndpoint,
}

/// Errors surfaced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {source}")]
    InvalidValue {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("missing required path for {name}: {path}")]
    MissingPath { name: &'static str, path: String },
}
