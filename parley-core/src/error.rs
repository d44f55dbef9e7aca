// ABOUTME: Typed error taxonomy for providers, sessions, and backlog reconciliation
// ABOUTME: Expected outcomes (timeouts, cancellation, stale advances) are enums elsewhere, not errors

use std::time::Duration;
use thiserror::Error;

use crate::traits::IdentityKey;

/// Errors reported by a connection provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The credential was rejected by the platform.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or platform outage.
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    /// The platform is rate limiting this identity.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,

    /// Any other platform-side failure (permissions, unknown channel, ...).
    #[error("platform error: {0}")]
    Platform(String),
}

/// `acquire` could not produce a usable session.
#[derive(Debug, Clone, Error)]
#[error("failed to establish session for identity {identity}: {source}")]
pub struct SessionEstablishmentError {
    pub identity: IdentityKey,
    #[source]
    pub source: ProviderError,
}

/// Errors from a scoped session operation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Session(#[from] SessionEstablishmentError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("operation failed: {0}")]
    Operation(#[source] anyhow::Error),
}

/// Errors from backlog reconciliation.
#[derive(Debug, Error)]
pub enum BacklogError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("watermark store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// A filter could not be built.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid content regex: {0}")]
    InvalidRegex(#[from] regex::Error),
}
