// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for keyflow operations.
//!
//! Only a small set of errors ever reaches a caller: unrecoverable upstream
//! verdicts (`InvalidRequest`, `Auth` after retries are exhausted, ...),
//! `NoAvailableCredentials`, and `DeadlineExceeded`. Everything rotatable is
//! absorbed by the request executor's retry loop.

use std::collections::BTreeMap;

use thiserror::Error;

/// Error types for keyflow operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Authentication failed (401, expired or revoked token)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Credential requires re-authentication (token refresh failed)
    #[error("Credential needs re-authentication: {0}")]
    NeedsReauth(String),

    /// Upstream rate limit (429)
    #[error("Rate limit error: {0}")]
    RateLimit(String),

    /// Upstream quota exhausted until a reset timestamp
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Upstream 5xx after bounded same-credential retries
    #[error("Upstream server error: {0}")]
    Upstream(String),

    /// Successful status with no usable content, after retries
    #[error("Empty response from upstream: {0}")]
    EmptyResponse(String),

    /// Malformed request - unrecoverable, never rotated
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A caller-supplied pre-request callback refused the request
    #[error("Pre-request callback rejected: {0}")]
    PreRequestCallback(String),

    /// Every candidate credential was blocked; carries the most recent
    /// blocking reason per candidate
    #[error("No available credentials for {provider}/{model}")]
    NoAvailableCredentials {
        /// Provider that was asked for a credential
        provider: String,
        /// Model that was requested
        model: String,
        /// Stable ID -> most recent blocking reason
        reasons: BTreeMap<String, String>,
    },

    /// The request-level deadline expired
    #[error("Deadline exceeded after {elapsed:.1}s")]
    DeadlineExceeded {
        /// Seconds spent before giving up
        elapsed: f64,
    },

    /// Provider does not implement the streaming surface
    #[error("Provider '{0}' does not support streaming")]
    StreamingUnsupported(String),

    /// Request named a provider that was never registered
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (storage paths only)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (storage paths only)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit(message.into())
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded(message.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for errors the executor would have rotated on; a caller seeing
    /// one of these means retries were exhausted, not that rotation was
    /// skipped.
    #[must_use]
    pub fn is_rotatable(&self) -> bool {
        matches!(
            self,
            Self::Auth(_)
                | Self::NeedsReauth(_)
                | Self::RateLimit(_)
                | Self::QuotaExceeded(_)
                | Self::Upstream(_)
                | Self::EmptyResponse(_)
        )
    }

    /// True for verdicts that terminate a request without any retry
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::PreRequestCallback(_)
                | Self::NoAvailableCredentials { .. }
                | Self::DeadlineExceeded { .. }
                | Self::StreamingUnsupported(_)
                | Self::UnknownProvider(_)
        )
    }
}

/// Result type for keyflow operations
pub type Result<T> = std::result::Result<T, Error>;

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::rate_limit("too many requests");
        assert_eq!(error.to_string(), "Rate limit error: too many requests");

        let error = Error::DeadlineExceeded { elapsed: 5.04 };
        assert_eq!(error.to_string(), "Deadline exceeded after 5.0s");
    }

    #[test]
    fn test_no_available_credentials_carries_reasons() {
        let mut reasons = BTreeMap::new();
        reasons.insert("alice".to_string(), "cooldown for 'g'".to_string());
        reasons.insert("bob".to_string(), "fair cycle exhausted".to_string());

        let error = Error::NoAvailableCredentials {
            provider: "acme".to_string(),
            model: "acme-large".to_string(),
            reasons,
        };
        assert_eq!(
            error.to_string(),
            "No available credentials for acme/acme-large"
        );
        if let Error::NoAvailableCredentials { reasons, .. } = &error {
            assert_eq!(reasons.len(), 2);
        } else {
            panic!("expected NoAvailableCredentials");
        }
    }

    #[test]
    fn test_rotatable_vs_terminal() {
        assert!(Error::auth("x").is_rotatable());
        assert!(Error::rate_limit("x").is_rotatable());
        assert!(!Error::invalid_request("x").is_rotatable());

        assert!(Error::invalid_request("x").is_terminal());
        assert!(Error::DeadlineExceeded { elapsed: 1.0 }.is_terminal());
        assert!(!Error::rate_limit("x").is_terminal());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_io_error_from() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let error = Error::from(io_error);
        assert!(matches!(error, Error::Io(_)));
    }
}
