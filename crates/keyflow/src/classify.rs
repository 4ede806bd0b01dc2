// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Upstream failure classification.
//!
//! Maps an opaque upstream failure (HTTP status + headers + body, or a bare
//! message) into a [`ClassifiedError`] that tells the request executor
//! whether to rotate to another credential, retry the same one, and how long
//! the failing credential should cool down.
//!
//! Providers that know their wire format can construct a [`ClassifiedError`]
//! directly; [`classify`] is the generic fallback they all share.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Error;

// ============================================================================
// Cooldown defaults
// ============================================================================

/// Cooldown after a 401/403 or a failed token refresh, in seconds
pub const COOLDOWN_AUTH_ERROR: f64 = 1800.0;

/// Default cooldown for a 429 without a usable Retry-After
pub const COOLDOWN_RATE_LIMIT_DEFAULT: f64 = 60.0;

/// Cooldown for transient faults (5xx, flaky quota, empty responses)
pub const COOLDOWN_TRANSIENT_ERROR: f64 = 5.0;

/// Escalating server-error backoff, indexed by consecutive failure count
pub const COOLDOWN_BACKOFF_TIERS: &[f64] = &[5.0, 15.0, 60.0, 300.0];

/// Ceiling for tiered backoff, in seconds
pub const COOLDOWN_BACKOFF_MAX: f64 = 900.0;

/// Reset-header values below this are relative seconds, not unix timestamps.
/// Roughly the 2001 epoch; no real reset timestamp predates it.
pub(crate) const RESET_TIMESTAMP_FLOOR: f64 = 1_000_000_000.0;

// ============================================================================
// Classification
// ============================================================================

/// Outcome classes for a failed upstream call.
///
/// Exhaustive over outcomes, not over causes: every upstream failure maps to
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 401 / expired or revoked token
    AuthError,
    /// Token refresh failed; the credential needs interactive re-auth
    NeedsReauth,
    /// 429 with a retry-after signal
    RateLimit,
    /// Quota exhausted until a known reset point
    QuotaExceeded,
    /// 5xx from the upstream
    ServerError,
    /// Flaky quota signal worth retrying on the same credential
    TransientQuota,
    /// Successful status but no usable content
    EmptyResponse,
    /// 400 / schema error - unrecoverable
    BadRequest,
    /// A caller-supplied pre-request callback refused the request
    PreRequestCallbackFail,
}

impl ErrorKind {
    /// Stable string form used in cooldown reasons and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthError => "auth_error",
            Self::NeedsReauth => "needs_reauth",
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ServerError => "server_error",
            Self::TransientQuota => "transient_quota",
            Self::EmptyResponse => "empty_response",
            Self::BadRequest => "bad_request",
            Self::PreRequestCallbackFail => "pre_request_callback_fail",
        }
    }

    /// Whether this failure counts toward the executor's consecutive
    /// quota-failure bound
    #[must_use]
    pub fn is_quota_like(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::RateLimit)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque upstream failure, as handed to the classifier.
///
/// Providers fill in whatever they have; every field is optional except the
/// message.
#[derive(Debug, Clone, Default)]
pub struct UpstreamFailure {
    /// HTTP status, if the failure came from an HTTP response
    pub status: Option<u16>,
    /// Provider's own error-type string (e.g. `rate_limit_error`), if parsed
    pub kind_hint: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Response headers, lowercased keys
    pub headers: BTreeMap<String, String>,
    /// Parsed response body, if any
    pub body: Option<Value>,
}

impl UpstreamFailure {
    /// Failure from an HTTP status and message
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Failure from a bare message (connection errors, timeouts, ...)
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Attach a response header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// Attach the parsed response body
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach the provider's error-type string
    #[must_use]
    pub fn with_kind_hint(mut self, hint: impl Into<String>) -> Self {
        self.kind_hint = Some(hint.into());
        self
    }
}

/// A classified upstream failure, driving the executor's retry decisions
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// Outcome class
    pub kind: ErrorKind,
    /// Whether the executor should move to another credential
    pub should_rotate: bool,
    /// Whether the same credential is worth a bounded retry first
    pub should_retry_same: bool,
    /// Cooldown to apply to the failing credential, in seconds
    pub cooldown: Option<f64>,
    /// Parsed Retry-After, in seconds
    pub retry_after: Option<f64>,
    /// Absolute quota-reset timestamp, if the upstream disclosed one
    pub quota_reset_at: Option<f64>,
    /// Marks the credential exhausted for fair-cycle purposes
    pub mark_exhausted: bool,
    /// Original message, for logs and terminal errors
    pub message: String,
}

impl ClassifiedError {
    /// Build a classified error of the given kind with its default
    /// rotate/retry/cooldown policy
    #[must_use]
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let (should_rotate, should_retry_same, cooldown, mark_exhausted) = match kind {
            ErrorKind::AuthError | ErrorKind::NeedsReauth => {
                (true, false, Some(COOLDOWN_AUTH_ERROR), false)
            }
            ErrorKind::RateLimit => (true, false, Some(COOLDOWN_RATE_LIMIT_DEFAULT), false),
            ErrorKind::QuotaExceeded => (true, false, None, true),
            ErrorKind::ServerError | ErrorKind::TransientQuota | ErrorKind::EmptyResponse => {
                (true, true, Some(COOLDOWN_TRANSIENT_ERROR), false)
            }
            ErrorKind::BadRequest | ErrorKind::PreRequestCallbackFail => {
                (false, false, None, false)
            }
        };
        Self {
            kind,
            should_rotate,
            should_retry_same,
            cooldown,
            retry_after: None,
            quota_reset_at: None,
            mark_exhausted,
            message,
        }
    }

    /// Override the cooldown duration
    #[must_use]
    pub fn with_cooldown(mut self, seconds: f64) -> Self {
        self.cooldown = Some(seconds);
        self
    }

    /// Set the absolute quota-reset timestamp
    #[must_use]
    pub fn with_quota_reset_at(mut self, timestamp: f64) -> Self {
        self.quota_reset_at = Some(timestamp);
        self
    }

    /// Effective cooldown for `record_failure`: prefers the explicit
    /// Retry-After over the kind default
    #[must_use]
    pub fn effective_cooldown(&self) -> Option<f64> {
        self.retry_after.or(self.cooldown)
    }

    /// Tiered backoff for repeated same-credential retries
    #[must_use]
    pub fn backoff_for_attempt(attempt: usize) -> f64 {
        COOLDOWN_BACKOFF_TIERS
            .get(attempt)
            .copied()
            .unwrap_or(COOLDOWN_BACKOFF_MAX)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ClassifiedError> for Error {
    fn from(err: ClassifiedError) -> Self {
        match err.kind {
            ErrorKind::AuthError => Error::Auth(err.message),
            ErrorKind::NeedsReauth => Error::NeedsReauth(err.message),
            ErrorKind::RateLimit => Error::RateLimit(err.message),
            ErrorKind::QuotaExceeded | ErrorKind::TransientQuota => {
                Error::QuotaExceeded(err.message)
            }
            ErrorKind::ServerError => Error::Upstream(err.message),
            ErrorKind::EmptyResponse => Error::EmptyResponse(err.message),
            ErrorKind::BadRequest => Error::InvalidRequest(err.message),
            ErrorKind::PreRequestCallbackFail => Error::PreRequestCallback(err.message),
        }
    }
}

/// Classify an opaque upstream failure.
///
/// Status codes are consulted first, then the provider's error-type hint,
/// then message heuristics. Retry-After and quota-reset information is parsed
/// out of headers and body regardless of the final kind.
#[must_use]
pub fn classify(failure: &UpstreamFailure) -> ClassifiedError {
    let kind = resolve_kind(failure);
    let mut classified = ClassifiedError::of_kind(kind, failure.message.clone());
    classified.retry_after = retry_after_from(failure);

    if kind == ErrorKind::QuotaExceeded {
        classified.quota_reset_at = quota_reset_from(failure);
        if classified.quota_reset_at.is_none() {
            // No reset disclosed; fall back to the retry-after signal
            classified.cooldown = classified.retry_after.or(Some(COOLDOWN_RATE_LIMIT_DEFAULT));
        }
    }

    classified
}

fn resolve_kind(failure: &UpstreamFailure) -> ErrorKind {
    let hint = failure.kind_hint.as_deref().unwrap_or("");
    let message = failure.message.to_lowercase();

    if let Some(status) = failure.status {
        match status {
            401 => return ErrorKind::AuthError,
            403 => {
                // Some providers report quota exhaustion as 403
                if hint.contains("quota") || message.contains("quota") {
                    return ErrorKind::QuotaExceeded;
                }
                return ErrorKind::AuthError;
            }
            429 => {
                if is_quota_marker(hint) || message.contains("quota") {
                    return ErrorKind::QuotaExceeded;
                }
                return ErrorKind::RateLimit;
            }
            400 | 404 | 413 | 422 => return ErrorKind::BadRequest,
            s if (500..600).contains(&s) => return ErrorKind::ServerError,
            _ => {}
        }
    }

    match hint {
        "rate_limit_error" | "rate_limit" => ErrorKind::RateLimit,
        "quota_exceeded" | "resource_exhausted" => ErrorKind::QuotaExceeded,
        "authentication_error" | "permission_error" | "auth_error" => ErrorKind::AuthError,
        "needs_reauth" => ErrorKind::NeedsReauth,
        "invalid_request_error" | "bad_request" => ErrorKind::BadRequest,
        "overloaded_error" | "server_error" => ErrorKind::ServerError,
        "empty_response" => ErrorKind::EmptyResponse,
        "transient_quota" => ErrorKind::TransientQuota,
        _ if message.contains("token") && message.contains("refresh") => ErrorKind::NeedsReauth,
        _ if message.contains("empty response") => ErrorKind::EmptyResponse,
        _ => ErrorKind::ServerError,
    }
}

fn is_quota_marker(hint: &str) -> bool {
    hint.contains("quota") || hint == "resource_exhausted" || hint == "insufficient_quota"
}

// ============================================================================
// Retry-After parsing
// ============================================================================

/// Extract a retry delay in seconds from a failure's headers and body.
///
/// Understands `Retry-After` as integer seconds or an HTTP-date, and the
/// common provider body shapes `retry_delay.seconds` and
/// `error.details[].retryDelay` (a `"30s"`-style string).
#[must_use]
pub fn retry_after_from(failure: &UpstreamFailure) -> Option<f64> {
    if let Some(raw) = failure.headers.get("retry-after") {
        if let Some(seconds) = parse_retry_after_value(raw) {
            return Some(seconds);
        }
    }
    failure.body.as_ref().and_then(retry_after_from_body)
}

fn parse_retry_after_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Ok(seconds) = raw.parse::<f64>() {
        return (seconds >= 0.0).then_some(seconds);
    }
    // HTTP-date form (RFC 7231 uses RFC 2822 dates)
    let when = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = (when.with_timezone(&Utc) - Utc::now()).num_milliseconds() as f64 / 1000.0;
    Some(delta.max(0.0))
}

fn retry_after_from_body(body: &Value) -> Option<f64> {
    // { "retry_delay": { "seconds": 30 } }
    if let Some(seconds) = body
        .pointer("/retry_delay/seconds")
        .or_else(|| body.pointer("/error/retry_delay/seconds"))
        .and_then(Value::as_f64)
    {
        return Some(seconds);
    }

    // { "error": { "details": [ { "retryDelay": "30s" }, ... ] } }
    let details = body.pointer("/error/details")?.as_array()?;
    for detail in details {
        if let Some(raw) = detail.get("retryDelay").and_then(Value::as_str) {
            if let Ok(seconds) = raw.trim_end_matches('s').parse::<f64>() {
                return Some(seconds);
            }
        }
    }
    None
}

fn quota_reset_from(failure: &UpstreamFailure) -> Option<f64> {
    let raw = failure
        .headers
        .get("x-ratelimit-reset")
        .or_else(|| failure.headers.get("x-ratelimit-reset-requests"))?;
    let value = raw.trim().parse::<f64>().ok()?;
    if value < RESET_TIMESTAMP_FLOOR {
        Some(crate::state::unix_now() + value)
    } else {
        Some(value)
    }
}

// ============================================================================
// Credential masking
// ============================================================================

/// Produce a short, log-safe form of a credential accessor.
///
/// Emails keep their local part, file paths keep their stem, and raw keys
/// become a six-character hash prefix. Every log line that references a
/// credential goes through this; raw key bytes never reach the log stream.
#[must_use]
pub fn mask_credential(accessor: &str) -> String {
    if let Some(local) = accessor.split('@').next() {
        if accessor.contains('@') && !local.is_empty() {
            return format!("{local}@…");
        }
    }

    if accessor.contains('/') || accessor.contains('\\') {
        let stem = std::path::Path::new(accessor)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("credential");
        return stem.to_string();
    }

    let digest = Sha256::digest(accessor.as_bytes());
    format!("key-{}", &hex::encode(digest)[..6])
}
