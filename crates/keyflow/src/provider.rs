// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The provider plugin contract.
//!
//! A [`Provider`] wraps everything upstream-specific: which credentials
//! exist, how to perform the opaque upstream effect, which models share a
//! quota pool, and optional hooks for request accounting and background
//! quota refresh. The core never parses wire protocols or reshapes
//! payloads; it hands the provider an opaque JSON payload and receives a
//! response or a classified error.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

use crate::classify::ClassifiedError;
use crate::config::ProviderConfig;
use crate::error::Result;
use crate::manager::UsageManager;
use crate::state::TokenCounts;

/// Request identity and deadline, propagated executor -> selection ->
/// upstream as an explicit value
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Provider name
    pub provider: String,
    /// Model being requested
    pub model: String,
    /// Quota group for the model, if any
    pub quota_group: Option<String>,
    /// Unique id for log correlation
    pub request_id: String,
    /// Absolute deadline, unix seconds
    pub deadline: f64,
    /// 1-based attempt number within this request
    pub attempt: u32,
}

/// A completed upstream call
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// HTTP status (or 200 for non-HTTP transports)
    pub status: u16,
    /// Response headers, lowercased keys
    pub headers: BTreeMap<String, String>,
    /// Opaque response body
    pub body: Value,
    /// Normalised token counts extracted by the provider
    pub tokens: TokenCounts,
    /// Estimated cost of the call in dollars
    pub approx_cost: f64,
}

impl ProviderResponse {
    /// A bare 200 response with the given body
    #[must_use]
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body,
            tokens: TokenCounts::default(),
            approx_cost: 0.0,
        }
    }
}

/// One streamed chunk; the final chunk usually carries the token counts
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Opaque chunk body
    pub body: Value,
    /// Token counts, when the upstream discloses them mid-stream
    pub tokens: Option<TokenCounts>,
}

/// A stream of chunks from the upstream
pub type ChunkStream =
    Pin<Box<dyn Stream<Item = std::result::Result<StreamChunk, ClassifiedError>> + Send>>;

/// Provider overrides for how a completed request is recorded
#[derive(Debug, Clone, Default)]
pub struct CompletionOverride {
    /// How many requests to count; 0 skips recording entirely, `None` uses
    /// the default of 1
    pub count_override: Option<u64>,
    /// Cooldown to apply instead of the classifier's, in seconds
    pub cooldown_override: Option<f64>,
    /// Mark the credential fair-cycle exhausted regardless of the error
    pub force_exhausted: bool,
}

/// What the `on_request_complete` hook sees
#[derive(Debug)]
pub struct CompletionEvent<'a> {
    /// Credential accessor that served the attempt
    pub accessor: &'a str,
    /// Model that was called
    pub model: &'a str,
    /// Whether the attempt succeeded
    pub success: bool,
    /// The response, on success
    pub response: Option<&'a ProviderResponse>,
    /// The classified error, on failure
    pub error: Option<&'a ClassifiedError>,
}

/// An upstream provider plugin.
///
/// Implementations are cheap to share (`Arc<dyn Provider>`) and must be
/// safe to call from many concurrent request tasks.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name; also the usage-snapshot namespace
    fn name(&self) -> &str;

    /// Credential accessors this provider can use
    fn credentials(&self) -> Vec<String>;

    /// Perform the upstream effect with one credential. Implementations
    /// classify their own failures (usually via [`crate::classify::classify`]).
    async fn execute(
        &self,
        ctx: &RequestContext,
        accessor: &str,
        payload: &Value,
    ) -> std::result::Result<ProviderResponse, ClassifiedError>;

    /// Streaming variant of [`Self::execute`]. Providers without a streaming
    /// surface leave the default in place and callers get
    /// [`crate::Error::StreamingUnsupported`].
    async fn execute_streaming(
        &self,
        _ctx: &RequestContext,
        _accessor: &str,
        _payload: &Value,
    ) -> std::result::Result<ChunkStream, ClassifiedError> {
        Err(ClassifiedError::of_kind(
            crate::classify::ErrorKind::BadRequest,
            format!("provider '{}' does not support streaming", self.name()),
        ))
    }

    /// Whether [`Self::execute_streaming`] is implemented
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Called after every attempt, success or failure. May override request
    /// counting, cooldowns, or exhaustion. `None` keeps the defaults.
    async fn on_request_complete(&self, _event: CompletionEvent<'_>) -> Option<CompletionOverride> {
        None
    }

    /// Static model -> quota-group table. Models sharing a group draw from
    /// one upstream pool.
    fn quota_group(&self, _model: &str) -> Option<String> {
        None
    }

    /// Per-model weight multiplier for cost accounting
    fn model_weight(&self, _model: &str) -> f64 {
        1.0
    }

    /// Highest priority number allowed to serve a model; credentials with a
    /// larger priority are filtered out before selection
    fn model_tier_requirement(&self, _model: &str) -> Option<i32> {
        None
    }

    /// Priority for a credential, lower is higher tier
    fn credential_priority(&self, _accessor: &str) -> Option<i32> {
        None
    }

    /// Tier label for a credential
    fn credential_tier_name(&self, _accessor: &str) -> Option<String> {
        None
    }

    /// Rotation configuration defaults for this provider; environment
    /// overrides are applied on top at load time
    fn usage_config(&self) -> ProviderConfig {
        ProviderConfig::default()
    }

    /// How often the background refresher should invoke [`Self::refresh`];
    /// `None` disables the job
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }

    /// Background quota refresh: consult the upstream for quota baselines
    /// and record them through the usage manager
    async fn refresh(&self, _usage: &UsageManager) -> Result<()> {
        Ok(())
    }
}
