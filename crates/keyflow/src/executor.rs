// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The request executor: pick a credential, perform the upstream effect,
//! record the outcome, and decide whether to retry on another credential or
//! give up.
//!
//! Callers never see a rotatable error: auth failures, rate limits, quota
//! exhaustion, and transient upstream faults are absorbed here by rotating
//! through the pool. Only unrecoverable verdicts, pool exhaustion, and
//! deadline expiry propagate.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::classify::{mask_credential, ClassifiedError, ErrorKind};
use crate::config::{
    DEFAULT_GLOBAL_TIMEOUT, DEFAULT_MAX_CONSECUTIVE_QUOTA_FAILURES,
    DEFAULT_MAX_SAME_CREDENTIAL_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::manager::UsageManager;
use crate::provider::{
    ChunkStream, CompletionEvent, CompletionOverride, Provider, ProviderResponse, RequestContext,
};
use crate::state::{unix_now, TokenCounts, UsageUpdate};

/// A caller-supplied gate run before each upstream attempt; an `Err` fails
/// the request without rotation
pub type PreRequestHook =
    Arc<dyn Fn(&RequestContext, &Value) -> std::result::Result<(), String> + Send + Sync>;

/// Per-request execution options
#[derive(Clone)]
pub struct ExecuteOptions {
    /// Request-level deadline in seconds
    pub timeout: f64,
    /// Bound on same-credential retries for retry-same verdicts
    pub max_same_credential_attempts: u32,
    /// Bound on consecutive quota-like failures before giving up
    pub max_consecutive_quota_failures: u32,
    /// Optional pre-request gate
    pub pre_request: Option<PreRequestHook>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GLOBAL_TIMEOUT,
            max_same_credential_attempts: DEFAULT_MAX_SAME_CREDENTIAL_ATTEMPTS,
            max_consecutive_quota_failures: DEFAULT_MAX_CONSECUTIVE_QUOTA_FAILURES,
            pre_request: None,
        }
    }
}

impl ExecuteOptions {
    /// Override the request deadline
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Install a pre-request gate
    #[must_use]
    pub fn with_pre_request(mut self, hook: PreRequestHook) -> Self {
        self.pre_request = Some(hook);
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field(
                "max_same_credential_attempts",
                &self.max_same_credential_attempts,
            )
            .field(
                "max_consecutive_quota_failures",
                &self.max_consecutive_quota_failures,
            )
            .field("pre_request", &self.pre_request.as_ref().map(|_| "[hook]"))
            .finish()
    }
}

/// Releases a credential's concurrency slot on every exit path
struct SlotGuard {
    usage: Arc<UsageManager>,
    stable_id: String,
}

impl SlotGuard {
    fn new(usage: Arc<UsageManager>, stable_id: String) -> Self {
        Self { usage, stable_id }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.usage.release(&self.stable_id);
    }
}

/// How a failed attempt continues
enum FailureStep {
    RetrySame,
    Rotate,
    Fail,
}

/// Drives the retry loop for one provider
pub struct RequestExecutor {
    provider: Arc<dyn Provider>,
    usage: Arc<UsageManager>,
}

impl RequestExecutor {
    /// Build an executor over a provider and its usage manager
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, usage: Arc<UsageManager>) -> Self {
        Self { provider, usage }
    }

    /// Execute a request, rotating across credentials until it succeeds or
    /// becomes unrecoverable
    pub async fn execute(
        &self,
        model: &str,
        payload: &Value,
        options: &ExecuteOptions,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let deadline_ts = unix_now() + options.timeout;
        let group = self.provider.quota_group(model);
        let group_ref = group.as_deref();
        let eligible = self.eligible_ids(model);
        let mut tried: HashSet<String> = HashSet::new();
        let mut consecutive_quota_failures = 0u32;
        let mut attempt_no = 0u32;

        loop {
            if started.elapsed().as_secs_f64() >= options.timeout {
                return Err(Error::DeadlineExceeded {
                    elapsed: started.elapsed().as_secs_f64(),
                });
            }

            let (stable_id, accessor) =
                match self.next_candidate(model, group_ref, &eligible, &tried, deadline_ts) {
                    Some(candidate) => candidate,
                    None => return Err(self.pool_exhausted(model, group_ref, &eligible, &tried)),
                };

            if !self.usage.acquire(&stable_id) {
                debug!(
                    credential = %mask_credential(&accessor),
                    "acquire refused, credential at capacity"
                );
                tried.insert(stable_id);
                continue;
            }
            let _guard = SlotGuard::new(Arc::clone(&self.usage), stable_id.clone());

            let mut attempts_on_credential = 0u32;
            loop {
                attempts_on_credential += 1;
                attempt_no += 1;
                let ctx = self.request_context(model, group_ref, deadline_ts, attempt_no);

                if let Some(hook) = &options.pre_request {
                    if let Err(message) = hook(&ctx, payload) {
                        return Err(Error::PreRequestCallback(message));
                    }
                }

                let remaining = options.timeout - started.elapsed().as_secs_f64();
                if remaining <= 0.0 {
                    return Err(Error::DeadlineExceeded {
                        elapsed: started.elapsed().as_secs_f64(),
                    });
                }

                let outcome = tokio::time::timeout(
                    Duration::from_secs_f64(remaining),
                    self.provider.execute(&ctx, &accessor, payload),
                )
                .await;

                match outcome {
                    // A timed-out attempt is cancelled, not recorded
                    Err(_) => {
                        return Err(Error::DeadlineExceeded {
                            elapsed: started.elapsed().as_secs_f64(),
                        });
                    }
                    Ok(Ok(response)) => {
                        self.finish_success(&stable_id, &accessor, model, group_ref, &response)
                            .await;
                        return Ok(response);
                    }
                    Ok(Err(classified)) => {
                        let step = self
                            .finish_failure(
                                &stable_id,
                                &accessor,
                                model,
                                group_ref,
                                &classified,
                                attempts_on_credential,
                                options,
                            )
                            .await;
                        match step {
                            FailureStep::RetrySame => continue,
                            FailureStep::Rotate => {
                                tried.insert(stable_id.clone());
                                if classified.kind.is_quota_like() {
                                    consecutive_quota_failures += 1;
                                    self.usage.evict_sticky(group_ref.unwrap_or(model));
                                } else {
                                    consecutive_quota_failures = 0;
                                }
                                if consecutive_quota_failures
                                    >= options.max_consecutive_quota_failures
                                {
                                    warn!(
                                        provider = %self.provider.name(),
                                        model,
                                        failures = consecutive_quota_failures,
                                        "too many consecutive quota failures, giving up"
                                    );
                                    return Err(classified.into());
                                }
                                break;
                            }
                            FailureStep::Fail => return Err(classified.into()),
                        }
                    }
                }
            }
            // Rotating: the guard for this credential drops here
        }
    }

    /// Streaming variant: rotation happens until a stream is established;
    /// after the first chunk the stream is committed to its credential.
    /// Usage is recorded when the stream ends.
    pub async fn execute_streaming(
        &self,
        model: &str,
        payload: &Value,
        options: &ExecuteOptions,
    ) -> Result<ChunkStream> {
        if !self.provider.supports_streaming() {
            return Err(Error::StreamingUnsupported(self.provider.name().to_string()));
        }

        let started = Instant::now();
        let deadline_ts = unix_now() + options.timeout;
        let group = self.provider.quota_group(model);
        let group_ref = group.as_deref();
        let eligible = self.eligible_ids(model);
        let mut tried: HashSet<String> = HashSet::new();
        let mut consecutive_quota_failures = 0u32;
        let mut attempt_no = 0u32;

        loop {
            if started.elapsed().as_secs_f64() >= options.timeout {
                return Err(Error::DeadlineExceeded {
                    elapsed: started.elapsed().as_secs_f64(),
                });
            }

            let (stable_id, accessor) =
                match self.next_candidate(model, group_ref, &eligible, &tried, deadline_ts) {
                    Some(candidate) => candidate,
                    None => return Err(self.pool_exhausted(model, group_ref, &eligible, &tried)),
                };

            if !self.usage.acquire(&stable_id) {
                tried.insert(stable_id);
                continue;
            }
            let guard = SlotGuard::new(Arc::clone(&self.usage), stable_id.clone());

            let mut attempts_on_credential = 0u32;
            let classified = loop {
                attempts_on_credential += 1;
                attempt_no += 1;
                let ctx = self.request_context(model, group_ref, deadline_ts, attempt_no);

                let remaining = options.timeout - started.elapsed().as_secs_f64();
                if remaining <= 0.0 {
                    return Err(Error::DeadlineExceeded {
                        elapsed: started.elapsed().as_secs_f64(),
                    });
                }

                let outcome = tokio::time::timeout(
                    Duration::from_secs_f64(remaining),
                    self.provider.execute_streaming(&ctx, &accessor, payload),
                )
                .await;

                match outcome {
                    Err(_) => {
                        return Err(Error::DeadlineExceeded {
                            elapsed: started.elapsed().as_secs_f64(),
                        });
                    }
                    Ok(Ok(stream)) => {
                        return Ok(self.wrap_stream(
                            stream,
                            guard,
                            stable_id,
                            accessor,
                            model.to_string(),
                            group.clone(),
                        ));
                    }
                    Ok(Err(classified)) => {
                        let step = self
                            .finish_failure(
                                &stable_id,
                                &accessor,
                                model,
                                group_ref,
                                &classified,
                                attempts_on_credential,
                                options,
                            )
                            .await;
                        match step {
                            FailureStep::RetrySame => continue,
                            FailureStep::Rotate => break classified,
                            FailureStep::Fail => return Err(classified.into()),
                        }
                    }
                }
            };

            tried.insert(stable_id.clone());
            if classified.kind.is_quota_like() {
                consecutive_quota_failures += 1;
                self.usage.evict_sticky(group_ref.unwrap_or(model));
            } else {
                consecutive_quota_failures = 0;
            }
            if consecutive_quota_failures >= options.max_consecutive_quota_failures {
                return Err(classified.into());
            }
        }
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Stable IDs eligible for a model after tier filtering. Credentials
    /// with an unknown priority stay candidates.
    fn eligible_ids(&self, model: &str) -> Vec<String> {
        let required_tier = self.provider.model_tier_requirement(model);
        let mut eligible = Vec::new();
        for accessor in self.provider.credentials() {
            let priority = self.provider.credential_priority(&accessor);
            if let (Some(required), Some(priority)) = (required_tier, priority) {
                if priority > required {
                    continue;
                }
            }
            let tier = self.provider.credential_tier_name(&accessor);
            let stable_id = self
                .usage
                .register_credential(&accessor, priority, tier, None);
            eligible.push(stable_id);
        }
        eligible.sort();
        eligible.dedup();
        if eligible.is_empty() {
            warn!(
                provider = %self.provider.name(),
                model,
                "no credentials eligible after tier filtering"
            );
        }
        eligible
    }

    fn next_candidate(
        &self,
        model: &str,
        group: Option<&str>,
        eligible: &[String],
        tried: &HashSet<String>,
        deadline_ts: f64,
    ) -> Option<(String, String)> {
        // Exclude tried credentials and any state not eligible for this
        // model (wrong tier, or loaded from storage but no longer
        // configured)
        let mut exclude: HashSet<String> = tried.clone();
        for id in self.usage.known_stable_ids() {
            if !eligible.contains(&id) {
                exclude.insert(id);
            }
        }
        self.usage
            .select_credential(model, group, &exclude, deadline_ts)
    }

    fn pool_exhausted(
        &self,
        model: &str,
        group: Option<&str>,
        eligible: &[String],
        tried: &HashSet<String>,
    ) -> Error {
        let mut reasons = self.usage.blocking_reasons(model, group, eligible);
        for id in tried {
            reasons
                .entry(id.clone())
                .or_insert_with(|| "already tried this request".to_string());
        }
        debug!(
            provider = %self.provider.name(),
            model,
            stats = %self.usage.availability_stats(model, group),
            "no available credentials"
        );
        Error::NoAvailableCredentials {
            provider: self.provider.name().to_string(),
            model: model.to_string(),
            reasons,
        }
    }

    fn request_context(
        &self,
        model: &str,
        group: Option<&str>,
        deadline: f64,
        attempt: u32,
    ) -> RequestContext {
        RequestContext {
            provider: self.provider.name().to_string(),
            model: model.to_string(),
            quota_group: group.map(str::to_string),
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline,
            attempt,
        }
    }

    async fn finish_success(
        &self,
        stable_id: &str,
        accessor: &str,
        model: &str,
        group: Option<&str>,
        response: &ProviderResponse,
    ) {
        let hook_result = self
            .provider
            .on_request_complete(CompletionEvent {
                accessor,
                model,
                success: true,
                response: Some(response),
                error: None,
            })
            .await
            .unwrap_or_default();

        let count = hook_result.count_override.unwrap_or(1);
        if count > 0 {
            let mut update = response.tokens.into_update(true, response.approx_cost);
            update.request_count = count;
            self.usage
                .record_success(stable_id, model, update, group, Some(&response.headers));
        }
        self.usage.maybe_flush().await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failure(
        &self,
        stable_id: &str,
        accessor: &str,
        model: &str,
        group: Option<&str>,
        classified: &ClassifiedError,
        attempts_on_credential: u32,
        options: &ExecuteOptions,
    ) -> FailureStep {
        debug!(
            credential = %mask_credential(accessor),
            kind = %classified.kind,
            attempt = attempts_on_credential,
            "attempt failed"
        );

        let hook_result = self
            .provider
            .on_request_complete(CompletionEvent {
                accessor,
                model,
                success: false,
                response: None,
                error: Some(classified),
            })
            .await
            .unwrap_or_default();

        self.record_failure_outcome(
            stable_id,
            model,
            group,
            classified,
            &hook_result,
            attempts_on_credential,
        );
        self.usage.maybe_flush().await;

        if classified.should_retry_same
            && attempts_on_credential < options.max_same_credential_attempts
        {
            FailureStep::RetrySame
        } else if classified.should_rotate {
            FailureStep::Rotate
        } else {
            FailureStep::Fail
        }
    }

    fn record_failure_outcome(
        &self,
        stable_id: &str,
        model: &str,
        group: Option<&str>,
        classified: &ClassifiedError,
        hook_result: &CompletionOverride,
        attempt: u32,
    ) {
        // Server errors escalate through the backoff tiers as retries on the
        // same credential pile up
        let tiered = match classified.kind {
            ErrorKind::ServerError => Some(ClassifiedError::backoff_for_attempt(
                attempt.saturating_sub(1) as usize,
            )),
            _ => classified.cooldown,
        };
        let cooldown = hook_result
            .cooldown_override
            .or(classified.retry_after)
            .or(tiered);
        let mark_exhausted = classified.mark_exhausted || hook_result.force_exhausted;
        let count = hook_result.count_override.unwrap_or(1);

        if count > 0 {
            let update = UsageUpdate {
                request_count: count,
                success: false,
                ..UsageUpdate::default()
            };
            self.usage.record_failure(
                stable_id,
                model,
                classified.kind.as_str(),
                update,
                group,
                cooldown,
                classified.quota_reset_at,
                mark_exhausted,
            );
            return;
        }

        // count_override = 0: the attempt is not counted, but cooldown and
        // exhaustion verdicts still apply
        let scope = group.or(Some(model));
        if let Some(until) = classified.quota_reset_at {
            self.usage.apply_cooldown_by_id(
                stable_id,
                classified.kind.as_str(),
                None,
                Some(until),
                scope,
                "api_quota",
            );
        } else if let Some(duration) = cooldown {
            self.usage.apply_cooldown_by_id(
                stable_id,
                classified.kind.as_str(),
                Some(duration),
                None,
                scope,
                "error",
            );
        }
        if mark_exhausted {
            self.usage.mark_exhausted_by_id(
                stable_id,
                scope.unwrap_or(model),
                classified.kind.as_str(),
            );
        }
    }

    fn wrap_stream(
        &self,
        mut inner: ChunkStream,
        guard: SlotGuard,
        stable_id: String,
        accessor: String,
        model: String,
        group: Option<String>,
    ) -> ChunkStream {
        let provider = Arc::clone(&self.provider);
        let usage = Arc::clone(&self.usage);

        let wrapped = async_stream::stream! {
            let _guard = guard;
            let mut tokens = TokenCounts::default();
            let mut failure: Option<ClassifiedError> = None;

            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(chunk_tokens) = chunk.tokens {
                            tokens = chunk_tokens;
                        }
                        yield Ok(chunk);
                    }
                    Err(err) => {
                        failure = Some(err.clone());
                        yield Err(err);
                        break;
                    }
                }
            }

            match failure {
                None => {
                    let hook_result = provider
                        .on_request_complete(CompletionEvent {
                            accessor: &accessor,
                            model: &model,
                            success: true,
                            response: None,
                            error: None,
                        })
                        .await
                        .unwrap_or_default();
                    let count = hook_result.count_override.unwrap_or(1);
                    if count > 0 {
                        let mut update = tokens.into_update(true, 0.0);
                        update.request_count = count;
                        usage.record_success(&stable_id, &model, update, group.as_deref(), None);
                    }
                }
                Some(classified) => {
                    let hook_result = provider
                        .on_request_complete(CompletionEvent {
                            accessor: &accessor,
                            model: &model,
                            success: false,
                            response: None,
                            error: Some(&classified),
                        })
                        .await
                        .unwrap_or_default();
                    let count = hook_result.count_override.unwrap_or(1);
                    if count > 0 {
                        let cooldown = hook_result
                            .cooldown_override
                            .or_else(|| classified.effective_cooldown());
                        usage.record_failure(
                            &stable_id,
                            &model,
                            classified.kind.as_str(),
                            UsageUpdate {
                                request_count: count,
                                success: false,
                                ..UsageUpdate::default()
                            },
                            group.as_deref(),
                            cooldown,
                            classified.quota_reset_at,
                            classified.mark_exhausted || hook_result.force_exhausted,
                        );
                    }
                }
            }
            usage.maybe_flush().await;
        };
        Box::pin(wrapped)
    }
}
