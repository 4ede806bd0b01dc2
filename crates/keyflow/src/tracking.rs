// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The tracking engine: sole mutator of credential state.
//!
//! All mutations happen under one `parking_lot` mutex per engine. The lock
//! is acquired, the mutation completes synchronously, and the lock is
//! released before any await; it is never held across a suspension point.
//! The limit and selection engines borrow the store under this same lock
//! for the duration of a check.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::classify::{mask_credential, RESET_TIMESTAMP_FLOOR};
use crate::config::{ProviderConfig, TrackingMode, WindowScope};
use crate::state::{
    unix_now, CooldownEntry, CredentialState, ScopedUsage, StateStore, UsageUpdate, WindowStats,
    FAIR_CYCLE_ALL_KEY, GLOBAL_COOLDOWN_KEY,
};
use crate::windows::WindowManager;

/// Outcome of [`TrackingEngine::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The credential was reserved; pair with a release
    Ok,
    /// The credential is at its concurrency cap
    AtCapacity,
}

/// Central engine for usage recording, cooldowns, and fair-cycle state
#[derive(Debug)]
pub struct TrackingEngine {
    provider: String,
    config: Arc<ProviderConfig>,
    windows: Arc<WindowManager>,
    store: Mutex<StateStore>,
}

impl TrackingEngine {
    /// Build an engine for one provider
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        config: Arc<ProviderConfig>,
        windows: Arc<WindowManager>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            windows,
            store: Mutex::new(StateStore::default()),
        }
    }

    /// The window manager this engine applies
    #[must_use]
    pub fn window_manager(&self) -> &Arc<WindowManager> {
        &self.windows
    }

    /// Lock the store. Crate-internal: callers must not hold the guard
    /// across an await.
    pub(crate) fn lock(&self) -> MutexGuard<'_, StateStore> {
        self.store.lock()
    }

    /// Create or refresh the state for a registered credential, syncing
    /// registration-time metadata
    pub fn ensure_state(
        &self,
        stable_id: &str,
        accessor: &str,
        priority: Option<i32>,
        tier: Option<String>,
        display_name: Option<String>,
    ) {
        let provider = self.provider.clone();
        let max_concurrent = priority.and_then(|p| self.config.max_concurrent_for(p));
        let mut store = self.lock();
        let state = store.state_mut(stable_id, &provider, accessor);
        state.accessor = accessor.to_string();
        if let Some(priority) = priority {
            state.priority = priority;
        }
        if tier.is_some() {
            state.tier = tier;
        }
        if display_name.is_some() {
            state.display_name = display_name;
        }
        state.max_concurrent = max_concurrent.or(state.max_concurrent);
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record usage for one request against model, group, and credential
    /// scopes atomically.
    ///
    /// The group is authoritative for window timing: after group windows are
    /// updated, `started_at`/`reset_at` are copied onto the matching model
    /// windows so every model in a pool shares one reset clock.
    pub fn record_usage(
        &self,
        stable_id: &str,
        accessor: &str,
        model: &str,
        update: &UsageUpdate,
        group: Option<&str>,
        response_headers: Option<&BTreeMap<String, String>>,
    ) {
        let provider = self.provider.clone();
        let fair_cycle_key = self.fair_cycle_key(group.unwrap_or(model));
        let mut store = self.lock();
        let state = store.state_mut(stable_id, &provider, accessor);
        let now = unix_now();

        self.apply_to_scope(state.model_usage_mut(model), update, now);

        if let Some(group) = group {
            self.apply_to_scope(state.group_usage_mut(group), update, now);
            sync_window_timing_from_group(state, model, group);
        }

        state.totals.apply(update, now);

        if self.config.fair_cycle.enabled {
            let entry = state.fair_cycle.entry(fair_cycle_key).or_default();
            entry.cycle_request_count += update.request_count;
        }

        if let Some(headers) = response_headers {
            self.update_from_headers(state, headers, model, group);
        }

        state.last_updated = now;
    }

    /// Record a successful request
    pub fn record_success(
        &self,
        stable_id: &str,
        accessor: &str,
        model: &str,
        update: UsageUpdate,
        group: Option<&str>,
        response_headers: Option<&BTreeMap<String, String>>,
    ) {
        self.record_usage(stable_id, accessor, model, &update, group, response_headers);
    }

    /// Record a failed request, optionally applying a cooldown and marking
    /// the credential exhausted for fair cycle.
    ///
    /// An explicit `quota_reset_at` timestamp wins over a relative
    /// `cooldown_duration`.
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &self,
        stable_id: &str,
        accessor: &str,
        model: &str,
        error_type: &str,
        update: UsageUpdate,
        group: Option<&str>,
        cooldown_duration: Option<f64>,
        quota_reset_at: Option<f64>,
        mark_exhausted: bool,
    ) {
        self.record_usage(stable_id, accessor, model, &update, group, None);

        let provider = self.provider.clone();
        let scope_key = group.unwrap_or(model).to_string();
        let fair_cycle_key = self.fair_cycle_key(&scope_key);
        let mut store = self.lock();
        let state = store.state_mut(stable_id, &provider, accessor);

        if let Some(until) = quota_reset_at {
            self.apply_cooldown_locked(
                state,
                error_type,
                None,
                Some(until),
                Some(&scope_key),
                "api_quota",
            );
        } else if let Some(duration) = cooldown_duration {
            if duration > 0.0 {
                self.apply_cooldown_locked(
                    state,
                    error_type,
                    Some(duration),
                    None,
                    Some(&scope_key),
                    "error",
                );
            }
        }

        if mark_exhausted {
            mark_exhausted_locked(state, &fair_cycle_key, error_type);
        }
    }

    // ========================================================================
    // Cooldowns and fair cycle
    // ========================================================================

    /// Apply a cooldown at a key. Overlapping cooldowns keep their original
    /// reason, source, and start; only `until` advances and the backoff
    /// count grows.
    pub fn apply_cooldown(
        &self,
        stable_id: &str,
        accessor: &str,
        reason: &str,
        duration: Option<f64>,
        until: Option<f64>,
        model_or_group: Option<&str>,
        source: &str,
    ) {
        let provider = self.provider.clone();
        let mut store = self.lock();
        let state = store.state_mut(stable_id, &provider, accessor);
        self.apply_cooldown_locked(state, reason, duration, until, model_or_group, source);
    }

    /// Remove the cooldown at a key, or the credential-wide one
    pub fn clear_cooldown(&self, stable_id: &str, model_or_group: Option<&str>) {
        let mut store = self.lock();
        if let Some(state) = store.credentials.get_mut(stable_id) {
            let key = model_or_group.unwrap_or(GLOBAL_COOLDOWN_KEY);
            state.cooldowns.remove(key);
        }
    }

    /// Mark a credential exhausted for fair cycle. Idempotent: a second call
    /// on an exhausted record does nothing, including no re-logging.
    pub fn mark_exhausted(&self, stable_id: &str, model_or_group: &str, reason: &str) {
        let key = self.fair_cycle_key(model_or_group);
        let mut store = self.lock();
        if let Some(state) = store.credentials.get_mut(stable_id) {
            mark_exhausted_locked(state, &key, reason);
        }
    }

    /// Clear fair-cycle exhaustion for one scope, or all scopes
    pub fn reset_fair_cycle(&self, stable_id: &str, model_or_group: Option<&str>) {
        let mut store = self.lock();
        let Some(state) = store.credentials.get_mut(stable_id) else {
            return;
        };
        match model_or_group {
            Some(scope) => {
                let key = self.fair_cycle_key(scope);
                if let Some(entry) = state.fair_cycle.get_mut(&key) {
                    entry.reset();
                }
            }
            None => {
                for entry in state.fair_cycle.values_mut() {
                    entry.reset();
                }
            }
        }
    }

    // ========================================================================
    // Concurrency accounting
    // ========================================================================

    /// Reserve a concurrency slot. Refused when the credential is at its
    /// cap; the block lifts when an in-flight request finishes.
    pub fn acquire(&self, stable_id: &str) -> Acquire {
        let mut store = self.lock();
        let Some(state) = store.credentials.get_mut(stable_id) else {
            return Acquire::AtCapacity;
        };
        if let Some(max) = state.max_concurrent {
            if state.active_requests >= max {
                return Acquire::AtCapacity;
            }
        }
        state.active_requests += 1;
        Acquire::Ok
    }

    /// Release a slot taken by [`Self::acquire`]
    pub fn release(&self, stable_id: &str) {
        let mut store = self.lock();
        if let Some(state) = store.credentials.get_mut(stable_id) {
            state.active_requests = state.active_requests.saturating_sub(1);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The fair-cycle tracking key for a model-or-group scope
    #[must_use]
    pub fn fair_cycle_key(&self, scope_key: &str) -> String {
        match self.config.fair_cycle.tracking_mode {
            TrackingMode::Credential => FAIR_CYCLE_ALL_KEY.to_string(),
            TrackingMode::ModelGroup => scope_key.to_string(),
        }
    }

    /// Request count that drives rotation weighting: the primary window at
    /// its configured scope, falling back to the credential lifetime total.
    #[must_use]
    pub fn primary_window_usage(
        &self,
        state: &CredentialState,
        model: &str,
        group: Option<&str>,
    ) -> u64 {
        primary_window_usage(&self.windows, state, model, group)
    }

    /// Remaining requests in a named window at the model or group scope
    #[must_use]
    pub fn window_remaining(
        &self,
        state: &CredentialState,
        window_name: &str,
        model: Option<&str>,
        group: Option<&str>,
    ) -> Option<u64> {
        if let Some(group) = group {
            if let Some(scoped) = state.group_usage.get(group) {
                if let Some(remaining) = self.windows.remaining(&scoped.windows, window_name) {
                    return Some(remaining);
                }
            }
        }
        if let Some(model) = model {
            if let Some(scoped) = state.model_usage.get(model) {
                return self.windows.remaining(&scoped.windows, window_name);
            }
        }
        None
    }

    // ========================================================================
    // Internal
    // ========================================================================

    /// Apply an update to every configured window in one scope map
    fn apply_to_scope(&self, scoped: &mut ScopedUsage, update: &UsageUpdate, now: f64) {
        for definition in self.windows.definitions() {
            let window = self
                .windows
                .get_or_create(&mut scoped.windows, &definition.name, None);
            apply_to_window(window, update, now);
            if window.started_at.is_none() {
                window.started_at = Some(now);
                if window.reset_at.is_none() {
                    window.reset_at = self.windows.next_reset(definition, now);
                }
            }
        }
        scoped.totals.apply(update, now);
    }

    fn apply_cooldown_locked(
        &self,
        state: &mut CredentialState,
        reason: &str,
        duration: Option<f64>,
        until: Option<f64>,
        model_or_group: Option<&str>,
        source: &str,
    ) {
        let now = unix_now();
        let cooldown_until = match (until, duration) {
            (Some(until), _) => until,
            (None, Some(duration)) => now + duration,
            (None, None) => return,
        };

        let key = model_or_group.unwrap_or(GLOBAL_COOLDOWN_KEY).to_string();

        // The first cause is the true cause: an overlapping cooldown keeps
        // its original reason, source, and start, and only the end time
        // moves (the upstream's latest estimate is authoritative).
        let (reason, source, started_at, backoff_count) = match state.cooldowns.get(&key) {
            Some(existing) if existing.is_active(now) => (
                existing.reason.clone(),
                existing.source.clone(),
                existing.started_at,
                existing.backoff_count + 1,
            ),
            _ => (reason.to_string(), source.to_string(), now, 0),
        };

        debug!(
            credential = %mask_credential(&state.accessor),
            key = %key,
            reason = %reason,
            until = cooldown_until,
            backoff_count,
            "cooldown applied"
        );

        state.cooldowns.insert(
            key,
            CooldownEntry {
                reason: reason.clone(),
                until: cooldown_until,
                started_at,
                source,
                model_or_group: model_or_group.map(str::to_string),
                backoff_count,
            },
        );

        // A cooldown long enough to span the quota period counts as
        // exhaustion for fair-cycle purposes
        if cooldown_until - now >= self.config.exhaustion_cooldown_threshold
            && self.config.fair_cycle.enabled
        {
            if let Some(scope) = model_or_group {
                let fair_cycle_key = self.fair_cycle_key(scope);
                mark_exhausted_locked(state, &fair_cycle_key, &format!("cooldown_{reason}"));
            }
        }
    }

    /// Ingest rate-limit headers into the primary window of both scopes
    fn update_from_headers(
        &self,
        state: &mut CredentialState,
        headers: &BTreeMap<String, String>,
        model: &str,
        group: Option<&str>,
    ) {
        let Some(primary) = self.windows.primary_definition().cloned() else {
            return;
        };
        let limit = headers
            .get("x-ratelimit-limit")
            .and_then(|raw| raw.trim().parse::<u64>().ok());
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .map(|value| {
                if value < RESET_TIMESTAMP_FLOOR {
                    unix_now() + value
                } else {
                    value
                }
            });
        if limit.is_none() && reset.is_none() {
            return;
        }

        if let Some(group) = group {
            if let Some(scoped) = state.group_usage.get_mut(group) {
                apply_header_values(&mut scoped.windows, &primary.name, limit, reset);
            }
        }
        if let Some(scoped) = state.model_usage.get_mut(model) {
            apply_header_values(&mut scoped.windows, &primary.name, limit, reset);
        }
    }
}

/// Request count for rotation weighting: the primary window at its
/// configured scope, falling back to the credential lifetime total
pub(crate) fn primary_window_usage(
    windows: &WindowManager,
    state: &CredentialState,
    model: &str,
    group: Option<&str>,
) -> u64 {
    if let Some(definition) = windows.primary_definition() {
        let scoped = match definition.scope {
            WindowScope::Model => state.model_usage.get(model).map(|s| &s.windows),
            WindowScope::Group => {
                let key = group.unwrap_or(model);
                state.group_usage.get(key).map(|s| &s.windows)
            }
            WindowScope::Credential => None,
        };
        if let Some(scoped) = scoped {
            if let Some(window) = windows.active(scoped, &definition.name) {
                return window.request_count;
            }
        }
    }
    state.totals.request_count
}

/// Increment a single window's counters
fn apply_to_window(window: &mut WindowStats, update: &UsageUpdate, now: f64) {
    window.request_count += update.request_count;
    if update.success {
        window.success_count += update.request_count;
    } else {
        window.failure_count += update.request_count;
    }
    window.prompt_tokens += update.prompt_tokens;
    window.completion_tokens += update.completion_tokens;
    window.thinking_tokens += update.thinking_tokens;
    window.output_tokens += update.output_tokens();
    window.cache_read_tokens += update.cache_read_tokens;
    window.cache_write_tokens += update.cache_write_tokens;
    window.total_tokens += update.total_tokens();
    window.approx_cost += update.approx_cost;

    window.last_used_at = Some(now);
    if window.first_used_at.is_none() {
        window.first_used_at = Some(now);
    }

    if window
        .max_recorded_requests
        .map_or(true, |max| window.request_count > max)
    {
        window.max_recorded_requests = Some(window.request_count);
        window.max_recorded_at = Some(now);
    }
}

/// Copy `started_at`/`reset_at` from each group window onto the matching
/// model window; the group clock is authoritative for the whole pool
fn sync_window_timing_from_group(state: &mut CredentialState, model: &str, group: &str) {
    let timings: Vec<(String, Option<f64>, Option<f64>)> = state
        .group_usage
        .get(group)
        .map(|scoped| {
            scoped
                .windows
                .iter()
                .map(|(name, w)| (name.clone(), w.started_at, w.reset_at))
                .collect()
        })
        .unwrap_or_default();

    if let Some(scoped) = state.model_usage.get_mut(model) {
        for (name, started_at, reset_at) in timings {
            if let Some(window) = scoped.windows.get_mut(&name) {
                window.started_at = started_at;
                window.reset_at = reset_at;
            }
        }
    }
}

fn apply_header_values(
    windows: &mut BTreeMap<String, WindowStats>,
    primary_name: &str,
    limit: Option<u64>,
    reset: Option<f64>,
) {
    if let Some(window) = windows.get_mut(primary_name) {
        if let Some(limit) = limit {
            window.limit = Some(limit);
        }
        if let Some(reset) = reset {
            window.reset_at = Some(reset);
        }
    }
}

fn mark_exhausted_locked(state: &mut CredentialState, tracking_key: &str, reason: &str) {
    let entry = state
        .fair_cycle
        .entry(tracking_key.to_string())
        .or_default();
    if entry.exhausted {
        return;
    }
    entry.exhausted = true;
    entry.exhausted_at = Some(unix_now());
    entry.exhausted_reason = Some(reason.to_string());
    info!(
        credential = %mask_credential(&state.accessor),
        scope = %tracking_key,
        reason = %reason,
        "credential marked fair-cycle exhausted"
    );
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairCycleConfig, WindowDefinition, WindowScope};

    fn engine(config: ProviderConfig) -> TrackingEngine {
        let windows = Arc::new(WindowManager::new(
            &config.windows,
            &config.daily_reset_time_utc,
        ));
        TrackingEngine::new("acme", Arc::new(config), windows)
    }

    fn windowed_config() -> ProviderConfig {
        ProviderConfig {
            windows: vec![
                WindowDefinition::rolling("5h", 5.0 * 3600.0, WindowScope::Group).primary(),
                WindowDefinition::fixed_daily("daily", WindowScope::Group),
            ],
            ..ProviderConfig::default()
        }
    }

    fn token_update() -> UsageUpdate {
        UsageUpdate {
            request_count: 1,
            success: true,
            prompt_tokens: 100,
            completion_tokens: 40,
            thinking_tokens: 10,
            cache_read_tokens: 25,
            cache_write_tokens: 5,
            approx_cost: 0.01,
        }
    }

    #[test]
    fn test_record_usage_hits_all_three_scopes() {
        let engine = engine(windowed_config());
        engine.record_usage("sid", "sk-a", "acme-large", &token_update(), Some("pool"), None);

        let store = engine.lock();
        let state = &store.credentials["sid"];

        assert_eq!(state.totals.request_count, 1);
        assert_eq!(state.totals.output_tokens, 50);
        assert_eq!(state.totals.total_tokens, 180);

        let model = &state.model_usage["acme-large"];
        assert_eq!(model.totals.request_count, 1);
        assert_eq!(model.windows["5h"].request_count, 1);
        assert_eq!(model.windows["daily"].request_count, 1);

        let group = &state.group_usage["pool"];
        assert_eq!(group.windows["5h"].total_tokens, 180);
    }

    #[test]
    fn test_group_is_authoritative_for_window_timing() {
        let engine = engine(windowed_config());
        engine.record_usage("sid", "sk-a", "acme-large", &token_update(), Some("pool"), None);
        engine.record_usage("sid", "sk-a", "acme-small", &token_update(), Some("pool"), None);

        let store = engine.lock();
        let state = &store.credentials["sid"];
        let group = &state.group_usage["pool"];
        for model in ["acme-large", "acme-small"] {
            let model_usage = &state.model_usage[model];
            for name in ["5h", "daily"] {
                assert_eq!(
                    model_usage.windows[name].started_at, group.windows[name].started_at,
                    "window {name} of {model}"
                );
                assert_eq!(
                    model_usage.windows[name].reset_at, group.windows[name].reset_at,
                    "window {name} of {model}"
                );
            }
        }
    }

    #[test]
    fn test_first_use_stamps_timing() {
        let engine = engine(windowed_config());
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), Some("g"), None);

        let store = engine.lock();
        let window = &store.credentials["sid"].group_usage["g"].windows["5h"];
        let started = window.started_at.unwrap();
        assert_eq!(window.reset_at.unwrap(), started + 5.0 * 3600.0);
    }

    #[test]
    fn test_failure_counts() {
        let engine = engine(windowed_config());
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::failure(), None, None);
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), None, None);

        let store = engine.lock();
        let state = &store.credentials["sid"];
        assert_eq!(state.totals.request_count, 2);
        assert_eq!(state.totals.success_count, 1);
        assert_eq!(state.totals.failure_count, 1);
    }

    #[test]
    fn test_cooldown_preserves_first_cause() {
        let engine = engine(ProviderConfig::default());
        engine.apply_cooldown("sid", "sk-a", "rate_limit", Some(60.0), None, Some("g"), "error");

        let first_started_at = {
            let store = engine.lock();
            let cooldown = &store.credentials["sid"].cooldowns["g"];
            assert_eq!(cooldown.reason, "rate_limit");
            assert_eq!(cooldown.backoff_count, 0);
            cooldown.started_at
        };

        engine.apply_cooldown("sid", "sk-a", "quota_exceeded", Some(600.0), None, Some("g"), "api");
        engine.apply_cooldown("sid", "sk-a", "server_error", Some(900.0), None, Some("g"), "error");

        let store = engine.lock();
        let cooldown = &store.credentials["sid"].cooldowns["g"];
        assert_eq!(cooldown.reason, "rate_limit");
        assert_eq!(cooldown.source, "error");
        assert_eq!(cooldown.started_at, first_started_at);
        assert_eq!(cooldown.backoff_count, 2);
        assert!(cooldown.remaining(unix_now()) > 800.0);
    }

    #[test]
    fn test_long_cooldown_promotes_to_exhaustion() {
        let config = ProviderConfig {
            fair_cycle: FairCycleConfig {
                enabled: true,
                ..FairCycleConfig::default()
            },
            exhaustion_cooldown_threshold: 1800.0,
            ..ProviderConfig::default()
        };
        let engine = engine(config);

        // Short cooldown: no exhaustion
        engine.apply_cooldown("sid", "sk-a", "rate_limit", Some(60.0), None, Some("g"), "error");
        assert!(!engine.lock().credentials["sid"].is_fair_cycle_exhausted("g"));

        // Threshold-length cooldown: exhausted with a derived reason
        engine.clear_cooldown("sid", Some("g"));
        engine.apply_cooldown("sid", "sk-a", "quota_exceeded", Some(3600.0), None, Some("g"), "api");
        let store = engine.lock();
        let entry = &store.credentials["sid"].fair_cycle["g"];
        assert!(entry.exhausted);
        assert_eq!(entry.exhausted_reason.as_deref(), Some("cooldown_quota_exceeded"));
    }

    #[test]
    fn test_global_cooldown_has_no_exhaustion_scope() {
        let config = ProviderConfig {
            fair_cycle: FairCycleConfig {
                enabled: true,
                ..FairCycleConfig::default()
            },
            ..ProviderConfig::default()
        };
        let engine = engine(config);
        engine.apply_cooldown("sid", "sk-a", "admin", Some(86_400.0), None, None, "admin");

        let store = engine.lock();
        let state = &store.credentials["sid"];
        assert!(state.cooldowns.contains_key(GLOBAL_COOLDOWN_KEY));
        assert!(state.fair_cycle.is_empty());
    }

    #[test]
    fn test_mark_exhausted_is_idempotent() {
        let engine = engine(ProviderConfig::default());
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), None, None);
        engine.mark_exhausted("sid", "g", "quota_exceeded");
        let first_at = engine.lock().credentials["sid"].fair_cycle["g"].exhausted_at;

        engine.mark_exhausted("sid", "g", "another_reason");
        let store = engine.lock();
        let entry = &store.credentials["sid"].fair_cycle["g"];
        assert_eq!(entry.exhausted_at, first_at);
        assert_eq!(entry.exhausted_reason.as_deref(), Some("quota_exceeded"));
    }

    #[test]
    fn test_reset_fair_cycle_scopes() {
        let engine = engine(ProviderConfig::default());
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), None, None);
        engine.mark_exhausted("sid", "g1", "quota");
        engine.mark_exhausted("sid", "g2", "quota");

        engine.reset_fair_cycle("sid", Some("g1"));
        {
            let store = engine.lock();
            assert!(!store.credentials["sid"].is_fair_cycle_exhausted("g1"));
            assert!(store.credentials["sid"].is_fair_cycle_exhausted("g2"));
        }

        engine.reset_fair_cycle("sid", None);
        let store = engine.lock();
        assert!(!store.credentials["sid"].is_fair_cycle_exhausted("g2"));
    }

    #[test]
    fn test_credential_tracking_mode_uses_sentinel() {
        let config = ProviderConfig {
            fair_cycle: FairCycleConfig {
                enabled: true,
                tracking_mode: TrackingMode::Credential,
                ..FairCycleConfig::default()
            },
            ..ProviderConfig::default()
        };
        let engine = engine(config);
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), Some("g"), None);

        let store = engine.lock();
        let state = &store.credentials["sid"];
        assert!(state.fair_cycle.contains_key(FAIR_CYCLE_ALL_KEY));
        assert!(!state.fair_cycle.contains_key("g"));
    }

    #[test]
    fn test_acquire_respects_cap_and_release() {
        let engine = engine(ProviderConfig::default());
        engine.ensure_state("sid", "sk-a", Some(1), None, None);
        {
            let mut store = engine.lock();
            store.credentials.get_mut("sid").unwrap().max_concurrent = Some(2);
        }

        assert_eq!(engine.acquire("sid"), Acquire::Ok);
        assert_eq!(engine.acquire("sid"), Acquire::Ok);
        assert_eq!(engine.acquire("sid"), Acquire::AtCapacity);

        engine.release("sid");
        assert_eq!(engine.acquire("sid"), Acquire::Ok);
    }

    #[test]
    fn test_header_ingestion_updates_primary_window() {
        let engine = engine(windowed_config());
        let mut headers = BTreeMap::new();
        headers.insert("x-ratelimit-limit".to_string(), "200".to_string());
        headers.insert("x-ratelimit-reset".to_string(), "3600".to_string());

        engine.record_usage(
            "sid",
            "sk-a",
            "m",
            &UsageUpdate::success(),
            Some("g"),
            Some(&headers),
        );

        let store = engine.lock();
        let state = &store.credentials["sid"];
        let now = unix_now();
        for windows in [
            &state.group_usage["g"].windows,
            &state.model_usage["m"].windows,
        ] {
            let primary = &windows["5h"];
            assert_eq!(primary.limit, Some(200));
            // Relative reset seconds become an absolute timestamp
            let reset = primary.reset_at.unwrap();
            assert!((reset - now - 3600.0).abs() < 5.0);
            // Non-primary windows are untouched
            assert_eq!(windows["daily"].limit, None);
        }
    }

    #[test]
    fn test_primary_window_usage_fallback_to_totals() {
        let engine = engine(ProviderConfig::default());
        engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), None, None);
        let store = engine.lock();
        let state = &store.credentials["sid"];
        // No windows configured: the lifetime total drives weighting
        assert_eq!(engine.primary_window_usage(state, "m", None), 1);
    }

    #[test]
    fn test_primary_window_usage_group_scope() {
        let engine = engine(windowed_config());
        for _ in 0..3 {
            engine.record_usage("sid", "sk-a", "m", &UsageUpdate::success(), Some("g"), None);
        }
        // A different model in the same group shares the pool count
        let store = engine.lock();
        let state = &store.credentials["sid"];
        assert_eq!(engine.primary_window_usage(state, "other-model", Some("g")), 3);
    }
}
