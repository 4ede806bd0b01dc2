// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The per-provider usage manager.
//!
//! A [`UsageManager`] owns one provider's whole rotation state: the
//! credential registry binding, the window manager, the tracking engine
//! (and its lock), the limit and selection engines, and the storage that
//! persists it all. It is the facade the executor drives and the surface
//! exposed to admin callers and background refresh hooks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::config::ProviderConfig;
use crate::identity::CredentialRegistry;
use crate::limits::LimitEngine;
use crate::selection::{AvailabilityStats, SelectionEngine};
use crate::state::{unix_now, CredentialState, UsageUpdate};
use crate::storage::{UsageSnapshot, UsageStorage};
use crate::tracking::{Acquire, TrackingEngine};
use crate::windows::WindowManager;

/// Usage tracking, limit enforcement, and credential selection for one
/// provider
pub struct UsageManager {
    provider: String,
    config: Arc<ProviderConfig>,
    registry: Arc<CredentialRegistry>,
    tracking: TrackingEngine,
    selection: SelectionEngine,
    storage: Option<UsageStorage>,
}

impl UsageManager {
    /// Build a manager for one provider. `storage_path` of `None` keeps the
    /// state purely in memory.
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        config: ProviderConfig,
        registry: Arc<CredentialRegistry>,
        storage_path: Option<&Path>,
    ) -> Self {
        let provider = provider.into();
        let config = Arc::new(config);
        let windows = Arc::new(WindowManager::new(
            &config.windows,
            &config.daily_reset_time_utc,
        ));
        let limits = Arc::new(LimitEngine::new(Arc::clone(&config), Arc::clone(&windows)));
        let tracking = TrackingEngine::new(&provider, Arc::clone(&config), Arc::clone(&windows));
        let selection = SelectionEngine::new(&provider, Arc::clone(&config), limits, windows);
        let storage = storage_path.map(UsageStorage::new);

        Self {
            provider,
            config,
            registry,
            tracking,
            selection,
            storage,
        }
    }

    /// Provider name
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Rotation configuration
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    // ========================================================================
    // Registration and persistence
    // ========================================================================

    /// Register a credential accessor, creating its state lazily. Returns
    /// the stable ID.
    pub fn register_credential(
        &self,
        accessor: &str,
        priority: Option<i32>,
        tier: Option<String>,
        display_name: Option<String>,
    ) -> String {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        self.registry.update_metadata(
            accessor,
            &self.provider,
            tier.clone(),
            priority,
            display_name.clone(),
        );
        self.tracking
            .ensure_state(&stable_id, accessor, priority, tier, display_name);
        stable_id
    }

    /// Load persisted state from storage, if configured. Never fails:
    /// corrupt or missing files start empty.
    pub fn load_from_storage(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(snapshot) = storage.load() else {
            return;
        };

        self.registry
            .restore_accessor_index(&snapshot.accessor_index, &self.provider);

        let mut store = self.tracking.lock();
        for (stable_id, state) in snapshot.credentials {
            store.credentials.insert(stable_id, state);
        }
        if let Some(cycles) = snapshot.fair_cycle_global.get(&self.provider) {
            for (key, cycle) in cycles {
                store.global_cycles.insert(key.clone(), cycle.clone());
            }
        }
    }

    /// Build a snapshot of the current state
    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::empty();
        snapshot.accessor_index = self.registry.accessor_index();
        let store = self.tracking.lock();
        snapshot.credentials = store
            .credentials
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect();
        snapshot.fair_cycle_global.insert(
            self.provider.clone(),
            store
                .global_cycles
                .iter()
                .map(|(key, cycle)| (key.clone(), cycle.clone()))
                .collect(),
        );
        snapshot
    }

    /// Write a snapshot when the coalescing policy says one is due. Errors
    /// are logged and swallowed; the next call retries.
    pub async fn maybe_flush(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if !storage.flush_due() {
            return;
        }
        let snapshot = self.snapshot();
        if let Err(err) = storage.write(&snapshot).await {
            warn!(provider = %self.provider, %err, "usage snapshot write failed, will retry");
        }
    }

    /// Unconditionally write pending state; called at shutdown
    pub async fn flush(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if !storage.dirty() {
            return;
        }
        let snapshot = self.snapshot();
        if let Err(err) = storage.write(&snapshot).await {
            warn!(provider = %self.provider, %err, "final usage snapshot write failed");
        }
    }

    // ========================================================================
    // Selection and concurrency (driven by the executor)
    // ========================================================================

    /// Select a credential for a request, excluding the given stable IDs.
    /// Returns the stable ID and its current accessor.
    pub fn select_credential(
        &self,
        model: &str,
        quota_group: Option<&str>,
        exclude: &HashSet<String>,
        deadline: f64,
    ) -> Option<(String, String)> {
        let mut store = self.tracking.lock();
        let stable_id = self
            .selection
            .select(&mut store, model, quota_group, exclude, None, deadline)?;
        let accessor = store
            .credentials
            .get(&stable_id)
            .map(|state| state.accessor.clone())
            .or_else(|| self.registry.accessor_for(&stable_id))?;
        Some((stable_id, accessor))
    }

    /// Reserve a concurrency slot on a credential
    pub fn acquire(&self, stable_id: &str) -> bool {
        self.tracking.acquire(stable_id) == Acquire::Ok
    }

    /// Release a slot taken by [`Self::acquire`]
    pub fn release(&self, stable_id: &str) {
        self.tracking.release(stable_id);
    }

    /// Evict the sequential strategy's sticky binding for a scope
    pub fn evict_sticky(&self, model_or_group: &str) {
        self.selection.mark_exhausted(model_or_group);
    }

    // ========================================================================
    // Recording (driven by the executor)
    // ========================================================================

    /// Record a successful request
    pub fn record_success(
        &self,
        stable_id: &str,
        model: &str,
        update: UsageUpdate,
        quota_group: Option<&str>,
        response_headers: Option<&BTreeMap<String, String>>,
    ) {
        let accessor = self.accessor_of(stable_id);
        self.tracking.record_success(
            stable_id,
            &accessor,
            model,
            update,
            quota_group,
            response_headers,
        );
        self.note_mutation();
    }

    /// Record a failed request with its cooldown and exhaustion outcome
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &self,
        stable_id: &str,
        model: &str,
        error_type: &str,
        update: UsageUpdate,
        quota_group: Option<&str>,
        cooldown_duration: Option<f64>,
        quota_reset_at: Option<f64>,
        mark_exhausted: bool,
    ) {
        let accessor = self.accessor_of(stable_id);
        self.tracking.record_failure(
            stable_id,
            &accessor,
            model,
            error_type,
            update,
            quota_group,
            cooldown_duration,
            quota_reset_at,
            mark_exhausted,
        );
        self.note_mutation();
    }

    // ========================================================================
    // Admin API (by accessor)
    // ========================================================================

    /// Apply a manual cooldown to a credential
    pub fn apply_cooldown(
        &self,
        accessor: &str,
        duration: f64,
        reason: &str,
        model_or_group: Option<&str>,
    ) {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        self.tracking.apply_cooldown(
            &stable_id,
            accessor,
            reason,
            Some(duration),
            None,
            model_or_group,
            "admin",
        );
        self.note_mutation();
    }

    /// Clear a cooldown from a credential
    pub fn clear_cooldown(&self, accessor: &str, model_or_group: Option<&str>) {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        self.tracking.clear_cooldown(&stable_id, model_or_group);
        self.note_mutation();
    }

    /// Mark a credential fair-cycle exhausted
    pub fn mark_exhausted(&self, accessor: &str, model_or_group: &str, reason: &str) {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        self.tracking
            .mark_exhausted(&stable_id, model_or_group, reason);
        self.note_mutation();
    }

    /// Apply a cooldown by stable ID, used by the executor for uncounted
    /// attempts whose cooldown verdict still stands
    pub fn apply_cooldown_by_id(
        &self,
        stable_id: &str,
        reason: &str,
        duration: Option<f64>,
        until: Option<f64>,
        model_or_group: Option<&str>,
        source: &str,
    ) {
        let accessor = self.accessor_of(stable_id);
        self.tracking.apply_cooldown(
            stable_id,
            &accessor,
            reason,
            duration,
            until,
            model_or_group,
            source,
        );
        self.note_mutation();
    }

    /// Mark a credential fair-cycle exhausted by stable ID
    pub fn mark_exhausted_by_id(&self, stable_id: &str, model_or_group: &str, reason: &str) {
        self.tracking
            .mark_exhausted(stable_id, model_or_group, reason);
        self.note_mutation();
    }

    /// Update a window's limit baseline, e.g. from a background quota
    /// refresh
    pub fn set_window_limit(
        &self,
        accessor: &str,
        window_name: &str,
        limit: u64,
        model: Option<&str>,
        quota_group: Option<&str>,
    ) {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        let windows = Arc::clone(self.tracking.window_manager());
        let mut store = self.tracking.lock();
        let Some(state) = store.credentials.get_mut(&stable_id) else {
            return;
        };
        if let Some(group) = quota_group {
            let scoped = state.group_usage_mut(group);
            windows.get_or_create(&mut scoped.windows, window_name, Some(limit));
            windows.update_limit(&mut scoped.windows, window_name, limit);
        }
        if let Some(model) = model {
            let scoped = state.model_usage_mut(model);
            windows.get_or_create(&mut scoped.windows, window_name, Some(limit));
            windows.update_limit(&mut scoped.windows, window_name, limit);
        }
        drop(store);
        self.note_mutation();
    }

    /// Remaining requests in a window for a credential
    #[must_use]
    pub fn window_remaining(
        &self,
        accessor: &str,
        window_name: &str,
        model: Option<&str>,
        quota_group: Option<&str>,
    ) -> Option<u64> {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        let store = self.tracking.lock();
        let state = store.credentials.get(&stable_id)?;
        self.tracking
            .window_remaining(state, window_name, model, quota_group)
    }

    /// A point-in-time copy of one credential's state
    #[must_use]
    pub fn state_snapshot(&self, accessor: &str) -> Option<CredentialState> {
        let stable_id = self.registry.stable_id(accessor, &self.provider);
        self.tracking.lock().credentials.get(&stable_id).cloned()
    }

    /// Point-in-time copies of all credential states
    #[must_use]
    pub fn all_states(&self) -> HashMap<String, CredentialState> {
        self.tracking
            .lock()
            .credentials
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    /// Availability summary for a (model, group)
    #[must_use]
    pub fn availability_stats(&self, model: &str, quota_group: Option<&str>) -> AvailabilityStats {
        let mut store = self.tracking.lock();
        self.selection
            .availability_stats(&mut store, model, quota_group)
    }

    /// Per-candidate blocking reasons for a (model, group)
    #[must_use]
    pub fn blocking_reasons(
        &self,
        model: &str,
        quota_group: Option<&str>,
        candidates: &[String],
    ) -> BTreeMap<String, String> {
        let mut store = self.tracking.lock();
        self.selection
            .blocking_reasons(&mut store, model, quota_group, candidates)
    }

    /// All stable IDs currently known to this manager
    #[must_use]
    pub fn known_stable_ids(&self) -> Vec<String> {
        self.tracking.lock().credentials.keys().cloned().collect()
    }

    /// The deadline a request started now would carry
    #[must_use]
    pub fn default_deadline(&self) -> f64 {
        unix_now() + crate::config::DEFAULT_GLOBAL_TIMEOUT
    }

    fn accessor_of(&self, stable_id: &str) -> String {
        self.registry
            .accessor_for(stable_id)
            .unwrap_or_else(|| stable_id.to_string())
    }

    fn note_mutation(&self) {
        if let Some(storage) = &self.storage {
            storage.note_mutation();
        }
    }
}
