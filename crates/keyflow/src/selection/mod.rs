// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Credential selection.
//!
//! The [`SelectionEngine`] filters candidates through the limit engine,
//! hands the survivors to the active rotation strategy, and - when the pool
//! comes back empty because of fair-cycle exhaustion - decides whether to
//! reset the cycle and retry once.

mod balanced;
mod sequential;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ProviderConfig, RotationMode, TrackingMode};
use crate::limits::{BlockKind, CheckRequest, LimitEngine, LimitVerdict};
use crate::state::{unix_now, StateStore, FAIR_CYCLE_ALL_KEY, GLOBAL_COOLDOWN_KEY};
use crate::tracking::primary_window_usage;
use crate::windows::WindowManager;

pub use balanced::BalancedStrategy;
pub use sequential::SequentialStrategy;

/// Everything a rotation strategy sees for one selection
#[derive(Debug, Clone)]
pub struct SelectionContext {
    /// Provider name
    pub provider: String,
    /// Model being requested
    pub model: String,
    /// Quota group for the model, if any
    pub quota_group: Option<String>,
    /// Allowed candidates, in stable order
    pub candidates: Vec<String>,
    /// Stable ID -> priority
    pub priorities: HashMap<String, i32>,
    /// Stable ID -> primary-window request count
    pub usage_counts: HashMap<String, u64>,
    /// Active rotation mode
    pub rotation_mode: RotationMode,
    /// Balanced-strategy tolerance
    pub rotation_tolerance: f64,
    /// Request deadline, unix seconds
    pub deadline: f64,
}

impl SelectionContext {
    /// Priority of a candidate; unknown candidates sort last
    #[must_use]
    pub fn priority_of(&self, stable_id: &str) -> i32 {
        self.priorities.get(stable_id).copied().unwrap_or(999)
    }

    /// Primary-window usage of a candidate
    #[must_use]
    pub fn usage_of(&self, stable_id: &str) -> u64 {
        self.usage_counts.get(stable_id).copied().unwrap_or(0)
    }

    /// Sticky-map key: the quota group, or the model when ungrouped
    #[must_use]
    pub fn sticky_key(&self) -> String {
        self.quota_group
            .clone()
            .unwrap_or_else(|| self.model.clone())
    }
}

/// Credential availability summary for one (model, group)
#[derive(Debug, Clone, Default)]
pub struct AvailabilityStats {
    /// Total credentials known to the provider
    pub total: usize,
    /// Credentials passing every limit right now
    pub available: usize,
    /// Blocker name -> count of credentials it blocked first
    pub blocked_by: BTreeMap<&'static str, usize>,
    /// Active rotation mode
    pub rotation_mode: RotationMode,
}

impl AvailabilityStats {
    /// Credentials blocked by anything
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.total - self.available
    }
}

impl std::fmt::Display for AvailabilityStats {
    /// Compact log form: `2/5,cd:2,fc:1`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.available, self.total)?;
        for (label, kind) in [
            ("cd", BlockKind::Cooldown),
            ("win", BlockKind::Window),
            ("cap", BlockKind::CustomCap),
            ("fc", BlockKind::FairCycle),
            ("conc", BlockKind::Concurrent),
        ] {
            if let Some(count) = self.blocked_by.get(kind.as_str()) {
                if *count > 0 {
                    write!(f, ",{label}:{count}")?;
                }
            }
        }
        Ok(())
    }
}

/// Picks one credential out of many to service a request
pub struct SelectionEngine {
    provider: String,
    config: Arc<ProviderConfig>,
    limits: Arc<LimitEngine>,
    windows: Arc<WindowManager>,
    balanced: BalancedStrategy,
    sequential: SequentialStrategy,
}

impl SelectionEngine {
    /// Build an engine for one provider
    #[must_use]
    pub fn new(
        provider: impl Into<String>,
        config: Arc<ProviderConfig>,
        limits: Arc<LimitEngine>,
        windows: Arc<WindowManager>,
    ) -> Self {
        let balanced = BalancedStrategy::new(config.rotation_tolerance);
        Self {
            provider: provider.into(),
            config,
            limits,
            windows,
            balanced,
            sequential: SequentialStrategy::new(),
        }
    }

    /// Select the best available credential, or `None` when every candidate
    /// is blocked.
    ///
    /// Runs under the tracking-engine lock (the caller passes the locked
    /// store). When the pool is empty and fair cycle is enabled, a reset is
    /// attempted and the filter re-runs exactly once.
    pub fn select(
        &self,
        store: &mut StateStore,
        model: &str,
        quota_group: Option<&str>,
        exclude: &HashSet<String>,
        priority_overrides: Option<&HashMap<String, i32>>,
        deadline: f64,
    ) -> Option<String> {
        let mut candidates: Vec<String> = store
            .credentials
            .keys()
            .filter(|id| !exclude.contains(*id))
            .cloned()
            .collect();
        candidates.sort();
        if candidates.is_empty() {
            return None;
        }

        let mut attempted_reset = false;
        loop {
            let available = self.filter_allowed(store, model, quota_group, &candidates);

            if available.is_empty() {
                if !attempted_reset
                    && self.config.fair_cycle.enabled
                    && self.try_fair_cycle_reset(
                        store,
                        model,
                        quota_group,
                        &candidates,
                        priority_overrides,
                    )
                {
                    attempted_reset = true;
                    continue;
                }
                debug!(
                    provider = %self.provider,
                    model,
                    candidates = candidates.len(),
                    "no available credentials, all blocked by limits"
                );
                return None;
            }

            let mut priorities = HashMap::new();
            let mut usage_counts = HashMap::new();
            for id in &available {
                let Some(state) = store.credentials.get(id) else {
                    continue;
                };
                let priority = priority_overrides
                    .and_then(|overrides| overrides.get(id).copied())
                    .unwrap_or(state.priority);
                priorities.insert(id.clone(), priority);
                usage_counts.insert(
                    id.clone(),
                    primary_window_usage(&self.windows, state, model, quota_group),
                );
            }

            let context = SelectionContext {
                provider: self.provider.clone(),
                model: model.to_string(),
                quota_group: quota_group.map(str::to_string),
                candidates: available,
                priorities,
                usage_counts,
                rotation_mode: self.config.rotation_mode,
                rotation_tolerance: self.config.rotation_tolerance,
                deadline: if deadline > 0.0 {
                    deadline
                } else {
                    unix_now() + crate::config::DEFAULT_GLOBAL_TIMEOUT
                },
            };

            let selected = match self.config.rotation_mode {
                RotationMode::Balanced => self.balanced.select(&context, store),
                RotationMode::Sequential => self.sequential.select(&context, store),
            };
            if let Some(selected) = &selected {
                debug!(
                    provider = %self.provider,
                    model,
                    candidates = context.candidates.len(),
                    selected = %crate::classify::mask_credential(selected),
                    "credential selected"
                );
            }
            return selected;
        }
    }

    /// Availability summary for status reporting. Each blocked credential is
    /// attributed to the first checker that blocked it.
    pub fn availability_stats(
        &self,
        store: &mut StateStore,
        model: &str,
        quota_group: Option<&str>,
    ) -> AvailabilityStats {
        let mut stats = AvailabilityStats {
            total: store.credentials.len(),
            rotation_mode: self.config.rotation_mode,
            ..AvailabilityStats::default()
        };

        let now = unix_now();
        let StateStore {
            credentials,
            global_cycles,
        } = store;
        for state in credentials.values_mut() {
            let request = CheckRequest {
                model,
                group: quota_group,
                now,
                global_cycles,
            };
            match self.limits.check(state, &request) {
                LimitVerdict::Allowed => stats.available += 1,
                LimitVerdict::Blocked { kind, .. } => {
                    *stats.blocked_by.entry(kind.as_str()).or_default() += 1;
                }
            }
        }
        stats
    }

    /// The per-candidate blocking reasons, for `NoAvailableCredentials`
    pub fn blocking_reasons(
        &self,
        store: &mut StateStore,
        model: &str,
        quota_group: Option<&str>,
        candidates: &[String],
    ) -> BTreeMap<String, String> {
        let now = unix_now();
        let mut reasons = BTreeMap::new();
        let StateStore {
            credentials,
            global_cycles,
        } = store;
        for id in candidates {
            let Some(state) = credentials.get_mut(id) else {
                continue;
            };
            let request = CheckRequest {
                model,
                group: quota_group,
                now,
                global_cycles,
            };
            if let LimitVerdict::Blocked { reason, .. } = self.limits.check(state, &request) {
                reasons.insert(id.clone(), reason);
            }
        }
        reasons
    }

    /// Evict the sequential strategy's sticky binding for a scope (called on
    /// quota failures so the next request moves on)
    pub fn mark_exhausted(&self, model_or_group: &str) {
        self.sequential.mark_exhausted(model_or_group);
    }

    /// The sequential strategy, for inspection
    #[must_use]
    pub fn sequential(&self) -> &SequentialStrategy {
        &self.sequential
    }

    fn filter_allowed(
        &self,
        store: &mut StateStore,
        model: &str,
        quota_group: Option<&str>,
        candidates: &[String],
    ) -> Vec<String> {
        let now = unix_now();
        let mut available = Vec::new();
        let StateStore {
            credentials,
            global_cycles,
        } = store;
        for id in candidates {
            let Some(state) = credentials.get_mut(id) else {
                continue;
            };
            let request = CheckRequest {
                model,
                group: quota_group,
                now,
                global_cycles,
            };
            if self.limits.check(state, &request).is_allowed() {
                available.push(id.clone());
            }
        }
        available
    }

    /// Reset the fair cycle when an entire tier is exhausted.
    ///
    /// Split candidates by priority tier (or treat them as one pool when
    /// `cross_tier` is set). A tier resets only when every member is
    /// fair-cycle exhausted and no member's remaining cooldown is shorter
    /// than `reset_cooldown_threshold` - a short cooldown means natural
    /// expiry will free a credential sooner than a reset would.
    fn try_fair_cycle_reset(
        &self,
        store: &mut StateStore,
        model: &str,
        quota_group: Option<&str>,
        candidates: &[String],
        priority_overrides: Option<&HashMap<String, i32>>,
    ) -> bool {
        let now = unix_now();
        let scope_key = quota_group.unwrap_or(model);
        let tracking_key = match self.config.fair_cycle.tracking_mode {
            TrackingMode::Credential => FAIR_CYCLE_ALL_KEY.to_string(),
            TrackingMode::ModelGroup => scope_key.to_string(),
        };

        // Only worth considering when fair-cycle exhaustion is implicated.
        // The exhausted flag is what matters: a credential whose long quota
        // cooldown marked it exhausted reports the cooldown as its blocker,
        // but it still belongs to the cycle.
        let any_exhausted = candidates.iter().any(|id| {
            store
                .credentials
                .get(id)
                .is_some_and(|state| state.is_fair_cycle_exhausted(&tracking_key))
        });
        if !any_exhausted {
            return false;
        }

        // Tier split (a single pool when cross_tier is on)
        let mut tiers: BTreeMap<i32, Vec<String>> = BTreeMap::new();
        for id in candidates {
            let Some(state) = store.credentials.get(id) else {
                continue;
            };
            let priority = if self.config.fair_cycle.cross_tier {
                0
            } else {
                priority_overrides
                    .and_then(|overrides| overrides.get(id).copied())
                    .unwrap_or(state.priority)
            };
            tiers.entry(priority).or_default().push(id.clone());
        }

        let mut reset_any = false;
        for (tier, members) in tiers {
            let all_exhausted = members.iter().all(|id| {
                store
                    .credentials
                    .get(id)
                    .is_some_and(|state| state.is_fair_cycle_exhausted(&tracking_key))
            });
            if !all_exhausted {
                continue;
            }

            if let Some((id, remaining)) = self.shortest_cooldown(store, &members, scope_key, now) {
                if remaining < self.config.fair_cycle.reset_cooldown_threshold {
                    debug!(
                        provider = %self.provider,
                        model,
                        tier,
                        credential = %crate::classify::mask_credential(&id),
                        remaining_secs = remaining as u64,
                        "skipping fair-cycle reset, a short cooldown expires first"
                    );
                    continue;
                }
            }

            for id in &members {
                if let Some(state) = store.credentials.get_mut(id) {
                    if let Some(entry) = state.fair_cycle.get_mut(&tracking_key) {
                        entry.reset();
                    }
                    // The exhaustion cooldowns belong to the finished cycle;
                    // a reset re-admits the tier in full
                    state.cooldowns.remove(scope_key);
                    state.cooldowns.remove(GLOBAL_COOLDOWN_KEY);
                }
            }
            let cycle = store.global_cycle_mut(&tracking_key, now);
            cycle.cycle_start = now;
            cycle.all_exhausted_at = None;
            cycle.cycle_count += 1;
            info!(
                provider = %self.provider,
                model,
                tier,
                cycle = cycle.cycle_count,
                "fair cycle reset, all tier credentials were exhausted"
            );
            reset_any = true;
        }
        reset_any
    }

    /// The shortest remaining cooldown among members, consulting the scope
    /// key and the credential-wide key
    fn shortest_cooldown(
        &self,
        store: &StateStore,
        members: &[String],
        scope_key: &str,
        now: f64,
    ) -> Option<(String, f64)> {
        let mut shortest: Option<(String, f64)> = None;
        for id in members {
            let Some(state) = store.credentials.get(id) else {
                continue;
            };
            for key in [scope_key, GLOBAL_COOLDOWN_KEY] {
                if let Some(cooldown) = state.active_cooldown(key, now) {
                    let remaining = cooldown.remaining(now);
                    if shortest
                        .as_ref()
                        .map_or(true, |(_, best)| remaining < *best)
                    {
                        shortest = Some((id.clone(), remaining));
                    }
                }
            }
        }
        shortest
    }
}
