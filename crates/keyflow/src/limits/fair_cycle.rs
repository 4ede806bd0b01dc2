// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fair-cycle checker.
//!
//! When many credentials share one provider quota, fair cycle bars a
//! credential that has burned its share until the whole peer set is
//! exhausted; the selection engine then resets the tier and the cycle
//! starts over. Exhaustion is flagged explicitly (quota errors, long
//! cooldowns) or promoted in-band here when the per-cycle request count
//! crosses the quota threshold.

use std::sync::Arc;

use tracing::info;

use super::{BlockKind, CheckRequest, LimitChecker, LimitVerdict};
use crate::classify::mask_credential;
use crate::config::{FairCycleConfig, TrackingMode, WindowScope};
use crate::state::{CredentialState, FAIR_CYCLE_ALL_KEY};
use crate::windows::WindowManager;

/// Blocks fair-cycle-exhausted credentials until their cycle expires
pub struct FairCycleChecker {
    config: FairCycleConfig,
    windows: Arc<WindowManager>,
}

impl FairCycleChecker {
    /// Build a checker over the fair-cycle settings
    #[must_use]
    pub fn new(config: FairCycleConfig, windows: Arc<WindowManager>) -> Self {
        Self { config, windows }
    }

    /// The tracking key for a request, per the configured mode
    #[must_use]
    pub fn tracking_key<'a>(&self, model: &'a str, group: Option<&'a str>) -> &'a str {
        match self.config.tracking_mode {
            TrackingMode::Credential => FAIR_CYCLE_ALL_KEY,
            TrackingMode::ModelGroup => group.unwrap_or(model),
        }
    }

    /// The quota limit that drives threshold promotion: the primary window's
    /// limit at the group scope, falling back to the model scope, falling
    /// back to the smallest limit on any window.
    fn quota_limit(
        &self,
        state: &CredentialState,
        model: &str,
        group: Option<&str>,
    ) -> Option<u64> {
        let primary = self.windows.primary_definition()?;

        let windows = match primary.scope {
            WindowScope::Group => group
                .and_then(|g| state.group_usage.get(g))
                .or_else(|| state.model_usage.get(model))
                .map(|s| &s.windows),
            _ => state
                .model_usage
                .get(model)
                .or_else(|| group.and_then(|g| state.group_usage.get(g)))
                .map(|s| &s.windows),
        }?;

        if let Some(window) = self.windows.active(windows, &primary.name) {
            if let Some(limit) = window.limit {
                return Some(limit);
            }
        }
        windows.values().filter_map(|w| w.limit).min()
    }
}

impl LimitChecker for FairCycleChecker {
    fn name(&self) -> &'static str {
        "fair_cycle"
    }

    fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict {
        if !self.config.enabled {
            return LimitVerdict::Allowed;
        }

        let key = self.tracking_key(request.model, request.group).to_string();

        // In-band promotion: crossing the quota threshold within one cycle
        // exhausts the credential even without an upstream error
        if let Some(limit) = self.quota_limit(state, request.model, request.group) {
            let threshold = (limit as f64 * self.config.quota_threshold) as u64;
            if let Some(entry) = state.fair_cycle.get_mut(&key) {
                if !entry.exhausted && entry.cycle_request_count >= threshold {
                    entry.exhausted = true;
                    entry.exhausted_at = Some(request.now);
                    entry.exhausted_reason = Some("quota_threshold".to_string());
                    info!(
                        credential = %mask_credential(&state.accessor),
                        scope = %key,
                        count = entry.cycle_request_count,
                        threshold,
                        "credential fair-cycle exhausted at quota threshold"
                    );
                }
            }
        }

        if !state.is_fair_cycle_exhausted(&key) {
            return LimitVerdict::Allowed;
        }

        // Exhausted, but if the cycle timer has run out a reset is about to
        // happen; let the credential through
        let cycle_expired = request
            .global_cycles
            .get(&key)
            .map_or(false, |cycle| cycle.expired(self.config.duration, request.now));
        if cycle_expired {
            return LimitVerdict::Allowed;
        }

        LimitVerdict::blocked(
            BlockKind::FairCycle,
            format!("fair cycle: exhausted for '{key}', waiting for peer credentials"),
            None,
        )
    }
}
