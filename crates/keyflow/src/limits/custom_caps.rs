// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Custom cap checker.
//!
//! Custom caps are user-defined ceilings tighter than the upstream limit,
//! keyed by credential tier and model-or-group name. Model caps and group
//! caps are independent: each is evaluated against the primary window of
//! its own scope, and the first one over its ceiling blocks.

use std::collections::HashMap;
use std::sync::Arc;

use super::{BlockKind, CheckRequest, LimitChecker, LimitVerdict};
use crate::config::{CapCooldown, CustomCap, TierKey};
use crate::state::{CredentialState, WindowStats};
use crate::windows::WindowManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapScope {
    Model,
    Group,
}

/// Blocks credentials that exceed a user-defined cap
pub struct CustomCapChecker {
    index: HashMap<(TierKey, String), CustomCap>,
    windows: Arc<WindowManager>,
}

impl CustomCapChecker {
    /// Build a checker over the configured caps
    #[must_use]
    pub fn new(caps: Vec<CustomCap>, windows: Arc<WindowManager>) -> Self {
        let index = caps
            .into_iter()
            .map(|cap| ((cap.tier.clone(), cap.target.clone()), cap))
            .collect();
        Self { index, windows }
    }

    /// Caps applicable to this request: the model cap (tier-specific, then
    /// default) and, when the group differs, the group cap likewise.
    fn applicable_caps<'a>(
        &'a self,
        priority: i32,
        model: &str,
        group: Option<&str>,
    ) -> Vec<(&'a CustomCap, CapScope, String)> {
        let mut result = Vec::new();

        if let Some(cap) = self.lookup(priority, model) {
            result.push((cap, CapScope::Model, model.to_string()));
        }
        if let Some(group) = group {
            if group != model {
                if let Some(cap) = self.lookup(priority, group) {
                    result.push((cap, CapScope::Group, group.to_string()));
                }
            }
        }
        result
    }

    fn lookup(&self, priority: i32, target: &str) -> Option<&CustomCap> {
        self.index
            .get(&(TierKey::Priority(priority), target.to_string()))
            .or_else(|| self.index.get(&(TierKey::Default, target.to_string())))
    }

    fn check_single_cap(
        &self,
        state: &CredentialState,
        cap: &CustomCap,
        scope: CapScope,
        scope_key: &str,
        now: f64,
    ) -> LimitVerdict {
        let windows = match scope {
            CapScope::Group => state.group_usage.get(scope_key).map(|s| &s.windows),
            CapScope::Model => state.model_usage.get(scope_key).map(|s| &s.windows),
        };
        let Some(windows) = windows else {
            return LimitVerdict::Allowed;
        };
        let Some(primary) = self.windows.primary(windows) else {
            return LimitVerdict::Allowed;
        };

        let max_requests = cap.limit.resolve(primary.limit);
        if primary.request_count < max_requests {
            return LimitVerdict::Allowed;
        }

        let scope_desc = match scope {
            CapScope::Model => "model",
            CapScope::Group => "group",
        };
        LimitVerdict::blocked(
            BlockKind::CustomCap,
            format!(
                "custom cap for {scope_desc} '{scope_key}' exceeded ({}/{max_requests})",
                primary.request_count
            ),
            cap_cooldown_until(&cap.cooldown, primary, now),
        )
    }
}

impl LimitChecker for CustomCapChecker {
    fn name(&self) -> &'static str {
        "custom_caps"
    }

    fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict {
        if self.index.is_empty() {
            return LimitVerdict::Allowed;
        }
        if self.windows.primary_definition().is_none() {
            return LimitVerdict::Allowed;
        }

        for (cap, scope, scope_key) in
            self.applicable_caps(state.priority, request.model, request.group)
        {
            let verdict = self.check_single_cap(state, cap, scope, &scope_key, request.now);
            if !verdict.is_allowed() {
                return verdict;
            }
        }
        LimitVerdict::Allowed
    }
}

/// When a cap-triggered block lifts
fn cap_cooldown_until(cooldown: &CapCooldown, window: &WindowStats, now: f64) -> Option<f64> {
    match cooldown {
        CapCooldown::QuotaReset => window.reset_at,
        CapCooldown::Offset(offset) => match window.reset_at {
            // The block can never lift before the quota itself resets
            Some(reset_at) => Some((reset_at + *offset as f64).max(reset_at)),
            None => Some(now + offset.unsigned_abs() as f64),
        },
        CapCooldown::Fixed(seconds) => Some(now + *seconds as f64),
    }
}
