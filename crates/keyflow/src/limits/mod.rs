// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Limit checking.
//!
//! The [`LimitEngine`] runs an ordered pipeline of checkers over a
//! credential for a (model, quota-group) request and reports the first
//! blocker. Order is fixed: concurrency, cooldowns, optional window limits,
//! custom caps, fair cycle. Checkers run under the tracking-engine lock and
//! may promote state in-band (fair cycle), but never hold borrows beyond
//! the check.

mod concurrent;
mod cooldowns;
mod custom_caps;
mod fair_cycle;
mod window_limits;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::classify::mask_credential;
use crate::config::ProviderConfig;
use crate::state::{CredentialState, GlobalCycle};
use crate::windows::WindowManager;

pub use concurrent::ConcurrentChecker;
pub use cooldowns::CooldownChecker;
pub use custom_caps::CustomCapChecker;
pub use fair_cycle::FairCycleChecker;
pub use window_limits::WindowLimitChecker;

/// Which checker blocked a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// At the concurrency cap
    Concurrent,
    /// An active cooldown
    Cooldown,
    /// A locally tracked window limit
    Window,
    /// A user-defined cap
    CustomCap,
    /// Fair-cycle exhaustion
    FairCycle,
}

impl BlockKind {
    /// Stable string form, used as the availability-stats key
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrent => "concurrent",
            Self::Cooldown => "cooldowns",
            Self::Window => "window_limits",
            Self::CustomCap => "custom_caps",
            Self::FairCycle => "fair_cycle",
        }
    }
}

/// Result of one limit check
#[derive(Debug, Clone)]
pub enum LimitVerdict {
    /// The credential may be used right now
    Allowed,
    /// The credential is blocked
    Blocked {
        /// Which checker blocked it
        kind: BlockKind,
        /// Human-readable explanation
        reason: String,
        /// When the block lifts, if knowable
        blocked_until: Option<f64>,
    },
}

impl LimitVerdict {
    /// Construct a block
    #[must_use]
    pub fn blocked(kind: BlockKind, reason: impl Into<String>, blocked_until: Option<f64>) -> Self {
        Self::Blocked {
            kind,
            reason: reason.into(),
            blocked_until,
        }
    }

    /// Whether the credential may be used
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// The blocking kind, if blocked
    #[must_use]
    pub fn block_kind(&self) -> Option<BlockKind> {
        match self {
            Self::Allowed => None,
            Self::Blocked { kind, .. } => Some(*kind),
        }
    }
}

/// What a checker sees for one request
pub struct CheckRequest<'a> {
    /// Model being requested
    pub model: &'a str,
    /// Quota group for the model, if any
    pub group: Option<&'a str>,
    /// Wall-clock time of the check, unix seconds
    pub now: f64,
    /// Provider-wide fair-cycle records
    pub global_cycles: &'a HashMap<String, GlobalCycle>,
}

impl<'a> CheckRequest<'a> {
    /// group-or-model: the cooldown and cap scope key
    #[must_use]
    pub fn scope_key(&self) -> &'a str {
        self.group.unwrap_or(self.model)
    }
}

/// One limit type. Checkers take `&mut` state because fair cycle promotes
/// exhaustion in-band during a check; everything else only reads.
pub trait LimitChecker: Send + Sync {
    /// Checker name, as shown in logs and stats
    fn name(&self) -> &'static str;

    /// Evaluate this limit for one credential
    fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict;
}

/// Ordered pipeline of limit checkers; first blocker wins
pub struct LimitEngine {
    checkers: Vec<Box<dyn LimitChecker>>,
}

impl LimitEngine {
    /// Build the pipeline for a provider configuration. The window-limit
    /// checker only participates when `window_limits_enabled` is set; by
    /// default only upstream errors block, not local bookkeeping.
    #[must_use]
    pub fn new(config: Arc<ProviderConfig>, windows: Arc<WindowManager>) -> Self {
        let mut checkers: Vec<Box<dyn LimitChecker>> =
            vec![Box::new(ConcurrentChecker), Box::new(CooldownChecker)];
        if config.window_limits_enabled {
            checkers.push(Box::new(WindowLimitChecker::new(Arc::clone(&windows))));
        }
        checkers.push(Box::new(CustomCapChecker::new(
            config.custom_caps.clone(),
            Arc::clone(&windows),
        )));
        checkers.push(Box::new(FairCycleChecker::new(
            config.fair_cycle.clone(),
            windows,
        )));
        Self { checkers }
    }

    /// Run all checkers in order; the first block is returned and later
    /// checkers are not consulted.
    pub fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict {
        for checker in &self.checkers {
            let verdict = checker.check(state, request);
            if let LimitVerdict::Blocked { reason, .. } = &verdict {
                debug!(
                    credential = %mask_credential(&state.accessor),
                    checker = checker.name(),
                    reason = %reason,
                    "credential blocked"
                );
                return verdict;
            }
        }
        LimitVerdict::Allowed
    }

    /// Run every checker and report each verdict, for availability stats
    /// and debugging
    pub fn blocking_info(
        &self,
        state: &mut CredentialState,
        request: &CheckRequest<'_>,
    ) -> Vec<(&'static str, LimitVerdict)> {
        self.checkers
            .iter()
            .map(|checker| (checker.name(), checker.check(state, request)))
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairCycleConfig, ProviderConfig};
    use crate::state::unix_now;
    use crate::state::CooldownEntry;

    fn request<'a>(
        model: &'a str,
        group: Option<&'a str>,
        cycles: &'a HashMap<String, GlobalCycle>,
    ) -> CheckRequest<'a> {
        CheckRequest {
            model,
            group,
            now: unix_now(),
            global_cycles: cycles,
        }
    }

    fn engine(config: ProviderConfig) -> LimitEngine {
        let windows = Arc::new(WindowManager::new(
            &config.windows,
            &config.daily_reset_time_utc,
        ));
        LimitEngine::new(Arc::new(config), windows)
    }

    #[test]
    fn test_clean_state_is_allowed() {
        let engine = engine(ProviderConfig::default());
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        let cycles = HashMap::new();
        assert!(engine
            .check(&mut state, &request("m", Some("g"), &cycles))
            .is_allowed());
    }

    #[test]
    fn test_earlier_checker_wins() {
        // Both the concurrency cap and a cooldown block; the concurrent
        // checker runs first so its verdict is returned.
        let engine = engine(ProviderConfig::default());
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state.max_concurrent = Some(1);
        state.active_requests = 1;
        state.cooldowns.insert(
            "g".to_string(),
            CooldownEntry {
                reason: "rate_limit".to_string(),
                until: unix_now() + 600.0,
                started_at: unix_now(),
                source: "error".to_string(),
                model_or_group: Some("g".to_string()),
                backoff_count: 0,
            },
        );

        let cycles = HashMap::new();
        let verdict = engine.check(&mut state, &request("m", Some("g"), &cycles));
        assert_eq!(verdict.block_kind(), Some(BlockKind::Concurrent));
    }

    #[test]
    fn test_blocking_info_reports_every_checker() {
        let config = ProviderConfig {
            fair_cycle: FairCycleConfig {
                enabled: true,
                ..FairCycleConfig::default()
            },
            ..ProviderConfig::default()
        };
        let engine = engine(config);
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        let cycles = HashMap::new();
        let info = engine.blocking_info(&mut state, &request("m", None, &cycles));
        let names: Vec<_> = info.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["concurrent", "cooldowns", "custom_caps", "fair_cycle"]);
    }

    #[test]
    fn test_window_checker_only_when_enabled() {
        let config = ProviderConfig {
            window_limits_enabled: true,
            ..ProviderConfig::default()
        };
        let engine = engine(config);
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        let cycles = HashMap::new();
        let info = engine.blocking_info(&mut state, &request("m", None, &cycles));
        assert!(info.iter().any(|(name, _)| *name == "window_limits"));
    }
}
