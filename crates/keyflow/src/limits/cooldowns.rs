// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cooldown checker.

use super::{BlockKind, CheckRequest, LimitChecker, LimitVerdict};
use crate::state::{CredentialState, GLOBAL_COOLDOWN_KEY};

/// Blocks credentials with an active cooldown.
///
/// Keys are consulted in order: the group key, the model key when it
/// differs, then the credential-wide `_global_` entry. The first active
/// cooldown wins and supplies `blocked_until`.
pub struct CooldownChecker;

impl LimitChecker for CooldownChecker {
    fn name(&self) -> &'static str {
        "cooldowns"
    }

    fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict {
        let scope_key = request.scope_key();
        let mut keys = vec![scope_key];
        if request.group.is_some() && scope_key != request.model {
            keys.push(request.model);
        }
        keys.push(GLOBAL_COOLDOWN_KEY);

        for key in keys {
            if let Some(cooldown) = state.active_cooldown(key, request.now) {
                let label = if key == GLOBAL_COOLDOWN_KEY {
                    "global cooldown".to_string()
                } else {
                    format!("cooldown for '{key}'")
                };
                return LimitVerdict::blocked(
                    BlockKind::Cooldown,
                    format!(
                        "{label}: {} (expires in {:.0}s)",
                        cooldown.reason,
                        cooldown.remaining(request.now)
                    ),
                    Some(cooldown.until),
                );
            }
        }
        LimitVerdict::Allowed
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{unix_now, CooldownEntry};
    use std::collections::HashMap;

    fn cooldown(until: f64, reason: &str) -> CooldownEntry {
        CooldownEntry {
            reason: reason.to_string(),
            until,
            started_at: unix_now(),
            source: "error".to_string(),
            model_or_group: None,
            backoff_count: 0,
        }
    }

    fn check<'a>(
        state: &mut CredentialState,
        model: &'a str,
        group: Option<&'a str>,
    ) -> LimitVerdict {
        let cycles = HashMap::new();
        CooldownChecker.check(
            state,
            &CheckRequest {
                model,
                group,
                now: unix_now(),
                global_cycles: &cycles,
            },
        )
    }

    #[test]
    fn test_expired_cooldown_allows() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state
            .cooldowns
            .insert("g".to_string(), cooldown(unix_now() - 1.0, "rate_limit"));
        assert!(check(&mut state, "m", Some("g")).is_allowed());
    }

    #[test]
    fn test_group_key_checked_before_model() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state
            .cooldowns
            .insert("g".to_string(), cooldown(unix_now() + 100.0, "group_cd"));
        state
            .cooldowns
            .insert("m".to_string(), cooldown(unix_now() + 900.0, "model_cd"));

        match check(&mut state, "m", Some("g")) {
            LimitVerdict::Blocked { reason, .. } => assert!(reason.contains("group_cd")),
            LimitVerdict::Allowed => panic!("expected block"),
        }
    }

    #[test]
    fn test_model_cooldown_blocks_when_group_clear() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        let until = unix_now() + 60.0;
        state
            .cooldowns
            .insert("m".to_string(), cooldown(until, "model_cd"));

        match check(&mut state, "m", Some("g")) {
            LimitVerdict::Blocked { blocked_until, .. } => {
                assert_eq!(blocked_until, Some(until));
            }
            LimitVerdict::Allowed => panic!("expected block"),
        }
    }

    #[test]
    fn test_global_cooldown_blocks_everything() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state.cooldowns.insert(
            GLOBAL_COOLDOWN_KEY.to_string(),
            cooldown(unix_now() + 60.0, "admin"),
        );
        assert!(!check(&mut state, "any-model", None).is_allowed());
        assert!(!check(&mut state, "other", Some("pool")).is_allowed());
    }
}
