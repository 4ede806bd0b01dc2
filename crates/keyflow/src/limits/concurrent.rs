// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Concurrency cap checker.

use super::{BlockKind, CheckRequest, LimitChecker, LimitVerdict};
use crate::state::CredentialState;

/// Blocks credentials with `active_requests` at their `max_concurrent` cap.
///
/// No `blocked_until`: the block lifts as soon as an in-flight request
/// finishes.
pub struct ConcurrentChecker;

impl LimitChecker for ConcurrentChecker {
    fn name(&self) -> &'static str {
        "concurrent"
    }

    fn check(&self, state: &mut CredentialState, _request: &CheckRequest<'_>) -> LimitVerdict {
        let Some(max) = state.max_concurrent else {
            return LimitVerdict::Allowed;
        };
        if state.active_requests >= max {
            return LimitVerdict::blocked(
                BlockKind::Concurrent,
                format!("at max concurrent: {}/{max}", state.active_requests),
                None,
            );
        }
        LimitVerdict::Allowed
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::unix_now;
    use std::collections::HashMap;

    fn check(state: &mut CredentialState) -> LimitVerdict {
        let cycles = HashMap::new();
        ConcurrentChecker.check(
            state,
            &CheckRequest {
                model: "m",
                group: None,
                now: unix_now(),
                global_cycles: &cycles,
            },
        )
    }

    #[test]
    fn test_no_cap_always_allows() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state.active_requests = 1000;
        assert!(check(&mut state).is_allowed());
    }

    #[test]
    fn test_blocks_at_cap_without_blocked_until() {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        state.max_concurrent = Some(2);
        state.active_requests = 1;
        assert!(check(&mut state).is_allowed());

        state.active_requests = 2;
        match check(&mut state) {
            LimitVerdict::Blocked {
                kind,
                blocked_until,
                ..
            } => {
                assert_eq!(kind, BlockKind::Concurrent);
                assert!(blocked_until.is_none());
            }
            LimitVerdict::Allowed => panic!("expected block"),
        }
    }
}
