// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Window limit checker.
//!
//! Off by default: most deployments let upstream errors drive blocking and
//! treat local window counts as bookkeeping. When enabled, a full window
//! blocks until its reset.

use std::sync::Arc;

use super::{BlockKind, CheckRequest, LimitChecker, LimitVerdict};
use crate::config::WindowScope;
use crate::state::CredentialState;
use crate::windows::WindowManager;

/// Blocks credentials whose tracked windows have reached their limit
pub struct WindowLimitChecker {
    windows: Arc<WindowManager>,
}

impl WindowLimitChecker {
    /// Build against the provider's window manager
    #[must_use]
    pub fn new(windows: Arc<WindowManager>) -> Self {
        Self { windows }
    }
}

impl LimitChecker for WindowLimitChecker {
    fn name(&self) -> &'static str {
        "window_limits"
    }

    fn check(&self, state: &mut CredentialState, request: &CheckRequest<'_>) -> LimitVerdict {
        for definition in self.windows.definitions() {
            let windows = match definition.scope {
                WindowScope::Model => state.model_usage.get(request.model).map(|s| &s.windows),
                WindowScope::Group => state
                    .group_usage
                    .get(request.scope_key())
                    .map(|s| &s.windows),
                WindowScope::Credential => None,
            };
            let Some(windows) = windows else {
                continue;
            };
            let Some(window) = self.windows.active(windows, &definition.name) else {
                continue;
            };
            let Some(limit) = window.limit else {
                continue;
            };
            if window.request_count >= limit {
                return LimitVerdict::blocked(
                    BlockKind::Window,
                    format!(
                        "window '{}' exhausted ({}/{limit})",
                        definition.name, window.request_count
                    ),
                    window.reset_at,
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
    use crate::config::WindowDefinition;
    use crate::state::{unix_now, WindowStats};
    use std::collections::HashMap;

    fn checker() -> WindowLimitChecker {
        let definitions = vec![
            WindowDefinition::rolling("5h", 5.0 * 3600.0, WindowScope::Group).primary(),
        ];
        WindowLimitChecker::new(Arc::new(WindowManager::new(&definitions, "03:00")))
    }

    fn state_with_group_window(count: u64, limit: Option<u64>) -> CredentialState {
        let mut state = CredentialState::new("sid", "acme", "sk-a");
        let mut window = WindowStats::new("5h");
        window.request_count = count;
        window.limit = limit;
        window.started_at = Some(unix_now());
        window.reset_at = Some(unix_now() + 3600.0);
        state
            .group_usage_mut("g")
            .windows
            .insert("5h".to_string(), window);
        state
    }

    fn check(state: &mut CredentialState) -> LimitVerdict {
        let cycles = HashMap::new();
        checker().check(
            state,
            &CheckRequest {
                model: "m",
                group: Some("g"),
                now: unix_now(),
                global_cycles: &cycles,
            },
        )
    }

    #[test]
    fn test_no_limit_allows() {
        let mut state = state_with_group_window(1000, None);
        assert!(check(&mut state).is_allowed());
    }

    #[test]
    fn test_under_limit_allows() {
        let mut state = state_with_group_window(99, Some(100));
        assert!(check(&mut state).is_allowed());
    }

    #[test]
    fn test_at_limit_blocks_until_reset() {
        let mut state = state_with_group_window(100, Some(100));
        let reset_at = state.group_usage["g"].windows["5h"].reset_at;
        match check(&mut state) {
            LimitVerdict::Blocked {
                kind,
                blocked_until,
                ..
            } => {
                assert_eq!(kind, BlockKind::Window);
                assert_eq!(blocked_until, reset_at);
            }
            LimitVerdict::Allowed => panic!("expected block"),
        }
    }
}
