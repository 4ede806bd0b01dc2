// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Sequential (sticky) rotation strategy.
//!
//! Reuses one credential per (provider, group-or-model) until it stops being
//! selectable, then moves on. Within a tier the replacement is the
//! *most*-used, most recently active candidate: reusing the busiest session
//! maximises upstream prompt-cache hits. Operators expecting round-robin
//! should use the balanced strategy instead.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use super::SelectionContext;
use crate::classify::mask_credential;
use crate::state::StateStore;

/// Sticky credential rotation
#[derive(Debug, Default)]
pub struct SequentialStrategy {
    /// group-or-model -> currently sticky stable ID
    current: Mutex<HashMap<String, String>>,
}

impl SequentialStrategy {
    /// Fresh strategy with no sticky bindings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a credential, preferring the current sticky binding when it is
    /// still allowed
    #[must_use]
    pub fn select(&self, context: &SelectionContext, store: &StateStore) -> Option<String> {
        if context.candidates.is_empty() {
            return None;
        }

        let key = context.sticky_key();
        if context.candidates.len() == 1 {
            let only = context.candidates[0].clone();
            self.current.lock().insert(key, only.clone());
            return Some(only);
        }

        {
            let current = self.current.lock();
            if let Some(sticky) = current.get(&key) {
                if context.candidates.contains(sticky) {
                    return Some(sticky.clone());
                }
            }
        }

        // Sticky binding gone or blocked: pick by tier, then highest usage,
        // then most recent activity
        let selected = self.pick_replacement(context, store)?;
        self.current.lock().insert(key.clone(), selected.clone());
        let masked = store
            .credentials
            .get(&selected)
            .map(|state| mask_credential(&state.accessor))
            .unwrap_or_else(|| mask_credential(&selected));
        debug!(credential = %masked, scope = %key, "sequential: switched sticky credential");
        Some(selected)
    }

    /// Evict the sticky binding for a scope, forcing the next selection to
    /// pick a new credential
    pub fn mark_exhausted(&self, model_or_group: &str) {
        if let Some(old) = self.current.lock().remove(model_or_group) {
            debug!(
                credential = %mask_credential(&old),
                scope = %model_or_group,
                "sequential: sticky credential evicted"
            );
        }
    }

    /// The current sticky binding for a scope
    #[must_use]
    pub fn current(&self, model_or_group: &str) -> Option<String> {
        self.current.lock().get(model_or_group).cloned()
    }

    /// Drop all sticky bindings
    pub fn clear_sticky(&self) {
        self.current.lock().clear();
    }

    fn pick_replacement(&self, context: &SelectionContext, store: &StateStore) -> Option<String> {
        context
            .candidates
            .iter()
            .min_by(|a, b| {
                let tier_a = context.priority_of(a);
                let tier_b = context.priority_of(b);
                tier_a
                    .cmp(&tier_b)
                    // Highest usage first
                    .then_with(|| context.usage_of(b).cmp(&context.usage_of(a)))
                    // Most recently used first
                    .then_with(|| {
                        let recency = |id: &str| {
                            store
                                .credentials
                                .get(id)
                                .and_then(|s| s.totals.last_used_at)
                                .unwrap_or(0.0)
                        };
                        recency(b)
                            .partial_cmp(&recency(a))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .cloned()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationMode;
    use crate::state::CredentialState;

    fn context(candidates: Vec<&str>, usage: Vec<(&str, u64)>) -> SelectionContext {
        SelectionContext {
            provider: "acme".to_string(),
            model: "m".to_string(),
            quota_group: Some("g".to_string()),
            candidates: candidates.into_iter().map(String::from).collect(),
            priorities: HashMap::new(),
            usage_counts: usage.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            rotation_mode: RotationMode::Sequential,
            rotation_tolerance: 0.0,
            deadline: 0.0,
        }
    }

    fn store_with(ids: &[(&str, Option<f64>)]) -> StateStore {
        let mut store = StateStore::default();
        for (id, last_used) in ids {
            let mut state = CredentialState::new(*id, "acme", *id);
            state.totals.last_used_at = *last_used;
            store.credentials.insert((*id).to_string(), state);
        }
        store
    }

    #[test]
    fn test_sticky_binding_persists() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("a", None), ("b", None)]);
        let context = context(vec!["a", "b"], vec![("a", 10), ("b", 0)]);

        let first = strategy.select(&context, &store).unwrap();
        for _ in 0..10 {
            assert_eq!(strategy.select(&context, &store).unwrap(), first);
        }
    }

    #[test]
    fn test_replacement_prefers_highest_usage() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("light", None), ("heavy", None)]);
        let context = context(vec!["light", "heavy"], vec![("light", 2), ("heavy", 50)]);

        // Heavier usage wins the sticky slot (cache reuse)
        assert_eq!(strategy.select(&context, &store).unwrap(), "heavy");
    }

    #[test]
    fn test_recency_breaks_usage_ties() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("stale", Some(100.0)), ("fresh", Some(200.0))]);
        let context = context(vec!["stale", "fresh"], vec![("stale", 5), ("fresh", 5)]);

        assert_eq!(strategy.select(&context, &store).unwrap(), "fresh");
    }

    #[test]
    fn test_mark_exhausted_evicts_sticky() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("a", None), ("b", None)]);
        let context = context(vec!["a", "b"], vec![("a", 50), ("b", 0)]);

        assert_eq!(strategy.select(&context, &store).unwrap(), "a");
        strategy.mark_exhausted("g");

        // "a" is no longer a candidate (cooled down); "b" takes over
        let context_b = context_without_a();
        assert_eq!(strategy.select(&context_b, &store).unwrap(), "b");
        assert_eq!(strategy.current("g").as_deref(), Some("b"));
    }

    fn context_without_a() -> SelectionContext {
        context(vec!["b"], vec![("b", 0)])
    }

    #[test]
    fn test_blocked_sticky_falls_through() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("a", None), ("b", None)]);

        let context_ab = context(vec!["a", "b"], vec![("a", 50), ("b", 0)]);
        assert_eq!(strategy.select(&context_ab, &store).unwrap(), "a");

        // "a" drops out of the allowed set without an explicit eviction
        let context_b = context(vec!["b"], vec![("b", 0)]);
        assert_eq!(strategy.select(&context_b, &store).unwrap(), "b");
    }

    #[test]
    fn test_clear_sticky() {
        let strategy = SequentialStrategy::new();
        let store = store_with(&[("a", None)]);
        let context = context(vec!["a"], vec![]);
        strategy.select(&context, &store);
        assert!(strategy.current("g").is_some());
        strategy.clear_sticky();
        assert!(strategy.current("g").is_none());
    }
}
