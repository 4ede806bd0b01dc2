// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Balanced rotation strategy.
//!
//! Weighted random selection biased toward less-used credentials. With
//! tolerance 0 the least-used credential always wins; larger tolerances mix
//! the pool more evenly.

use rand::Rng;

use super::SelectionContext;
use crate::state::StateStore;

/// Minimum selection weight; keeps heavily used credentials selectable
const MIN_WEIGHT: f64 = 0.1;

/// Weighted-random credential rotation.
///
/// Weight formula per candidate: `(max_usage - usage) + tolerance + 1`,
/// floored at 0.1. Candidates are grouped by priority and the highest tier
/// with any candidate wins.
#[derive(Debug, Clone)]
pub struct BalancedStrategy {
    tolerance: f64,
}

impl BalancedStrategy {
    /// Build with the configured rotation tolerance
    #[must_use]
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Pick a credential from the context's candidates
    #[must_use]
    pub fn select(&self, context: &SelectionContext, _store: &StateStore) -> Option<String> {
        if context.candidates.is_empty() {
            return None;
        }
        if context.candidates.len() == 1 {
            return context.candidates.first().cloned();
        }

        let mut tiers: Vec<i32> = context
            .candidates
            .iter()
            .map(|id| context.priority_of(id))
            .collect();
        tiers.sort_unstable();
        tiers.dedup();

        for tier in tiers {
            let candidates: Vec<&String> = context
                .candidates
                .iter()
                .filter(|id| context.priority_of(id) == tier)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let weights = self.weights(&candidates, context);
            if let Some(selected) = weighted_choice(&candidates, &weights) {
                return Some(selected.clone());
            }
        }

        context.candidates.first().cloned()
    }

    fn weights(&self, candidates: &[&String], context: &SelectionContext) -> Vec<f64> {
        let usages: Vec<u64> = candidates.iter().map(|id| context.usage_of(id)).collect();
        let max_usage = usages.iter().copied().max().unwrap_or(0);
        usages
            .into_iter()
            .map(|usage| {
                let weight = (max_usage - usage) as f64 + self.tolerance + 1.0;
                weight.max(MIN_WEIGHT)
            })
            .collect()
    }
}

fn weighted_choice<'a>(candidates: &[&'a String], weights: &[f64]) -> Option<&'a String> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0]);
    }

    let total: f64 = weights.iter().sum();
    let mut rng = rand::thread_rng();
    if total <= 0.0 {
        let index = rng.gen_range(0..candidates.len());
        return Some(candidates[index]);
    }

    let mut roll = rng.gen_range(0.0..total);
    for (candidate, weight) in candidates.iter().zip(weights) {
        roll -= weight;
        if roll <= 0.0 {
            return Some(candidate);
        }
    }
    candidates.last().copied()
}
