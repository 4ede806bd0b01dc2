// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-credential usage state.
//!
//! Everything in this module is plain serializable data. The tracking engine
//! is the only mutator; the limit and selection engines borrow state
//! read-mostly for the duration of a check. Timestamps are unix seconds as
//! `f64`, matching the persisted schema.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Cooldown-map key for credential-wide cooldowns
pub const GLOBAL_COOLDOWN_KEY: &str = "_global_";

/// Fair-cycle tracking key used in credential tracking mode. Deliberately
/// distinct from [`GLOBAL_COOLDOWN_KEY`]; the two namespaces never mix.
pub const FAIR_CYCLE_ALL_KEY: &str = "_all_";

/// Current wall-clock time as unix seconds
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ============================================================================
// Usage updates
// ============================================================================

/// One request's worth of usage deltas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageUpdate {
    /// How many upstream calls this update represents
    pub request_count: u64,
    /// Whether the request succeeded
    pub success: bool,
    /// Prompt (input) tokens
    pub prompt_tokens: u64,
    /// Completion (content output) tokens
    pub completion_tokens: u64,
    /// Reasoning/thinking tokens
    pub thinking_tokens: u64,
    /// Cached prompt tokens read
    pub cache_read_tokens: u64,
    /// Cached prompt tokens written
    pub cache_write_tokens: u64,
    /// Estimated cost in dollars
    pub approx_cost: f64,
}

impl UsageUpdate {
    /// A single successful request with no token detail
    #[must_use]
    pub fn success() -> Self {
        Self {
            request_count: 1,
            success: true,
            ..Self::default()
        }
    }

    /// A single failed request
    #[must_use]
    pub fn failure() -> Self {
        Self {
            request_count: 1,
            success: false,
            ..Self::default()
        }
    }

    /// completion + thinking
    #[must_use]
    pub fn output_tokens(&self) -> u64 {
        self.completion_tokens + self.thinking_tokens
    }

    /// prompt + completion + thinking + cache read + cache write
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens
            + self.completion_tokens
            + self.thinking_tokens
            + self.cache_read_tokens
            + self.cache_write_tokens
    }
}

/// Token counts extracted from an upstream response
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    /// Prompt (input) tokens
    pub prompt: u64,
    /// Completion (content output) tokens
    pub completion: u64,
    /// Reasoning/thinking tokens
    pub thinking: u64,
    /// Cached prompt tokens read
    pub cache_read: u64,
    /// Cached prompt tokens written
    pub cache_write: u64,
}

impl TokenCounts {
    /// Convert to a usage update for a completed request
    #[must_use]
    pub fn into_update(self, success: bool, approx_cost: f64) -> UsageUpdate {
        UsageUpdate {
            request_count: 1,
            success,
            prompt_tokens: self.prompt,
            completion_tokens: self.completion,
            thinking_tokens: self.thinking,
            cache_read_tokens: self.cache_read,
            cache_write_tokens: self.cache_write,
            approx_cost,
        }
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Monotonic lifetime counters for one scope.
///
/// Never decreases except through an explicit external override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TotalStats {
    /// All requests
    #[serde(default)]
    pub request_count: u64,
    /// Successful requests
    #[serde(default)]
    pub success_count: u64,
    /// Failed requests
    #[serde(default)]
    pub failure_count: u64,
    /// Prompt tokens
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens
    #[serde(default)]
    pub completion_tokens: u64,
    /// Thinking tokens
    #[serde(default)]
    pub thinking_tokens: u64,
    /// completion + thinking
    #[serde(default)]
    pub output_tokens: u64,
    /// Cached prompt tokens read
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Cached prompt tokens written
    #[serde(default)]
    pub cache_write_tokens: u64,
    /// Grand total tokens
    #[serde(default)]
    pub total_tokens: u64,
    /// Estimated cost in dollars
    #[serde(default)]
    pub approx_cost: f64,
    /// First recorded use
    #[serde(default)]
    pub first_used_at: Option<f64>,
    /// Most recent recorded use
    #[serde(default)]
    pub last_used_at: Option<f64>,
}

impl TotalStats {
    /// Apply one usage update
    pub fn apply(&mut self, update: &UsageUpdate, now: f64) {
        self.request_count += update.request_count;
        if update.success {
            self.success_count += update.request_count;
        } else {
            self.failure_count += update.request_count;
        }
        self.prompt_tokens += update.prompt_tokens;
        self.completion_tokens += update.completion_tokens;
        self.thinking_tokens += update.thinking_tokens;
        self.output_tokens += update.output_tokens();
        self.cache_read_tokens += update.cache_read_tokens;
        self.cache_write_tokens += update.cache_write_tokens;
        self.total_tokens += update.total_tokens();
        self.approx_cost += update.approx_cost;
        self.last_used_at = Some(now);
        if self.first_used_at.is_none() {
            self.first_used_at = Some(now);
        }
    }
}

/// A named counter bucket with a reset policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    /// Window name, matching its definition
    pub name: String,
    /// Requests in the current cycle
    #[serde(default)]
    pub request_count: u64,
    /// Successes in the current cycle
    #[serde(default)]
    pub success_count: u64,
    /// Failures in the current cycle
    #[serde(default)]
    pub failure_count: u64,
    /// Prompt tokens in the current cycle
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens in the current cycle
    #[serde(default)]
    pub completion_tokens: u64,
    /// Thinking tokens in the current cycle
    #[serde(default)]
    pub thinking_tokens: u64,
    /// completion + thinking
    #[serde(default)]
    pub output_tokens: u64,
    /// Cached prompt tokens read
    #[serde(default)]
    pub cache_read_tokens: u64,
    /// Cached prompt tokens written
    #[serde(default)]
    pub cache_write_tokens: u64,
    /// Grand total tokens
    #[serde(default)]
    pub total_tokens: u64,
    /// Estimated cost in dollars
    #[serde(default)]
    pub approx_cost: f64,
    /// Request ceiling, learned from the upstream or configured
    #[serde(default)]
    pub limit: Option<u64>,
    /// First use of the current cycle; unset until first recorded use
    #[serde(default)]
    pub started_at: Option<f64>,
    /// When the current cycle resets; unset until first use or upstream edit
    #[serde(default)]
    pub reset_at: Option<f64>,
    /// First recorded use, ever
    #[serde(default)]
    pub first_used_at: Option<f64>,
    /// Most recent recorded use
    #[serde(default)]
    pub last_used_at: Option<f64>,
    /// Historical high-water mark, preserved across resets
    #[serde(default)]
    pub max_recorded_requests: Option<u64>,
    /// When the high-water mark was recorded
    #[serde(default)]
    pub max_recorded_at: Option<f64>,
}

impl WindowStats {
    /// A fresh, unused window
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// `limit - request_count`, if a limit is known
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|l| l.saturating_sub(self.request_count))
    }
}

/// Windows plus totals for one model or quota group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedUsage {
    /// Window name -> stats
    #[serde(default)]
    pub windows: BTreeMap<String, WindowStats>,
    /// All-time totals for this scope
    #[serde(default)]
    pub totals: TotalStats,
}

// ============================================================================
// Cooldowns and fair cycle
// ============================================================================

/// An active or expired cooldown at one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    /// Why the cooldown was first applied; preserved across extensions
    pub reason: String,
    /// When the cooldown ends
    pub until: f64,
    /// When the cooldown was first applied; preserved across extensions
    pub started_at: f64,
    /// Who applied it (error kind, `custom_cap`, `admin`, ...)
    pub source: String,
    /// Scope the cooldown was applied for, `None` for credential-wide
    #[serde(default)]
    pub model_or_group: Option<String>,
    /// How many times the cooldown was extended while active
    #[serde(default)]
    pub backoff_count: u32,
}

impl CooldownEntry {
    /// Whether the cooldown is still in force
    #[must_use]
    pub fn is_active(&self, now: f64) -> bool {
        now < self.until
    }

    /// Seconds until the cooldown lifts, zero if expired
    #[must_use]
    pub fn remaining(&self, now: f64) -> f64 {
        (self.until - now).max(0.0)
    }
}

/// Fair-cycle bookkeeping for one tracking key on one credential
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FairCycleEntry {
    /// Whether the credential is exhausted for this key
    #[serde(default)]
    pub exhausted: bool,
    /// When exhaustion was flagged
    #[serde(default)]
    pub exhausted_at: Option<f64>,
    /// Why exhaustion was flagged
    #[serde(default)]
    pub exhausted_reason: Option<String>,
    /// Requests made during the current cycle
    #[serde(default)]
    pub cycle_request_count: u64,
}

impl FairCycleEntry {
    /// Clear exhaustion and the per-cycle counter
    pub fn reset(&mut self) {
        self.exhausted = false;
        self.exhausted_at = None;
        self.exhausted_reason = None;
        self.cycle_request_count = 0;
    }
}

/// Provider-wide fair-cycle state for one tracking key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalCycle {
    /// When the current cycle began
    pub cycle_start: f64,
    /// When every credential was last observed exhausted
    #[serde(default)]
    pub all_exhausted_at: Option<f64>,
    /// How many resets have fired
    #[serde(default)]
    pub cycle_count: u64,
}

impl GlobalCycle {
    /// A cycle starting now
    #[must_use]
    pub fn starting_at(now: f64) -> Self {
        Self {
            cycle_start: now,
            all_exhausted_at: None,
            cycle_count: 0,
        }
    }

    /// Whether the cycle timer has expired
    #[must_use]
    pub fn expired(&self, duration: f64, now: f64) -> bool {
        now >= self.cycle_start + duration
    }
}

// ============================================================================
// Credential state
// ============================================================================

/// All persistent state for one credential, keyed by stable ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialState {
    /// Stable identity (email or key-hash prefix)
    pub stable_id: String,
    /// Owning provider
    pub provider: String,
    /// Current outside-world handle (file path or raw key)
    pub accessor: String,
    /// Human-readable name, if known
    #[serde(default)]
    pub display_name: Option<String>,
    /// Tier label, if known
    #[serde(default)]
    pub tier: Option<String>,
    /// Priority; lower numbers are higher tiers
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Requests currently in flight (not persisted)
    #[serde(skip)]
    pub active_requests: u32,
    /// Concurrency cap, if any
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    /// When this state was first created
    #[serde(default)]
    pub created_at: f64,
    /// Most recent mutation
    #[serde(default)]
    pub last_updated: f64,
    /// Credential-level lifetime counters
    #[serde(default)]
    pub totals: TotalStats,
    /// Model name -> usage
    #[serde(default)]
    pub model_usage: BTreeMap<String, ScopedUsage>,
    /// Quota group -> usage
    #[serde(default)]
    pub group_usage: BTreeMap<String, ScopedUsage>,
    /// Cooldown key -> entry
    #[serde(default)]
    pub cooldowns: BTreeMap<String, CooldownEntry>,
    /// Fair-cycle tracking key -> entry
    #[serde(default)]
    pub fair_cycle: BTreeMap<String, FairCycleEntry>,
}

fn default_priority() -> i32 {
    999
}

impl CredentialState {
    /// Fresh state for a newly registered credential
    #[must_use]
    pub fn new(
        stable_id: impl Into<String>,
        provider: impl Into<String>,
        accessor: impl Into<String>,
    ) -> Self {
        let now = unix_now();
        Self {
            stable_id: stable_id.into(),
            provider: provider.into(),
            accessor: accessor.into(),
            display_name: None,
            tier: None,
            priority: default_priority(),
            active_requests: 0,
            max_concurrent: None,
            created_at: now,
            last_updated: now,
            totals: TotalStats::default(),
            model_usage: BTreeMap::new(),
            group_usage: BTreeMap::new(),
            cooldowns: BTreeMap::new(),
            fair_cycle: BTreeMap::new(),
        }
    }

    /// Usage for a model, created on first reference
    pub fn model_usage_mut(&mut self, model: &str) -> &mut ScopedUsage {
        self.model_usage.entry(model.to_string()).or_default()
    }

    /// Usage for a quota group, created on first reference
    pub fn group_usage_mut(&mut self, group: &str) -> &mut ScopedUsage {
        self.group_usage.entry(group.to_string()).or_default()
    }

    /// The active cooldown at a key, if any
    #[must_use]
    pub fn active_cooldown(&self, key: &str, now: f64) -> Option<&CooldownEntry> {
        self.cooldowns.get(key).filter(|c| c.is_active(now))
    }

    /// Whether the credential is fair-cycle exhausted for a tracking key
    #[must_use]
    pub fn is_fair_cycle_exhausted(&self, tracking_key: &str) -> bool {
        self.fair_cycle
            .get(tracking_key)
            .is_some_and(|fc| fc.exhausted)
    }
}

/// Everything the tracking engine guards under its mutex: all credential
/// states for one provider plus the provider-wide fair-cycle records
#[derive(Debug, Default)]
pub struct StateStore {
    /// Stable ID -> credential state
    pub credentials: HashMap<String, CredentialState>,
    /// Fair-cycle tracking key -> global cycle record
    pub global_cycles: HashMap<String, GlobalCycle>,
}

impl StateStore {
    /// State for a stable ID, created lazily on first reference
    pub fn state_mut(
        &mut self,
        stable_id: &str,
        provider: &str,
        accessor: &str,
    ) -> &mut CredentialState {
        self.credentials
            .entry(stable_id.to_string())
            .or_insert_with(|| CredentialState::new(stable_id, provider, accessor))
    }

    /// Global cycle record for a tracking key, created lazily
    pub fn global_cycle_mut(&mut self, tracking_key: &str, now: f64) -> &mut GlobalCycle {
        self.global_cycles
            .entry(tracking_key.to_string())
            .or_insert_with(|| GlobalCycle::starting_at(now))
    }
}
