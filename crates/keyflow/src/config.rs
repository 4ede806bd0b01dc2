// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-provider rotation configuration.
//!
//! A [`ProviderConfig`] is assembled once at startup from three layers, later
//! layers winning: library defaults, the provider plugin's declared defaults,
//! and environment variables. It is immutable for the life of the process.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// Defaults
// ============================================================================

/// Default randomness for the balanced strategy's weighting
pub const DEFAULT_ROTATION_TOLERANCE: f64 = 3.0;

/// Default concurrent slots for priorities without an explicit multiplier
pub const DEFAULT_SEQUENTIAL_FALLBACK_MULTIPLIER: u32 = 1;

/// Default fair-cycle duration, in seconds
pub const DEFAULT_FAIR_CYCLE_DURATION: f64 = 43_200.0;

/// Fraction of the window limit at which fair cycle considers a credential
/// exhausted
pub const DEFAULT_FAIR_CYCLE_QUOTA_THRESHOLD: f64 = 0.95;

/// Cooldowns shorter than this never justify a fair-cycle reset, in seconds
pub const DEFAULT_RESET_COOLDOWN_THRESHOLD: f64 = 300.0;

/// A cooldown at or beyond this length implies exhaustion, in seconds
pub const DEFAULT_EXHAUSTION_COOLDOWN_THRESHOLD: f64 = 1800.0;

/// Default request-level deadline, in seconds
pub const DEFAULT_GLOBAL_TIMEOUT: f64 = 120.0;

/// Default bound on same-credential retries for retry-same verdicts
pub const DEFAULT_MAX_SAME_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Default bound on consecutive quota-like failures before giving up
pub const DEFAULT_MAX_CONSECUTIVE_QUOTA_FAILURES: u32 = 10;

/// Default UTC reset time for fixed-daily windows
pub const DEFAULT_DAILY_RESET_UTC: &str = "03:00";

// ============================================================================
// Enumerations
// ============================================================================

/// Credential rotation strategy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Weighted-random selection biased toward less-used credentials
    #[default]
    Balanced,
    /// Sticky selection: reuse one credential until it is blocked
    Sequential,
}

impl RotationMode {
    /// Stable string form, as used in env vars and stats
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Sequential => "sequential",
        }
    }
}

impl FromStr for RotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown rotation mode '{other}'")),
        }
    }
}

/// How fair-cycle exhaustion is keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// One record per model or quota group
    #[default]
    ModelGroup,
    /// One record per credential, under a single sentinel key
    Credential,
}

/// When a window's counters are zeroed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// `duration` after first use
    Rolling,
    /// At a fixed UTC time every day
    FixedDaily,
    /// Sunday 03:00 UTC
    CalendarWeekly,
    /// 1st of the month, 03:00 UTC
    CalendarMonthly,
    /// Only when the upstream supplies an explicit reset timestamp
    ApiAuthoritative,
}

/// Which usage map a window lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowScope {
    /// Tracked on the credential's own totals
    Credential,
    /// Tracked per model
    Model,
    /// Tracked per quota group
    Group,
}

// ============================================================================
// Windows
// ============================================================================

/// Configuration-time description of a usage window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowDefinition {
    /// Window name (e.g. "5h", "daily")
    pub name: String,
    /// Window length in seconds; `None` means infinite
    pub duration: Option<f64>,
    /// Reset policy
    pub reset_mode: ResetMode,
    /// At most one definition per config is primary; the primary window
    /// drives rotation weighting and custom-cap evaluation
    pub is_primary: bool,
    /// Which usage map the window applies to
    pub scope: WindowScope,
}

impl WindowDefinition {
    /// A rolling window of the given length
    #[must_use]
    pub fn rolling(name: impl Into<String>, duration_secs: f64, scope: WindowScope) -> Self {
        Self {
            name: name.into(),
            duration: Some(duration_secs),
            reset_mode: ResetMode::Rolling,
            is_primary: false,
            scope,
        }
    }

    /// A fixed-daily window resetting at the configured UTC time
    #[must_use]
    pub fn fixed_daily(name: impl Into<String>, scope: WindowScope) -> Self {
        Self {
            name: name.into(),
            duration: Some(86_400.0),
            reset_mode: ResetMode::FixedDaily,
            is_primary: false,
            scope,
        }
    }

    /// A window reset only by upstream-provided timestamps
    #[must_use]
    pub fn api_authoritative(name: impl Into<String>, scope: WindowScope) -> Self {
        Self {
            name: name.into(),
            duration: None,
            reset_mode: ResetMode::ApiAuthoritative,
            is_primary: false,
            scope,
        }
    }

    /// Mark this definition as the primary window
    #[must_use]
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }
}

// ============================================================================
// Fair cycle
// ============================================================================

/// Fair-cycle rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairCycleConfig {
    /// Master switch
    pub enabled: bool,
    /// How exhaustion records are keyed
    pub tracking_mode: TrackingMode,
    /// Treat all priority tiers as one pool when deciding resets
    pub cross_tier: bool,
    /// Cycle length in seconds; an exhausted credential is re-admitted once
    /// the cycle timer expires
    pub duration: f64,
    /// Fraction of the window limit that counts as exhaustion
    pub quota_threshold: f64,
    /// Skip the reset when the shortest remaining cooldown is below this
    pub reset_cooldown_threshold: f64,
}

impl Default for FairCycleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tracking_mode: TrackingMode::default(),
            cross_tier: false,
            duration: DEFAULT_FAIR_CYCLE_DURATION,
            quota_threshold: DEFAULT_FAIR_CYCLE_QUOTA_THRESHOLD,
            reset_cooldown_threshold: DEFAULT_RESET_COOLDOWN_THRESHOLD,
        }
    }
}

// ============================================================================
// Custom caps
// ============================================================================

/// Which credential tier a cap applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKey {
    /// Applies to any tier without a more specific cap
    Default,
    /// Applies to one priority level
    Priority(i32),
}

impl std::fmt::Display for TierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Priority(p) => write!(f, "{p}"),
        }
    }
}

/// How a cap's request ceiling is computed from the primary window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapLimit {
    /// The literal number
    Absolute(u64),
    /// Added to the window limit (negative values tighten); falls back to
    /// the magnitude when the limit is unknown
    Offset(i64),
    /// Percentage of the window limit; falls back to 1000 when unknown
    Percent(f64),
}

impl CapLimit {
    /// Fallback ceiling for percentage caps with no known window limit
    pub const PERCENT_FALLBACK: u64 = 1000;

    /// Resolve the effective request ceiling against the primary window's
    /// limit, clamped to zero
    #[must_use]
    pub fn resolve(&self, window_limit: Option<u64>) -> u64 {
        match (self, window_limit) {
            (Self::Absolute(n), _) => *n,
            (Self::Offset(delta), Some(limit)) => {
                let resolved = limit as i64 + delta;
                resolved.max(0) as u64
            }
            (Self::Offset(delta), None) => delta.unsigned_abs(),
            (Self::Percent(pct), Some(limit)) => ((limit as f64) * pct / 100.0).max(0.0) as u64,
            (Self::Percent(_), None) => Self::PERCENT_FALLBACK,
        }
    }
}

impl FromStr for CapLimit {
    type Err = String;

    /// Parse the env-var grammar: `"150"` absolute, `"-50"`/`"+20"` offset,
    /// `"80%"` percentage
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let value: f64 = pct
                .parse()
                .map_err(|_| format!("invalid cap percentage '{s}'"))?;
            return Ok(Self::Percent(value));
        }
        if s.starts_with('+') || s.starts_with('-') {
            let value: i64 = s.parse().map_err(|_| format!("invalid cap offset '{s}'"))?;
            return Ok(Self::Offset(value));
        }
        let value: u64 = s.parse().map_err(|_| format!("invalid cap value '{s}'"))?;
        Ok(Self::Absolute(value))
    }
}

/// How long a cap-triggered block lasts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapCooldown {
    /// Until the primary window's natural reset
    #[default]
    QuotaReset,
    /// `reset_at + offset` seconds, clamped to be no earlier than the reset;
    /// `now + |offset|` when the reset is unknown
    Offset(i64),
    /// A fixed number of seconds from now
    Fixed(u64),
}

impl FromStr for CapCooldown {
    type Err = String;

    /// Parse the env-var grammar: `"quota_reset"`, `"offset:300"`,
    /// `"fixed:3600"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, value) = match s.split_once(':') {
            Some((mode, value)) => (mode.trim(), Some(value.trim())),
            None => (s.trim(), None),
        };
        match mode {
            "quota_reset" => Ok(Self::QuotaReset),
            "offset" => {
                let value: i64 = value
                    .ok_or_else(|| "offset cooldown needs a value".to_string())?
                    .parse()
                    .map_err(|_| format!("invalid cooldown offset in '{s}'"))?;
                Ok(Self::Offset(value))
            }
            "fixed" => {
                let value: u64 = value
                    .ok_or_else(|| "fixed cooldown needs a value".to_string())?
                    .parse()
                    .map_err(|_| format!("invalid fixed cooldown in '{s}'"))?;
                Ok(Self::Fixed(value))
            }
            other => Err(format!("unknown cooldown mode '{other}'")),
        }
    }
}

/// A user-defined cap tighter than the upstream limit, keyed by tier and
/// model-or-group name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomCap {
    /// Which tier the cap applies to
    pub tier: TierKey,
    /// Model or quota-group name
    pub target: String,
    /// Request ceiling
    pub limit: CapLimit,
    /// Block duration once the ceiling is hit
    pub cooldown: CapCooldown,
}

// ============================================================================
// Provider configuration
// ============================================================================

/// Complete rotation configuration for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Rotation strategy
    pub rotation_mode: RotationMode,
    /// Randomness of the balanced strategy
    pub rotation_tolerance: f64,
    /// Priority -> concurrent slots, both modes
    pub priority_multipliers: BTreeMap<i32, u32>,
    /// Mode-specific overrides of `priority_multipliers`
    pub priority_multipliers_by_mode: BTreeMap<RotationMode, BTreeMap<i32, u32>>,
    /// Concurrent slots for priorities not listed above, sequential mode
    pub sequential_fallback_multiplier: u32,
    /// Fair-cycle settings
    pub fair_cycle: FairCycleConfig,
    /// User-defined caps
    pub custom_caps: Vec<CustomCap>,
    /// A cooldown at or beyond this implies exhaustion, in seconds
    pub exhaustion_cooldown_threshold: f64,
    /// Whether locally tracked window limits block selection (default: only
    /// upstream errors block)
    pub window_limits_enabled: bool,
    /// Window definitions
    pub windows: Vec<WindowDefinition>,
    /// UTC reset time for fixed-daily windows, "HH:MM"
    pub daily_reset_time_utc: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            rotation_mode: RotationMode::Balanced,
            rotation_tolerance: DEFAULT_ROTATION_TOLERANCE,
            priority_multipliers: BTreeMap::new(),
            priority_multipliers_by_mode: BTreeMap::new(),
            sequential_fallback_multiplier: DEFAULT_SEQUENTIAL_FALLBACK_MULTIPLIER,
            fair_cycle: FairCycleConfig::default(),
            custom_caps: Vec::new(),
            exhaustion_cooldown_threshold: DEFAULT_EXHAUSTION_COOLDOWN_THRESHOLD,
            window_limits_enabled: false,
            windows: Vec::new(),
            daily_reset_time_utc: DEFAULT_DAILY_RESET_UTC.to_string(),
        }
    }
}

impl ProviderConfig {
    /// Concurrent slots for a credential of the given priority, or `None`
    /// when no multiplier applies (unlimited)
    #[must_use]
    pub fn max_concurrent_for(&self, priority: i32) -> Option<u32> {
        if let Some(by_mode) = self.priority_multipliers_by_mode.get(&self.rotation_mode) {
            if let Some(slots) = by_mode.get(&priority) {
                return Some(*slots);
            }
        }
        if let Some(slots) = self.priority_multipliers.get(&priority) {
            return Some(*slots);
        }
        match self.rotation_mode {
            RotationMode::Sequential => Some(self.sequential_fallback_multiplier),
            RotationMode::Balanced => None,
        }
    }

    /// The single primary window definition, if one is configured
    #[must_use]
    pub fn primary_window(&self) -> Option<&WindowDefinition> {
        self.windows.iter().find(|w| w.is_primary)
    }

    /// Apply environment-variable overrides for `provider` from the process
    /// environment. Overrides always win over the current values.
    #[must_use]
    pub fn with_env_overrides(self, provider: &str) -> Self {
        self.with_env_overrides_from(provider, std::env::vars())
    }

    /// Apply environment-variable overrides from an explicit variable list.
    /// Invalid values log a warning and keep the previous setting.
    #[must_use]
    pub fn with_env_overrides_from<I>(mut self, provider: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let upper = provider.to_uppercase();
        let vars: BTreeMap<String, String> = vars.into_iter().collect();

        if let Some(raw) = vars.get(&format!("ROTATION_MODE_{upper}")) {
            match raw.parse() {
                Ok(mode) => self.rotation_mode = mode,
                Err(_) => warn!(provider, value = %raw, "invalid ROTATION_MODE, keeping current"),
            }
        }

        if let Some(raw) = vars.get(&format!("FAIR_CYCLE_{upper}")) {
            self.fair_cycle.enabled = parse_bool(raw);
        }

        if let Some(raw) = vars.get(&format!("FAIR_CYCLE_TRACKING_MODE_{upper}")) {
            match raw.to_lowercase().as_str() {
                "model_group" => self.fair_cycle.tracking_mode = TrackingMode::ModelGroup,
                "credential" => self.fair_cycle.tracking_mode = TrackingMode::Credential,
                _ => warn!(provider, value = %raw, "invalid FAIR_CYCLE_TRACKING_MODE"),
            }
        }

        if let Some(raw) = vars.get(&format!("FAIR_CYCLE_CROSS_TIER_{upper}")) {
            self.fair_cycle.cross_tier = parse_bool(raw);
        }

        if let Some(raw) = vars.get(&format!("FAIR_CYCLE_DURATION_{upper}")) {
            match raw.parse::<f64>() {
                Ok(seconds) if seconds > 0.0 => self.fair_cycle.duration = seconds,
                _ => warn!(provider, value = %raw, "invalid FAIR_CYCLE_DURATION"),
            }
        }

        let threshold = vars
            .get(&format!("EXHAUSTION_COOLDOWN_THRESHOLD_{upper}"))
            .or_else(|| vars.get("EXHAUSTION_COOLDOWN_THRESHOLD"));
        if let Some(raw) = threshold {
            match raw.parse::<f64>() {
                Ok(seconds) if seconds > 0.0 => self.exhaustion_cooldown_threshold = seconds,
                _ => warn!(provider, value = %raw, "invalid EXHAUSTION_COOLDOWN_THRESHOLD"),
            }
        }

        self.apply_multiplier_vars(&upper, &vars);
        self.apply_custom_cap_vars(&upper, &vars);
        self
    }

    /// `CONCURRENCY_MULTIPLIER_<P>_PRIORITY_<N>[_<MODE>]=<slots>`
    fn apply_multiplier_vars(&mut self, upper: &str, vars: &BTreeMap<String, String>) {
        let prefix = format!("CONCURRENCY_MULTIPLIER_{upper}_PRIORITY_");
        for (key, raw) in vars {
            let Some(remainder) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(slots) = raw.parse::<u32>() else {
                warn!(key = %key, value = %raw, "invalid concurrency multiplier");
                continue;
            };
            if slots < 1 {
                warn!(key = %key, value = %raw, "concurrency multiplier must be >= 1");
                continue;
            }

            if let Some((priority_raw, mode_raw)) = remainder.rsplit_once('_') {
                if let (Ok(priority), Ok(mode)) =
                    (priority_raw.parse::<i32>(), mode_raw.to_lowercase().parse())
                {
                    self.priority_multipliers_by_mode
                        .entry(mode)
                        .or_default()
                        .insert(priority, slots);
                    continue;
                }
            }
            match remainder.parse::<i32>() {
                Ok(priority) => {
                    self.priority_multipliers.insert(priority, slots);
                }
                Err(_) => warn!(key = %key, "could not parse priority from multiplier var"),
            }
        }
    }

    /// `CUSTOM_CAP_<P>_T<TIER>_<MODEL>=<limit>` and
    /// `CUSTOM_CAP_COOLDOWN_<P>_T<TIER>_<MODEL>=<mode>[:<value>]`
    fn apply_custom_cap_vars(&mut self, upper: &str, vars: &BTreeMap<String, String>) {
        let cap_prefix = format!("CUSTOM_CAP_{upper}_T");
        let cooldown_prefix = format!("CUSTOM_CAP_COOLDOWN_{upper}_T");

        let mut staged: BTreeMap<(TierKey, String), (Option<CapLimit>, Option<CapCooldown>)> =
            BTreeMap::new();

        for (key, raw) in vars {
            if let Some(remainder) = key.strip_prefix(&cooldown_prefix) {
                let Some((tier, target)) = parse_tier_target(remainder) else {
                    continue;
                };
                match raw.parse::<CapCooldown>() {
                    Ok(cooldown) => {
                        staged.entry((tier, target)).or_default().1 = Some(cooldown);
                    }
                    Err(err) => warn!(key = %key, %err, "invalid custom cap cooldown"),
                }
            } else if let Some(remainder) = key.strip_prefix(&cap_prefix) {
                let Some((tier, target)) = parse_tier_target(remainder) else {
                    warn!(key = %key, "could not parse tier/target from custom cap var");
                    continue;
                };
                match raw.parse::<CapLimit>() {
                    Ok(limit) => {
                        staged.entry((tier, target)).or_default().0 = Some(limit);
                    }
                    Err(err) => warn!(key = %key, %err, "invalid custom cap limit"),
                }
            }
        }

        for ((tier, target), (limit, cooldown)) in staged {
            // A cooldown var without a matching cap var configures nothing
            let Some(limit) = limit else { continue };
            self.custom_caps.push(CustomCap {
                tier,
                target,
                limit,
                cooldown: cooldown.unwrap_or_default(),
            });
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes")
}

/// Parse `"2_ACME_LARGE"` or `"DEFAULT_ACME_LARGE"` into a tier key and a
/// lowercased, dash-separated target name.
fn parse_tier_target(remainder: &str) -> Option<(TierKey, String)> {
    let (tier_raw, target_raw) = remainder.split_once('_')?;
    if target_raw.is_empty() {
        return None;
    }
    let tier = if tier_raw.eq_ignore_ascii_case("DEFAULT") {
        TierKey::Default
    } else {
        TierKey::Priority(tier_raw.parse().ok()?)
    };
    Some((tier, target_raw.to_lowercase().replace('_', "-")))
}
