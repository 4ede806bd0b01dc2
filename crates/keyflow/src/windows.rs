// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Usage window lifecycle.
//!
//! The [`WindowManager`] creates, looks up, and resets the time-bucketed
//! counters defined by a provider's [`WindowDefinition`]s. Reset policy
//! spans rolling durations, a fixed daily UTC time, calendar boundaries
//! (Sunday 03:00 UTC, 1st of the month 03:00 UTC), and api-authoritative
//! windows that only reset when the upstream says so.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::config::{ResetMode, WindowDefinition};
use crate::state::{unix_now, WindowStats};

/// Calendar resets fire at 03:00 UTC
const CALENDAR_RESET_HOUR: u32 = 3;

/// Creates, looks up, and resets usage windows according to their
/// definitions
#[derive(Debug, Clone)]
pub struct WindowManager {
    definitions: BTreeMap<String, WindowDefinition>,
    daily_reset: (u32, u32),
}

impl WindowManager {
    /// Build a manager for the given definitions. `daily_reset_time_utc` is
    /// "HH:MM"; invalid values fall back to 03:00.
    #[must_use]
    pub fn new(definitions: &[WindowDefinition], daily_reset_time_utc: &str) -> Self {
        Self {
            definitions: definitions
                .iter()
                .map(|d| (d.name.clone(), d.clone()))
                .collect(),
            daily_reset: parse_daily_reset(daily_reset_time_utc),
        }
    }

    /// All known definitions
    #[must_use]
    pub fn definitions(&self) -> impl Iterator<Item = &WindowDefinition> {
        self.definitions.values()
    }

    /// Definition by name
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&WindowDefinition> {
        self.definitions.get(name)
    }

    /// The single definition marked primary, if any
    #[must_use]
    pub fn primary_definition(&self) -> Option<&WindowDefinition> {
        self.definitions.values().find(|d| d.is_primary)
    }

    /// An active (not due for reset) window by name. Windows without a known
    /// definition are returned as-is.
    #[must_use]
    pub fn active<'a>(
        &self,
        windows: &'a BTreeMap<String, WindowStats>,
        name: &str,
    ) -> Option<&'a WindowStats> {
        let window = windows.get(name)?;
        match self.definitions.get(name) {
            Some(definition) if self.should_reset(window, definition, unix_now()) => None,
            _ => Some(window),
        }
    }

    /// The active primary window, if any
    #[must_use]
    pub fn primary<'a>(
        &self,
        windows: &'a BTreeMap<String, WindowStats>,
    ) -> Option<&'a WindowStats> {
        let definition = self.primary_definition()?;
        self.active(windows, &definition.name)
    }

    /// An active window by name, created if absent or expired.
    ///
    /// A replacement carries forward the expired window's high-water mark
    /// (taking the final request count when it beats the recorded max) and
    /// its last observed limit, so baseline knowledge survives resets.
    /// `started_at` and `reset_at` stay unset until the first recorded use,
    /// to avoid fabricating reset times for unused windows.
    pub fn get_or_create<'a>(
        &self,
        windows: &'a mut BTreeMap<String, WindowStats>,
        name: &str,
        limit: Option<u64>,
    ) -> &'a mut WindowStats {
        let now = unix_now();
        match windows.entry(name.to_string()) {
            Entry::Vacant(vacant) => {
                let mut window = WindowStats::new(name);
                window.limit = limit;
                vacant.insert(window)
            }
            Entry::Occupied(mut occupied) => {
                let due = self
                    .definitions
                    .get(name)
                    .is_some_and(|d| self.should_reset(occupied.get(), d, now));
                if due {
                    let old = occupied.get();
                    let recorded_max = old.max_recorded_requests.unwrap_or(0);
                    let (carry_max, carry_max_at) = if old.request_count > recorded_max {
                        (old.request_count, old.last_used_at.or(Some(now)))
                    } else {
                        (recorded_max, old.max_recorded_at)
                    };

                    let mut window = WindowStats::new(name);
                    window.limit = limit.or(old.limit);
                    window.max_recorded_requests = (carry_max > 0).then_some(carry_max);
                    window.max_recorded_at = carry_max_at;
                    window.first_used_at = old.first_used_at;
                    occupied.insert(window);
                }
                occupied.into_mut()
            }
        }
    }

    /// Remaining requests in an active window, `None` when unlimited or
    /// unknown
    #[must_use]
    pub fn remaining(&self, windows: &BTreeMap<String, WindowStats>, name: &str) -> Option<u64> {
        self.active(windows, name).and_then(WindowStats::remaining)
    }

    /// Record a limit learned from the upstream. Idempotent.
    pub fn update_limit(
        &self,
        windows: &mut BTreeMap<String, WindowStats>,
        name: &str,
        new_limit: u64,
    ) {
        if let Some(window) = windows.get_mut(name) {
            window.limit = Some(new_limit);
        }
    }

    /// Record a reset timestamp learned from the upstream. Idempotent. This
    /// is the only way an api-authoritative window ever resets.
    pub fn update_reset_time(
        &self,
        windows: &mut BTreeMap<String, WindowStats>,
        name: &str,
        reset_at: f64,
    ) {
        if let Some(window) = windows.get_mut(name) {
            window.reset_at = Some(reset_at);
        }
    }

    /// Whether a window is due for reset at `now`
    #[must_use]
    pub fn should_reset(&self, window: &WindowStats, definition: &WindowDefinition, now: f64) -> bool {
        // An explicit reset time always wins
        if let Some(reset_at) = window.reset_at {
            return now >= reset_at;
        }
        // Unused windows never reset
        let Some(started_at) = window.started_at else {
            return false;
        };

        match definition.reset_mode {
            ResetMode::Rolling => definition
                .duration
                .is_some_and(|duration| now >= started_at + duration),
            ResetMode::FixedDaily => self
                .next_daily_reset(started_at)
                .is_some_and(|reset| now >= reset),
            ResetMode::CalendarWeekly => {
                next_weekly_reset(started_at).is_some_and(|reset| now >= reset)
            }
            ResetMode::CalendarMonthly => {
                next_monthly_reset(started_at).is_some_and(|reset| now >= reset)
            }
            ResetMode::ApiAuthoritative => false,
        }
    }

    /// When a window started at `start_time` will next reset, per its
    /// definition. `None` for infinite and api-authoritative windows.
    #[must_use]
    pub fn next_reset(&self, definition: &WindowDefinition, start_time: f64) -> Option<f64> {
        match definition.reset_mode {
            ResetMode::Rolling => definition.duration.map(|d| start_time + d),
            ResetMode::FixedDaily => self.next_daily_reset(start_time),
            ResetMode::CalendarWeekly => next_weekly_reset(start_time),
            ResetMode::CalendarMonthly => next_monthly_reset(start_time),
            ResetMode::ApiAuthoritative => None,
        }
    }

    fn next_daily_reset(&self, from_time: f64) -> Option<f64> {
        let from = utc_datetime(from_time)?;
        let (hour, minute) = self.daily_reset;
        let mut reset = from
            .with_hour(hour)?
            .with_minute(minute)?
            .with_second(0)?
            .with_nanosecond(0)?;
        if reset <= from {
            reset += Duration::days(1);
        }
        Some(reset.timestamp() as f64)
    }
}

fn parse_daily_reset(raw: &str) -> (u32, u32) {
    let parsed = raw.split_once(':').and_then(|(h, m)| {
        let hour: u32 = h.parse().ok()?;
        let minute: u32 = m.parse().ok()?;
        (hour < 24 && minute < 60).then_some((hour, minute))
    });
    parsed.unwrap_or((CALENDAR_RESET_HOUR, 0))
}

fn utc_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp as i64, 0).single()
}

/// Next Sunday 03:00 UTC strictly after the window start
fn next_weekly_reset(from_time: f64) -> Option<f64> {
    let from = utc_datetime(from_time)?;
    let mut days_until_sunday = (6 - from.weekday().num_days_from_monday()) % 7;
    if days_until_sunday == 0 && from.hour() >= CALENDAR_RESET_HOUR {
        days_until_sunday = 7;
    }
    let reset = from
        .with_hour(CALENDAR_RESET_HOUR)?
        .with_minute(0)?
        .with_second(0)?
        .with_nanosecond(0)?
        + Duration::days(i64::from(days_until_sunday));
    Some(reset.timestamp() as f64)
}

/// 1st of the following month, 03:00 UTC
fn next_monthly_reset(from_time: f64) -> Option<f64> {
    let from = utc_datetime(from_time)?;
    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };
    let reset = Utc
        .with_ymd_and_hms(year, month, 1, CALENDAR_RESET_HOUR, 0, 0)
        .single()?;
    Some(reset.timestamp() as f64)
}
