// Per-platform request budgets and adaptive backoff.
//
// The guard never sleeps: every decision is a pure function of the injected
// `now`, and waits come back as durations for the orchestrator's timers.
// Counters only move through `record_dispatch`, never speculatively.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Days, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Rolling per-IP window length.
const IP_WINDOW_SECS: i64 = 60;

/// Longest tolerated wait for the hourly counter to reset; anything beyond
/// this aborts the platform crawl instead of stalling.
const HOURLY_WAIT_CEILING_SECS: i64 = 300;

/// Clamp on any single computed wait.
const MAX_SINGLE_WAIT_SECS: f64 = 300.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformLimits {
    pub daily: u32,
    pub hourly: u32,
    /// Minimum spacing between requests, in seconds.
    pub delay_secs: f64,
    /// Ceiling for the adaptive backoff, in seconds.
    pub max_backoff_secs: f64,
}

impl PlatformLimits {
    /// Built-in per-platform budget table.
    pub fn builtin(platform: &str) -> Self {
        match platform {
            "google_maps" => Self {
                daily: 5000,
                hourly: 500,
                delay_secs: 3.0,
                max_backoff_secs: 120.0,
            },
            "yemeksepeti" => Self {
                daily: 10_000,
                hourly: 1000,
                delay_secs: 1.0,
                max_backoff_secs: 60.0,
            },
            "tripadvisor" => Self {
                daily: 8000,
                hourly: 800,
                delay_secs: 2.0,
                max_backoff_secs: 90.0,
            },
            "foursquare" => Self {
                daily: 15_000,
                hourly: 1500,
                delay_secs: 0.5,
                max_backoff_secs: 60.0,
            },
            _ => Self {
                daily: 10_000,
                hourly: 1000,
                delay_secs: 2.0,
                max_backoff_secs: 90.0,
            },
        }
    }
}

/// Verdict for one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    /// Go ahead after waiting this long (hourly remainder + IP window
    /// remainder + inter-request spacing + active backoff, additively).
    Proceed { wait: Duration },
    /// The platform crawl must stop; partial progress stays checkpointed.
    AbortPlatform { reason: String },
}

#[derive(Debug)]
struct PlatformState {
    daily_count: u32,
    hourly_count: u32,
    daily_reset_at: DateTime<Utc>,
    hourly_reset_at: DateTime<Utc>,
    backoff_secs: f64,
    last_dispatch_at: Option<DateTime<Utc>>,
}

impl PlatformState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_count: 0,
            hourly_count: 0,
            daily_reset_at: next_day_start(now),
            hourly_reset_at: next_hour_start(now),
            backoff_secs: 0.0,
            last_dispatch_at: None,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.daily_reset_at {
            if self.daily_count > 0 {
                tracing::info!(count = self.daily_count, "daily counter reset");
            }
            self.daily_count = 0;
            self.daily_reset_at = next_day_start(now);
        }
        if now >= self.hourly_reset_at {
            self.hourly_count = 0;
            self.hourly_reset_at = next_hour_start(now);
        }
    }
}

pub struct QuotaGuard {
    overrides: HashMap<String, PlatformLimits>,
    states: HashMap<String, PlatformState>,
    ip_log: HashMap<String, Vec<DateTime<Utc>>>,
    /// Max requests per proxy IP inside the rolling window.
    per_ip_limit: usize,
}

impl Default for QuotaGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaGuard {
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            states: HashMap::new(),
            ip_log: HashMap::new(),
            per_ip_limit: 2,
        }
    }

    pub fn with_limits(mut self, platform: impl Into<String>, limits: PlatformLimits) -> Self {
        self.overrides.insert(platform.into(), limits);
        self
    }

    pub fn with_per_ip_limit(mut self, per_ip_limit: usize) -> Self {
        self.per_ip_limit = per_ip_limit;
        self
    }

    pub fn limits_for(&self, platform: &str) -> PlatformLimits {
        self.overrides
            .get(platform)
            .cloned()
            .unwrap_or_else(|| PlatformLimits::builtin(platform))
    }

    /// Evaluate every budget before a dispatch. Does not mutate counters
    /// beyond rolling expired reset boundaries.
    pub fn gate(&mut self, platform: &str, proxy_ip: Option<&str>, now: DateTime<Utc>) -> Gate {
        let limits = self.limits_for(platform);
        let state = self
            .states
            .entry(platform.to_string())
            .or_insert_with(|| PlatformState::new(now));
        state.roll(now);

        if state.daily_count >= limits.daily {
            tracing::error!(
                platform,
                limit = limits.daily,
                "daily request limit reached, aborting platform crawl"
            );
            return Gate::AbortPlatform {
                reason: format!(
                    "daily request limit reached: {}/{}",
                    state.daily_count, limits.daily
                ),
            };
        }

        let mut wait = 0.0f64;

        if state.hourly_count >= limits.hourly {
            let remaining = (state.hourly_reset_at - now).num_seconds();
            if remaining > HOURLY_WAIT_CEILING_SECS {
                tracing::error!(
                    platform,
                    remaining,
                    "hourly limit reached and reset is too far away, aborting platform crawl"
                );
                return Gate::AbortPlatform {
                    reason: format!(
                        "hourly request limit reached, reset in {remaining}s exceeds wait ceiling"
                    ),
                };
            }
            tracing::warn!(platform, remaining, "hourly limit reached, waiting for reset");
            wait += remaining.max(0) as f64;
        }

        if let Some(last) = state.last_dispatch_at {
            let elapsed = (now - last).num_milliseconds() as f64 / 1000.0;
            let spacing = (limits.delay_secs - elapsed).max(0.0);
            if spacing > 0.0 {
                wait += spacing + state.backoff_secs;
            }
        } else if state.backoff_secs > 0.0 {
            wait += state.backoff_secs;
        }

        if let Some(ip) = proxy_ip {
            wait += self.ip_wait_secs(ip, now);
        }

        let wait = wait.min(MAX_SINGLE_WAIT_SECS);
        Gate::Proceed {
            wait: Duration::from_secs_f64(wait.max(0.0)),
        }
    }

    /// Account for a request that is being sent now.
    pub fn record_dispatch(&mut self, platform: &str, proxy_ip: Option<&str>, now: DateTime<Utc>) {
        let state = self
            .states
            .entry(platform.to_string())
            .or_insert_with(|| PlatformState::new(now));
        state.daily_count += 1;
        state.hourly_count += 1;
        state.last_dispatch_at = Some(now);

        if let Some(ip) = proxy_ip {
            let cutoff = now - chrono::Duration::seconds(IP_WINDOW_SECS);
            let log = self.ip_log.entry(ip.to_string()).or_default();
            log.retain(|t| *t > cutoff);
            log.push(now);
        }
    }

    /// Backoff bookkeeping from a response status code.
    pub fn note_response(
        &mut self,
        platform: &str,
        status: u16,
        retry_after_secs: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let limits = self.limits_for(platform);
        let state = self
            .states
            .entry(platform.to_string())
            .or_insert_with(|| PlatformState::new(now));

        match status {
            429 => {
                let mut next = (state.backoff_secs * 2.0)
                    .max(limits.delay_secs)
                    .min(limits.max_backoff_secs);
                if let Some(hint) = retry_after_secs {
                    next = hint.min(limits.max_backoff_secs);
                }
                tracing::warn!(
                    platform,
                    from = state.backoff_secs,
                    to = next,
                    retry_after = ?retry_after_secs,
                    "429 received, backoff increased"
                );
                state.backoff_secs = next;
            }
            403 | 407 => {
                let next = (state.backoff_secs * 2.0)
                    .max(limits.delay_secs)
                    .min(limits.max_backoff_secs);
                tracing::warn!(platform, status, backoff = next, "ban signature status, backoff increased");
                state.backoff_secs = next;
            }
            200..=399 => {
                if state.backoff_secs > 0.0 {
                    tracing::debug!(platform, "successful response, backoff reset");
                }
                state.backoff_secs = 0.0;
            }
            500..=599 => {
                let next = (state.backoff_secs * 1.5)
                    .max(limits.delay_secs)
                    .min(limits.max_backoff_secs);
                tracing::debug!(platform, status, backoff = next, "server error, backoff nudged up");
                state.backoff_secs = next;
            }
            _ => {}
        }
    }

    /// Connection errors and timeouts get the full doubling, same as a ban.
    pub fn note_transport_failure(&mut self, platform: &str, now: DateTime<Utc>) {
        let limits = self.limits_for(platform);
        let state = self
            .states
            .entry(platform.to_string())
            .or_insert_with(|| PlatformState::new(now));
        let next = (state.backoff_secs * 2.0)
            .max(limits.delay_secs)
            .min(limits.max_backoff_secs);
        state.backoff_secs = next;
    }

    /// Whether `ip` still has room in its rolling window. Used by the proxy
    /// pool as a selection filter.
    pub fn ip_window_ok(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - chrono::Duration::seconds(IP_WINDOW_SECS);
        match self.ip_log.get(ip) {
            Some(log) => log.iter().filter(|t| **t > cutoff).count() < self.per_ip_limit,
            None => true,
        }
    }

    fn ip_wait_secs(&self, ip: &str, now: DateTime<Utc>) -> f64 {
        let cutoff = now - chrono::Duration::seconds(IP_WINDOW_SECS);
        let Some(log) = self.ip_log.get(ip) else {
            return 0.0;
        };
        let in_window: Vec<_> = log.iter().filter(|t| **t > cutoff).collect();
        if in_window.len() < self.per_ip_limit {
            return 0.0;
        }
        let oldest = in_window
            .iter()
            .min()
            .map(|t| **t)
            .unwrap_or(now);
        let remainder =
            (oldest + chrono::Duration::seconds(IP_WINDOW_SECS) - now).num_milliseconds() as f64
                / 1000.0;
        remainder.max(1.0)
    }

    pub fn backoff_secs(&self, platform: &str) -> f64 {
        self.states
            .get(platform)
            .map(|s| s.backoff_secs)
            .unwrap_or(0.0)
    }

    pub fn daily_count(&self, platform: &str) -> u32 {
        self.states.get(platform).map(|s| s.daily_count).unwrap_or(0)
    }
}

/// Next midnight, UTC.
fn next_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    (now.date_naive() + Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

/// Next top of the hour, UTC.
fn next_hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("hour start is always valid")
        .and_utc()
        + chrono::Duration::hours(1)
}
