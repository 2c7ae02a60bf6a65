use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::config::{Limits, ProviderConfig};

/// How long a single error extends the penalty window, per recorded error.
const PENALTY_MINUTES_PER_ERROR: i64 = 10;
/// Penalty ceiling: one full day.
const PENALTY_CAP_MINUTES: i64 = 1440;

/// Why an admission attempt was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Provider is cooling down after upstream failures.
    ErrorLimited { minutes: i64 },
    Rpm { current: u64, limit: u64 },
    Tpm { current: u64, requested: u64, limit: u64 },
    Tpr { requested: u64, limit: u64 },
    Rpd { current: u64, limit: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ErrorLimited { minutes } => write!(f, "error_limited:{}", minutes),
            Rejection::Rpm { current, limit } => {
                write!(f, "RPM limit exceeded ({}/{} requests in the last minute)", current, limit)
            }
            Rejection::Tpm { current, requested, limit } => {
                write!(f, "TPM limit exceeded ({} + {} > {} tokens in the last minute)", current, requested, limit)
            }
            Rejection::Tpr { requested, limit } => {
                write!(f, "TPR limit exceeded ({} > {} tokens per request)", requested, limit)
            }
            Rejection::Rpd { current, limit } => {
                write!(f, "RPD limit exceeded ({}/{} requests today)", current, limit)
            }
        }
    }
}

/// Windowed counters for one provider. Created lazily on first mention,
/// lives for the process lifetime.
#[derive(Debug, Default)]
struct ProviderUsage {
    /// Timestamps of admitted requests, pruned to the last 60s.
    rpm_window: VecDeque<DateTime<Utc>>,
    /// (timestamp, tokens) of admitted requests, pruned to the last 60s.
    tpm_window: VecDeque<(DateTime<Utc>, u64)>,
    /// Requests admitted in the current calendar day.
    rpd: u64,
    /// Upstream failure timestamps, pruned to the last 24h.
    errors: VecDeque<DateTime<Utc>>,
}

impl ProviderUsage {
    /// Removes the aged-out prefix of every window. Windows are ordered by
    /// timestamp, so pruning never removes anything but the oldest prefix.
    fn prune(&mut self, now: DateTime<Utc>) {
        let minute_floor = now - Duration::seconds(60);
        while self.rpm_window.front().map_or(false, |t| *t <= minute_floor) {
            self.rpm_window.pop_front();
        }
        while self.tpm_window.front().map_or(false, |(t, _)| *t <= minute_floor) {
            self.tpm_window.pop_front();
        }
        self.prune_errors(now);
    }

    fn prune_errors(&mut self, now: DateTime<Utc>) {
        let day_floor = now - Duration::hours(24);
        while self.errors.front().map_or(false, |t| *t <= day_floor) {
            self.errors.pop_front();
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tpm_window.iter().map(|(_, tokens)| tokens).sum()
    }

    /// End of the penalty window: `min(10·n, 1440)` minutes past the newest
    /// error, where n is the error count in the last 24h.
    fn cooldown_deadline(&self) -> Option<DateTime<Utc>> {
        let last = *self.errors.back()?;
        let minutes = (PENALTY_MINUTES_PER_ERROR * self.errors.len() as i64).min(PENALTY_CAP_MINUTES);
        Some(last + Duration::minutes(minutes))
    }

    fn is_idle(&self) -> bool {
        self.rpm_window.is_empty() && self.tpm_window.is_empty() && self.errors.is_empty() && self.rpd == 0
    }
}

/// Live usage of one provider, as reported by `/api_usage`.
#[derive(Debug, Serialize)]
pub struct DimensionUsage {
    pub current: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ProviderSnapshot {
    pub rpm: DimensionUsage,
    pub tpm: DimensionUsage,
    pub rpd: DimensionUsage,
}

pub type UsageSnapshot = IndexMap<String, ProviderSnapshot>;

/// Token/request accounting engine. The sole shared mutable resource of the
/// gateway: one exclusive lock covers every read-modify-write, and the lock
/// is never held across I/O. For a fixed provider the sequence of
/// admit/commit/record_error/snapshot operations is totally ordered.
pub struct RateGovernor {
    inner: Mutex<HashMap<String, ProviderUsage>>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderUsage>> {
        // A poisoned lock means a panic inside a short arithmetic section;
        // the counters are still structurally sound.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks whether `provider` has budget for a request of `tokens` under
    /// `limits`. Does not record usage.
    pub fn admit(&self, provider: &str, limits: &Limits, tokens: u64) -> Result<(), Rejection> {
        self.admit_at(provider, limits, tokens, Utc::now())
    }

    fn admit_at(
        &self,
        provider: &str,
        limits: &Limits,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let mut map = self.lock();
        let usage = map.entry(provider.to_string()).or_default();
        usage.prune(now);
        Self::check(usage, limits, tokens, now)
    }

    fn check(
        usage: &ProviderUsage,
        limits: &Limits,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if let Some(deadline) = usage.cooldown_deadline() {
            if now < deadline {
                return Err(Rejection::ErrorLimited { minutes: (deadline - now).num_minutes() });
            }
        }
        if let Some(rpm) = limits.rpm {
            let current = usage.rpm_window.len() as u64;
            if current >= rpm {
                return Err(Rejection::Rpm { current, limit: rpm });
            }
        }
        if let Some(tpm) = limits.tpm {
            let current = usage.tokens_in_window();
            if current + tokens > tpm {
                return Err(Rejection::Tpm { current, requested: tokens, limit: tpm });
            }
        }
        if let Some(tpr) = limits.tpr {
            if tokens > tpr {
                return Err(Rejection::Tpr { requested: tokens, limit: tpr });
            }
        }
        if let Some(rpd) = limits.rpd {
            if usage.rpd >= rpd {
                return Err(Rejection::Rpd { current: usage.rpd, limit: rpd });
            }
        }
        Ok(())
    }

    /// Records consumed budget. Call iff `admit` accepted.
    pub fn commit(&self, provider: &str, tokens: u64) {
        self.commit_at(provider, tokens, Utc::now())
    }

    fn commit_at(&self, provider: &str, tokens: u64, now: DateTime<Utc>) {
        let mut map = self.lock();
        let usage = map.entry(provider.to_string()).or_default();
        usage.rpm_window.push_back(now);
        usage.tpm_window.push_back((now, tokens));
        usage.rpd += 1;
    }

    /// Admission and commit folded into a single lock acquisition, so no
    /// concurrent admission on the same provider can observe the gap between
    /// the two.
    pub fn try_admit_and_commit(
        &self,
        provider: &str,
        limits: &Limits,
        tokens: u64,
    ) -> Result<(), Rejection> {
        self.try_admit_and_commit_at(provider, limits, tokens, Utc::now())
    }

    fn try_admit_and_commit_at(
        &self,
        provider: &str,
        limits: &Limits,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let mut map = self.lock();
        let usage = map.entry(provider.to_string()).or_default();
        usage.prune(now);
        Self::check(usage, limits, tokens, now)?;
        usage.rpm_window.push_back(now);
        usage.tpm_window.push_back((now, tokens));
        usage.rpd += 1;
        Ok(())
    }

    /// Appends an upstream failure to the provider's error ledger.
    pub fn record_error(&self, provider: &str) {
        self.record_error_at(provider, Utc::now())
    }

    fn record_error_at(&self, provider: &str, now: DateTime<Utc>) {
        let mut map = self.lock();
        let usage = map.entry(provider.to_string()).or_default();
        usage.prune_errors(now);
        usage.errors.push_back(now);
    }

    /// Returns `Some(remaining_minutes)` while the provider is in penalty.
    pub fn error_state(&self, provider: &str) -> Option<i64> {
        self.error_state_at(provider, Utc::now())
    }

    fn error_state_at(&self, provider: &str, now: DateTime<Utc>) -> Option<i64> {
        let mut map = self.lock();
        let usage = map.get_mut(provider)?;
        usage.prune_errors(now);
        let deadline = usage.cooldown_deadline()?;
        if now < deadline {
            Some((deadline - now).num_minutes())
        } else {
            None
        }
    }

    /// Zeroes every provider's daily request count. Scheduled at local
    /// midnight; the minute windows are untouched.
    pub fn reset_daily(&self) {
        let mut map = self.lock();
        for usage in map.values_mut() {
            usage.rpd = 0;
        }
    }

    /// Prunes every error ledger and drops providers with no live state.
    /// Scheduled periodically.
    pub fn sweep_errors(&self) {
        self.sweep_errors_at(Utc::now())
    }

    fn sweep_errors_at(&self, now: DateTime<Utc>) {
        let mut map = self.lock();
        for usage in map.values_mut() {
            usage.prune(now);
        }
        map.retain(|_, usage| !usage.is_idle());
    }

    /// Clears all windows, daily counts and error ledgers.
    pub fn reset_all(&self) {
        self.lock().clear();
    }

    /// Current usage against configured limits for every known provider.
    pub fn snapshot(&self, providers: &IndexMap<String, ProviderConfig>) -> UsageSnapshot {
        self.snapshot_at(providers, Utc::now())
    }

    fn snapshot_at(
        &self,
        providers: &IndexMap<String, ProviderConfig>,
        now: DateTime<Utc>,
    ) -> UsageSnapshot {
        let mut map = self.lock();
        let mut out = UsageSnapshot::new();
        for (id, provider) in providers {
            let usage = map.entry(id.clone()).or_default();
            usage.prune(now);
            out.insert(
                id.clone(),
                ProviderSnapshot {
                    rpm: DimensionUsage {
                        current: usage.rpm_window.len() as u64,
                        limit: provider.limits.rpm,
                    },
                    tpm: DimensionUsage {
                        current: usage.tokens_in_window(),
                        limit: provider.limits.tpm,
                    },
                    rpd: DimensionUsage { current: usage.rpd, limit: provider.limits.rpd },
                },
            );
        }
        out
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}
