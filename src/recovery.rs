//! Failure accounting and backoff.
//!
//! Every failed cycle bumps `consecutive_failures` by one, whichever stage
//! failed, and yields a delay of
//! `min(base * 2^consecutive_failures, max) + U[0, delay * jitter_fraction]`.
//! A fully successful cycle resets the counter. Reaching
//! `max_consecutive_failures` escalates but never stops the service by
//! itself; what escalation does is the controller's decision.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;

/// Classification of a retryable stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// An external system was unreachable or timed out.
    Transient,
    /// An external system returned inconsistent results.
    Integrity,
    /// The killswitch is missing or wrong.
    Security,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Transient => f.write_str("transient"),
            FaultKind::Integrity => f.write_str("integrity"),
            FaultKind::Security => f.write_str("security"),
        }
    }
}

/// Rolling failure counters. Persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureState {
    /// Failed cycles since the last fully successful one.
    pub consecutive_failures: u32,
    /// Killswitch failures since the killswitch was last confirmed.
    #[serde(default)]
    pub security_failures: u32,
    /// When the last failure happened.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// No retry before this instant.
    pub backoff_until: Option<DateTime<Utc>>,
}

impl FailureState {
    /// Time left before `backoff_until`, if it is still in the future.
    pub fn remaining_backoff(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.backoff_until
            .and_then(|until| (until - now).to_std().ok())
            .filter(|d| !d.is_zero())
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// Updated counters.
    pub state: FailureState,
    /// How long to back off.
    pub delay: Duration,
    /// The escalation threshold has been reached.
    pub escalate: bool,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecoveryPolicy {
    /// Delay unit.
    pub base: Duration,
    /// Cap on the delay before jitter.
    pub max: Duration,
    /// Jitter upper bound as a fraction of the delay.
    pub jitter_fraction: f64,
    /// Escalation threshold.
    pub max_failures: u32,
}

impl From<&ServiceConfig> for RecoveryPolicy {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            base: Duration::from_secs(config.failure_backoff_base),
            max: Duration::from_secs(config.failure_backoff_max),
            jitter_fraction: config.jitter_fraction,
            max_failures: config.max_consecutive_failures,
        }
    }
}

impl RecoveryPolicy {
    /// Record a failed cycle.
    pub fn on_failure(
        &self,
        state: &FailureState,
        kind: FaultKind,
        now: DateTime<Utc>,
    ) -> RecoveryDecision {
        self.on_failure_with(state, kind, now, &mut rand::thread_rng())
    }

    /// [`RecoveryPolicy::on_failure`] with an explicit random source.
    pub fn on_failure_with<R: Rng + ?Sized>(
        &self,
        state: &FailureState,
        kind: FaultKind,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RecoveryDecision {
        let consecutive_failures = state.consecutive_failures.saturating_add(1);
        let security_failures = if kind == FaultKind::Security {
            state.security_failures.saturating_add(1)
        } else {
            state.security_failures
        };

        let delay = self.backoff_delay_with(consecutive_failures, rng);
        let backoff_until = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        RecoveryDecision {
            state: FailureState {
                consecutive_failures,
                security_failures,
                last_failure_at: Some(now),
                backoff_until,
            },
            delay,
            escalate: consecutive_failures >= self.max_failures,
        }
    }

    /// Reset after a fully successful cycle. Security history is kept.
    pub fn on_success(&self, state: &FailureState) -> FailureState {
        FailureState {
            consecutive_failures: 0,
            security_failures: state.security_failures,
            last_failure_at: state.last_failure_at,
            backoff_until: None,
        }
    }

    /// Reset the security counter once the killswitch is confirmed.
    pub fn on_killswitch_confirmed(&self, state: &FailureState) -> FailureState {
        FailureState {
            security_failures: 0,
            ..state.clone()
        }
    }

    /// The capped exponential delay before jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// The delay with jitter drawn from `rng`.
    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(failures);
        let spread = delay.as_secs_f64() * self.jitter_fraction;
        if spread <= 0.0 {
            return delay;
        }
        delay + Duration::from_secs_f64(rng.gen_range(0.0..=spread))
    }
}
