//! Pending job model
//!
//! A [`PendingJob`] is the queue row saying "the next action of this
//! resource is due". There is at most one row per resource URN; workers
//! claim rows under a time-bounded lease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Queue row for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: u64,
    pub resource_urn: String,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,

    /// Retained after exhausting retries; never ready until re-planned
    #[serde(default)]
    pub parked: bool,
}

impl PendingJob {
    pub fn new(id: u64, resource_urn: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            id,
            resource_urn: resource_urn.into(),
            run_at,
            claimed_by: None,
            claimed_until: None,
            last_error: None,
            attempts: 0,
            parked: false,
        }
    }

    /// Whether some worker holds an unexpired lease at `now`
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.claimed_until.is_some_and(|until| until > now)
    }

    /// Whether `worker_id` holds an unexpired lease at `now`
    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.is_leased(now) && self.claimed_by.as_deref() == Some(worker_id)
    }

    /// A job is ready when it is due and not held under a valid lease
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.parked && self.run_at <= now && !self.is_leased(now)
    }

    pub(crate) fn claim(&mut self, worker_id: &str, now: DateTime<Utc>, ttl: Duration) {
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_until = Some(now + ttl);
    }

    pub(crate) fn release(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }
}

/// How a claimed job ends, applied atomically with the resource write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The resource reached a steady state; delete the row
    Done,

    /// The step succeeded and a follow-up is due at `run_at`; attempts reset
    Continue { run_at: DateTime<Utc> },

    /// The step failed; retry at `run_at` with `attempts += 1`
    Retry {
        run_at: DateTime<Utc>,
        error: String,
    },

    /// The step failed for the last time; keep the row but never run it
    Park { error: String },
}

/// Request to (re)schedule a resource's job alongside a resource write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub run_at: DateTime<Utc>,

    /// Start a fresh attempt streak (un-parks a parked job)
    pub reset_attempts: bool,
}

impl Schedule {
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at,
            reset_attempts: false,
        }
    }

    pub fn fresh(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at,
            reset_attempts: true,
        }
    }
}
