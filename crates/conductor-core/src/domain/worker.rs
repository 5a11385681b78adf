//! Worker records as tracked by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::{Capability, LeaseToken};

/// Caller-chosen worker identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,

    /// Missed the heartbeat deadline. Its leases were force-expired.
    Unreachable,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub capabilities: BTreeSet<Capability>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,

    /// Leases currently held, across all executions.
    #[serde(default)]
    pub held_leases: BTreeSet<LeaseToken>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        capabilities: BTreeSet<Capability>,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            capabilities,
            last_heartbeat_at: registered_at,
            status: WorkerStatus::Idle,
            held_leases: BTreeSet::new(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status != WorkerStatus::Unreachable
    }

    /// Busy while any lease is held; never overrides Unreachable.
    pub(crate) fn refresh_status(&mut self) {
        if self.status == WorkerStatus::Unreachable {
            return;
        }
        self.status = if self.held_leases.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
    }
}
