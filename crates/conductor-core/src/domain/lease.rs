//! Leases: time-bounded, token-authenticated exclusive claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use super::{ExecutionId, TaskId, WorkerId};

/// Opaque proof of a lease.
///
/// The token carries the owning execution so the control surface can route a
/// report straight to that execution's lock. Workers must treat it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseToken {
    execution_id: ExecutionId,
    nonce: Ulid,
}

impl LeaseToken {
    pub fn new(execution_id: ExecutionId, nonce: Ulid) -> Self {
        Self {
            execution_id,
            nonce,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.nonce)
    }
}

/// A worker's exclusive claim on one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Why a lease stopped being valid. Kept so stale callers get a precise error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEnd {
    /// Completion or failure was reported with this token.
    Finished,

    /// TTL elapsed, or the holder was declared unreachable.
    Expired,

    /// The execution was cancelled while the lease was held.
    Cancelled,
}
