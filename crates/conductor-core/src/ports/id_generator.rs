//! IdGenerator port - id minting.
//!
//! `UlidGenerator` stamps ids with the injected clock, so a `FixedClock` yields
//! ids with a deterministic timestamp part.

use ulid::Ulid;

use crate::domain::{ExecutionId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn execution_id(&self) -> ExecutionId;

    fn task_id(&self) -> TaskId;

    /// Random part of a lease token.
    fn lease_nonce(&self) -> Ulid;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn execution_id(&self) -> ExecutionId {
        ExecutionId::from(self.next())
    }

    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn lease_nonce(&self) -> Ulid {
        self.next()
    }
}
