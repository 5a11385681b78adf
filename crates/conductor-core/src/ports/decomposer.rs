//! ObjectiveDecomposer port - turns an objective into a candidate task graph.
//!
//! The scheduler never trusts the output: it validates the candidate and
//! rejects cycles, dangling edges and unassignable capabilities before any
//! execution exists.

use async_trait::async_trait;

use crate::domain::{Capability, DecomposeError, Decomposition};

#[async_trait]
pub trait ObjectiveDecomposer: Send + Sync {
    /// Propose tasks and dependency edges for `objective`, using only the
    /// given roster capabilities.
    async fn decompose(
        &self,
        objective: &str,
        capabilities: &[Capability],
    ) -> Result<Decomposition, DecomposeError>;
}
