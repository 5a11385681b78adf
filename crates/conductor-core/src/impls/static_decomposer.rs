//! StaticDecomposer - returns a fixed candidate graph, whatever the objective.

use async_trait::async_trait;

use crate::domain::{Capability, DecomposeError, Decomposition};
use crate::ports::ObjectiveDecomposer;

#[derive(Debug, Clone)]
pub struct StaticDecomposer {
    decomposition: Decomposition,
}

impl StaticDecomposer {
    pub fn new(decomposition: Decomposition) -> Self {
        Self { decomposition }
    }
}

#[async_trait]
impl ObjectiveDecomposer for StaticDecomposer {
    async fn decompose(
        &self,
        _objective: &str,
        _capabilities: &[Capability],
    ) -> Result<Decomposition, DecomposeError> {
        Ok(self.decomposition.clone())
    }
}
