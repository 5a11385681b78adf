//! Runtime - runs a claimed task by dispatching on its capability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Capability;
use crate::queue::ClaimedTask;

/// Why a handler gave up on a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,

    /// Transient problems are retried with backoff while attempts remain.
    pub retryable: bool,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// A handler for one capability.
///
/// Returns the task's result on success.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &ClaimedTask) -> Result<String, HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler already registered for capability {0}")]
    DuplicateHandler(Capability),
}

/// Registry of handlers (capability -> handler).
///
/// Built during initialization, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Capability, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        capability: impl Into<Capability>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let capability = capability.into();
        if self.handlers.contains_key(&capability) {
            return Err(RegistryError::DuplicateHandler(capability));
        }
        self.handlers.insert(capability, handler);
        Ok(())
    }

    pub fn get(&self, capability: &Capability) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(capability)
    }

    /// Registered capabilities, sorted.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.handlers.keys().cloned().collect();
        caps.sort();
        caps
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct Runtime {
    registry: Arc<HandlerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one claimed task. A missing handler is a permanent failure.
    pub async fn execute(&self, task: &ClaimedTask) -> Result<String, HandlerError> {
        let handler = self
            .registry
            .get(&task.required_capability)
            .ok_or_else(|| {
                HandlerError::permanent(format!(
                    "no handler for capability {}",
                    task.required_capability
                ))
            })?;
        handler.handle(task).await
    }
}
