//! SchedulerBuilder - wiring and fail-fast validation.
//!
//! Every port has an in-process default except the decomposer, which must be
//! supplied. `build()` validates the configuration before anything runs.

use std::sync::Arc;

use super::Scheduler;
use crate::config::{ConfigError, SchedulerConfig};
use crate::ports::{
    Clock, EventSink, IdGenerator, NoopEventSink, ObjectiveDecomposer, SystemClock, UlidGenerator,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no objective decomposer configured")]
    MissingDecomposer,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// # Example
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .decomposer(KeywordDecomposer::new())
///     .config(SchedulerConfig::from_file("conductor.toml")?)
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Option<Arc<dyn EventSink>>,
    decomposer: Option<Arc<dyn ObjectiveDecomposer>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            clock: None,
            ids: None,
            events: None,
            decomposer: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to a `UlidGenerator` stamped by the configured clock.
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn decomposer(mut self, decomposer: impl ObjectiveDecomposer + 'static) -> Self {
        self.decomposer = Some(Arc::new(decomposer));
        self
    }

    pub fn shared_decomposer(mut self, decomposer: Arc<dyn ObjectiveDecomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        self.config.validate()?;
        let decomposer = self.decomposer.ok_or(BuildError::MissingDecomposer)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let events = self.events.unwrap_or_else(|| Arc::new(NoopEventSink));

        Ok(Scheduler::new(self.config, clock, ids, events, decomposer))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::KeywordDecomposer;

    #[test]
    fn build_success() {
        let scheduler = SchedulerBuilder::new()
            .decomposer(KeywordDecomposer::new())
            .build();
        assert!(scheduler.is_ok());
    }

    #[test]
    fn build_without_decomposer_fails() {
        let scheduler = SchedulerBuilder::new().build();
        assert!(matches!(scheduler, Err(BuildError::MissingDecomposer)));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = SchedulerConfig::default();
        config.retry.max_attempts = 0;

        let scheduler = SchedulerBuilder::new()
            .decomposer(KeywordDecomposer::new())
            .config(config)
            .build();
        assert!(matches!(scheduler, Err(BuildError::Config(_))));
    }
}
