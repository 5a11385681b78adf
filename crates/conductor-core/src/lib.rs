//! conductor-core
//!
//! Dependency-aware task scheduling across a pool of workers.
//!
//! # Modules
//! - **domain**: ids, task states, specs, leases, workers, events, errors
//! - **graph**: task graph, dependency resolver, plan analysis
//! - **queue**: per-execution ready set, leases, retry policy
//! - **coordinator**: worker registry and liveness
//! - **orchestrator**: executions and the `Scheduler` control surface
//! - **ports**: Clock, IdGenerator, ObjectiveDecomposer, EventSink
//! - **impls**: in-process port implementations
//! - **app**: worker group, sweeper loop, handler runtime
//! - **config**: TOML configuration

pub mod app;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod orchestrator;
pub mod ports;
pub mod queue;

pub use config::{ConfigError, SchedulerConfig};
pub use domain::SchedulerError;
pub use orchestrator::{Scheduler, SchedulerBuilder};
