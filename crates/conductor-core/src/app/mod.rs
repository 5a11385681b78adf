//! App - background loops and the in-process task runtime.
//!
//! - **Runtime**: capability -> handler dispatch
//! - **WorkerGroup**: claim -> handle (renewing) -> report
//! - **SweeperLoop**: heartbeat detection and lease expiry on a timer

pub mod runtime;
pub mod sweeper_loop;
pub mod worker_loop;

pub use self::runtime::{HandlerError, HandlerRegistry, RegistryError, Runtime, TaskHandler};
pub use self::sweeper_loop::SweeperLoop;
pub use self::worker_loop::{WorkerGroup, WorkerOptions};
