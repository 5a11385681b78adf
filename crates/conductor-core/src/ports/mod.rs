//! Ports - seams to the outside world.
//!
//! Each trait is a collaborator the scheduler consumes but does not implement
//! itself: time, id minting, objective decomposition and the event record.

pub mod clock;
pub mod decomposer;
pub mod event_sink;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::decomposer::ObjectiveDecomposer;
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
