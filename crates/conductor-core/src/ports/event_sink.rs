//! EventSink port - append-only record of state changes.
//!
//! Emission happens while an execution lock is held, so implementations must
//! not block; durable sinks should buffer and write asynchronously.

use crate::domain::DomainEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}
