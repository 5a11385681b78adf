//! Impls - in-process implementations of the ports.
//!
//! - **KeywordDecomposer**: rule-based objective decomposition
//! - **StaticDecomposer**: fixed candidate graph (tests, replays)
//! - **InMemoryEventSink**: event record kept in memory

pub mod keyword_decomposer;
pub mod memory_sink;
pub mod static_decomposer;

pub use self::keyword_decomposer::{KeywordDecomposer, KeywordRule};
pub use self::memory_sink::InMemoryEventSink;
pub use self::static_decomposer::StaticDecomposer;
