//! Queue module: per-execution ready set, leases and retry backoff.

mod distribution;
mod retry;

pub use distribution::{ClaimedTask, Disposition, DistributionQueue, Release};
pub use retry::RetryPolicy;
