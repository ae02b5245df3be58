//! Reconciliation and tiered metric refresh for externally published posts.
//!
//! The automation pipeline that publishes content never reports back which
//! platform item it created. Each run discovers recent platform items, matches
//! them to in-flight records by caption and timing, fails records that never
//! show up, and keeps metrics of matched records fresh on an age-based cadence.

pub mod aggregate;
pub mod freshness;
pub mod matcher;
pub mod notify;
pub mod orchestrator;
pub mod platform;
pub mod rate_limit;
pub mod scheduler;
pub mod selector;
pub mod sentinel;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;
pub mod types;

pub use orchestrator::{Orchestrator, ReconcileDeps, ReconcileSettings};
pub use scheduler::ReconcileScheduler;
pub use types::{ChannelStatus, RunReport, RunStats, RunStatus, SkipReason};
