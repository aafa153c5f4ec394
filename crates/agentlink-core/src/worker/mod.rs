//! Worker process management
//!
//! Launches the worker, keeps one healthy generation connected, and restarts
//! it with backoff when it dies.

mod backoff;
mod bus;
#[cfg(test)]
pub(crate) mod fake;
mod launcher;
mod supervisor;

pub use backoff::{RestartDecision, RestartTracker};
pub use bus::{NotificationBus, SubscriptionToken};
pub(crate) use bus::{typed_subscriber, Subscriber};
pub use launcher::{ExitInfo, ProcessControl, ProcessLauncher, WorkerLauncher, WorkerProcess};
pub use supervisor::{Connection, Supervisor};

/// Log target for output coming from the worker itself
pub const WORKER_LOG_TARGET: &str = "agentlink::worker";
