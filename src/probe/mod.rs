//! Probe Module
//!
//! Add-event engine of the node disk probe: ownership classification,
//! legacy upgrades and reconciliation of block device snapshots against
//! BlockDevice resources, plus the daemon feeding it.

pub mod add_handler;
pub mod controller;
pub mod daemon;
pub mod metrics;
pub mod ownership;
pub mod upgrade;

pub use add_handler::{AddOutcome, EventReport, ProbeEvent, SkipReason};
pub use controller::Controller;
pub use daemon::ProbeDaemon;
pub use metrics::ProbeMetrics;
pub use upgrade::UpgradePolicy;
