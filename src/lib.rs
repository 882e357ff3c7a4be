//! Node Disk Operator
//!
//! Node-level block device probe. Discovers the block devices of a node,
//! derives a stable identifier for each of them and reconciles that identity
//! against the cluster-wide `BlockDevice` resources, so storage engines can
//! claim devices without ever having a claimed device overwritten.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Probe Daemon                            │
//! │        (periodic rescan, backoff retry, shutdown token)          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   snapshots   ┌─────────────────────────┐  │
//! │  │ Hardware Scanner │ ────────────► │   Add Event Handler     │  │
//! │  │  (sysfs + udev)  │               │  Unmanaged → ParentOwned│  │
//! │  └──────────────────┘               │  → NeedsUpgrade         │  │
//! │                                     │  → NeedsIdentity        │  │
//! │  ┌──────────────────┐               │  → Reconcile            │  │
//! │  │ Hierarchy Cache  │ ◄───────────► └────────────┬────────────┘  │
//! │  └──────────────────┘                            │               │
//! ├──────────────────────────────────────────────────┼───────────────┤
//! │            BlockDevice Store (Kubernetes / memory)   Partitioner │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`probe`]: Add-event engine and daemon
//! - [`hardware`]: Device snapshots, hierarchy cache, identifiers, discovery
//! - [`crd`]: BlockDevice custom resource
//! - [`store`]: BlockDevice store adapters
//! - [`domain`]: Store and partitioner ports
//! - [`config`]: Probe configuration and path filters
//! - [`error`]: Error types and handling

pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod probe;
pub mod store;

// Re-export commonly used types
pub use config::{FilterConfig, PathFilter, ProbeConfig};

pub use crd::{BlockDeviceResource, BlockDeviceSpec, BlockDeviceStatus, ClaimState, DeviceState};

pub use domain::ports::{BlockDeviceList, BlockDeviceStore, Partitioner};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    BlockDevice, HardwareScanner, HierarchyCache, ScannerConfig, SgdiskPartitioner, UsedBy,
};

pub use probe::{AddOutcome, Controller, ProbeDaemon, ProbeEvent, ProbeMetrics, SkipReason};

pub use store::{InMemoryBlockDeviceStore, KubeBlockDeviceStore, KubeStoreConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
