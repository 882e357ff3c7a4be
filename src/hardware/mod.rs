//! Hardware Module
//!
//! Block device snapshots, the node-wide device hierarchy cache, identifier
//! derivation, discovery and the single-partition writer.

pub mod device;
pub mod discovery;
pub mod hierarchy;
pub mod identity;
pub mod partition;

pub use device::*;
pub use discovery::*;
pub use hierarchy::HierarchyCache;
pub use identity::*;
pub use partition::{PartitionBounds, SgdiskPartitioner};
