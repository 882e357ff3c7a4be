//! BlockDevice Store Adapters
//!
//! Provides adapters for the BlockDevice resource store:
//! - Kubernetes: BlockDevice custom resources
//! - Memory: standalone mode

pub mod kubernetes;
pub mod memory;

pub use kubernetes::*;
pub use memory::*;
