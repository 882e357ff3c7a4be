//! Custom Resource Definitions for the Node Disk Operator
//!
//! This module contains the CRD types:
//! - BlockDevice: a disk or partition published for storage consumers

pub mod block_device;

pub use block_device::*;
