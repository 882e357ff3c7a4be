//! Device Hierarchy Cache
//!
//! Node-wide map from device path to the last observed snapshot of that
//! device. Partitions resolve their parent disk through it.

use super::device::BlockDevice;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Last observed snapshot per device path
#[derive(Debug, Default)]
pub struct HierarchyCache {
    devices: RwLock<HashMap<String, BlockDevice>>,
}

impl HierarchyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest snapshot for its path.
    ///
    /// Returns true if the path was already cached, which means the event was
    /// most likely generated by a partition table re-read.
    pub fn upsert(&self, device: BlockDevice) -> bool {
        let path = device.dev_path.clone();
        let existed = self.devices.write().insert(path.clone(), device).is_some();
        if existed {
            debug!(
                device = %path,
                "device already in cache, event likely generated by a partition table re-read"
            );
        } else {
            debug!(device = %path, "device not in cache, device is now connected to this node");
        }
        existed
    }

    /// Get the cached snapshot for a path
    pub fn lookup(&self, path: &str) -> Option<BlockDevice> {
        self.devices.read().get(path).cloned()
    }

    /// Resolve the parent disk of a partition
    pub fn parent_of(&self, device: &BlockDevice) -> Result<BlockDevice> {
        let parent = device.dependent_devices.parent.clone().unwrap_or_default();
        self.lookup(&parent).ok_or_else(|| Error::MissingParent {
            device: device.dev_path.clone(),
            parent,
        })
    }

    /// Number of cached devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
