//! Domain Ports - Core trait definitions for the node disk operator
//!
//! These traits define the boundaries between the add-event engine and
//! external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::crd::BlockDeviceResource;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Resource Snapshot
// =============================================================================

/// Point-in-time list of BlockDevice resources fetched once per event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDeviceList {
    pub items: Vec<BlockDeviceResource>,
}

impl BlockDeviceList {
    pub fn new(items: Vec<BlockDeviceResource>) -> Self {
        Self { items }
    }

    /// Look up a resource by name within the snapshot
    pub fn find(&self, name: &str) -> Option<&BlockDeviceResource> {
        self.items.iter().find(|r| r.name() == name)
    }

    /// Look up a resource carrying the given annotation value
    pub fn find_by_annotation(&self, key: &str, value: &str) -> Option<&BlockDeviceResource> {
        if value.is_empty() {
            return None;
        }
        self.items.iter().find(|r| r.annotation(key) == Some(value))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<BlockDeviceResource>> for BlockDeviceList {
    fn from(items: Vec<BlockDeviceResource>) -> Self {
        Self::new(items)
    }
}

// =============================================================================
// BlockDevice Store Port
// =============================================================================

/// Port for the cluster-wide BlockDevice resource store
#[async_trait]
pub trait BlockDeviceStore: Send + Sync {
    /// Fetch a resource by name, `Error::ResourceNotFound` when absent
    async fn get(&self, name: &str) -> Result<BlockDeviceResource>;

    /// Create a resource, `Error::ResourceExists` when the name is taken
    async fn create(&self, resource: BlockDeviceResource) -> Result<()>;

    /// Replace the stored record with a new one merged onto it
    async fn update(
        &self,
        resource: BlockDeviceResource,
        existing: &BlockDeviceResource,
    ) -> Result<()>;

    /// Mark a resource inactive without deleting it
    async fn deactivate(&self, resource: &BlockDeviceResource) -> Result<()>;

    /// List resources of this node
    async fn list(&self) -> Result<BlockDeviceList>;

    /// Get store name
    fn store_name(&self) -> &str;
}

// =============================================================================
// Partitioner Port
// =============================================================================

/// Port for writing a partition table on a raw disk
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Write a fresh GPT with one partition spanning the disk
    async fn create_single_partition(
        &self,
        device_path: &str,
        disk_size: u64,
        logical_block_size: u64,
    ) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type BlockDeviceStoreRef = Arc<dyn BlockDeviceStore>;
pub type PartitionerRef = Arc<dyn Partitioner>;
