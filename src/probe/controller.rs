//! Probe Controller
//!
//! Shared state of the probe on one node: the BlockDevice store, the
//! partitioner, the device hierarchy cache and the metrics. All store
//! mutations of the add-event handler go through here.

use super::metrics::ProbeMetrics;
use crate::crd::BlockDeviceResource;
use crate::domain::ports::{BlockDeviceList, BlockDeviceStoreRef, PartitionerRef};
use crate::error::{Error, Result};
use crate::hardware::{BlockDevice, HierarchyCache};
use tracing::{debug, info, warn};

/// Store operation labels used in metrics
pub(crate) mod operation {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DEACTIVATE: &str = "deactivate";
    pub const PARTITION: &str = "partition";
}

/// Store, partitioner and hierarchy shared by all add events on a node
pub struct Controller {
    store: BlockDeviceStoreRef,
    partitioner: PartitionerRef,
    hierarchy: HierarchyCache,
    metrics: ProbeMetrics,
}

impl Controller {
    pub fn new(store: BlockDeviceStoreRef, partitioner: PartitionerRef, metrics: ProbeMetrics) -> Self {
        Self {
            store,
            partitioner,
            hierarchy: HierarchyCache::new(),
            metrics,
        }
    }

    pub fn hierarchy(&self) -> &HierarchyCache {
        &self.hierarchy
    }

    pub fn metrics(&self) -> &ProbeMetrics {
        &self.metrics
    }

    /// Fetch a point-in-time snapshot of the node's resources
    pub async fn list_block_devices(&self) -> Result<BlockDeviceList> {
        let list = self.store.list().await?;
        debug!(store = self.store.store_name(), count = list.len(), "listed block devices");
        Ok(list)
    }

    /// Get a resource, `None` when it does not exist
    pub async fn get_block_device(&self, name: &str) -> Result<Option<BlockDeviceResource>> {
        match self.store.get(name).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a resource.
    ///
    /// A resource of the same name created after the list snapshot was taken
    /// is updated instead. Returns false in that case.
    pub async fn create_block_device(&self, resource: BlockDeviceResource) -> Result<bool> {
        let name = resource.name().to_string();
        match self.store.create(resource.clone()).await {
            Ok(()) => {
                self.metrics.record_store_operation(operation::CREATE);
                info!(name = %name, path = %resource.spec.path, "created BlockDevice resource");
                Ok(true)
            }
            Err(Error::ResourceExists { .. }) => {
                debug!(name = %name, "resource already exists, updating it");
                let existing = self.store.get(&name).await?;
                self.update_block_device(resource, &existing).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(name = %name, error = %e, "unable to create BlockDevice resource");
                Err(e)
            }
        }
    }

    /// Update a resource in place, keeping its claim
    pub async fn update_block_device(
        &self,
        resource: BlockDeviceResource,
        existing: &BlockDeviceResource,
    ) -> Result<()> {
        let name = existing.name().to_string();
        self.store.update(resource, existing).await?;
        self.metrics.record_store_operation(operation::UPDATE);
        info!(name = %name, claim_state = ?existing.claim_state(), "updated BlockDevice resource");
        Ok(())
    }

    /// Mark a resource inactive
    pub async fn deactivate_block_device(&self, resource: &BlockDeviceResource) -> Result<()> {
        self.store.deactivate(resource).await?;
        self.metrics.record_store_operation(operation::DEACTIVATE);
        info!(name = %resource.name(), "deactivated BlockDevice resource");
        Ok(())
    }

    /// Write a single partition spanning a raw disk
    pub async fn create_single_partition(&self, device: &BlockDevice) -> Result<()> {
        self.partitioner
            .create_single_partition(
                &device.dev_path,
                device.capacity.storage,
                u64::from(device.device_attributes.logical_block_size),
            )
            .await?;
        self.metrics.record_store_operation(operation::PARTITION);
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("store", &self.store.store_name())
            .field("cached_devices", &self.hierarchy.len())
            .finish()
    }
}
