//! Add Event Handler
//!
//! Reconciles a block device snapshot against the BlockDevice resources of
//! the node. The decision tree runs as a small state machine:
//!
//! ```text
//! Unmanaged ──► ParentOwned ──► NeedsUpgrade ──► NeedsIdentity ──► Reconcile(uuid)
//!     │              │               │                 │                 │
//!     └──────────────┴───────────────┴─────────────────┴─────────────────┴──► AddOutcome
//! ```
//!
//! Each state either finishes the event with an [`AddOutcome`] or hands over
//! to the next state. At most one resource is created or updated per event,
//! plus the deactivation of a parent disk whose ownership moves to one of
//! its partitions.

use super::controller::Controller;
use crate::crd::{BlockDeviceResource, UUID_SCHEME_ANNOTATION};
use crate::domain::ports::BlockDeviceList;
use crate::error::{Error, Result};
use crate::hardware::{generate_uuid, BlockDevice, UuidScheme};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

// =============================================================================
// Outcomes
// =============================================================================

/// Why an event finished without touching the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Device belongs to a consumer whose devices are never published
    OpaqueConsumer,
    /// Parent disk is owned by a consumer publishing its own resources
    ParentShadowConsumer,
    /// Parent disk is in use, its consumer manages the partitions
    ParentInUse,
    /// Parent disk resource is claimed
    ParentClaimed,
    /// Device has no identity but already has partitions or holders
    HasDependents,
    /// Device has holders stacked on it
    HasHolders,
    /// Whole disk whose partitions generate their own events
    WholeDiskWithPartitions,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SkipReason::OpaqueConsumer => "in use by an unmanaged consumer",
            SkipReason::ParentShadowConsumer => "parent in use by zfs-localpv",
            SkipReason::ParentInUse => "parent in use",
            SkipReason::ParentClaimed => "parent claimed",
            SkipReason::HasDependents => "has partitions or holders",
            SkipReason::HasHolders => "has holders",
            SkipReason::WholeDiskWithPartitions => "whole disk with partitions",
        };
        f.write_str(reason)
    }
}

/// Result of processing one add event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Created { name: String },
    Updated { name: String },
    /// Parent resource deactivated in favour of a partition resource
    Migrated { from: String, to: String },
    /// Raw disk partitioned so it gets an identity on its next event
    PartitionCreated { device: String },
    Skipped(SkipReason),
}

impl AddOutcome {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            AddOutcome::Created { .. } => "created",
            AddOutcome::Updated { .. } => "updated",
            AddOutcome::Migrated { .. } => "migrated",
            AddOutcome::PartitionCreated { .. } => "partition_created",
            AddOutcome::Skipped(_) => "skipped",
        }
    }

    /// Check if the store was changed
    pub fn mutated_store(&self) -> bool {
        matches!(
            self,
            AddOutcome::Created { .. } | AddOutcome::Updated { .. } | AddOutcome::Migrated { .. }
        )
    }
}

/// Outcomes and failures of a batch of add events
#[derive(Debug, Default)]
pub struct EventReport {
    pub outcomes: Vec<(String, AddOutcome)>,
    pub failures: Vec<(BlockDevice, Error)>,
}

// =============================================================================
// State Machine
// =============================================================================

/// Decision points of an add event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum AddState {
    /// Check ownership by out-of-band consumers
    Unmanaged,
    /// Check whether the parent disk's consumer owns this partition
    ParentOwned,
    /// Migrate resources named by the legacy scheme
    NeedsUpgrade,
    /// Derive the identifier, partitioning the disk if it has none
    NeedsIdentity,
    /// Reconcile the identifier against the resource snapshot
    Reconcile(String),
}

pub(super) enum Transition {
    Next(AddState),
    Done(AddOutcome),
}

// =============================================================================
// Probe Event
// =============================================================================

/// Handles device add events for one node
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub(super) controller: Arc<Controller>,
}

impl ProbeEvent {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Process a batch of devices against one resource snapshot.
    ///
    /// Whole disks are processed before partitions. The snapshot is
    /// refreshed after every store mutation so later devices of the batch
    /// see resources created earlier. Failed devices are reported, not
    /// retried.
    pub async fn add_block_devices(&self, mut devices: Vec<BlockDevice>) -> Result<EventReport> {
        devices.sort_by_key(|d| d.is_partition());
        let mut list = self.controller.list_block_devices().await?;
        let mut report = EventReport::default();

        for device in devices {
            let path = device.dev_path.clone();
            match self.add_block_device(device.clone(), &list).await {
                Ok(outcome) => {
                    if outcome.mutated_store() {
                        list = self.controller.list_block_devices().await?;
                    }
                    report.outcomes.push((path, outcome));
                }
                Err(e) => report.failures.push((device, e)),
            }
        }
        Ok(report)
    }

    /// Process the add event of one device
    pub async fn add_block_device(
        &self,
        device: BlockDevice,
        list: &BlockDeviceList,
    ) -> Result<AddOutcome> {
        debug!(device = %device.dev_path, device_type = %device.device_attributes.device_type, "processing add event");
        self.controller.hierarchy().upsert(device.clone());

        match self.run(&device, list).await {
            Ok(outcome) => {
                match &outcome {
                    AddOutcome::Skipped(reason) => {
                        debug!(device = %device.dev_path, %reason, "add event skipped")
                    }
                    outcome => debug!(device = %device.dev_path, ?outcome, "add event processed"),
                }
                self.controller.metrics().record_event(outcome.label());
                Ok(outcome)
            }
            Err(e) => {
                if e.is_internal_consistency() {
                    error!(device = %device.dev_path, error = %e, "add event hit an unreachable state");
                } else {
                    warn!(device = %device.dev_path, error = %e, "add event failed");
                }
                self.controller.metrics().record_event("error");
                Err(e)
            }
        }
    }

    async fn run(&self, device: &BlockDevice, list: &BlockDeviceList) -> Result<AddOutcome> {
        let mut state = AddState::Unmanaged;
        loop {
            trace!(device = %device.dev_path, ?state, "add event state");
            let transition = match state {
                AddState::Unmanaged => self.on_unmanaged(device).await?,
                AddState::ParentOwned => self.on_parent_owned(device)?,
                AddState::NeedsUpgrade => self.on_needs_upgrade(device, list).await?,
                AddState::NeedsIdentity => self.on_needs_identity(device).await?,
                AddState::Reconcile(uuid) => self.on_reconcile(device, &uuid, list).await?,
            };
            match transition {
                Transition::Next(next) => state = next,
                Transition::Done(outcome) => return Ok(outcome),
            }
        }
    }

    // =========================================================================
    // Generic Path
    // =========================================================================

    /// A partition of an in-use disk is left to the disk's consumer
    fn on_parent_owned(&self, device: &BlockDevice) -> Result<Transition> {
        if !device.is_partition() {
            return Ok(Transition::Next(AddState::NeedsUpgrade));
        }
        let parent = self.controller.hierarchy().parent_of(device)?;
        if parent.dev_use.in_use {
            debug!(device = %device.dev_path, parent = %parent.dev_path, "parent device in use");
            return Ok(Transition::Done(AddOutcome::Skipped(SkipReason::ParentInUse)));
        }
        Ok(Transition::Next(AddState::NeedsUpgrade))
    }

    async fn on_needs_identity(&self, device: &BlockDevice) -> Result<Transition> {
        if let Some(uuid) = generate_uuid(device) {
            self.controller.hierarchy().upsert(device.with_uuid(uuid.clone()));
            return Ok(Transition::Next(AddState::Reconcile(uuid)));
        }

        // only raw disks are ever partitioned
        if device.is_partition() {
            return Err(Error::IdentityUnavailable {
                device: device.dev_path.clone(),
                scheme: "partition entry".into(),
            });
        }

        if device.has_partitions() || device.has_holders() {
            debug!(
                device = %device.dev_path,
                partitions = ?device.dependent_devices.partitions,
                holders = ?device.dependent_devices.holders,
                "no identity, dependents will generate their own events"
            );
            return Ok(Transition::Done(AddOutcome::Skipped(SkipReason::HasDependents)));
        }

        info!(device = %device.dev_path, "no identity available, creating single partition");
        self.controller.create_single_partition(device).await?;
        Ok(Transition::Done(AddOutcome::PartitionCreated {
            device: device.dev_path.clone(),
        }))
    }

    async fn on_reconcile(
        &self,
        device: &BlockDevice,
        uuid: &str,
        list: &BlockDeviceList,
    ) -> Result<Transition> {
        let device = device.with_uuid(uuid);

        let outcome = match list.find(uuid) {
            // a claimed resource keeps its claim, only its data is refreshed
            Some(existing) => {
                debug!(
                    device = %device.dev_path,
                    uuid = %uuid,
                    claim_state = ?existing.claim_state(),
                    "resource exists, refreshing it"
                );
                self.write_resource(&device, gpt_annotations(), Some(existing)).await?
            }
            None if device.is_partition() => self.reconcile_new_partition(&device, list).await?,
            None if device.has_partitions() => {
                AddOutcome::Skipped(SkipReason::WholeDiskWithPartitions)
            }
            None => self.write_resource(&device, gpt_annotations(), None).await?,
        };
        Ok(Transition::Done(outcome))
    }

    /// First sighting of a partition, ownership may move from its parent
    async fn reconcile_new_partition(
        &self,
        device: &BlockDevice,
        list: &BlockDeviceList,
    ) -> Result<AddOutcome> {
        let parent = self.controller.hierarchy().parent_of(device)?;
        let parent_resource = generate_uuid(&parent).and_then(|uuid| list.find(&uuid));

        let Some(parent_resource) = parent_resource else {
            debug!(device = %device.dev_path, parent = %parent.dev_path, "parent has no resource");
            return self.write_resource(device, gpt_annotations(), None).await;
        };

        if !parent_resource.is_unclaimed() {
            debug!(
                device = %device.dev_path,
                parent = %parent_resource.name(),
                "parent resource claimed, its consumer owns the partitions"
            );
            return Ok(AddOutcome::Skipped(SkipReason::ParentClaimed));
        }

        if device.has_holders() {
            debug!(device = %device.dev_path, "partition has holders, parent left active");
            return Ok(AddOutcome::Skipped(SkipReason::HasHolders));
        }

        info!(
            device = %device.dev_path,
            parent = %parent_resource.name(),
            "partitions created on unclaimed disk, moving ownership to the partition"
        );
        self.controller.deactivate_block_device(parent_resource).await?;
        match self.write_resource(device, gpt_annotations(), None).await? {
            AddOutcome::Created { name } | AddOutcome::Updated { name } => Ok(AddOutcome::Migrated {
                from: parent_resource.name().to_string(),
                to: name,
            }),
            outcome => Ok(outcome),
        }
    }

    // =========================================================================
    // Store Writes
    // =========================================================================

    /// Create or update the resource of a device carrying its identifier.
    ///
    /// Devices with holders are never written.
    pub(super) async fn write_resource(
        &self,
        device: &BlockDevice,
        annotations: BTreeMap<String, String>,
        existing: Option<&BlockDeviceResource>,
    ) -> Result<AddOutcome> {
        let resource = BlockDeviceResource::from_block_device(device).with_annotations(annotations);
        self.write(device, resource, existing).await
    }

    pub(super) async fn write(
        &self,
        device: &BlockDevice,
        resource: BlockDeviceResource,
        existing: Option<&BlockDeviceResource>,
    ) -> Result<AddOutcome> {
        if device.has_holders() {
            debug!(
                device = %device.dev_path,
                holders = ?device.dependent_devices.holders,
                "device has holders, skipping resource write"
            );
            return Ok(AddOutcome::Skipped(SkipReason::HasHolders));
        }

        let name = resource.name().to_string();
        if name.is_empty() {
            return Err(Error::Internal(format!(
                "resource for {} has no identifier",
                device.dev_path
            )));
        }

        match existing {
            Some(existing) => {
                self.controller.update_block_device(resource, existing).await?;
                Ok(AddOutcome::Updated { name })
            }
            None if self.controller.create_block_device(resource).await? => {
                Ok(AddOutcome::Created { name })
            }
            None => Ok(AddOutcome::Updated { name }),
        }
    }
}

pub(super) fn scheme_annotations(scheme: UuidScheme) -> BTreeMap<String, String> {
    BTreeMap::from([(UUID_SCHEME_ANNOTATION.to_string(), scheme.to_string())])
}

fn gpt_annotations() -> BTreeMap<String, String> {
    scheme_annotations(UuidScheme::Gpt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClaimState, DeviceState};
    use crate::error::ErrorAction;
    use crate::hardware::UsedBy;
    use crate::probe::testing::{Harness, StoreCall};
    use crate::store::StoreOp;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::ObjectReference;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn wwn_disk(path: &str, wwn: &str) -> BlockDevice {
        let mut device = BlockDevice::disk(path);
        device.node_attributes.node_name = "worker-1".into();
        device.node_attributes.hostname = "worker-1".into();
        device.capacity.storage = 100 * GIB;
        device.device_attributes.logical_block_size = 512;
        device.device_attributes.physical_block_size = 4096;
        device.device_attributes.wwn = wwn.into();
        device.device_attributes.serial = "S4EWNX0N".into();
        device.device_attributes.id_type = "disk".into();
        device
    }

    fn partition_of(parent: &mut BlockDevice, path: &str, entry_uuid: &str) -> BlockDevice {
        parent.dependent_devices.partitions.push(path.to_string());
        let mut part = BlockDevice::partition(path, parent.dev_path.clone());
        part.node_attributes = parent.node_attributes.clone();
        part.capacity.storage = parent.capacity.storage - GIB;
        part.device_attributes.logical_block_size = 512;
        part.partition_info.partition_entry_uuid = entry_uuid.into();
        part
    }

    fn stored(device: &BlockDevice, claim: ClaimState) -> BlockDeviceResource {
        let uuid = generate_uuid(device).unwrap();
        let mut resource = BlockDeviceResource::from_block_device(&device.with_uuid(uuid))
            .with_annotations(gpt_annotations());
        resource.status.as_mut().unwrap().claim_state = claim;
        resource
    }

    fn without_versions(mut resources: Vec<BlockDeviceResource>) -> Vec<BlockDeviceResource> {
        for resource in &mut resources {
            resource.metadata.resource_version = None;
        }
        resources
    }

    #[tokio::test]
    async fn test_disk_with_identity_is_created() {
        let harness = Harness::new();
        let device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let uuid = generate_uuid(&device).unwrap();

        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::Created { name: uuid.clone() });
        assert_eq!(harness.store.journal(), vec![StoreOp::Create(uuid.clone())]);
        let resource = harness.store.resource(&uuid).unwrap();
        assert_eq!(resource.uuid_scheme(), Some(UuidScheme::Gpt));
        assert_eq!(resource.spec.path, "/dev/sdb");
        assert_eq!(resource.claim_state(), ClaimState::Unclaimed);
        assert_eq!(harness.controller.metrics().event_count("created"), 1);

        // the cache holds the snapshot with its identifier
        let cached = harness.controller.hierarchy().lookup("/dev/sdb").unwrap();
        assert_eq!(cached.uuid.as_deref(), Some(uuid.as_str()));
    }

    #[tokio::test]
    async fn test_disk_without_identity_is_partitioned() {
        let harness = Harness::new();
        let mut device = BlockDevice::disk("/dev/vdb");
        device.capacity.storage = 10 * GIB;
        device.device_attributes.logical_block_size = 512;

        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::PartitionCreated { device: "/dev/vdb".into() });
        assert_eq!(
            harness.partitioner.calls(),
            vec![("/dev/vdb".to_string(), 10 * GIB, 512)]
        );
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_partition_without_entry_uuid_is_never_partitioned() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let mut part = partition_of(&mut parent, "/dev/sdb1", "");
        part.fs_info.file_system = "ext4".into();
        part.fs_info.file_system_uuid = "0f6b9c52-3f55-4b5e-9d5e-6a1b2c3d4e5f".into();
        let harness = Harness::new();
        harness.controller.hierarchy().upsert(parent);

        let err = harness.add(part).await.unwrap_err();

        assert_matches!(err, Error::IdentityUnavailable { ref device, .. } if device == "/dev/sdb1");
        assert!(!err.is_retryable());
        assert!(harness.partitioner.calls().is_empty());
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_disk_without_identity_with_dependents_is_left_alone() {
        let harness = Harness::new();
        let mut device = BlockDevice::disk("/dev/vdb");
        device.dependent_devices.holders.push("/dev/dm-0".into());

        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::HasDependents));
        assert!(harness.partitioner.calls().is_empty());
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_partition_of_claimed_parent_is_skipped() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Claimed)]);
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::ParentClaimed));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_partition_of_unclaimed_parent_takes_ownership() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let parent_uuid = generate_uuid(&parent).unwrap();
        let part_uuid = generate_uuid(&part).unwrap();
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_eq!(
            outcome,
            AddOutcome::Migrated {
                from: parent_uuid.clone(),
                to: part_uuid.clone()
            }
        );
        assert_eq!(
            harness.store.journal(),
            vec![
                StoreOp::Deactivate(parent_uuid.clone()),
                StoreOp::Create(part_uuid.clone())
            ]
        );
        assert_eq!(
            harness.store.resource(&parent_uuid).unwrap().device_state(),
            DeviceState::Inactive
        );
        let child = harness.store.resource(&part_uuid).unwrap();
        assert_eq!(child.spec.parent_device.as_deref(), Some("/dev/sdb"));
    }

    #[tokio::test]
    async fn test_partition_without_parent_resource_is_created() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let part_uuid = generate_uuid(&part).unwrap();
        let harness = Harness::new();
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_eq!(outcome, AddOutcome::Created { name: part_uuid.clone() });
        assert_eq!(harness.store.journal(), vec![StoreOp::Create(part_uuid)]);
    }

    #[tokio::test]
    async fn test_partition_of_in_use_parent_is_skipped() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        parent.dev_use.in_use = true;
        let harness = Harness::new();
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::ParentInUse));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_fails_without_mutation() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);

        let err = harness.add(part).await.unwrap_err();

        assert_matches!(err, Error::MissingParent { ref parent, .. } if parent == "/dev/sdb");
        assert_matches!(err.action(), ErrorAction::RequeueAfter(_));
        assert!(harness.store.journal().is_empty());
        assert_eq!(harness.controller.metrics().event_count("error"), 1);
    }

    #[tokio::test]
    async fn test_whole_disk_with_partitions_is_skipped() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let _ = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let harness = Harness::new();

        let outcome = harness.add(parent).await.unwrap();

        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::WholeDiskWithPartitions));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_holders_block_every_write() {
        let mut device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        device.dependent_devices.holders.push("/dev/dm-0".into());

        // no resource yet
        let harness = Harness::new();
        let outcome = harness.add(device.clone()).await.unwrap();
        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::HasHolders));
        assert!(harness.store.journal().is_empty());

        // existing unclaimed and claimed resources
        for claim in [ClaimState::Unclaimed, ClaimState::Claimed] {
            let harness = Harness::with_resources(vec![stored(&device, claim)]);
            let outcome = harness.add(device.clone()).await.unwrap();
            assert_eq!(outcome, AddOutcome::Skipped(SkipReason::HasHolders));
            assert!(harness.store.journal().is_empty());
        }
    }

    #[tokio::test]
    async fn test_partition_with_holders_keeps_parent_active() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let mut part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        part.dependent_devices.holders.push("/dev/dm-1".into());
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_eq!(outcome, AddOutcome::Skipped(SkipReason::HasHolders));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_claimed_resource_keeps_claim() {
        let device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let mut existing = stored(&device, ClaimState::Claimed);
        existing.spec.claim_ref = Some(ObjectReference {
            kind: Some("BlockDeviceClaim".into()),
            name: Some("bdc-pvc-1".into()),
            namespace: Some("openebs".into()),
            ..Default::default()
        });
        let uuid = existing.name().to_string();
        let harness = Harness::with_resources(vec![existing.clone()]);

        // reattached at another path with a larger capacity
        let mut reattached = device.clone();
        reattached.dev_path = "/dev/sdc".into();
        reattached.capacity.storage = 200 * GIB;
        let outcome = harness.add(reattached).await.unwrap();

        assert_eq!(outcome, AddOutcome::Updated { name: uuid.clone() });
        let resource = harness.store.resource(&uuid).unwrap();
        assert_eq!(resource.claim_state(), ClaimState::Claimed);
        assert_eq!(resource.spec.claim_ref, existing.spec.claim_ref);
        assert_eq!(resource.name(), uuid);
        assert_eq!(resource.spec.path, "/dev/sdc");
        assert_eq!(resource.spec.capacity.storage, 200 * GIB);
    }

    #[tokio::test]
    async fn test_replaying_create_is_idempotent() {
        let device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let harness = Harness::new();

        harness.add(device.clone()).await.unwrap();
        let first = without_versions(harness.store.resources());
        // same event against the same stale snapshot
        let empty = BlockDeviceList::default();
        harness.event.add_block_device(device.clone(), &empty).await.unwrap();
        harness.add(device).await.unwrap();

        assert_eq!(without_versions(harness.store.resources()), first);
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_replaying_migration_is_idempotent() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);
        harness.controller.hierarchy().upsert(parent);

        harness.add(part.clone()).await.unwrap();
        let first = without_versions(harness.store.resources());
        harness.add(part).await.unwrap();

        assert_eq!(without_versions(harness.store.resources()), first);
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn test_migration_completes_after_crash() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let part_uuid = generate_uuid(&part).unwrap();
        // parent deactivated, child never created
        let crashed = stored(&parent, ClaimState::Unclaimed).deactivated();
        let harness = Harness::with_resources(vec![crashed]);
        harness.controller.hierarchy().upsert(parent);

        let outcome = harness.add(part).await.unwrap();

        assert_matches!(outcome, AddOutcome::Migrated { ref to, .. } if *to == part_uuid);
        assert!(harness.store.resource(&part_uuid).is_some());
    }

    #[tokio::test]
    async fn test_parent_claimed_after_snapshot_is_not_deactivated() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let parent_uuid = generate_uuid(&parent).unwrap();
        let part_uuid = generate_uuid(&part).unwrap();
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);
        harness.controller.hierarchy().upsert(parent);

        let list = harness.controller.list_block_devices().await.unwrap();
        harness.store.set_claim_state(&parent_uuid, ClaimState::Claimed);
        let err = harness.event.add_block_device(part, &list).await.unwrap_err();

        assert_matches!(err, Error::Conflict { .. });
        assert!(err.is_retryable());
        let parent = harness.store.resource(&parent_uuid).unwrap();
        assert_eq!(parent.claim_state(), ClaimState::Claimed);
        assert_eq!(parent.device_state(), DeviceState::Active);
        assert!(harness.store.resource(&part_uuid).is_none());
    }

    #[tokio::test]
    async fn test_failed_deactivate_aborts_migration() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let parent_uuid = generate_uuid(&parent).unwrap();
        let part_uuid = generate_uuid(&part).unwrap();
        let harness = Harness::with_resources(vec![stored(&parent, ClaimState::Unclaimed)]);
        harness.controller.hierarchy().upsert(parent);
        harness.faults.fail_on(StoreCall::Deactivate);

        let err = harness.add(part).await.unwrap_err();

        assert_matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::TimedOut);
        assert!(err.is_retryable());
        assert!(harness.store.journal().is_empty());
        assert!(harness.store.resource(&part_uuid).is_none());
        assert_eq!(
            harness.store.resource(&parent_uuid).unwrap().device_state(),
            DeviceState::Active
        );
        assert_eq!(harness.controller.metrics().event_count("error"), 1);
    }

    #[tokio::test]
    async fn test_failed_create_is_propagated() {
        let harness = Harness::new();
        harness.faults.fail_on(StoreCall::Create);

        let err = harness
            .add(wwn_disk("/dev/sdb", "0x5002538e40a1b2c3"))
            .await
            .unwrap_err();

        assert_matches!(err, Error::Io(_));
        assert!(harness.store.resources().is_empty());
    }

    #[tokio::test]
    async fn test_failed_update_is_propagated() {
        let device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let harness = Harness::with_resources(vec![stored(&device, ClaimState::Claimed)]);
        harness.faults.fail_on(StoreCall::Update);

        assert_matches!(harness.add(device).await, Err(Error::Io(_)));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_failed_list_fails_the_batch() {
        let harness = Harness::new();
        harness.faults.fail_on(StoreCall::List);

        let result = harness
            .event
            .add_block_devices(vec![wwn_disk("/dev/sdb", "0x5002538e40a1b2c3")])
            .await;

        assert_matches!(result, Err(Error::Io(_)));
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_add_block_devices_processes_disks_first() {
        let mut parent = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        let part = partition_of(&mut parent, "/dev/sdb1", "5f0c7a1e-2b3d-4c5e-8f90-a1b2c3d4e5f6");
        let other = wwn_disk("/dev/sdc", "0x5002538e40a1b2c4");
        let mut orphan = BlockDevice::partition("/dev/sdz1", "/dev/sdz");
        orphan.partition_info.partition_entry_uuid = "0a0b0c0d-0000-4000-8000-000000000000".into();
        let harness = Harness::new();

        let report = harness
            .event
            .add_block_devices(vec![part, orphan, parent, other])
            .await
            .unwrap();

        let paths: Vec<&str> = report.outcomes.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/dev/sdb", "/dev/sdc", "/dev/sdb1"]);
        assert_eq!(
            report.outcomes[0].1,
            AddOutcome::Skipped(SkipReason::WholeDiskWithPartitions)
        );
        assert_matches!(report.outcomes[1].1, AddOutcome::Created { .. });
        assert_matches!(report.outcomes[2].1, AddOutcome::Created { .. });

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0.dev_path, "/dev/sdz1");
        assert_matches!(report.failures[0].1, Error::MissingParent { .. });
        assert_eq!(harness.store.resources().len(), 2);
    }

    #[tokio::test]
    async fn test_consumer_without_legacy_policy_uses_generic_path() {
        let harness = Harness::new();
        let mut device = wwn_disk("/dev/sdb", "0x5002538e40a1b2c3");
        device.dev_use.in_use = true;
        device.dev_use.used_by = UsedBy::None;

        let outcome = harness.add(device).await.unwrap();
        assert_matches!(outcome, AddOutcome::Created { .. });
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AddOutcome::Skipped(SkipReason::HasHolders).label(), "skipped");
        assert!(AddOutcome::Migrated {
            from: "a".into(),
            to: "b".into()
        }
        .mutated_store());
        assert!(!AddOutcome::PartitionCreated { device: "/dev/sdb".into() }.mutated_store());
    }
}
