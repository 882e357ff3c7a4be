//! Legacy Upgrade
//!
//! Devices in use by a storage engine may still be published under the
//! legacy naming scheme. They keep that resource, found either by its
//! legacy name or by a correlation annotation that survives a changed
//! legacy name, instead of getting a second one.

use super::add_handler::{scheme_annotations, AddState, ProbeEvent, Transition};
use crate::crd::{FS_UUID_ANNOTATION, PARTITION_UUID_ANNOTATION};
use crate::domain::ports::BlockDeviceList;
use crate::error::{Error, Result};
use crate::hardware::{
    generate_legacy_uuid, generate_uuid, BlockDevice, ConsumerClass, CorrelationKey, UsedBy,
    UuidScheme,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// How resources of one legacy storage engine are upgraded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradePolicy {
    pub engine: UsedBy,
    /// Device signature matched against the correlation annotation
    pub correlation: CorrelationKey,
}

impl UpgradePolicy {
    /// Policy for a consumer, `None` if it is not a legacy engine
    pub fn for_consumer(used_by: UsedBy) -> Option<Self> {
        match used_by.class() {
            ConsumerClass::LegacyEngine(correlation) => Some(Self {
                engine: used_by,
                correlation,
            }),
            ConsumerClass::Opaque | ConsumerClass::Shadow | ConsumerClass::Generic => None,
        }
    }

    /// Annotation holding the correlation value
    pub fn annotation_key(&self) -> &'static str {
        match self.correlation {
            CorrelationKey::FileSystemUuid => FS_UUID_ANNOTATION,
            CorrelationKey::PartitionTableUuid => PARTITION_UUID_ANNOTATION,
        }
    }

    fn annotations(&self, device: &BlockDevice) -> BTreeMap<String, String> {
        let mut annotations = scheme_annotations(UuidScheme::Legacy);
        if let Some(value) = device.correlation_value(self.correlation) {
            annotations.insert(self.annotation_key().to_string(), value.to_string());
        }
        annotations
    }
}

impl ProbeEvent {
    pub(super) async fn on_needs_upgrade(
        &self,
        device: &BlockDevice,
        list: &BlockDeviceList,
    ) -> Result<Transition> {
        match device.consumer().and_then(UpgradePolicy::for_consumer) {
            Some(policy) => self.upgrade(device, list, policy).await,
            None => Ok(Transition::Next(AddState::NeedsIdentity)),
        }
    }

    async fn upgrade(
        &self,
        device: &BlockDevice,
        list: &BlockDeviceList,
        policy: UpgradePolicy,
    ) -> Result<Transition> {
        if let Some(existing) = generate_uuid(device).and_then(|uuid| list.find(&uuid)) {
            if existing.is_unclaimed() {
                return Err(Error::UnreachableState {
                    device: device.dev_path.clone(),
                    reason: format!(
                        "device in use by {} has unclaimed resource {}",
                        policy.engine,
                        existing.name()
                    ),
                });
            }
            debug!(device = %device.dev_path, name = %existing.name(), "device already upgraded");
            return Ok(Transition::Next(AddState::NeedsIdentity));
        }

        let legacy = generate_legacy_uuid(device);
        // a device may return at the same path under a new legacy name
        let existing = device
            .correlation_value(policy.correlation)
            .and_then(|value| list.find_by_annotation(policy.annotation_key(), value))
            .or_else(|| list.find(&legacy.uuid));
        let annotations = policy.annotations(device);

        let outcome = match existing {
            None => {
                info!(device = %device.dev_path, uuid = %legacy.uuid, engine = %policy.engine, "publishing device under legacy identifier");
                self.write_resource(&device.with_uuid(&legacy.uuid), annotations, None).await?
            }
            // virtual device signatures are unstable, they may lack a claim
            Some(existing) if !existing.is_unclaimed() || legacy.is_virtual => {
                info!(device = %device.dev_path, name = %existing.name(), engine = %policy.engine, "refreshing legacy resource");
                self.write_resource(&device.with_uuid(existing.name()), annotations, Some(existing))
                    .await?
            }
            Some(existing) => {
                return Err(Error::UnreachableState {
                    device: device.dev_path.clone(),
                    reason: format!(
                        "physical device in use by {} has unclaimed legacy resource {}",
                        policy.engine,
                        existing.name()
                    ),
                });
            }
        };
        Ok(Transition::Done(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BlockDeviceResource, ClaimState, UUID_SCHEME_ANNOTATION};
    use crate::probe::testing::Harness;
    use crate::probe::AddOutcome;
    use crate::store::StoreOp;
    use assert_matches::assert_matches;

    fn local_pv_device() -> BlockDevice {
        let mut device = BlockDevice::disk("/dev/sdb");
        device.node_attributes.hostname = "worker-1".into();
        device.device_attributes.model = "Virtual_disk".into();
        device.device_attributes.serial = "6000c29".into();
        device.dev_use.in_use = true;
        device.dev_use.used_by = UsedBy::LocalPv;
        device.fs_info.file_system_uuid = "0f6b9c52-3f55-4b5e-9d5e-6a1b2c3d4e5f".into();
        device
    }

    fn cstor_device() -> BlockDevice {
        let mut device = BlockDevice::disk("/dev/sdc");
        device.device_attributes.model = "ST4000NM0035".into();
        device.device_attributes.serial = "ZA1234".into();
        device.device_attributes.vendor = "ATA".into();
        device.device_attributes.id_type = "disk".into();
        device.dev_use.in_use = true;
        device.dev_use.used_by = UsedBy::CStor;
        device.partition_info.partition_table_uuid = "4b7a2f10-1111-4222-8333-444455556666".into();
        device
    }

    fn stored(device: &BlockDevice, name: &str, claim: ClaimState, annotations: &[(&str, &str)]) -> BlockDeviceResource {
        let mut resource = BlockDeviceResource::from_block_device(&device.with_uuid(name)).with_annotations(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        resource.status.as_mut().unwrap().claim_state = claim;
        resource
    }

    #[test]
    fn test_policy_for_consumer() {
        let local = UpgradePolicy::for_consumer(UsedBy::LocalPv).unwrap();
        assert_eq!(local.annotation_key(), FS_UUID_ANNOTATION);
        let cstor = UpgradePolicy::for_consumer(UsedBy::CStor).unwrap();
        assert_eq!(cstor.annotation_key(), PARTITION_UUID_ANNOTATION);
        assert!(UpgradePolicy::for_consumer(UsedBy::Mayastor).is_none());
        assert!(UpgradePolicy::for_consumer(UsedBy::None).is_none());
    }

    #[tokio::test]
    async fn test_local_pv_without_resource_gets_legacy_resource() {
        let harness = Harness::new();
        let device = local_pv_device();
        let legacy = generate_legacy_uuid(&device);

        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::Created { name: legacy.uuid.clone() });
        assert_eq!(harness.store.journal(), vec![StoreOp::Create(legacy.uuid.clone())]);
        let resource = harness.store.resource(&legacy.uuid).unwrap();
        assert_eq!(resource.annotation(UUID_SCHEME_ANNOTATION), Some("legacy"));
        assert_eq!(
            resource.annotation(FS_UUID_ANNOTATION),
            Some("0f6b9c52-3f55-4b5e-9d5e-6a1b2c3d4e5f")
        );
    }

    #[tokio::test]
    async fn test_claimed_gpt_resource_continues_generic_path() {
        let mut with_wwn = cstor_device();
        with_wwn.device_attributes.wwn = "0x5000c500a1b2c3d4".into();
        let uuid = generate_uuid(&with_wwn).unwrap();

        let harness = Harness::with_resources(vec![stored(&with_wwn, &uuid, ClaimState::Claimed, &[])]);
        let outcome = harness.add(with_wwn).await.unwrap();

        assert_eq!(outcome, AddOutcome::Updated { name: uuid.clone() });
        let resource = harness.store.resource(&uuid).unwrap();
        assert_eq!(resource.claim_state(), ClaimState::Claimed);
        assert_eq!(resource.annotation(UUID_SCHEME_ANNOTATION), Some("gpt"));
    }

    #[tokio::test]
    async fn test_unclaimed_gpt_resource_is_unreachable() {
        let mut device = cstor_device();
        device.device_attributes.wwn = "0x5000c500a1b2c3d4".into();
        let uuid = generate_uuid(&device).unwrap();

        let harness = Harness::with_resources(vec![stored(&device, &uuid, ClaimState::Unclaimed, &[])]);
        let err = harness.add(device).await.unwrap_err();

        assert_matches!(err, Error::UnreachableState { .. });
        assert!(!err.is_retryable());
        assert!(harness.store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_cstor_matched_by_partition_uuid_annotation() {
        let device = cstor_device();
        let partition_uuid = device.partition_info.partition_table_uuid.clone();
        let existing = stored(
            &device,
            "blockdevice-old-serial",
            ClaimState::Claimed,
            &[(PARTITION_UUID_ANNOTATION, partition_uuid.as_str())],
        );
        let harness = Harness::with_resources(vec![existing]);

        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::Updated { name: "blockdevice-old-serial".into() });
        assert_eq!(
            harness.store.journal(),
            vec![StoreOp::Update("blockdevice-old-serial".into())]
        );
        let resource = harness.store.resource("blockdevice-old-serial").unwrap();
        assert_eq!(resource.claim_state(), ClaimState::Claimed);
        assert_eq!(resource.annotation(UUID_SCHEME_ANNOTATION), Some("legacy"));
    }

    #[tokio::test]
    async fn test_unclaimed_legacy_virtual_device_updated() {
        let mut device = local_pv_device();
        device.fs_info.file_system_uuid.clear();
        let legacy = generate_legacy_uuid(&device);
        assert!(legacy.is_virtual);

        let harness = Harness::with_resources(vec![stored(&device, &legacy.uuid, ClaimState::Unclaimed, &[])]);
        let outcome = harness.add(device).await.unwrap();

        assert_eq!(outcome, AddOutcome::Updated { name: legacy.uuid });
    }

    #[tokio::test]
    async fn test_unclaimed_legacy_physical_device_is_unreachable() {
        let device = cstor_device();
        let legacy = generate_legacy_uuid(&device);
        assert!(!legacy.is_virtual);

        let harness = Harness::with_resources(vec![stored(&device, &legacy.uuid, ClaimState::Unclaimed, &[])]);

        assert_matches!(harness.add(device).await, Err(Error::UnreachableState { .. }));
        assert!(harness.store.journal().is_empty());
    }
}
