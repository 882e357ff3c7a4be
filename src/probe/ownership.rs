//! Ownership Classification
//!
//! Filters out devices owned by consumers that publish their devices
//! themselves or not at all, before any generic reconciliation happens.

use super::add_handler::{scheme_annotations, AddOutcome, AddState, ProbeEvent, SkipReason, Transition};
use crate::crd::BlockDeviceResource;
use crate::error::{Error, Result};
use crate::hardware::{generate_uuid_from_partition_table, BlockDevice, ConsumerClass, UuidScheme};
use tracing::{debug, info};

impl ProbeEvent {
    pub(super) async fn on_unmanaged(&self, device: &BlockDevice) -> Result<Transition> {
        // a partition is never classified before its parent has been seen
        let parent = if device.is_partition() {
            Some(self.controller.hierarchy().parent_of(device)?)
        } else {
            None
        };
        let parent_is_shadow = parent
            .as_ref()
            .and_then(BlockDevice::consumer)
            .map(|used_by| used_by.class() == ConsumerClass::Shadow)
            .unwrap_or(false);

        let class = device
            .consumer()
            .map(|used_by| used_by.class())
            .unwrap_or(ConsumerClass::Generic);

        match class {
            ConsumerClass::Opaque => {
                debug!(device = %device.dev_path, used_by = %device.dev_use.used_by, "device not managed, ignoring");
                Ok(Transition::Done(AddOutcome::Skipped(SkipReason::OpaqueConsumer)))
            }
            _ if parent_is_shadow => {
                debug!(device = %device.dev_path, "parent device in use by zfs-localpv");
                Ok(Transition::Done(AddOutcome::Skipped(SkipReason::ParentShadowConsumer)))
            }
            ConsumerClass::Shadow => self.publish_shadow_device(device).await.map(Transition::Done),
            ConsumerClass::LegacyEngine(_) | ConsumerClass::Generic => {
                Ok(Transition::Next(AddState::ParentOwned))
            }
        }
    }

    /// Publish a device of a shadow consumer under its partition table identity
    async fn publish_shadow_device(&self, device: &BlockDevice) -> Result<AddOutcome> {
        let used_by = device.dev_use.used_by;
        let uuid = generate_uuid_from_partition_table(device).ok_or_else(|| {
            Error::IdentityUnavailable {
                device: device.dev_path.clone(),
                scheme: format!("partition table ({})", used_by),
            }
        })?;

        info!(device = %device.dev_path, uuid = %uuid, %used_by, "device in use by shadow consumer");
        let device = device.with_uuid(uuid);
        let resource = BlockDeviceResource::from_block_device(&device)
            .with_annotations(scheme_annotations(UuidScheme::Gpt))
            .with_consumer_tag(used_by);
        self.write(&device, resource, None).await
    }
}
