//! BlockDevice CRD
//!
//! Cluster-wide record of a block device attached to a node. Resources are
//! named by the device identifier and claimed by storage engines through
//! their status.

use crate::hardware::{BlockDevice, DeviceType, UsedBy, UuidScheme};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Labels & Annotations
// =============================================================================

/// Hostname of the node owning the device
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
/// Kubernetes node name of the node owning the device
pub const NODE_NAME_LABEL: &str = "nodename";
/// Marks resources managed by the probe
pub const MANAGED_LABEL: &str = "ndm.io/managed";
/// Resource type label
pub const BLOCK_DEVICE_TYPE_LABEL: &str = "ndm.io/blockdevice-type";
/// Consumer tag for resources created on behalf of a storage engine
pub const BLOCK_DEVICE_TAG_LABEL: &str = "openebs.io/block-device-tag";

/// Naming scheme that produced the resource name
pub const UUID_SCHEME_ANNOTATION: &str = "internal.openebs.io/uuid-scheme";
/// Filesystem UUID, correlation key for local PV upgrades
pub const FS_UUID_ANNOTATION: &str = "internal.openebs.io/fsuuid";
/// Partition table UUID, correlation key for cStor upgrades
pub const PARTITION_UUID_ANNOTATION: &str = "internal.openebs.io/partition-uuid";

const BLOCK_DEVICE_TYPE: &str = "blockdevice";

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// BlockDevice describes a disk or partition that storage engines can claim.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    root = "BlockDeviceResource",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "NodeName", "type": "string", "jsonPath": ".spec.nodeAttributes.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacity.storage"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Device path (e.g., /dev/sdb)
    pub path: String,

    /// Device capacity
    #[serde(default)]
    pub capacity: DeviceCapacity,

    /// Hardware details
    #[serde(default)]
    pub details: DeviceDetails,

    /// Filesystem on the device, if any
    #[serde(default)]
    pub filesystem: FileSystemInfo,

    /// Node the device is attached to
    #[serde(default)]
    pub node_attributes: NodeAttribute,

    /// Whether the device carries partitions
    #[serde(default)]
    pub partitioned: Partitioned,

    /// Parent disk path for partitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_device: Option<String>,

    /// Claim held by a storage consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "object_reference_schema")]
    pub claim_ref: Option<ObjectReference>,
}

/// `ObjectReference` carries no JSON schema, keep it opaque to pruning
fn object_reference_schema(_: &mut schemars::gen::SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Capacity of the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Size in bytes
    pub storage: u64,
    #[serde(default)]
    pub logical_sector_size: u32,
    #[serde(default)]
    pub physical_sector_size: u32,
}

/// Hardware details of the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetails {
    pub device_type: String,
    #[serde(default)]
    pub drive_type: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub logical_block_size: u32,
    #[serde(default)]
    pub physical_block_size: u32,
}

/// Filesystem details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fs_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_point: String,
}

/// Node attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttribute {
    pub node_name: String,
    #[serde(default)]
    pub hostname: String,
}

/// Partitioned flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Partitioned {
    Yes,
    #[default]
    No,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the BlockDevice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    /// Claim state, owned by storage consumers once claimed
    #[serde(default)]
    pub claim_state: ClaimState,

    /// Whether the device is currently attached
    #[serde(default)]
    pub state: DeviceState,
}

/// Claim state of a BlockDevice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed,
    Released,
}

impl std::fmt::Display for ClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimState::Unclaimed => write!(f, "Unclaimed"),
            ClaimState::Claimed => write!(f, "Claimed"),
            ClaimState::Released => write!(f, "Released"),
        }
    }
}

/// Attachment state of a BlockDevice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Active => write!(f, "Active"),
            DeviceState::Inactive => write!(f, "Inactive"),
            DeviceState::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl BlockDeviceResource {
    /// Build the resource for a device snapshot carrying an identifier
    pub fn from_block_device(device: &BlockDevice) -> Self {
        let name = device.uuid.clone().unwrap_or_default();
        let attrs = &device.device_attributes;
        let node = &device.node_attributes;

        let spec = BlockDeviceSpec {
            path: device.dev_path.clone(),
            capacity: DeviceCapacity {
                storage: device.capacity.storage,
                logical_sector_size: attrs.logical_block_size,
                physical_sector_size: attrs.physical_block_size,
            },
            details: DeviceDetails {
                device_type: attrs.device_type.to_string(),
                drive_type: attrs.drive_type.clone(),
                model: attrs.model.clone(),
                serial: attrs.serial.clone(),
                vendor: attrs.vendor.clone(),
                logical_block_size: attrs.logical_block_size,
                physical_block_size: attrs.physical_block_size,
            },
            filesystem: FileSystemInfo {
                fs_type: device.fs_info.file_system.clone(),
                mount_point: device.fs_info.mount_points.first().cloned().unwrap_or_default(),
            },
            node_attributes: NodeAttribute {
                node_name: node.node_name.clone(),
                hostname: node.hostname.clone(),
            },
            partitioned: if device.has_partitions() {
                Partitioned::Yes
            } else {
                Partitioned::No
            },
            parent_device: match attrs.device_type {
                DeviceType::Partition => device.dependent_devices.parent.clone(),
                DeviceType::Disk => None,
            },
            claim_ref: None,
        };

        let mut resource = BlockDeviceResource::new(&name, spec);
        let labels = resource.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(HOSTNAME_LABEL.to_string(), node.hostname.clone());
        labels.insert(NODE_NAME_LABEL.to_string(), node.node_name.clone());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(BLOCK_DEVICE_TYPE_LABEL.to_string(), BLOCK_DEVICE_TYPE.to_string());

        resource.status = Some(BlockDeviceStatus {
            claim_state: ClaimState::Unclaimed,
            state: DeviceState::Active,
        });
        resource
    }

    /// Resource name (the device identifier)
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Claim state, `Unclaimed` when no status was written yet
    pub fn claim_state(&self) -> ClaimState {
        self.status.as_ref().map(|s| s.claim_state).unwrap_or_default()
    }

    /// Check if no consumer holds the device
    pub fn is_unclaimed(&self) -> bool {
        self.claim_state() == ClaimState::Unclaimed
    }

    /// Attachment state
    pub fn device_state(&self) -> DeviceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Get an annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Naming scheme recorded on the resource
    pub fn uuid_scheme(&self) -> Option<UuidScheme> {
        match self.annotation(UUID_SCHEME_ANNOTATION)? {
            "gpt" => Some(UuidScheme::Gpt),
            "legacy" => Some(UuidScheme::Legacy),
            _ => None,
        }
    }

    /// Set the given annotations, keeping unrelated ones
    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        self
    }

    /// Tag the resource with the consumer it was created for
    pub fn with_consumer_tag(mut self, used_by: UsedBy) -> Self {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(BLOCK_DEVICE_TAG_LABEL.to_string(), used_by.to_string());
        self
    }

    /// Merge this freshly built resource onto the stored record.
    ///
    /// Identity and claim data always come from the existing record: name,
    /// resource version, claim reference and claim state. Labels and
    /// annotations of the existing record are kept and overlaid.
    pub fn merged_onto(self, existing: &BlockDeviceResource) -> BlockDeviceResource {
        let mut merged = self;
        merged.metadata.name = existing.metadata.name.clone();
        merged.metadata.namespace = existing.metadata.namespace.clone();
        merged.metadata.resource_version = existing.metadata.resource_version.clone();
        merged.metadata.uid = existing.metadata.uid.clone();
        merged.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();

        let mut labels = existing.metadata.labels.clone().unwrap_or_default();
        labels.extend(merged.metadata.labels.take().unwrap_or_default());
        merged.metadata.labels = Some(labels);

        let mut annotations = existing.metadata.annotations.clone().unwrap_or_default();
        annotations.extend(merged.metadata.annotations.take().unwrap_or_default());
        merged.metadata.annotations = Some(annotations);

        merged.spec.claim_ref = existing.spec.claim_ref.clone();
        merged.status = Some(BlockDeviceStatus {
            claim_state: existing.claim_state(),
            state: DeviceState::Active,
        });
        merged
    }

    /// Copy of the resource marked inactive
    pub fn deactivated(&self) -> BlockDeviceResource {
        let mut resource = self.clone();
        let status = resource.status.get_or_insert_with(BlockDeviceStatus::default);
        status.state = DeviceState::Inactive;
        resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> BlockDevice {
        let mut device = BlockDevice::disk("/dev/sdb").with_uuid("blockdevice-aa11");
        device.node_attributes.hostname = "worker-1".into();
        device.node_attributes.node_name = "worker-1".into();
        device.capacity.storage = 107_374_182_400;
        device.device_attributes.logical_block_size = 512;
        device.device_attributes.model = "PM1733".into();
        device
    }

    #[test]
    fn test_from_block_device() {
        let resource = BlockDeviceResource::from_block_device(&device());

        assert_eq!(resource.name(), "blockdevice-aa11");
        assert_eq!(resource.spec.path, "/dev/sdb");
        assert_eq!(resource.spec.capacity.storage, 107_374_182_400);
        assert_eq!(resource.spec.details.device_type, "disk");
        assert_eq!(resource.spec.partitioned, Partitioned::No);
        assert!(resource.is_unclaimed());
        assert_eq!(resource.device_state(), DeviceState::Active);

        let labels = resource.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(HOSTNAME_LABEL).map(String::as_str), Some("worker-1"));
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_merged_onto_keeps_claim() {
        let mut existing = BlockDeviceResource::from_block_device(&device());
        existing.metadata.resource_version = Some("42".into());
        existing.spec.claim_ref = Some(ObjectReference {
            name: Some("bdc-1".into()),
            ..Default::default()
        });
        existing.status = Some(BlockDeviceStatus {
            claim_state: ClaimState::Claimed,
            state: DeviceState::Inactive,
        });
        existing = existing.with_annotations(BTreeMap::from([(
            "consumer.example.io/pool".to_string(),
            "pool-a".to_string(),
        )]));

        let mut moved = device();
        moved.dev_path = "/dev/sdc".into();
        let fresh = BlockDeviceResource::from_block_device(&moved).with_annotations(
            BTreeMap::from([(UUID_SCHEME_ANNOTATION.to_string(), "gpt".to_string())]),
        );

        let merged = fresh.merged_onto(&existing);
        assert_eq!(merged.spec.path, "/dev/sdc");
        assert_eq!(merged.claim_state(), ClaimState::Claimed);
        assert_eq!(merged.device_state(), DeviceState::Active);
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            merged.spec.claim_ref.as_ref().and_then(|r| r.name.as_deref()),
            Some("bdc-1")
        );
        assert_eq!(merged.annotation("consumer.example.io/pool"), Some("pool-a"));
        assert_eq!(merged.uuid_scheme(), Some(UuidScheme::Gpt));
    }

    #[test]
    fn test_deactivated() {
        let resource = BlockDeviceResource::from_block_device(&device());
        let inactive = resource.deactivated();
        assert_eq!(inactive.device_state(), DeviceState::Inactive);
        assert_eq!(inactive.claim_state(), resource.claim_state());
    }

    #[test]
    fn test_consumer_tag() {
        let resource =
            BlockDeviceResource::from_block_device(&device()).with_consumer_tag(UsedBy::ZfsLocalPv);
        let labels = resource.metadata.labels.unwrap();
        assert_eq!(
            labels.get(BLOCK_DEVICE_TAG_LABEL).map(String::as_str),
            Some("zfs-localpv")
        );
    }
}
