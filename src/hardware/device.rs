//! Block Device Snapshot
//!
//! In-memory description of a block device as observed by the probe for a
//! single event. A snapshot is replaced wholesale every time its device
//! path generates a new event.

use serde::{Deserialize, Serialize};

// =============================================================================
// Device Type
// =============================================================================

/// Whole disk or partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Disk,
    Partition,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Disk => write!(f, "disk"),
            DeviceType::Partition => write!(f, "partition"),
        }
    }
}

// =============================================================================
// Consumers
// =============================================================================

/// Storage consumer detected on a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsedBy {
    #[default]
    None,
    Mayastor,
    #[serde(rename = "zfs-localpv")]
    ZfsLocalPv,
    #[serde(rename = "cstor")]
    CStor,
    #[serde(rename = "localpv")]
    LocalPv,
}

impl std::fmt::Display for UsedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsedBy::None => write!(f, "none"),
            UsedBy::Mayastor => write!(f, "mayastor"),
            UsedBy::ZfsLocalPv => write!(f, "zfs-localpv"),
            UsedBy::CStor => write!(f, "cstor"),
            UsedBy::LocalPv => write!(f, "localpv"),
        }
    }
}

/// Annotation carrying a correlation key for legacy-scheme upgrades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Filesystem UUID, stable for filesystem-based consumers
    FileSystemUuid,
    /// Partition table UUID, stable for pool-based consumers
    PartitionTableUuid,
}

/// How the probe treats devices owned by a given consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerClass {
    /// Devices are never published by this probe
    Opaque,
    /// Consumer gets a tagged resource derived from its partition table
    Shadow,
    /// Storage engine whose resources may predate the current naming scheme
    LegacyEngine(CorrelationKey),
    /// No consumer, or one handled by the generic path
    Generic,
}

impl UsedBy {
    /// Classify the consumer for the add-event decision points
    pub fn class(&self) -> ConsumerClass {
        match self {
            UsedBy::Mayastor => ConsumerClass::Opaque,
            UsedBy::ZfsLocalPv => ConsumerClass::Shadow,
            UsedBy::LocalPv => ConsumerClass::LegacyEngine(CorrelationKey::FileSystemUuid),
            UsedBy::CStor => ConsumerClass::LegacyEngine(CorrelationKey::PartitionTableUuid),
            UsedBy::None => ConsumerClass::Generic,
        }
    }
}

// =============================================================================
// Snapshot Sections
// =============================================================================

/// Node the device is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub node_name: String,
    pub hostname: String,
}

/// Device size
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Size in bytes
    pub storage: u64,
}

/// Hardware attributes reported by sysfs and udev
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub device_type: DeviceType,
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub wwn: String,
    pub serial: String,
    pub model: String,
    pub vendor: String,
    /// udev `ID_TYPE` (e.g. `disk`), empty for most virtual devices
    pub id_type: String,
    /// `SSD` or `HDD` when the rotational flag is known
    pub drive_type: String,
}

/// Hierarchy links to other device paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentDevices {
    /// Parent disk of a partition
    pub parent: Option<String>,
    pub partitions: Vec<String>,
    /// Stacked consumers such as device-mapper or encryption layers
    pub holders: Vec<String>,
}

/// Consumer usage of the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUse {
    pub in_use: bool,
    pub used_by: UsedBy,
}

/// Filesystem signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsInfo {
    pub file_system: String,
    pub file_system_uuid: String,
    pub file_system_label: String,
    pub mount_points: Vec<String>,
}

/// Partition table signature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_table_uuid: String,
    pub partition_entry_uuid: String,
}

// =============================================================================
// Block Device
// =============================================================================

/// Snapshot of a block device for one add event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Derived identifier, filled in by the probe
    pub uuid: Option<String>,
    pub node_attributes: NodeAttributes,
    /// Device path (e.g., /dev/sda), the hierarchy cache key
    pub dev_path: String,
    pub capacity: Capacity,
    pub device_attributes: DeviceAttributes,
    pub dependent_devices: DependentDevices,
    pub dev_use: DevUse,
    pub fs_info: FsInfo,
    pub partition_info: PartitionInfo,
}

impl BlockDevice {
    /// Create a whole-disk snapshot for a path
    pub fn disk(dev_path: impl Into<String>) -> Self {
        Self {
            dev_path: dev_path.into(),
            ..Default::default()
        }
    }

    /// Create a partition snapshot with its parent path
    pub fn partition(dev_path: impl Into<String>, parent: impl Into<String>) -> Self {
        let mut device = Self::disk(dev_path);
        device.device_attributes.device_type = DeviceType::Partition;
        device.dependent_devices.parent = Some(parent.into());
        device
    }

    pub fn is_partition(&self) -> bool {
        self.device_attributes.device_type == DeviceType::Partition
    }

    pub fn has_partitions(&self) -> bool {
        !self.dependent_devices.partitions.is_empty()
    }

    pub fn has_holders(&self) -> bool {
        !self.dependent_devices.holders.is_empty()
    }

    /// The consumer using this device, if it reports being in use
    pub fn consumer(&self) -> Option<UsedBy> {
        if self.dev_use.in_use {
            Some(self.dev_use.used_by)
        } else {
            None
        }
    }

    /// Value of a correlation key on this device, if present
    pub fn correlation_value(&self, key: CorrelationKey) -> Option<&str> {
        let value = match key {
            CorrelationKey::FileSystemUuid => &self.fs_info.file_system_uuid,
            CorrelationKey::PartitionTableUuid => &self.partition_info.partition_table_uuid,
        };
        if value.is_empty() {
            None
        } else {
            Some(value.as_str())
        }
    }

    /// Copy of this snapshot carrying an identifier
    pub fn with_uuid(&self, uuid: impl Into<String>) -> Self {
        let mut device = self.clone();
        device.uuid = Some(uuid.into());
        device
    }
}
