//! Identifier Derivation
//!
//! Pure functions computing the resource name of a block device under the
//! current (GPT-era) scheme, the legacy scheme, and from a partition table
//! signature.

use super::device::BlockDevice;
use serde::{Deserialize, Serialize};
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Prefix of every BlockDevice resource name
pub const BLOCK_DEVICE_PREFIX: &str = "blockdevice-";

/// Models of local or virtual disks whose serial is not unique across nodes
const VIRTUAL_DISK_MODELS: &[&str] = &["EphemeralDisk", "Virtual_disk", "QEMU_HARDDISK"];

// =============================================================================
// Naming Scheme
// =============================================================================

/// Naming scheme that produced a resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UuidScheme {
    Gpt,
    Legacy,
}

impl UuidScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UuidScheme::Gpt => "gpt",
            UuidScheme::Legacy => "legacy",
        }
    }
}

impl std::fmt::Display for UuidScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier produced by the legacy scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyUuid {
    pub uuid: String,
    /// Hostname and device path were mixed in, the device is virtual
    pub is_virtual: bool,
}

// =============================================================================
// Derivations
// =============================================================================

/// Derive the identifier from hardware-level identity.
///
/// Partitions use their partition entry UUID. Disks with a WWN use WWN and
/// serial together, since some arrays expose every LUN under one WWN.
/// Otherwise a filesystem UUID is used. The serial alone is never enough,
/// cloud providers only guarantee it to be unique per node.
pub fn generate_uuid(device: &BlockDevice) -> Option<String> {
    let attrs = &device.device_attributes;

    let field = if device.is_partition() {
        non_empty(&device.partition_info.partition_entry_uuid)?.to_string()
    } else if !attrs.wwn.is_empty() {
        format!("{}{}", attrs.wwn, attrs.serial)
    } else {
        non_empty(&device.fs_info.file_system_uuid)?.to_string()
    };

    let uuid = prefixed_hash(&field);
    debug!(device = %device.dev_path, uuid = %uuid, "generated uuid");
    Some(uuid)
}

/// Derive the identifier used before partition-based identities existed
pub fn generate_legacy_uuid(device: &BlockDevice) -> LegacyUuid {
    let attrs = &device.device_attributes;
    let mut field = format!("{}{}{}{}", attrs.wwn, attrs.model, attrs.serial, attrs.vendor);

    let is_virtual = attrs.id_type.is_empty() || VIRTUAL_DISK_MODELS.contains(&attrs.model.as_str());
    if is_virtual {
        field.push_str(&device.node_attributes.hostname);
        field.push_str(&device.dev_path);
    }

    LegacyUuid {
        uuid: prefixed_hash(&field),
        is_virtual,
    }
}

/// Derive the identifier from the partition table signature
pub fn generate_uuid_from_partition_table(device: &BlockDevice) -> Option<String> {
    non_empty(&device.partition_info.partition_table_uuid).map(prefixed_hash)
}

fn prefixed_hash(field: &str) -> String {
    format!("{}{:x}", BLOCK_DEVICE_PREFIX, md5::compute(field.as_bytes()))
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical_disk() -> BlockDevice {
        let mut device = BlockDevice::disk("/dev/sdb");
        device.node_attributes.hostname = "worker-1".into();
        device.device_attributes.wwn = "0x5000c500a1b2c3d4".into();
        device.device_attributes.serial = "ZA1234".into();
        device.device_attributes.model = "ST4000NM0035".into();
        device.device_attributes.vendor = "ATA".into();
        device.device_attributes.id_type = "disk".into();
        device
    }

    #[test]
    fn test_prefixed_hash() {
        // md5("") is well known
        assert_eq!(prefixed_hash(""), "blockdevice-d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_uuid_from_wwn_and_serial() {
        let device = physical_disk();
        let uuid = generate_uuid(&device).unwrap();
        assert_eq!(uuid, prefixed_hash("0x5000c500a1b2c3d4ZA1234"));

        let mut other_lun = physical_disk();
        other_lun.device_attributes.serial = "ZA9999".into();
        assert_ne!(generate_uuid(&other_lun).unwrap(), uuid);
    }

    #[test]
    fn test_uuid_is_path_independent() {
        let mut moved = physical_disk();
        moved.dev_path = "/dev/sdq".into();
        moved.node_attributes.hostname = "worker-7".into();
        assert_eq!(generate_uuid(&moved), generate_uuid(&physical_disk()));
    }

    #[test]
    fn test_uuid_falls_back_to_filesystem() {
        let mut device = BlockDevice::disk("/dev/vdb");
        assert_eq!(generate_uuid(&device), None);

        device.fs_info.file_system_uuid = "3f1b2c4d-aaaa-bbbb-cccc-0123456789ab".into();
        assert_eq!(
            generate_uuid(&device),
            Some(prefixed_hash("3f1b2c4d-aaaa-bbbb-cccc-0123456789ab"))
        );
    }

    #[test]
    fn test_partition_uses_entry_uuid() {
        let mut part = BlockDevice::partition("/dev/sdb1", "/dev/sdb");
        part.device_attributes.wwn = "0x5000c500a1b2c3d4".into();
        assert_eq!(generate_uuid(&part), None);

        part.partition_info.partition_entry_uuid = "9d1c7f0e-1111-2222-3333-444455556666".into();
        assert_eq!(
            generate_uuid(&part),
            Some(prefixed_hash("9d1c7f0e-1111-2222-3333-444455556666"))
        );
    }

    #[test]
    fn test_legacy_uuid_physical() {
        let legacy = generate_legacy_uuid(&physical_disk());
        assert!(!legacy.is_virtual);
        assert_eq!(
            legacy.uuid,
            prefixed_hash("0x5000c500a1b2c3d4ST4000NM0035ZA1234ATA")
        );
    }

    #[test]
    fn test_legacy_uuid_virtual_uses_host_and_path() {
        let mut device = physical_disk();
        device.device_attributes.model = "QEMU_HARDDISK".into();
        let legacy = generate_legacy_uuid(&device);
        assert!(legacy.is_virtual);

        let mut elsewhere = device.clone();
        elsewhere.dev_path = "/dev/sdc".into();
        assert_ne!(generate_legacy_uuid(&elsewhere).uuid, legacy.uuid);

        let mut no_id_type = physical_disk();
        no_id_type.device_attributes.id_type.clear();
        assert!(generate_legacy_uuid(&no_id_type).is_virtual);
    }

    #[test]
    fn test_partition_table_uuid() {
        let mut device = BlockDevice::disk("/dev/sdd");
        assert_eq!(generate_uuid_from_partition_table(&device), None);

        device.partition_info.partition_table_uuid = "c0ffee00-0000-4000-8000-000000000001".into();
        assert_eq!(
            generate_uuid_from_partition_table(&device),
            Some(prefixed_hash("c0ffee00-0000-4000-8000-000000000001"))
        );
    }

    #[test]
    fn test_scheme_display() {
        assert_eq!(UuidScheme::Gpt.to_string(), "gpt");
        assert_eq!(UuidScheme::Legacy.to_string(), "legacy");
    }
}
