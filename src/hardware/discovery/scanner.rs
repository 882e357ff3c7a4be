//! Block Device Scanner
//!
//! Enumerates block devices from sysfs and builds the snapshots handed to
//! the add-event handler, enriched with udev properties, mount points and
//! the storage consumer detected on each device.

use super::udev::{
    MountTable, UdevProperties, ID_FS_LABEL, ID_FS_TYPE, ID_FS_UUID, ID_MODEL, ID_PART_ENTRY_NAME,
    ID_PART_ENTRY_UUID, ID_PART_TABLE_UUID, ID_SERIAL_SHORT, ID_TYPE, ID_VENDOR, ID_WWN,
};
use crate::config::{FilterConfig, PathFilter, ProbeConfig};
use crate::error::{Error, Result};
use crate::hardware::device::{BlockDevice, DevUse, UsedBy};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// sysfs reports sizes in 512-byte sectors regardless of the device
const SYSFS_SECTOR_SIZE: u64 = 512;

const ZFS_MEMBER: &str = "zfs_member";
const CSTOR_POOL_PREFIX: &str = "cstor";
const MAYASTOR_SIGNATURE: &str = "mayastor";

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the hardware scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_path: PathBuf,
    /// Path to the udev database
    pub udev_data_path: PathBuf,
    /// Path to the mountinfo file
    pub mountinfo_path: PathBuf,
    /// Filesystems mounted below this path belong to local PV
    pub local_pv_base_path: PathBuf,
    pub node_name: String,
    pub hostname: String,
    /// Device paths to process
    pub filter: PathFilter,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        let probe = ProbeConfig::default();
        Self {
            sysfs_path: probe.sysfs_path,
            udev_data_path: probe.udev_data_path,
            mountinfo_path: probe.mountinfo_path,
            local_pv_base_path: probe.local_pv_base_path,
            node_name: probe.node_name,
            hostname: probe.hostname,
            filter: FilterConfig::default().compile().unwrap_or_default(),
        }
    }
}

impl ScannerConfig {
    /// Derive the scanner configuration from the probe configuration
    pub fn from_probe_config(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            sysfs_path: config.sysfs_path.clone(),
            udev_data_path: config.udev_data_path.clone(),
            mountinfo_path: config.mountinfo_path.clone(),
            local_pv_base_path: config.local_pv_base_path.clone(),
            node_name: config.node_name.clone(),
            hostname: config.hostname.clone(),
            filter: config.filters.compile()?,
        })
    }
}

// =============================================================================
// Hardware Scanner
// =============================================================================

/// Scans block devices on Linux systems
pub struct HardwareScanner {
    config: ScannerConfig,
}

impl HardwareScanner {
    /// Create a new hardware scanner
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Snapshot every block device on the node, whole disks first
    pub async fn discover(&self) -> Result<Vec<BlockDevice>> {
        let block_path = self.config.sysfs_path.join("class/block");
        if !block_path.exists() {
            return Err(Error::HardwareDiscovery(format!(
                "block device sysfs not found at {}",
                block_path.display()
            )));
        }

        let mounts = MountTable::load(&self.config.mountinfo_path)?;
        let mut devices = Vec::new();

        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let dev_path = format!("/dev/{}", name);

            if !self.config.filter.allows(&dev_path) {
                debug!(device = %dev_path, "excluded by path filter");
                continue;
            }

            match self.scan_device(&entry.path(), &dev_path, &mounts) {
                Ok(device) => devices.push(device),
                Err(e) => warn!(device = %dev_path, error = %e, "failed to scan device"),
            }
        }

        devices.sort_by(|a, b| {
            a.is_partition()
                .cmp(&b.is_partition())
                .then_with(|| a.dev_path.cmp(&b.dev_path))
        });
        info!("Found {} block devices", devices.len());
        Ok(devices)
    }

    /// Build the snapshot of one device from its sysfs entry
    fn scan_device(&self, class_path: &Path, dev_path: &str, mounts: &MountTable) -> Result<BlockDevice> {
        let sysfs_path = fs::canonicalize(class_path).map_err(|e| {
            Error::HardwareDiscovery(format!("failed to resolve {}: {}", class_path.display(), e))
        })?;
        let is_partition = sysfs_path.join("partition").exists();

        let mut device = if is_partition {
            let parent = sysfs_path
                .parent()
                .and_then(Path::file_name)
                .ok_or_else(|| {
                    Error::HardwareDiscovery(format!("partition {} has no parent", dev_path))
                })?;
            BlockDevice::partition(dev_path, format!("/dev/{}", parent.to_string_lossy()))
        } else {
            BlockDevice::disk(dev_path)
        };

        let (major, minor) = self.read_device_number(&sysfs_path)?;
        let props = UdevProperties::load(&self.config.udev_data_path, major, minor)?;

        device.node_attributes.node_name = self.config.node_name.clone();
        device.node_attributes.hostname = self.config.hostname.clone();

        let sectors: u64 = self
            .read_sysfs_attr(&sysfs_path, "size")?
            .trim()
            .parse()
            .map_err(|_| Error::HardwareDiscovery(format!("invalid size for {}", dev_path)))?;
        device.capacity.storage = sectors * SYSFS_SECTOR_SIZE;

        // partitions share the request queue of their disk
        let queue_owner = if is_partition {
            sysfs_path.parent().unwrap_or(sysfs_path.as_path())
        } else {
            sysfs_path.as_path()
        };
        let attrs = &mut device.device_attributes;
        attrs.logical_block_size = self.read_block_size(queue_owner, "queue/logical_block_size");
        attrs.physical_block_size = self.read_block_size(queue_owner, "queue/physical_block_size");
        attrs.drive_type = self.detect_drive_type(queue_owner).to_string();
        attrs.wwn = props.get(ID_WWN).to_string();
        attrs.serial = props.get(ID_SERIAL_SHORT).to_string();
        attrs.model = props.get(ID_MODEL).to_string();
        attrs.vendor = props.get(ID_VENDOR).to_string();
        attrs.id_type = props.get(ID_TYPE).to_string();

        if !is_partition {
            device.dependent_devices.partitions = self.list_partitions(&sysfs_path)?;
        }
        device.dependent_devices.holders = list_dev_names(&sysfs_path.join("holders"))?;

        device.fs_info.file_system = props.get(ID_FS_TYPE).to_string();
        device.fs_info.file_system_uuid = props.get(ID_FS_UUID).to_string();
        device.fs_info.file_system_label = props.get(ID_FS_LABEL).to_string();
        device.fs_info.mount_points = mounts.mount_points(major, minor);

        device.partition_info.partition_table_uuid = props.get(ID_PART_TABLE_UUID).to_string();
        device.partition_info.partition_entry_uuid = props.get(ID_PART_ENTRY_UUID).to_string();

        device.dev_use = self.detect_usage(&device, props.get(ID_PART_ENTRY_NAME));

        debug!(
            device = %device.dev_path,
            device_type = %device.device_attributes.device_type,
            used_by = %device.dev_use.used_by,
            "scanned device"
        );
        Ok(device)
    }

    /// Detect the storage consumer using a device
    fn detect_usage(&self, device: &BlockDevice, part_entry_name: &str) -> DevUse {
        let fs = &device.fs_info;
        let used_by = if fs.file_system == ZFS_MEMBER {
            if fs.file_system_label.starts_with(CSTOR_POOL_PREFIX) {
                UsedBy::CStor
            } else {
                UsedBy::ZfsLocalPv
            }
        } else if is_mayastor_signature(part_entry_name) || is_mayastor_signature(&fs.file_system_label) {
            UsedBy::Mayastor
        } else if fs
            .mount_points
            .iter()
            .any(|mount| Path::new(mount).starts_with(&self.config.local_pv_base_path))
        {
            UsedBy::LocalPv
        } else {
            UsedBy::None
        };

        DevUse {
            in_use: used_by != UsedBy::None || !fs.mount_points.is_empty(),
            used_by,
        }
    }

    /// Partition device paths of a disk
    fn list_partitions(&self, sysfs_path: &Path) -> Result<Vec<String>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(sysfs_path)? {
            let entry = entry?;
            if entry.path().join("partition").exists() {
                partitions.push(format!("/dev/{}", entry.file_name().to_string_lossy()));
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    /// Detect whether a device is SSD or HDD
    fn detect_drive_type(&self, sysfs_path: &Path) -> &'static str {
        match self.read_sysfs_attr(sysfs_path, "queue/rotational") {
            Ok(rotational) if rotational.trim() == "0" => "SSD",
            Ok(rotational) if rotational.trim() == "1" => "HDD",
            _ => "Unknown",
        }
    }

    fn read_block_size(&self, sysfs_path: &Path, attr: &str) -> u32 {
        self.read_sysfs_attr(sysfs_path, attr)
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(SYSFS_SECTOR_SIZE as u32)
    }

    /// Parse the `major:minor` device number
    fn read_device_number(&self, sysfs_path: &Path) -> Result<(u32, u32)> {
        let dev = self.read_sysfs_attr(sysfs_path, "dev")?;
        dev.trim()
            .split_once(':')
            .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
            .ok_or_else(|| Error::HardwareDiscovery(format!("invalid device number {:?}", dev)))
    }

    /// Read a sysfs attribute
    fn read_sysfs_attr(&self, base_path: &Path, attr: &str) -> Result<String> {
        let path = base_path.join(attr);
        fs::read_to_string(&path).map_err(|e| {
            Error::HardwareDiscovery(format!("Failed to read {}: {}", path.display(), e))
        })
    }
}

fn is_mayastor_signature(value: &str) -> bool {
    value.to_ascii_lowercase().contains(MAYASTOR_SIGNATURE)
}

/// Device paths for the entries of a sysfs link directory such as `holders`
fn list_dev_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| format!("/dev/{}", e.file_name().to_string_lossy())))
        .collect::<std::io::Result<_>>()?;
    names.sort();
    Ok(names)
}
