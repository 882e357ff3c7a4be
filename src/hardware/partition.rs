//! Single Partition Writer
//!
//! Writes a fresh GPT with one partition spanning a raw disk, so that a
//! disk without hardware identity gets a stable partition entry UUID.
//! Uses sgdisk from gdisk.

use crate::domain::ports::Partitioner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

// =============================================================================
// Constants
// =============================================================================

/// Name written into the partition entry
pub const PARTITION_NAME: &str = "OpenEBS_NDM";

/// Partitions start on a 1 MiB boundary
const PARTITION_ALIGNMENT_BYTES: u64 = 1024 * 1024;

/// GPT entry array: 128 entries of 128 bytes
const GPT_ENTRY_ARRAY_BYTES: u64 = 128 * 128;

// =============================================================================
// Geometry
// =============================================================================

/// LBA range of the single partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionBounds {
    pub start_lba: u64,
    pub end_lba: u64,
}

impl PartitionBounds {
    /// Compute the largest aligned partition fitting between both GPT copies
    pub fn for_disk(device: &str, disk_size: u64, logical_block_size: u64) -> Result<Self> {
        if logical_block_size == 0 || !logical_block_size.is_power_of_two() {
            return Err(Error::Partitioning {
                device: device.to_string(),
                reason: format!("invalid logical block size {}", logical_block_size),
            });
        }

        let total_sectors = disk_size / logical_block_size;
        let entry_sectors = GPT_ENTRY_ARRAY_BYTES.div_ceil(logical_block_size);
        let alignment = (PARTITION_ALIGNMENT_BYTES / logical_block_size).max(1);

        // protective MBR + primary header + entries
        let first_usable = 2 + entry_sectors;
        let start_lba = first_usable.div_ceil(alignment) * alignment;

        // backup entries + backup header at the end of the disk
        let end_lba = total_sectors
            .checked_sub(2 + entry_sectors)
            .filter(|end| *end > start_lba)
            .ok_or_else(|| Error::Partitioning {
                device: device.to_string(),
                reason: format!("disk of {} bytes is too small for a partition", disk_size),
            })?;

        Ok(Self { start_lba, end_lba })
    }

    /// Partition size in bytes
    pub fn size_bytes(&self, logical_block_size: u64) -> u64 {
        (self.end_lba - self.start_lba + 1) * logical_block_size
    }
}

// =============================================================================
// sgdisk Partitioner
// =============================================================================

/// Partitioner running sgdisk against the device node
#[derive(Debug, Clone)]
pub struct SgdiskPartitioner {
    binary: String,
}

impl Default for SgdiskPartitioner {
    fn default() -> Self {
        Self {
            binary: "sgdisk".to_string(),
        }
    }
}

impl SgdiskPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific sgdisk binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments creating a new GPT with one named partition
    fn build_args(device_path: &str, bounds: PartitionBounds) -> Vec<String> {
        vec![
            "--clear".to_string(),
            format!("--new=1:{}:{}", bounds.start_lba, bounds.end_lba),
            format!("--change-name=1:{}", PARTITION_NAME),
            device_path.to_string(),
        ]
    }
}

#[async_trait]
impl Partitioner for SgdiskPartitioner {
    async fn create_single_partition(
        &self,
        device_path: &str,
        disk_size: u64,
        logical_block_size: u64,
    ) -> Result<()> {
        let bounds = PartitionBounds::for_disk(device_path, disk_size, logical_block_size)?;
        let args = Self::build_args(device_path, bounds);
        debug!(device = %device_path, ?args, "running {}", self.binary);

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::Partitioning {
                device: device_path.to_string(),
                reason: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Partitioning {
                device: device_path.to_string(),
                reason: format!("{} exited with {}: {}", self.binary, output.status, stderr.trim()),
            });
        }

        info!(
            device = %device_path,
            start_lba = bounds.start_lba,
            end_lba = bounds.end_lba,
            "created single partition"
        );
        Ok(())
    }
}
