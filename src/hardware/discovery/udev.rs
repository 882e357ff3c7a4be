//! udev Database and Mount Table
//!
//! Reads the device properties udev persisted under `/run/udev/data` and
//! the mount table from `mountinfo`.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::trace;

// =============================================================================
// udev Properties
// =============================================================================

pub const ID_WWN: &str = "ID_WWN";
pub const ID_SERIAL_SHORT: &str = "ID_SERIAL_SHORT";
pub const ID_MODEL: &str = "ID_MODEL";
pub const ID_VENDOR: &str = "ID_VENDOR";
pub const ID_TYPE: &str = "ID_TYPE";
pub const ID_FS_TYPE: &str = "ID_FS_TYPE";
pub const ID_FS_UUID: &str = "ID_FS_UUID";
pub const ID_FS_LABEL: &str = "ID_FS_LABEL";
pub const ID_PART_TABLE_UUID: &str = "ID_PART_TABLE_UUID";
pub const ID_PART_ENTRY_UUID: &str = "ID_PART_ENTRY_UUID";
pub const ID_PART_ENTRY_NAME: &str = "ID_PART_ENTRY_NAME";

/// Properties of one device from the udev database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdevProperties {
    properties: HashMap<String, String>,
}

impl UdevProperties {
    /// Parse a udev database record. Only `E:KEY=VALUE` lines carry
    /// properties, the other record types are ignored.
    pub fn parse(contents: &str) -> Self {
        let properties = contents
            .lines()
            .filter_map(|line| line.strip_prefix("E:"))
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_string(), value.trim().to_string()))
            .collect();
        Self { properties }
    }

    /// Load the record of a block device by its device number.
    ///
    /// Devices udev has not processed yet have no record and yield empty
    /// properties.
    pub fn load(udev_data_path: &Path, major: u32, minor: u32) -> Result<Self> {
        let path = udev_data_path.join(format!("b{}:{}", major, minor));
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(path = %path.display(), "no udev record");
                Ok(Self::default())
            }
            Err(e) => Err(Error::HardwareDiscovery(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Property value, empty when unset
    pub fn get(&self, key: &str) -> &str {
        self.properties.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

// =============================================================================
// Mount Table
// =============================================================================

/// Mount points keyed by device number (`major:minor`)
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: HashMap<String, Vec<String>>,
}

impl MountTable {
    /// Parse `mountinfo` contents
    pub fn parse(contents: &str) -> Self {
        let mut mounts: HashMap<String, Vec<String>> = HashMap::new();
        for line in contents.lines() {
            // mount-id parent-id major:minor root mount-point ...
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                continue;
            }
            mounts
                .entry(fields[2].to_string())
                .or_default()
                .push(unescape_octal(fields[4]));
        }
        Self { mounts }
    }

    /// Load the mount table, empty if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mount points of a device
    pub fn mount_points(&self, major: u32, minor: u32) -> Vec<String> {
        self.mounts
            .get(&format!("{}:{}", major, minor))
            .cloned()
            .unwrap_or_default()
    }
}

/// Decode `\040` style escapes used for whitespace in mount paths
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
