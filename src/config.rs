//! Probe Configuration
//!
//! Runtime configuration of the probe daemon plus the optional YAML filter
//! file selecting which device paths are processed at all.

use crate::error::{Error, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Filter Configuration
// =============================================================================

/// Glob patterns over device paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathFilterConfig {
    /// When non-empty, only matching paths are processed
    #[serde(default)]
    pub include: Vec<String>,
    /// Matching paths are never processed
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
}

impl Default for PathFilterConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_excludes(),
        }
    }
}

/// Filter file contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default)]
    pub path_filter: PathFilterConfig,
}

impl FilterConfig {
    /// Parse a filter file
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: FilterConfig = serde_yaml::from_str(contents)?;
        config.compile()?;
        Ok(config)
    }

    /// Load a filter file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loaded filter configuration");
        Self::from_yaml(&contents)
    }

    /// Compile the patterns
    pub fn compile(&self) -> Result<PathFilter> {
        Ok(PathFilter {
            include: compile_patterns(&self.path_filter.include)?,
            exclude: compile_patterns(&self.path_filter.exclude)?,
        })
    }
}

/// Compiled path filter
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PathFilter {
    /// Check whether a device path should be processed
    pub fn allows(&self, dev_path: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches(dev_path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(dev_path))
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|e| {
                Error::Configuration(format!("invalid path filter pattern {:?}: {}", p, e))
            })
        })
        .collect()
}

fn default_excludes() -> Vec<String> {
    [
        "/dev/loop*",
        "/dev/fd*",
        "/dev/sr*",
        "/dev/ram*",
        "/dev/md*",
        "/dev/dm-*",
        "/dev/rbd*",
        "/dev/zd*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// =============================================================================
// Probe Configuration
// =============================================================================

/// Configuration for the probe daemon
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Kubernetes node name
    pub node_name: String,
    /// Hostname recorded on resources and mixed into legacy identifiers
    pub hostname: String,
    /// Path to sysfs
    pub sysfs_path: PathBuf,
    /// Path to the udev database
    pub udev_data_path: PathBuf,
    /// Path to the mountinfo file
    pub mountinfo_path: PathBuf,
    /// Base directory of local PV hostpath volumes
    pub local_pv_base_path: PathBuf,
    /// Interval between rescans
    pub rescan_interval: Duration,
    /// Upper bound for retrying a single device
    pub max_retry_elapsed: Duration,
    /// Device path filters
    pub filters: FilterConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            hostname: String::new(),
            sysfs_path: PathBuf::from("/sys"),
            udev_data_path: PathBuf::from("/run/udev/data"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            local_pv_base_path: PathBuf::from("/var/openebs/local"),
            rescan_interval: Duration::from_secs(30),
            max_retry_elapsed: Duration::from_secs(120),
            filters: FilterConfig::default(),
        }
    }
}

impl ProbeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Configuration("node name must be set".into()));
        }
        if self.rescan_interval.is_zero() {
            return Err(Error::Configuration("rescan interval must be positive".into()));
        }
        self.filters.compile()?;
        Ok(())
    }
}
