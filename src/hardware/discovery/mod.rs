//! Hardware Discovery Module
//!
//! Discovers block devices on Linux systems from sysfs and the udev
//! database.

pub mod scanner;
pub mod udev;

pub use scanner::*;
pub use udev::{MountTable, UdevProperties};
