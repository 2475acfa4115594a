//! Filesystem capacity probing.
//!
//! Pluggable so limit resolution and the mover's space check can be pinned
//! in tests without a real multi-tier filesystem.

use std::path::Path;

use crate::error::Result;

/// Capacity view of the filesystem holding a path.
pub trait DiskUsage: Send + Sync {
    fn total_bytes(&self, path: &Path) -> Result<u64>;
    fn free_bytes(&self, path: &Path) -> Result<u64>;
}

/// Real filesystem probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDisk;

impl DiskUsage for SystemDisk {
    fn total_bytes(&self, path: &Path) -> Result<u64> {
        Ok(fs2::total_space(path)?)
    }

    fn free_bytes(&self, path: &Path) -> Result<u64> {
        Ok(fs2::available_space(path)?)
    }
}

/// Fixed-capacity probe for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedDisk {
    pub total: u64,
    pub free: u64,
}

impl DiskUsage for FixedDisk {
    fn total_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.total)
    }

    fn free_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.free)
    }
}
