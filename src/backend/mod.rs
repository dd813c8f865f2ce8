//! Dataset backends for vm-state
//!
//! A backend speaks in raw dataset names (`pool/base/state`) and snapshot
//! names (`pool/base/state@snap`). State naming, ownership and assignments
//! live one layer up in [`crate::provider::StateProvider`].

mod local_zfs;
mod memory;

pub use local_zfs::LocalZfsBackend;
pub use memory::MemoryBackend;

use crate::error::Result;
use std::path::Path;

/// A filesystem dataset as reported by a backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetEntry {
    pub name: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// A snapshot as reported by a backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// `dataset@snapshot`
    pub full_name: String,
    pub creation: String,
    pub referenced_bytes: u64,
}

impl SnapshotEntry {
    /// Split the full name into dataset and snapshot parts
    pub fn split(&self) -> Option<(&str, &str)> {
        self.full_name.split_once('@')
    }
}

/// Copy-on-write dataset operations
///
/// Implementations must not cascade: destroying a dataset that still has
/// snapshots, or a snapshot that a clone depends on, fails.
pub trait DatasetBackend {
    /// Check whether a dataset or snapshot exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Create a dataset mounted at `mountpoint`
    fn create(&self, name: &str, mountpoint: &Path) -> Result<()>;

    /// Destroy a dataset or a single snapshot
    fn destroy(&self, name: &str) -> Result<()>;

    /// Snapshot `dataset` as `dataset@snap_name`; allowed while mounted and in use
    fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<()>;

    /// Create `dest` from a snapshot. `dest` depends on the snapshot until promoted.
    fn clone_snapshot(&self, snapshot: &str, dest: &str, mountpoint: &Path) -> Result<()>;

    /// Reverse the clone dependency so `name` no longer depends on its origin
    fn promote(&self, name: &str) -> Result<()>;

    /// Datasets cloned from `snapshot` that have not been promoted
    fn dependent_clones(&self, snapshot: &str) -> Result<Vec<String>>;

    /// Filesystem datasets below `base`, excluding `base` itself
    fn list_datasets(&self, base: &str) -> Result<Vec<DatasetEntry>>;

    /// Snapshots of `base` and every dataset below it
    fn list_snapshots(&self, base: &str) -> Result<Vec<SnapshotEntry>>;

    /// Best-effort, 0 on error
    fn used_bytes(&self, name: &str) -> u64;

    /// Best-effort, 0 on error
    fn available_bytes(&self, name: &str) -> u64;
}

impl<B: DatasetBackend + ?Sized> DatasetBackend for &B {
    fn exists(&self, name: &str) -> Result<bool> {
        (**self).exists(name)
    }

    fn create(&self, name: &str, mountpoint: &Path) -> Result<()> {
        (**self).create(name, mountpoint)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        (**self).destroy(name)
    }

    fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<()> {
        (**self).snapshot(dataset, snap_name)
    }

    fn clone_snapshot(&self, snapshot: &str, dest: &str, mountpoint: &Path) -> Result<()> {
        (**self).clone_snapshot(snapshot, dest, mountpoint)
    }

    fn promote(&self, name: &str) -> Result<()> {
        (**self).promote(name)
    }

    fn dependent_clones(&self, snapshot: &str) -> Result<Vec<String>> {
        (**self).dependent_clones(snapshot)
    }

    fn list_datasets(&self, base: &str) -> Result<Vec<DatasetEntry>> {
        (**self).list_datasets(base)
    }

    fn list_snapshots(&self, base: &str) -> Result<Vec<SnapshotEntry>> {
        (**self).list_snapshots(base)
    }

    fn used_bytes(&self, name: &str) -> u64 {
        (**self).used_bytes(name)
    }

    fn available_bytes(&self, name: &str) -> u64 {
        (**self).available_bytes(name)
    }
}
