//! In-process backend with ZFS clone/promote semantics
//!
//! Datasets are tracked in memory; their mountpoints are real directories.
//! A snapshot captures the regular files at the top of the mountpoint, which
//! is all a state holds (`data.img`). Dependency rules follow ZFS:
//!
//! * a dataset with snapshots cannot be destroyed,
//! * a snapshot that is the origin of a clone cannot be destroyed,
//! * promoting a clone moves the origin snapshot (and every older snapshot
//!   of the origin dataset) to the clone and makes the origin dataset a
//!   clone of it instead.

use super::{DatasetBackend, DatasetEntry, SnapshotEntry};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reported capacity when none is configured
const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024 * 1024;

#[derive(Debug)]
struct Dataset {
    mountpoint: PathBuf,
    origin: Option<String>,
}

#[derive(Debug)]
struct Snap {
    seq: u64,
    creation: u64,
    files: Vec<(OsString, Vec<u8>)>,
}

impl Snap {
    fn referenced(&self) -> u64 {
        self.files.iter().map(|(_, data)| data.len() as u64).sum()
    }
}

#[derive(Debug, Default)]
struct Pool {
    datasets: BTreeMap<String, Dataset>,
    snapshots: BTreeMap<String, Snap>,
    next_seq: u64,
}

impl Pool {
    fn clones_of(&self, snapshot: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(_, ds)| ds.origin.as_deref() == Some(snapshot))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn snapshots_of<'a>(&'a self, dataset: &'a str) -> impl Iterator<Item = (&'a String, &'a Snap)> {
        self.snapshots
            .iter()
            .filter(move |(full, _)| full.split_once('@').map(|(ds, _)| ds) == Some(dataset))
    }
}

/// In-memory dataset backend
#[derive(Debug)]
pub struct MemoryBackend {
    pool: RefCell<Pool>,
    capacity: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            pool: RefCell::new(Pool::default()),
            capacity,
        }
    }

    /// Origin snapshot of a dataset, if it is still a clone
    pub fn origin(&self, name: &str) -> Option<String> {
        self.pool
            .borrow()
            .datasets
            .get(name)
            .and_then(|ds| ds.origin.clone())
    }

    fn mountpoint(&self, name: &str) -> Option<PathBuf> {
        self.pool
            .borrow()
            .datasets
            .get(name)
            .map(|ds| ds.mountpoint.clone())
    }

    fn total_used(&self) -> u64 {
        let names: Vec<String> = self.pool.borrow().datasets.keys().cloned().collect();
        names.iter().map(|name| self.used_bytes(name)).sum()
    }
}

/// Regular files directly under `dir`
fn capture_files(dir: &Path) -> Result<Vec<(OsString, Vec<u8>)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push((entry.file_name(), fs::read(entry.path())?));
        }
    }
    files.sort();
    Ok(files)
}

fn zfs_error(msg: String) -> Error {
    tracing::debug!(error = %msg, "memory backend refused operation");
    Error::Zfs(msg)
}

impl DatasetBackend for MemoryBackend {
    fn exists(&self, name: &str) -> Result<bool> {
        let pool = self.pool.borrow();
        Ok(if name.contains('@') {
            pool.snapshots.contains_key(name)
        } else {
            pool.datasets.contains_key(name)
        })
    }

    fn create(&self, name: &str, mountpoint: &Path) -> Result<()> {
        if self.exists(name)? {
            return Err(Error::DatasetAlreadyExists(name.to_string()));
        }
        fs::create_dir_all(mountpoint)?;
        self.pool.borrow_mut().datasets.insert(
            name.to_string(),
            Dataset {
                mountpoint: mountpoint.to_path_buf(),
                origin: None,
            },
        );
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        let mut pool = self.pool.borrow_mut();

        if name.contains('@') {
            if !pool.snapshots.contains_key(name) {
                return Err(Error::DatasetNotFound(name.to_string()));
            }
            let clones = pool.clones_of(name);
            if !clones.is_empty() {
                return Err(zfs_error(format!(
                    "cannot destroy '{}': snapshot has dependent clones ({})",
                    name,
                    clones.join(", ")
                )));
            }
            pool.snapshots.remove(name);
            return Ok(());
        }

        if !pool.datasets.contains_key(name) {
            return Err(Error::DatasetNotFound(name.to_string()));
        }
        if pool.snapshots_of(name).next().is_some() {
            return Err(zfs_error(format!(
                "cannot destroy '{}': filesystem has children",
                name
            )));
        }
        if let Some(ds) = pool.datasets.remove(name) {
            match fs::remove_dir_all(&ds.mountpoint) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }

    fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<()> {
        let mountpoint = self
            .mountpoint(dataset)
            .ok_or_else(|| Error::DatasetNotFound(dataset.to_string()))?;
        let full = format!("{}@{}", dataset, snap_name);
        if self.exists(&full)? {
            return Err(Error::DatasetAlreadyExists(full));
        }

        let files = capture_files(&mountpoint)?;
        let creation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut pool = self.pool.borrow_mut();
        let seq = pool.next_seq;
        pool.next_seq += 1;
        pool.snapshots.insert(full, Snap { seq, creation, files });
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, dest: &str, mountpoint: &Path) -> Result<()> {
        let mut pool = self.pool.borrow_mut();
        let files = match pool.snapshots.get(snapshot) {
            Some(snap) => snap.files.clone(),
            None => return Err(Error::SnapshotNotFound(snapshot.to_string())),
        };
        if pool.datasets.contains_key(dest) {
            return Err(Error::DatasetAlreadyExists(dest.to_string()));
        }

        fs::create_dir_all(mountpoint)?;
        for (file, data) in &files {
            fs::write(mountpoint.join(file), data)?;
        }
        pool.datasets.insert(
            dest.to_string(),
            Dataset {
                mountpoint: mountpoint.to_path_buf(),
                origin: Some(snapshot.to_string()),
            },
        );
        Ok(())
    }

    fn promote(&self, name: &str) -> Result<()> {
        let mut pool = self.pool.borrow_mut();
        let origin = match pool.datasets.get(name) {
            Some(ds) => ds.origin.clone(),
            None => return Err(Error::DatasetNotFound(name.to_string())),
        };
        let Some(origin) = origin else {
            return Err(zfs_error(format!(
                "cannot promote '{}': not a cloned filesystem",
                name
            )));
        };
        let Some((source, _)) = origin.split_once('@') else {
            return Err(zfs_error(format!("invalid origin '{}'", origin)));
        };
        let source = source.to_string();
        let origin_seq = pool.snapshots.get(&origin).map(|s| s.seq).unwrap_or(0);

        let moved: Vec<(String, String)> = pool
            .snapshots_of(&source)
            .filter(|(_, snap)| snap.seq <= origin_seq)
            .filter_map(|(full, _)| {
                let (_, snap) = full.split_once('@')?;
                Some((full.clone(), format!("{}@{}", name, snap)))
            })
            .collect();

        if let Some((_, conflict)) = moved.iter().find(|(_, new)| pool.snapshots.contains_key(new)) {
            return Err(zfs_error(format!(
                "cannot promote '{}': snapshot '{}' already exists",
                name, conflict
            )));
        }

        let source_origin = pool.datasets.get(&source).and_then(|ds| ds.origin.clone());

        for (old, new) in &moved {
            if let Some(snap) = pool.snapshots.remove(old) {
                pool.snapshots.insert(new.clone(), snap);
            }
            for ds in pool.datasets.values_mut() {
                if ds.origin.as_deref() == Some(old.as_str()) {
                    ds.origin = Some(new.clone());
                }
            }
        }

        let new_origin = format!("{}@{}", name, origin.split_once('@').map(|(_, s)| s).unwrap_or(""));
        if let Some(ds) = pool.datasets.get_mut(name) {
            ds.origin = source_origin;
        }
        if let Some(ds) = pool.datasets.get_mut(&source) {
            ds.origin = Some(new_origin);
        }
        Ok(())
    }

    fn dependent_clones(&self, snapshot: &str) -> Result<Vec<String>> {
        let pool = self.pool.borrow();
        if !pool.snapshots.contains_key(snapshot) {
            return Err(Error::SnapshotNotFound(snapshot.to_string()));
        }
        Ok(pool.clones_of(snapshot))
    }

    fn list_datasets(&self, base: &str) -> Result<Vec<DatasetEntry>> {
        let prefix = format!("{}/", base);
        let names: Vec<String> = self
            .pool
            .borrow()
            .datasets
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        let available = self.available_bytes(base);
        Ok(names
            .into_iter()
            .map(|name| DatasetEntry {
                used_bytes: self.used_bytes(&name),
                available_bytes: available,
                name,
            })
            .collect())
    }

    fn list_snapshots(&self, base: &str) -> Result<Vec<SnapshotEntry>> {
        let prefix = format!("{}/", base);
        let pool = self.pool.borrow();
        let mut snaps: Vec<(&str, u64, SnapshotEntry)> = pool
            .snapshots
            .iter()
            .filter_map(|(full, snap)| {
                let (dataset, _) = full.split_once('@')?;
                if dataset != base && !dataset.starts_with(&prefix) {
                    return None;
                }
                Some((
                    dataset,
                    snap.seq,
                    SnapshotEntry {
                        full_name: full.clone(),
                        creation: snap.creation.to_string(),
                        referenced_bytes: snap.referenced(),
                    },
                ))
            })
            .collect();
        snaps.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(&b.1)));
        Ok(snaps.into_iter().map(|(_, _, entry)| entry).collect())
    }

    fn used_bytes(&self, name: &str) -> u64 {
        self.mountpoint(name)
            .and_then(|dir| capture_files(&dir).ok())
            .map(|files| files.iter().map(|(_, data)| data.len() as u64).sum())
            .unwrap_or(0)
    }

    fn available_bytes(&self, _name: &str) -> u64 {
        self.capacity.saturating_sub(self.total_used())
    }
}
