//! Local ZFS backend implementation
//!
//! Drives the `zfs` command line tool. Listings use `-H -p` so columns are
//! tab separated and sizes are exact byte counts, but the size parser still
//! accepts the human readable suffixes in case `-p` output is not available.

use super::{DatasetBackend, DatasetEntry, SnapshotEntry};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, SystemRunner};
use std::path::Path;

/// Local ZFS backend implementation
pub struct LocalZfsBackend<R = SystemRunner> {
    runner: R,
}

impl LocalZfsBackend {
    /// Create a backend that runs `zfs` on this host
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for LocalZfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LocalZfsBackend<R> {
    /// Create a backend using a custom command runner
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    fn zfs(&self, args: &[&str]) -> Result<String> {
        self.runner.run("zfs", args)
    }

    fn mountpoint_arg(mountpoint: &Path) -> String {
        format!("mountpoint={}", mountpoint.display())
    }
}

impl<R: CommandRunner> DatasetBackend for LocalZfsBackend<R> {
    fn exists(&self, name: &str) -> Result<bool> {
        self.runner
            .check("zfs", &["list", "-H", "-o", "name", "-t", "all", name])
    }

    fn create(&self, name: &str, mountpoint: &Path) -> Result<()> {
        if self.exists(name)? {
            return Err(Error::DatasetAlreadyExists(name.to_string()));
        }
        tracing::info!(dataset = name, mountpoint = %mountpoint.display(), "zfs create");
        self.zfs(&["create", "-o", &Self::mountpoint_arg(mountpoint), name])?;
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        if !self.exists(name)? {
            return Err(Error::DatasetNotFound(name.to_string()));
        }
        tracing::info!(dataset = name, "zfs destroy");
        self.zfs(&["destroy", name])?;
        Ok(())
    }

    fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<()> {
        if !self.exists(dataset)? {
            return Err(Error::DatasetNotFound(dataset.to_string()));
        }
        let full = format!("{}@{}", dataset, snap_name);
        tracing::info!(snapshot = %full, "zfs snapshot");
        self.zfs(&["snapshot", &full])?;
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, dest: &str, mountpoint: &Path) -> Result<()> {
        if !self.exists(snapshot)? {
            return Err(Error::SnapshotNotFound(snapshot.to_string()));
        }
        if self.exists(dest)? {
            return Err(Error::DatasetAlreadyExists(dest.to_string()));
        }
        tracing::info!(snapshot, dataset = dest, "zfs clone");
        self.zfs(&[
            "clone",
            "-o",
            &Self::mountpoint_arg(mountpoint),
            snapshot,
            dest,
        ])?;
        Ok(())
    }

    fn promote(&self, name: &str) -> Result<()> {
        tracing::info!(dataset = name, "zfs promote");
        self.zfs(&["promote", name])?;
        Ok(())
    }

    fn dependent_clones(&self, snapshot: &str) -> Result<Vec<String>> {
        let output = self.zfs(&["get", "-H", "-o", "value", "clones", snapshot])?;
        Ok(parse_clones(&output))
    }

    fn list_datasets(&self, base: &str) -> Result<Vec<DatasetEntry>> {
        let output = self.zfs(&[
            "list", "-H", "-p", "-o", "name,used,avail", "-t", "filesystem", "-r", base,
        ])?;
        Ok(parse_zfs_list(&output)
            .into_iter()
            .filter(|entry| entry.name != base)
            .collect())
    }

    fn list_snapshots(&self, base: &str) -> Result<Vec<SnapshotEntry>> {
        let output = self.zfs(&[
            "list", "-H", "-p", "-t", "snapshot", "-o", "name,creation,refer", "-r", base,
        ])?;
        Ok(parse_snapshot_list(&output))
    }

    fn used_bytes(&self, name: &str) -> u64 {
        self.property_bytes(name, "used")
    }

    fn available_bytes(&self, name: &str) -> u64 {
        self.property_bytes(name, "avail")
    }
}

impl<R: CommandRunner> LocalZfsBackend<R> {
    fn property_bytes(&self, name: &str, property: &str) -> u64 {
        match self.zfs(&["get", "-H", "-p", "-o", "value", property, name]) {
            Ok(out) => parse_size(&out).unwrap_or(0),
            Err(e) => {
                tracing::warn!(dataset = name, property, error = %e, "zfs get failed");
                0
            }
        }
    }
}

/// Parse `zfs list -H -o name,used,avail` output
fn parse_zfs_list(output: &str) -> Vec<DatasetEntry> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 3 {
                Some(DatasetEntry {
                    name: parts[0].to_string(),
                    used_bytes: parse_size(parts[1]).unwrap_or(0),
                    available_bytes: parse_size(parts[2]).unwrap_or(0),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Parse `zfs list -H -t snapshot -o name,creation,refer` output
///
/// Without `-p` the creation column contains spaces, so the first and last
/// tab-separated fields are taken as name and size and the middle as time.
fn parse_snapshot_list(output: &str) -> Vec<SnapshotEntry> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 3 || !fields[0].contains('@') {
                return None;
            }
            let last = fields.len() - 1;
            Some(SnapshotEntry {
                full_name: fields[0].trim().to_string(),
                creation: fields[1..last].join(" ").trim().to_string(),
                referenced_bytes: parse_size(fields[last]).unwrap_or(0),
            })
        })
        .collect()
}

/// Parse the comma separated `clones` property, `-` when there are none
fn parse_clones(output: &str) -> Vec<String> {
    output
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "-")
        .map(String::from)
        .collect()
}

/// Parse size strings like "1.5G", "500M", "10K" or plain byte counts
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s == "-" || s.is_empty() {
        return Some(0);
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('P') {
        (n, 1024u64 * 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('T') {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024u64 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s, 1)
    };

    if multiplier == 1 {
        if let Ok(n) = num_str.parse::<u64>() {
            return Some(n);
        }
    }
    num_str.parse::<f64>().ok().map(|n| (n * multiplier as f64) as u64)
}
