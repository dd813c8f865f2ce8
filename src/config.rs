//! Configuration for vm-state
//!
//! Defaults match the reference deployment. A JSON file can override any
//! subset of fields.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Config file read when no explicit path is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vm-state.json";

/// Which service-manager client controls slot units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// Shell out to `systemctl`
    #[default]
    Systemctl,
    /// Call the systemd manager over D-Bus via `busctl`
    Busctl,
}

impl std::str::FromStr for LifecycleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "systemctl" => Ok(LifecycleKind::Systemctl),
            "busctl" | "dbus" => Ok(LifecycleKind::Busctl),
            other => Err(Error::InvalidArgument(format!(
                "Unknown lifecycle '{}'. Must be systemctl or busctl",
                other
            ))),
        }
    }
}

/// Owner applied to state and slot directories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub user: String,
    pub group: String,
    pub mode: u32,
}

impl Default for Ownership {
    fn default() -> Self {
        Self {
            user: "microvm".to_string(),
            group: "kvm".to_string(),
            mode: 0o755,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the states directory (e.g., /var/lib/microvms/states)
    pub states_dir: PathBuf,
    /// Directory holding one subdirectory per slot (e.g., /var/lib/microvms)
    pub slots_dir: PathBuf,
    /// Path to the assignments file (e.g., /etc/vm-state-assignments.json)
    pub assignments_file: PathBuf,
    /// ZFS pool name (e.g., microvms)
    pub zfs_pool: String,
    /// ZFS dataset path under the pool (e.g., storage/states)
    pub zfs_dataset: String,
    /// Prefix of the per-slot service unit (e.g., microvm@)
    pub service_prefix: String,
    /// `None` leaves ownership untouched
    pub owner: Option<Ownership>,
    /// Wait between stopping a slot and reassigning its data image
    pub settle_delay_secs: u64,
    pub lifecycle: LifecycleKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            states_dir: PathBuf::from("/var/lib/microvms/states"),
            slots_dir: PathBuf::from("/var/lib/microvms"),
            assignments_file: PathBuf::from("/etc/vm-state-assignments.json"),
            zfs_pool: "microvms".to_string(),
            zfs_dataset: "storage/states".to_string(),
            service_prefix: "microvm@".to_string(),
            owner: Some(Ownership::default()),
            settle_delay_secs: 2,
            lifecycle: LifecycleKind::Systemctl,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, [`DEFAULT_CONFIG_PATH`] is
    /// used if present and defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)
                } else {
                    tracing::debug!("no config file, using defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Base dataset holding every state, e.g. `microvms/storage/states`
    pub fn base_dataset(&self) -> String {
        format!("{}/{}", self.zfs_pool, self.zfs_dataset)
    }

    pub fn settle_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settle_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"zfs_pool": "tank", "owner": null, "lifecycle": "busctl"}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.zfs_pool, "tank");
        assert_eq!(config.owner, None);
        assert_eq!(config.lifecycle, LifecycleKind::Busctl);
        assert_eq!(config.zfs_dataset, "storage/states");
        assert_eq!(config.base_dataset(), "tank/storage/states");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.json"))).is_err());
    }
}
