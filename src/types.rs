//! Core types for vm-state management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A slot represents a fixed network identity (slot1 = 10.1.0.2, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Slot1,
    Slot2,
    Slot3,
    Slot4,
    Slot5,
}

impl Slot {
    /// All available slots
    pub const ALL: [Slot; 5] = [Slot::Slot1, Slot::Slot2, Slot::Slot3, Slot::Slot4, Slot::Slot5];

    /// Get the slot's IP address
    pub fn ip(&self) -> &'static str {
        match self {
            Slot::Slot1 => "10.1.0.2",
            Slot::Slot2 => "10.2.0.2",
            Slot::Slot3 => "10.3.0.2",
            Slot::Slot4 => "10.4.0.2",
            Slot::Slot5 => "10.5.0.2",
        }
    }

    /// Get the service unit bound to this slot, e.g. `microvm@slot1.service`
    pub fn unit_name(&self, prefix: &str) -> String {
        format!("{}{}.service", prefix, self.as_str())
    }

    /// Get the slot name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Slot1 => "slot1",
            Slot::Slot2 => "slot2",
            Slot::Slot3 => "slot3",
            Slot::Slot4 => "slot4",
            Slot::Slot5 => "slot5",
        }
    }

    /// The state a slot uses when it has never been assigned one
    pub fn default_state(&self) -> State {
        State(self.as_str().to_string())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Slot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "slot1" => Ok(Slot::Slot1),
            "slot2" => Ok(Slot::Slot2),
            "slot3" => Ok(Slot::Slot3),
            "slot4" => Ok(Slot::Slot4),
            "slot5" => Ok(Slot::Slot5),
            _ => Err(Error::InvalidArgument(format!(
                "Invalid slot '{}'. Must be slot1, slot2, slot3, slot4, or slot5",
                s
            ))),
        }
    }
}

/// Longest name ZFS accepts for one path component, minus headroom for `@snapshot`
const MAX_NAME_LEN: usize = 200;

/// Check a state or snapshot name against the characters ZFS allows in a component
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!("{} name cannot be empty", kind)));
    }
    if name.contains('/') || name.contains('@') {
        return Err(Error::InvalidArgument(format!(
            "{} name cannot contain '/' or '@'",
            kind
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "{} name is longer than {} characters",
            kind, MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." || name.starts_with('-') {
        return Err(Error::InvalidArgument(format!("Invalid {} name '{}'", kind, name)));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
    {
        return Err(Error::InvalidArgument(format!(
            "{} name '{}' contains invalid character '{}'",
            kind, name, c
        )));
    }
    Ok(())
}

/// A state name (portable data container)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct State(String);

impl State {
    /// Create a new state from a name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name("State", &name)?;
        Ok(State(name))
    }

    /// Get the state name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        State::new(s)
    }
}

impl TryFrom<String> for State {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        State::new(s)
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.0
    }
}

/// A snapshot name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snapshot(String);

impl Snapshot {
    /// Create a new snapshot from a name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name("Snapshot", &name)?;
        Ok(Snapshot(name))
    }

    /// Get the snapshot name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Snapshot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Snapshot::new(s)
    }
}

/// Status of the process bound to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Running,
    Stopped,
    Failed,
    Unknown,
}

impl SlotStatus {
    /// Map a systemd `ActiveState` value
    pub fn from_active_state(state: &str) -> Self {
        match state.trim() {
            "active" | "activating" | "reloading" => SlotStatus::Running,
            "inactive" | "deactivating" => SlotStatus::Stopped,
            "failed" => SlotStatus::Failed,
            _ => SlotStatus::Unknown,
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotStatus::Running => "yes",
            SlotStatus::Stopped => "no",
            SlotStatus::Failed => "failed",
            SlotStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Information about a slot
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot: Slot,
    pub assigned_state: State,
    pub status: SlotStatus,
}

impl SlotInfo {
    pub fn running(&self) -> bool {
        self.status == SlotStatus::Running
    }
}

/// Information about a state
#[derive(Debug, Clone)]
pub struct StateInfo {
    pub state: State,
    pub mount_path: PathBuf,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub zfs_dataset: String,
}

/// Information about a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub state: State,
    pub snapshot: Snapshot,
    pub full_name: String,
    pub creation: String,
    pub referenced_bytes: u64,
}
