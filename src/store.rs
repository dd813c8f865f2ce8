//! Persistent slot-to-state assignments
//!
//! The document is a flat JSON object (`{"slot1": "dev"}`). A slot without
//! an entry uses the state named after itself. Writes go through a temp file
//! and a rename, and read-modify-write cycles hold an exclusive `flock` on a
//! sibling `.lock` file so concurrent invocations cannot lose updates.

use crate::error::Result;
use crate::types::{Slot, State};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Slot-to-state assignments stored in JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignments(BTreeMap<String, String>);

impl Assignments {
    /// Explicit entry for a slot, if any
    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.0.get(slot.as_str()).map(String::as_str)
    }

    /// State a slot resolves to, falling back to the slot's own name
    pub fn resolve(&self, slot: Slot) -> Result<State> {
        match self.get(slot) {
            Some(name) => State::new(name),
            None => Ok(slot.default_state()),
        }
    }

    /// Name a slot resolves to, as stored and without validation
    pub fn raw_name(&self, slot: Slot) -> &str {
        self.get(slot).unwrap_or(slot.as_str())
    }

    /// Slots whose stored or default name equals `name`
    pub fn slots_named(&self, name: &str) -> Vec<Slot> {
        Slot::ALL
            .iter()
            .copied()
            .filter(|&slot| self.raw_name(slot) == name)
            .collect()
    }

    pub fn set(&mut self, slot: Slot, state: &State) {
        self.0
            .insert(slot.as_str().to_string(), state.name().to_string());
    }

    /// Every slot with its resolved state, in slot order
    pub fn resolve_all(&self) -> Result<Vec<(Slot, State)>> {
        Slot::ALL
            .iter()
            .map(|&slot| Ok((slot, self.resolve(slot)?)))
            .collect()
    }
}

/// File-backed assignment store
#[derive(Debug)]
pub struct AssignmentStore {
    path: PathBuf,
    lock_path: PathBuf,
    held: RefCell<Option<File>>,
    depth: Cell<usize>,
}

impl AssignmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.clone().into_os_string();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            held: RefCell::new(None),
            depth: Cell::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load assignments from file
    ///
    /// A missing or empty file means nothing has been assigned yet. A file
    /// that fails to parse is an error, never an empty map.
    pub fn load(&self) -> Result<Assignments> {
        if !self.path.exists() {
            return Ok(Assignments::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Assignments::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Save assignments to file, replacing it atomically
    pub fn save(&self, assignments: &Assignments) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        let content = serde_json::to_string_pretty(assignments)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o644))?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!(path = %self.path.display(), "saved assignments");
        Ok(())
    }

    /// Locked read-modify-write of the whole document
    pub fn update<F>(&self, f: F) -> Result<Assignments>
    where
        F: FnOnce(&mut Assignments) -> Result<()>,
    {
        let _lock = self.lock()?;
        let mut assignments = self.load()?;
        f(&mut assignments)?;
        self.save(&assignments)?;
        Ok(assignments)
    }

    /// Take the exclusive store lock.
    ///
    /// Blocks until no other process holds it. Nested calls within this
    /// process share the one `flock`, which is released when the outermost
    /// guard drops.
    pub fn lock(&self) -> Result<StoreLock<'_>> {
        if self.depth.get() == 0 {
            fs::create_dir_all(self.parent_dir())?;
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&self.lock_path)?;
            flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(std::io::Error::from)?;
            tracing::debug!(path = %self.lock_path.display(), "acquired assignment lock");
            *self.held.borrow_mut() = Some(file);
        }
        self.depth.set(self.depth.get() + 1);
        Ok(StoreLock { store: self })
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Scoped hold on the assignment lock
#[derive(Debug)]
pub struct StoreLock<'a> {
    store: &'a AssignmentStore,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let depth = self.store.depth.get() - 1;
        self.store.depth.set(depth);
        if depth == 0 {
            if let Some(file) = self.store.held.borrow_mut().take() {
                if let Err(e) = flock(file.as_raw_fd(), FlockArg::Unlock) {
                    tracing::warn!(error = %e, "failed to release assignment lock");
                }
            }
        }
    }
}
