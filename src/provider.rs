//! State, snapshot and assignment management over a dataset backend

use crate::backend::DatasetBackend;
use crate::config::{Config, Ownership};
use crate::error::{Error, Result};
use crate::store::{AssignmentStore, StoreLock};
use crate::types::{Slot, Snapshot, SnapshotInfo, State, StateInfo};
use nix::unistd::{chown, Group, User};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

/// File every state and slot directory holds
pub const DATA_IMAGE: &str = "data.img";

/// Prefix of the snapshot taken on the source of a clone
pub const CLONE_SNAPSHOT_PREFIX: &str = "clone-for-";

/// Result of [`StateProvider::assign_state`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    /// Name the slot resolved to before, as stored (it may fail validation)
    pub previous: String,
    /// The state did not exist and was created empty
    pub created: bool,
}

/// Composes the assignment store and a dataset backend.
///
/// States live at `<pool>/<base>/<state>` mounted on `<states_dir>/<state>`.
/// A slot reads its image through `<slots_dir>/<slot>/data.img`, a symlink
/// into the assigned state.
pub struct StateProvider<B> {
    backend: B,
    store: AssignmentStore,
    zfs_pool: String,
    zfs_dataset: String,
    states_dir: PathBuf,
    slots_dir: PathBuf,
    owner: Option<Ownership>,
}

impl<B: DatasetBackend> StateProvider<B> {
    pub fn new(backend: B, config: &Config) -> Self {
        Self {
            backend,
            store: AssignmentStore::new(&config.assignments_file),
            zfs_pool: config.zfs_pool.clone(),
            zfs_dataset: config.zfs_dataset.clone(),
            states_dir: config.states_dir.clone(),
            slots_dir: config.slots_dir.clone(),
            owner: config.owner.clone(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &AssignmentStore {
        &self.store
    }

    /// Hold the assignment lock for a whole command
    pub fn lock(&self) -> Result<StoreLock<'_>> {
        self.store.lock()
    }

    // === Naming ===

    /// Get the base ZFS dataset path (parent of all states)
    pub fn base_dataset(&self) -> String {
        format!("{}/{}", self.zfs_pool, self.zfs_dataset)
    }

    /// Get the full ZFS dataset path for a state
    pub fn dataset_path(&self, state: &State) -> String {
        format!("{}/{}", self.base_dataset(), state.name())
    }

    /// Get the state directory path
    pub fn state_dir(&self, state: &State) -> PathBuf {
        self.states_dir.join(state.name())
    }

    pub fn state_data_img(&self, state: &State) -> PathBuf {
        self.state_dir(state).join(DATA_IMAGE)
    }

    pub fn slot_dir(&self, slot: Slot) -> PathBuf {
        self.slots_dir.join(slot.as_str())
    }

    pub fn slot_data_img(&self, slot: Slot) -> PathBuf {
        self.slot_dir(slot).join(DATA_IMAGE)
    }

    /// State name for a dataset directly below the base dataset
    fn state_from_dataset(&self, dataset: &str) -> Option<State> {
        let base = self.base_dataset();
        let name = dataset.strip_prefix(&base)?.strip_prefix('/')?;
        if name.contains('/') {
            return None;
        }
        State::new(name).ok()
    }

    // === States ===

    pub fn state_exists(&self, state: &State) -> Result<bool> {
        self.backend.exists(&self.dataset_path(state))
    }

    pub fn get_state_info(&self, state: &State) -> Result<Option<StateInfo>> {
        let dataset = self.dataset_path(state);
        if !self.backend.exists(&dataset)? {
            return Ok(None);
        }
        Ok(Some(StateInfo {
            state: state.clone(),
            mount_path: self.state_dir(state),
            used_bytes: self.backend.used_bytes(&dataset),
            available_bytes: self.backend.available_bytes(&dataset),
            zfs_dataset: dataset,
        }))
    }

    pub fn list_states(&self) -> Result<Vec<StateInfo>> {
        let entries = self.backend.list_datasets(&self.base_dataset())?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let state = self.state_from_dataset(&entry.name)?;
                Some(StateInfo {
                    mount_path: self.state_dir(&state),
                    state,
                    used_bytes: entry.used_bytes,
                    available_bytes: entry.available_bytes,
                    zfs_dataset: entry.name,
                })
            })
            .collect())
    }

    /// Create a new empty state owned by the slot service account
    pub fn create_state(&self, state: &State) -> Result<()> {
        if self.state_exists(state)? {
            return Err(Error::StateAlreadyExists(state.clone()));
        }

        let mountpoint = self.state_dir(state);
        self.backend
            .create(&self.dataset_path(state), &mountpoint)?;
        self.set_ownership(&mountpoint)?;

        tracing::info!(state = %state, "created state");
        Ok(())
    }

    /// Delete a state and all of its snapshots.
    ///
    /// Refuses while any slot resolves to the state unless `force` is set.
    /// Reading the assignments must succeed for the check to pass. Refuses,
    /// even with `force`, while another dataset is a clone of one of its
    /// snapshots; nothing is destroyed in that case.
    pub fn delete_state(&self, state: &State, force: bool) -> Result<()> {
        let _lock = self.lock()?;

        if !self.state_exists(state)? {
            return Err(Error::StateNotFound(state.clone()));
        }
        if force {
            tracing::warn!(state = %state, "skipping in-use check");
        } else if let Some(slot) = self.is_state_in_use(state)? {
            return Err(Error::StateInUse {
                state: state.clone(),
                slot,
            });
        }

        let snapshots = self.list_snapshots(Some(state))?;
        let mut clones = Vec::new();
        for snap in &snapshots {
            clones.extend(self.backend.dependent_clones(&snap.full_name)?);
        }
        if !clones.is_empty() {
            return Err(Error::StateHasDependents {
                state: state.clone(),
                clones,
            });
        }

        for snap in snapshots {
            tracing::debug!(snapshot = %snap.full_name, "destroying snapshot");
            self.backend.destroy(&snap.full_name)?;
        }
        self.backend.destroy(&self.dataset_path(state))?;

        tracing::info!(state = %state, "deleted state");
        Ok(())
    }

    /// Clone a state to a new, independent state.
    ///
    /// The `clone-for-<dest>` snapshot is kept; after the promote it belongs
    /// to `dest`. An existing snapshot of that name from an earlier attempt
    /// is reused.
    pub fn clone_state(&self, source: &State, destination: &State) -> Result<()> {
        if !self.state_exists(source)? {
            return Err(Error::StateNotFound(source.clone()));
        }
        if self.state_exists(destination)? {
            return Err(Error::StateAlreadyExists(destination.clone()));
        }

        let src_dataset = self.dataset_path(source);
        let snap_name = format!("{}{}", CLONE_SNAPSHOT_PREFIX, destination.name());
        let clone_snap = format!("{}@{}", src_dataset, snap_name);

        if self.backend.exists(&clone_snap)? {
            tracing::warn!(snapshot = %clone_snap, "reusing existing clone snapshot");
        } else {
            self.backend.snapshot(&src_dataset, &snap_name)?;
        }

        self.clone_and_promote(&clone_snap, destination)?;
        tracing::info!(source = %source, destination = %destination, "cloned state");
        Ok(())
    }

    /// Clone then promote so `state` never depends on `snapshot`
    fn clone_and_promote(&self, snapshot: &str, state: &State) -> Result<()> {
        let dataset = self.dataset_path(state);
        let mountpoint = self.state_dir(state);

        self.backend.clone_snapshot(snapshot, &dataset, &mountpoint)?;
        self.backend.promote(&dataset)?;
        self.set_ownership(&mountpoint)
    }

    // === Snapshots ===

    /// Snapshot a state. Running processes are not quiesced.
    pub fn create_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        if !self.state_exists(state)? {
            return Err(Error::StateNotFound(state.clone()));
        }
        self.backend
            .snapshot(&self.dataset_path(state), snapshot.name())?;

        tracing::info!(state = %state, snapshot = %snapshot, "created snapshot");
        Ok(())
    }

    /// Snapshot whatever state a slot currently resolves to
    pub fn snapshot_slot(&self, slot: Slot, snapshot: &Snapshot) -> Result<State> {
        let state = self.get_slot_state(slot)?;
        self.create_snapshot(&state, snapshot)?;
        Ok(state)
    }

    pub fn delete_snapshot(&self, state: &State, snapshot: &Snapshot) -> Result<()> {
        let full = format!("{}@{}", self.dataset_path(state), snapshot.name());
        if !self.backend.exists(&full)? {
            return Err(Error::SnapshotNotFound(full));
        }
        self.backend.destroy(&full)?;

        tracing::info!(state = %state, snapshot = %snapshot, "deleted snapshot");
        Ok(())
    }

    /// Restore the first snapshot named `snapshot`, from any state, into a new state
    pub fn restore_snapshot(&self, snapshot: &Snapshot, new_state: &State) -> Result<()> {
        let snap = self
            .find_snapshot(snapshot)?
            .ok_or_else(|| Error::SnapshotNotFound(snapshot.name().to_string()))?;
        if self.state_exists(new_state)? {
            return Err(Error::StateAlreadyExists(new_state.clone()));
        }

        self.clone_and_promote(&snap.full_name, new_state)?;
        tracing::info!(snapshot = %snap.full_name, state = %new_state, "restored snapshot");
        Ok(())
    }

    /// Snapshots of one state, or of all states
    pub fn list_snapshots(&self, state: Option<&State>) -> Result<Vec<SnapshotInfo>> {
        let entries = self.backend.list_snapshots(&self.base_dataset())?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let (dataset, snap_name) = entry.split()?;
                let owner = self.state_from_dataset(dataset)?;
                let snapshot = Snapshot::new(snap_name).ok()?;
                if state.is_some_and(|s| *s != owner) {
                    return None;
                }
                Some(SnapshotInfo {
                    state: owner,
                    snapshot,
                    creation: entry.creation.clone(),
                    referenced_bytes: entry.referenced_bytes,
                    full_name: entry.full_name.clone(),
                })
            })
            .collect())
    }

    /// Find a snapshot by name across all states
    pub fn find_snapshot(&self, snapshot: &Snapshot) -> Result<Option<SnapshotInfo>> {
        Ok(self
            .list_snapshots(None)?
            .into_iter()
            .find(|s| s.snapshot == *snapshot))
    }

    // === Assignments ===

    /// Get the state assigned to a slot, defaulting to the slot's own name
    pub fn get_slot_state(&self, slot: Slot) -> Result<State> {
        self.store.load()?.resolve(slot)
    }

    /// Every slot with the state it resolves to
    pub fn list_assignments(&self) -> Result<Vec<(Slot, State)>> {
        self.store.load()?.resolve_all()
    }

    /// First slot bound to a state
    pub fn is_state_in_use(&self, state: &State) -> Result<Option<Slot>> {
        Ok(self.slots_using(state)?.into_iter().next())
    }

    /// Every slot bound to a state
    pub fn slots_using(&self, state: &State) -> Result<Vec<Slot>> {
        Ok(self
            .list_assignments()?
            .into_iter()
            .filter(|(_, s)| s == state)
            .map(|(slot, _)| slot)
            .collect())
    }

    /// Every slot with the name it resolves to, invalid names included
    pub fn list_assignment_names(&self) -> Result<Vec<(Slot, String)>> {
        let assignments = self.store.load()?;
        Ok(Slot::ALL
            .iter()
            .map(|&slot| (slot, assignments.raw_name(slot).to_string()))
            .collect())
    }

    /// Check that binding `state` to `slot` keeps every state on at most one slot.
    ///
    /// Compares stored names as written, so an entry that is no longer a
    /// valid state name never blocks assignments.
    pub fn check_assignable(&self, slot: Slot, state: &State, force: bool) -> Result<()> {
        let other = self
            .store
            .load()?
            .slots_named(state.name())
            .into_iter()
            .find(|&s| s != slot);
        match other {
            Some(other) if !force => Err(Error::StateInUse {
                state: state.clone(),
                slot: other,
            }),
            Some(other) => {
                tracing::warn!(state = %state, slot = %slot, other = %other, "sharing state between slots");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Assign a state to a slot (does not restart the slot).
    ///
    /// Creates the state if it does not exist, records the assignment and
    /// points the slot's data image at the state.
    pub fn assign_state(&self, slot: Slot, state: &State, force: bool) -> Result<AssignOutcome> {
        let _lock = self.lock()?;

        self.check_assignable(slot, state, force)?;

        let created = !self.state_exists(state)?;
        if created {
            self.create_state(state)?;
        }

        let mut previous = String::new();
        self.store.update(|assignments| {
            previous = assignments.raw_name(slot).to_string();
            assignments.set(slot, state);
            Ok(())
        })?;

        self.link_slot_image(slot, state)?;

        tracing::info!(slot = %slot, state = %state, previous = %previous, "assigned state");
        Ok(AssignOutcome { previous, created })
    }

    /// Point `<slot>/data.img` at the state's image, keeping a regular file as `.backup`
    fn link_slot_image(&self, slot: Slot, state: &State) -> Result<()> {
        let slot_dir = self.slot_dir(slot);
        let slot_data = self.slot_data_img(slot);

        fs::create_dir_all(&slot_dir)?;
        if let Err(e) = self.set_owner_only(&slot_dir) {
            tracing::warn!(path = %slot_dir.display(), error = %e, "failed to chown slot directory");
        }

        match fs::symlink_metadata(&slot_data) {
            Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(&slot_data)?,
            Ok(_) => {
                let backup = slot_dir.join(format!("{}.backup", DATA_IMAGE));
                tracing::warn!(path = %slot_data.display(), backup = %backup.display(), "backing up existing data image");
                fs::rename(&slot_data, &backup)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        symlink(self.state_data_img(state), &slot_data)?;
        Ok(())
    }

    // === Ownership ===

    fn resolve_owner(owner: &Ownership) -> Result<(User, Group)> {
        let user = User::from_name(&owner.user)
            .map_err(std::io::Error::from)?
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown user '{}'", owner.user)))?;
        let group = Group::from_name(&owner.group)
            .map_err(std::io::Error::from)?
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown group '{}'", owner.group)))?;
        Ok((user, group))
    }

    fn set_owner_only(&self, path: &Path) -> Result<()> {
        if let Some(owner) = &self.owner {
            let (user, group) = Self::resolve_owner(owner)?;
            chown(path, Some(user.uid), Some(group.gid)).map_err(std::io::Error::from)?;
        }
        Ok(())
    }

    /// Set ownership and mode on a state mountpoint
    fn set_ownership(&self, path: &Path) -> Result<()> {
        if let Some(owner) = &self.owner {
            self.set_owner_only(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(owner.mode))?;
        }
        Ok(())
    }
}
