#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use vm_state::backend::{DatasetBackend, DatasetEntry, MemoryBackend, SnapshotEntry};
use vm_state::store::AssignmentStore;
use vm_state::{Config, Error, Result, Slot, SlotLifecycle, SlotStatus, State, StateProvider};

pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}

/// Temporary directory laid out like a host, with ownership changes disabled
pub struct Host {
    pub dir: tempfile::TempDir,
    pub config: Config,
}

impl Host {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            states_dir: dir.path().join("states"),
            slots_dir: dir.path().join("microvms"),
            assignments_file: dir.path().join("etc/vm-state-assignments.json"),
            zfs_pool: "microvms".to_string(),
            zfs_dataset: "storage/states".to_string(),
            owner: None,
            settle_delay_secs: 0,
            ..Config::default()
        };
        Self { dir, config }
    }

    pub fn provider<B: DatasetBackend>(&self, backend: B) -> StateProvider<B> {
        StateProvider::new(backend, &self.config)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub fn state(name: &str) -> State {
    State::new(name).expect("valid state name")
}

/// Memory backend that records every mutating call
pub struct RecordingBackend {
    pub inner: MemoryBackend,
    pub log: EventLog,
}

impl RecordingBackend {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MemoryBackend::new(),
            log,
        }
    }

    fn record(&self, event: String) {
        self.log.borrow_mut().push(event);
    }
}

impl DatasetBackend for RecordingBackend {
    fn exists(&self, name: &str) -> Result<bool> {
        self.inner.exists(name)
    }

    fn create(&self, name: &str, mountpoint: &Path) -> Result<()> {
        self.record(format!("create {}", name));
        self.inner.create(name, mountpoint)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {}", name));
        self.inner.destroy(name)
    }

    fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<()> {
        self.record(format!("snapshot {}@{}", dataset, snap_name));
        self.inner.snapshot(dataset, snap_name)
    }

    fn clone_snapshot(&self, snapshot: &str, dest: &str, mountpoint: &Path) -> Result<()> {
        self.record(format!("clone {} {}", snapshot, dest));
        self.inner.clone_snapshot(snapshot, dest, mountpoint)
    }

    fn promote(&self, name: &str) -> Result<()> {
        self.record(format!("promote {}", name));
        self.inner.promote(name)
    }

    fn dependent_clones(&self, snapshot: &str) -> Result<Vec<String>> {
        self.inner.dependent_clones(snapshot)
    }

    fn list_datasets(&self, base: &str) -> Result<Vec<DatasetEntry>> {
        self.inner.list_datasets(base)
    }

    fn list_snapshots(&self, base: &str) -> Result<Vec<SnapshotEntry>> {
        self.inner.list_snapshots(base)
    }

    fn used_bytes(&self, name: &str) -> u64 {
        self.inner.used_bytes(name)
    }

    fn available_bytes(&self, name: &str) -> u64 {
        self.inner.available_bytes(name)
    }
}

/// Service manager stand-in.
///
/// Every start and stop is logged together with the state the slot resolves
/// to at that moment, read straight from the assignment file.
pub struct FakeLifecycle {
    running: RefCell<BTreeSet<Slot>>,
    unknown: RefCell<BTreeSet<Slot>>,
    fail: RefCell<Option<&'static str>>,
    assignments: PathBuf,
    pub log: EventLog,
}

impl FakeLifecycle {
    pub fn new(host: &Host, log: EventLog) -> Self {
        Self {
            running: RefCell::new(BTreeSet::new()),
            unknown: RefCell::new(BTreeSet::new()),
            fail: RefCell::new(None),
            assignments: host.config.assignments_file.clone(),
            log,
        }
    }

    pub fn set_running(&self, slot: Slot) {
        self.running.borrow_mut().insert(slot);
    }

    pub fn set_unknown(&self, slot: Slot) {
        self.unknown.borrow_mut().insert(slot);
    }

    /// Make the next call of `action` ("start", "stop", "restart", "status") fail
    pub fn fail_on(&self, action: &'static str) {
        *self.fail.borrow_mut() = Some(action);
    }

    fn act(&self, action: &'static str, slot: Slot) -> Result<()> {
        let assigned = AssignmentStore::new(&self.assignments)
            .load()?
            .resolve(slot)?;
        self.log
            .borrow_mut()
            .push(format!("{} {} ({})", action, slot, assigned));
        if *self.fail.borrow() == Some(action) {
            self.fail.borrow_mut().take();
            return Err(Error::Systemd(format!("{} {} failed", action, slot)));
        }
        Ok(())
    }
}

impl SlotLifecycle for FakeLifecycle {
    fn unit_name(&self, slot: Slot) -> String {
        slot.unit_name("microvm@")
    }

    fn start(&self, slot: Slot) -> Result<()> {
        self.act("start", slot)?;
        self.running.borrow_mut().insert(slot);
        Ok(())
    }

    fn stop(&self, slot: Slot) -> Result<()> {
        self.act("stop", slot)?;
        self.running.borrow_mut().remove(&slot);
        Ok(())
    }

    fn restart(&self, slot: Slot) -> Result<()> {
        self.act("restart", slot)?;
        self.running.borrow_mut().insert(slot);
        Ok(())
    }

    fn status(&self, slot: Slot) -> Result<SlotStatus> {
        if *self.fail.borrow() == Some("status") {
            self.fail.borrow_mut().take();
            return Err(Error::Systemd(format!("cannot query {}", slot)));
        }
        if self.unknown.borrow().contains(&slot) {
            return Ok(SlotStatus::Unknown);
        }
        Ok(if self.running.borrow().contains(&slot) {
            SlotStatus::Running
        } else {
            SlotStatus::Stopped
        })
    }
}
