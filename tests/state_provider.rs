mod common;

use common::{events, state, Host, RecordingBackend};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use vm_state::backend::{DatasetBackend, MemoryBackend};
use vm_state::{ErrorKind, Slot, Snapshot};

fn snap(name: &str) -> Snapshot {
    Snapshot::new(name).unwrap()
}

#[test]
fn create_succeeds_only_for_new_names() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");

    assert!(!states.state_exists(&dev).unwrap());
    states.create_state(&dev).unwrap();
    assert!(states.state_exists(&dev).unwrap());
    assert!(host.path().join("states/dev").is_dir());

    let err = states.create_state(&dev).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn unassigned_slot_defaults_to_its_own_name() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());

    for slot in Slot::ALL {
        assert_eq!(states.get_slot_state(slot).unwrap().name(), slot.as_str());
    }
}

#[test]
fn assign_round_trips_and_links_image() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");

    let outcome = states.assign_state(Slot::Slot1, &dev, false).unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.previous, "slot1");
    assert_eq!(states.get_slot_state(Slot::Slot1).unwrap(), dev);

    let link = host.path().join("microvms/slot1/data.img");
    assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(
        fs::read_link(&link).unwrap(),
        host.path().join("states/dev/data.img")
    );

    // Reassigning replaces the symlink
    states.assign_state(Slot::Slot1, &state("other"), false).unwrap();
    assert_eq!(
        fs::read_link(&link).unwrap(),
        host.path().join("states/other/data.img")
    );
}

#[test]
fn assign_backs_up_a_regular_data_image() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let slot_dir = host.path().join("microvms/slot2");
    fs::create_dir_all(&slot_dir).unwrap();
    fs::write(slot_dir.join("data.img"), b"legacy").unwrap();

    states.assign_state(Slot::Slot2, &state("dev"), false).unwrap();

    assert_eq!(fs::read(slot_dir.join("data.img.backup")).unwrap(), b"legacy");
    assert!(fs::symlink_metadata(slot_dir.join("data.img"))
        .unwrap()
        .file_type()
        .is_symlink());
}

#[test]
fn a_state_binds_to_one_slot_unless_forced() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.assign_state(Slot::Slot1, &dev, false).unwrap();

    let err = states.assign_state(Slot::Slot2, &dev, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);
    assert_eq!(states.get_slot_state(Slot::Slot2).unwrap().name(), "slot2");

    // The default binding counts too: slot3's own state belongs to slot3.
    let err = states
        .assign_state(Slot::Slot1, &state("slot3"), false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);

    // Re-assigning the same pair is fine
    states.assign_state(Slot::Slot1, &dev, false).unwrap();

    states.assign_state(Slot::Slot2, &dev, true).unwrap();
    assert_eq!(
        states.slots_using(&dev).unwrap(),
        vec![Slot::Slot1, Slot::Slot2]
    );
}

#[test]
fn delete_is_blocked_while_assigned() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.assign_state(Slot::Slot1, &dev, false).unwrap();

    let err = states.delete_state(&dev, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);
    assert!(err.to_string().contains("slot1"));
    assert_eq!(states.is_state_in_use(&dev).unwrap(), Some(Slot::Slot1));

    states.assign_state(Slot::Slot1, &state("elsewhere"), false).unwrap();
    states.delete_state(&dev, false).unwrap();
    assert!(!states.state_exists(&dev).unwrap());
}

#[test]
fn delete_fails_closed_on_unreadable_assignments() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.create_state(&dev).unwrap();

    let file = &host.config.assignments_file;
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(file, "{ truncated").unwrap();

    let err = states.delete_state(&dev, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendFailure);
    assert!(states.state_exists(&dev).unwrap());
}

#[test]
fn delete_destroys_snapshots_before_dataset() {
    let host = Host::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let states = host.provider(RecordingBackend::new(log.clone()));
    let dev = state("dev");
    states.create_state(&dev).unwrap();
    states.create_snapshot(&dev, &snap("a")).unwrap();
    states.create_snapshot(&dev, &snap("b")).unwrap();
    log.borrow_mut().clear();

    states.delete_state(&dev, false).unwrap();

    assert_eq!(
        events(&log),
        vec![
            "destroy microvms/storage/states/dev@a",
            "destroy microvms/storage/states/dev@b",
            "destroy microvms/storage/states/dev",
        ]
    );
}

#[test]
fn delete_refuses_a_state_with_dependent_clones_before_destroying_anything() {
    let host = Host::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let states = host.provider(RecordingBackend::new(log.clone()));
    let (dev, dev2) = (state("dev"), state("dev2"));
    states.create_state(&dev).unwrap();
    states.create_snapshot(&dev, &snap("s1")).unwrap();
    states.clone_state(&dev, &dev2).unwrap();
    states.create_snapshot(&dev2, &snap("keepme")).unwrap();

    // After the promote, dev hangs off dev2@clone-for-dev2 and s1 moved to dev2.
    let before: Vec<String> = states
        .list_snapshots(Some(&dev2))
        .unwrap()
        .into_iter()
        .map(|s| s.full_name)
        .collect();
    assert_eq!(before.len(), 3);
    log.borrow_mut().clear();

    for force in [false, true] {
        let err = states.delete_state(&dev2, force).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InUse);
        assert!(err.to_string().contains("microvms/storage/states/dev"));
    }

    assert!(events(&log).is_empty());
    let after: Vec<String> = states
        .list_snapshots(Some(&dev2))
        .unwrap()
        .into_iter()
        .map(|s| s.full_name)
        .collect();
    assert_eq!(after, before);

    // Once the dependent clone is gone the delete goes through.
    states.delete_state(&dev, false).unwrap();
    states.delete_state(&dev2, false).unwrap();
    assert!(!states.state_exists(&dev2).unwrap());
}

#[test]
fn invalid_stored_name_does_not_block_assignments() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let file = &host.config.assignments_file;
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(file, r#"{"slot1": "my vm"}"#).unwrap();

    let outcome = states.assign_state(Slot::Slot2, &state("other"), false).unwrap();
    assert_eq!(outcome.previous, "slot2");

    let outcome = states.assign_state(Slot::Slot1, &state("good"), false).unwrap();
    assert_eq!(outcome.previous, "my vm");
    assert_eq!(states.get_slot_state(Slot::Slot1).unwrap(), state("good"));
    assert_eq!(states.list_assignments().unwrap()[0], (Slot::Slot1, state("good")));
}

#[test]
fn invalid_stored_name_keeps_delete_fail_closed() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.create_state(&dev).unwrap();
    let file = &host.config.assignments_file;
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(file, r#"{"slot1": "my vm"}"#).unwrap();

    assert!(states.delete_state(&dev, false).is_err());
    assert!(states.state_exists(&dev).unwrap());
    assert_eq!(
        states.list_assignment_names().unwrap()[0],
        (Slot::Slot1, "my vm".to_string())
    );
}

#[test]
fn delete_missing_state_is_not_found() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let err = states.delete_state(&state("ghost"), false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn clone_survives_deleting_its_source() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let (src, dest) = (state("src"), state("dest"));
    states.create_state(&src).unwrap();
    fs::write(states.state_data_img(&src), b"golden image").unwrap();

    states.clone_state(&src, &dest).unwrap();
    assert_eq!(
        states.backend().origin("microvms/storage/states/dest"),
        None
    );

    states.delete_state(&src, false).unwrap();

    assert!(states.state_exists(&dest).unwrap());
    assert!(!states.state_exists(&src).unwrap());
    assert_eq!(
        fs::read(states.state_data_img(&dest)).unwrap(),
        b"golden image"
    );
}

#[test]
fn clone_keeps_its_snapshot_on_the_destination() {
    let host = Host::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let states = host.provider(RecordingBackend::new(log.clone()));
    let (src, dest) = (state("src"), state("dest"));
    states.create_state(&src).unwrap();
    log.borrow_mut().clear();

    states.clone_state(&src, &dest).unwrap();

    assert_eq!(
        events(&log),
        vec![
            "snapshot microvms/storage/states/src@clone-for-dest",
            "clone microvms/storage/states/src@clone-for-dest microvms/storage/states/dest",
            "promote microvms/storage/states/dest",
        ]
    );
    let snaps = states.list_snapshots(Some(&dest)).unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].snapshot.name(), "clone-for-dest");
    assert!(states.list_snapshots(Some(&src)).unwrap().is_empty());
}

#[test]
fn clone_checks_source_and_destination() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let (a, b) = (state("a"), state("b"));

    assert_eq!(
        states.clone_state(&a, &b).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    states.create_state(&a).unwrap();
    states.create_state(&b).unwrap();
    assert_eq!(
        states.clone_state(&a, &b).unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
}

#[test]
fn skipping_promote_pins_the_source() {
    // What clone_state guards against: an unpromoted clone keeps its origin
    // snapshot, and with it the source state, alive.
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let src = state("src");
    states.create_state(&src).unwrap();
    let backend = states.backend();
    backend
        .snapshot("microvms/storage/states/src", "x")
        .unwrap();
    backend
        .clone_snapshot(
            "microvms/storage/states/src@x",
            "microvms/storage/states/raw",
            &host.path().join("states/raw"),
        )
        .unwrap();

    let err = states.delete_state(&src, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendFailure);
    assert!(states.state_exists(&src).unwrap());
}

#[test]
fn snapshot_of_slot_uses_its_assigned_state() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    states.create_state(&state("dev")).unwrap();
    states.assign_state(Slot::Slot1, &state("dev"), false).unwrap();

    let snapped = states.snapshot_slot(Slot::Slot1, &snap("s1")).unwrap();
    assert_eq!(snapped.name(), "dev");

    let found = states.find_snapshot(&snap("s1")).unwrap().unwrap();
    assert_eq!(found.state.name(), "dev");
    assert_eq!(found.full_name, "microvms/storage/states/dev@s1");

    // slot2 resolves to "slot2", which was never created
    let err = states.snapshot_slot(Slot::Slot2, &snap("s1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn restore_creates_an_independent_state() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.create_state(&dev).unwrap();
    fs::write(states.state_data_img(&dev), b"v1").unwrap();
    states.create_snapshot(&dev, &snap("s1")).unwrap();
    fs::write(states.state_data_img(&dev), b"v2").unwrap();

    let recovered = state("dev-recovered");
    states.restore_snapshot(&snap("s1"), &recovered).unwrap();

    assert_ne!(recovered, dev);
    assert_eq!(fs::read(states.state_data_img(&recovered)).unwrap(), b"v1");
    assert_eq!(
        states
            .backend()
            .origin("microvms/storage/states/dev-recovered"),
        None
    );

    states.delete_state(&dev, false).unwrap();
    assert!(states.state_exists(&recovered).unwrap());
    assert_eq!(fs::read(states.state_data_img(&recovered)).unwrap(), b"v1");
}

#[test]
fn restore_rejects_unknown_snapshot_and_existing_target() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.create_state(&dev).unwrap();

    let err = states.restore_snapshot(&snap("nope"), &state("x")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    states.create_snapshot(&dev, &snap("s1")).unwrap();
    let err = states.restore_snapshot(&snap("s1"), &dev).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn listing_reports_states_and_usage() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::with_capacity(1000));
    states.create_state(&state("a")).unwrap();
    states.create_state(&state("b")).unwrap();
    fs::write(states.state_data_img(&state("a")), [0u8; 100]).unwrap();

    let listed = states.list_states().unwrap();
    let names: Vec<_> = listed.iter().map(|s| s.state.name()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(listed[0].used_bytes, 100);
    assert_eq!(listed[0].available_bytes, 900);
    assert_eq!(listed[0].mount_path, host.path().join("states/a"));

    let info = states.get_state_info(&state("a")).unwrap().unwrap();
    assert_eq!(info.zfs_dataset, "microvms/storage/states/a");
    assert!(states.get_state_info(&state("zzz")).unwrap().is_none());
}

#[test]
fn delete_single_snapshot() {
    let host = Host::new();
    let states = host.provider(MemoryBackend::new());
    let dev = state("dev");
    states.create_state(&dev).unwrap();
    states.create_snapshot(&dev, &snap("s1")).unwrap();

    states.delete_snapshot(&dev, &snap("s1")).unwrap();
    assert!(states.find_snapshot(&snap("s1")).unwrap().is_none());
    assert_eq!(
        states.delete_snapshot(&dev, &snap("s1")).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn backend_listing_is_visible_through_references() {
    let host = Host::new();
    let backend = MemoryBackend::new();
    let states = host.provider(&backend);
    states.create_state(&state("dev")).unwrap();
    assert!(backend.exists("microvms/storage/states/dev").unwrap());
}
