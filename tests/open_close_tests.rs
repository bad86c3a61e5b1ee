mod common;

use common::{max_live_opens, mounted_volume, position_of};
use quickbeam::{EngineEvent, QuickbeamError};
use std::rc::Rc;

/// Two opens of one path share one handle and one engine node.
#[test]
fn test_open_dedup_shares_handle() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/b.txt", b"payload");
    });
    let id = volume.engine().lookup_id("/a/b.txt").unwrap();

    let first = volume.open("/a/b.txt").unwrap();
    let second = volume.open("/a/b.txt").unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(first.ref_count(), 2);

    // One engine-level open, total.
    let opens = volume
        .engine()
        .events()
        .iter()
        .filter(|event| **event == EngineEvent::Open(id))
        .count();
    assert_eq!(opens, 1);

    // Closing once leaves the shared handle open with one reference.
    volume.close(&second);
    assert_eq!(first.ref_count(), 1);
    assert!(first.is_open());

    volume.close(&first);
    assert!(!first.is_open());
    assert_eq!(volume.engine().live_opens(), 0);
    assert_eq!(volume.engine().violations(), 0);
}

#[test]
fn test_open_normalizes_before_dedup() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/b.txt", b"");
    });

    let first = volume.open("/a/b.txt").unwrap();
    let second = volume.open("\\a\\b.txt").unwrap();
    let third = volume.open("/a/./b.txt").unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert!(Rc::ptr_eq(&first, &third));

    volume.close(&first);
    volume.close(&second);
    volume.close(&third);
}

#[test]
fn test_open_missing_is_not_found() {
    let volume = mounted_volume(|engine| {
        engine.seed_dir("/a");
    });
    assert_eq!(volume.open("/a/nope"), Err(QuickbeamError::NotFound));
    assert_eq!(volume.open("/nope/deep"), Err(QuickbeamError::NotFound));
    assert_eq!(volume.engine().live_opens(), 0);
}

#[test]
fn test_open_relative_path_rejected() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a", b"");
    });
    assert_eq!(volume.open("a"), Err(QuickbeamError::InvalidParameter));
}

#[test]
fn test_open_unmounted_volume() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a", b"");
    });
    volume.unmount();
    assert_eq!(volume.open("/a"), Err(QuickbeamError::NotReady));
}

/// Opening a child resolves relative to an already-open ancestor instead of
/// walking through it from the root.
#[test]
fn test_open_child_of_open_ancestor() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/b/c.txt", b"");
    });
    let b_id = volume.engine().lookup_id("/a/b").unwrap();

    let b = volume.open("/a/b").unwrap();
    let c = volume.open("/a/b/c.txt").unwrap();

    // The walk to c must not have touched b's open slot a second time.
    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(max_live_opens(&volume.engine().events(), b_id), 1);

    volume.close(&c);
    volume.close(&b);
}

/// Opening an ancestor after a descendant never produces a second live open
/// for the ancestor's inode, even though the descendant's resolution already
/// walked through it.
#[test]
fn test_open_ancestor_after_descendant() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/b", b"");
    });
    let a_id = volume.engine().lookup_id("/a").unwrap();

    let b = volume.open("/a/b").unwrap();
    let a = volume.open("/a").unwrap();
    assert!(a.is_dir());

    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(max_live_opens(&volume.engine().events(), a_id), 1);

    volume.close(&a);
    volume.close(&b);
}

/// Closing a dirty file whose parent is open: the parent steps aside, the
/// target closes, the parent is reopened by identity and re-registered.
#[test]
fn test_dirty_close_brackets_open_parent() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"");
    });
    let a_id = volume.engine().lookup_id("/a").unwrap();
    let f_id = volume.engine().lookup_id("/a/f.txt").unwrap();

    let a = volume.open("/a").unwrap();
    let f = volume.open("/a/f.txt").unwrap();
    volume.write(&f, b"dirtying bytes").unwrap();
    volume.engine().take_events();

    volume.close(&f);

    let events = volume.engine().events();
    assert_eq!(volume.engine().violations(), 0);

    // Parent released before the target's close, reopened after it.
    let parent_close = position_of(&events, EngineEvent::Close(a_id)).unwrap();
    let target_close = position_of(&events, EngineEvent::Close(f_id)).unwrap();
    let parent_reopen = position_of(&events, EngineEvent::Open(a_id)).unwrap();
    assert!(parent_close < target_close);
    assert!(target_close < parent_reopen);

    // The parent handle survived the dance and is still the registered one.
    assert!(a.is_open());
    let again = volume.open("/a").unwrap();
    assert!(Rc::ptr_eq(&again, &a));
    volume.close(&again);
    volume.close(&a);
    assert_eq!(volume.engine().violations(), 0);
}

/// A clean close needs no bracket at all.
#[test]
fn test_clean_close_leaves_parent_alone() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"");
    });
    let a_id = volume.engine().lookup_id("/a").unwrap();

    let a = volume.open("/a").unwrap();
    let f = volume.open("/a/f.txt").unwrap();
    volume.engine().take_events();

    volume.close(&f);

    let events = volume.engine().events();
    assert!(position_of(&events, EngineEvent::Close(a_id)).is_none());
    volume.close(&a);
}

/// At most one live engine open per identity, at every point in a mixed
/// open/close sequence.
#[test]
fn test_single_open_invariant_across_sequence() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/b/c.txt", b"data");
        engine.seed_file("/a/d.txt", b"data");
    });

    let a = volume.open("/a").unwrap();
    let c = volume.open("/a/b/c.txt").unwrap();
    let b = volume.open("/a/b").unwrap();
    let d = volume.open("/a/d.txt").unwrap();
    let c2 = volume.open("/a/b/c.txt").unwrap();
    volume.close(&c2);
    volume.close(&b);
    let b2 = volume.open("/a/b").unwrap();
    volume.close(&d);
    volume.close(&c);
    volume.close(&b2);
    volume.close(&a);

    let events = volume.engine().events();
    assert_eq!(volume.engine().violations(), 0);
    for id in 1..10 {
        assert!(
            max_live_opens(&events, quickbeam::InodeId(id)) <= 1,
            "inode #{} had more than one live open",
            id
        );
    }
    assert_eq!(volume.engine().live_opens(), 0);
}
