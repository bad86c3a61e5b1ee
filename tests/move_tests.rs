mod common;

use common::{last_position_of, mounted_volume, position_of};
use quickbeam::{EngineEvent, MemEngine, QuickbeamError, Volume};
use rstest::rstest;
use std::rc::Rc;

const PAYLOAD: &[u8] = b"the bytes that must survive the move";

fn read_back(volume: &Volume<MemEngine>, vpath: &str) -> Vec<u8> {
    let handle = volume.open(vpath).unwrap();
    let mut buf = vec![0u8; 256];
    let n = volume.read(&handle, &mut buf).unwrap();
    buf.truncate(n);
    volume.close(&handle);
    buf
}

/// The four SameDir x ParentIsChildOfNewParent combinations (the fourth,
/// SameDir with the flag set, cannot arise: the flag is only computed across
/// differing directories), plus a distance-2 topology where the direct-child
/// check correctly stays false. Each case runs once with the ancestors held
/// open and once resolving them transiently; the invariant in all of them is
/// zero single-open violations and a coherent table afterwards.
#[rstest]
// same_dir
#[case("/a/b/f.txt", "/a/b/g.txt", &["/a/b"])]
#[case("/a/b/f.txt", "/a/b/g.txt", &[])]
// different, unrelated directories
#[case("/a/b/f.txt", "/c/f.txt", &["/a/b", "/c"])]
#[case("/a/b/f.txt", "/c/f.txt", &[])]
// old parent is a direct child of the new parent (moving up)
#[case("/c/b/f.txt", "/c/f.txt", &["/c", "/c/b"])]
#[case("/c/b/f.txt", "/c/f.txt", &[])]
// new parent is a direct child of the old parent (moving down)
#[case("/a/f.txt", "/a/b/f.txt", &["/a", "/a/b"])]
#[case("/a/f.txt", "/a/b/f.txt", &[])]
// distance two: new parent is the old parent's grandparent
#[case("/a/b/c/f.txt", "/a/f.txt", &["/a", "/a/b/c"])]
#[case("/a/b/c/f.txt", "/a/f.txt", &[])]
fn test_move_topology(#[case] from: &str, #[case] to: &str, #[case] held_open: &[&str]) {
    let volume = mounted_volume(|engine| {
        engine.seed_file(from, PAYLOAD);
        engine.seed_dir("/a/b/c");
        engine.seed_dir("/c");
    });

    let ancestors: Vec<_> = held_open
        .iter()
        .map(|p| volume.open(p).unwrap())
        .collect();
    let handle = volume.open(from).unwrap();
    volume.engine().take_events();

    volume.rename(&handle, to).unwrap();

    assert_eq!(
        volume.engine().violations(),
        0,
        "single-open violated moving {} -> {} (held open: {:?})",
        from,
        to,
        held_open
    );
    assert_eq!(handle.path(), to);
    assert!(handle.is_open());

    // The old name is gone, the new one resolves to the shared handle.
    assert_eq!(volume.open(from), Err(QuickbeamError::NotFound));
    let reopened = volume.open(to).unwrap();
    assert!(Rc::ptr_eq(&reopened, &handle));
    volume.close(&reopened);

    for ancestor in &ancestors {
        assert!(
            ancestor.is_open(),
            "ancestor {} lost its slot",
            ancestor.path()
        );
    }

    volume.close(&handle);
    for ancestor in &ancestors {
        volume.close(ancestor);
    }
    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(volume.engine().live_opens(), 0);

    // Content survived.
    assert_eq!(read_back(&volume, to), PAYLOAD);
    assert_eq!(volume.engine().violations(), 0);
}

/// The ancestor-chain scenario spelled out: A under B under C, moving A up
/// into C. C's slot is released before B's close, whose internal sync
/// re-opens C, and C is reacquired only afterwards. Any other order would
/// double-open C inside the engine.
#[test]
fn test_move_ancestor_chain_release_order() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/c/b/a.txt", b"x");
    });
    let c_id = volume.engine().lookup_id("/c").unwrap();
    let b_id = volume.engine().lookup_id("/c/b").unwrap();

    let c = volume.open("/c").unwrap();
    let b = volume.open("/c/b").unwrap();
    let a = volume.open("/c/b/a.txt").unwrap();
    volume.engine().take_events();

    volume.rename(&a, "/c/a.txt").unwrap();

    let events = volume.engine().events();
    assert_eq!(volume.engine().violations(), 0);

    let c_release = position_of(&events, EngineEvent::Close(c_id)).unwrap();
    let b_close = position_of(&events, EngineEvent::Close(b_id)).unwrap();
    let c_internal = position_of(&events, EngineEvent::InternalOpen(c_id)).unwrap();
    let c_reopen = position_of(&events, EngineEvent::Open(c_id)).unwrap();

    assert!(c_release < b_close, "C must be released before B closes");
    assert!(c_release < c_internal, "the internal re-open needs C's slot free");
    assert!(c_internal < c_reopen, "C is reacquired only after the syncs");
    // Every internal touch of C happens while we do not hold it.
    assert!(last_position_of(&events, EngineEvent::InternalOpen(c_id)).unwrap() < c_reopen);

    assert!(b.is_open());
    assert!(c.is_open());
    volume.close(&a);
    volume.close(&b);
    volume.close(&c);
    assert_eq!(volume.engine().violations(), 0);
}

#[test]
fn test_move_same_path_is_noop() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"");
    });
    let f = volume.open("/a/f.txt").unwrap();
    volume.engine().take_events();

    volume.rename(&f, "/a/f.txt").unwrap();
    assert!(volume.engine().events().is_empty());
    volume.close(&f);
}

#[test]
fn test_move_refuses_dirty_handle() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"");
    });
    let f = volume.open("/a/f.txt").unwrap();
    volume.write(&f, b"pending").unwrap();

    assert_eq!(
        volume.rename(&f, "/a/g.txt"),
        Err(QuickbeamError::AccessDenied)
    );

    // Flushed, the same move goes through.
    volume.flush(&f).unwrap();
    volume.rename(&f, "/a/g.txt").unwrap();
    assert_eq!(f.path(), "/a/g.txt");
    volume.close(&f);
    assert_eq!(volume.engine().violations(), 0);
}

#[test]
fn test_move_rejects_bad_target_name() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"");
    });
    let f = volume.open("/a/f.txt").unwrap();
    assert_eq!(
        volume.rename(&f, "/a/ba:d"),
        Err(QuickbeamError::InvalidParameter)
    );
    assert!(f.is_open());
    volume.close(&f);
}

#[test]
fn test_move_directory_under_itself_denied() {
    let volume = mounted_volume(|engine| {
        engine.seed_dir("/a/b");
    });
    let a = volume.open("/a").unwrap();
    assert_eq!(
        volume.rename(&a, "/a/b/a"),
        Err(QuickbeamError::AccessDenied)
    );
    assert!(a.is_open());
    volume.close(&a);
}

#[test]
fn test_move_directory_carries_children() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/sub/f.txt", PAYLOAD);
        engine.seed_dir("/b");
    });

    let sub = volume.open("/a/sub").unwrap();
    volume.rename(&sub, "/b/sub").unwrap();
    volume.close(&sub);

    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(read_back(&volume, "/b/sub/f.txt"), PAYLOAD);
    assert_eq!(volume.open("/a/sub"), Err(QuickbeamError::NotFound));
}

/// Open descendants of a moved directory keep working: their registered
/// paths follow the subtree, so later lookups and ancestor brackets stay
/// coherent.
#[test]
fn test_move_directory_rebases_open_descendants() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/sub/f.txt", PAYLOAD);
        engine.seed_dir("/b");
    });

    let sub = volume.open("/a/sub").unwrap();
    let f = volume.open("/a/sub/f.txt").unwrap();

    volume.rename(&sub, "/b/sub").unwrap();
    assert_eq!(f.path(), "/b/sub/f.txt");
    assert!(f.is_open());

    // The child handle is still the registered one at its new path.
    let again = volume.open("/b/sub/f.txt").unwrap();
    assert!(Rc::ptr_eq(&again, &f));
    volume.close(&again);

    // Dirty it and close it: the ancestor bracket must find the relocated
    // parent under its new path.
    volume.write(&f, b"updated").unwrap();
    volume.close(&f);
    assert_eq!(volume.engine().violations(), 0);

    volume.close(&sub);
    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(volume.engine().live_opens(), 0);
}

#[test]
fn test_move_onto_existing_name_fails() {
    let volume = mounted_volume(|engine| {
        engine.seed_file("/a/f.txt", b"one");
        engine.seed_file("/a/g.txt", b"two");
    });
    let f = volume.open("/a/f.txt").unwrap();
    assert_eq!(
        volume.rename(&f, "/a/g.txt"),
        Err(QuickbeamError::AccessDenied)
    );
    // The source is intact and still usable.
    assert!(f.is_open());
    assert_eq!(f.path(), "/a/f.txt");
    volume.close(&f);
    assert_eq!(volume.engine().violations(), 0);
    assert_eq!(read_back(&volume, "/a/g.txt"), b"two");
}
