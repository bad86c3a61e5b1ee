mod common;

use quickbeam::{
    EngineError, MemEngine, MountFlags, NodeKind, QuickbeamError, Volume,
};

fn fresh_volume() -> Volume<MemEngine> {
    let engine = MemEngine::new();
    engine.seed_file("/a/f.txt", b"data");
    engine.set_label("SCRATCH");
    Volume::new(engine)
}

/// Mounting is refcounted: only the first mount touches the engine, only
/// the last unmount releases it.
#[test]
fn test_mount_refcounting() {
    let volume = fresh_volume();

    volume.mount(MountFlags::empty()).unwrap();
    volume.mount(MountFlags::empty()).unwrap();
    assert_eq!(volume.mount_count(), 2);

    let mounts = volume
        .engine()
        .events()
        .iter()
        .filter(|event| **event == quickbeam::EngineEvent::Mount)
        .count();
    assert_eq!(mounts, 1);

    volume.unmount();
    assert!(volume.is_mounted());
    let f = volume.open("/a/f.txt").unwrap();
    volume.close(&f);

    volume.unmount();
    assert!(!volume.is_mounted());
    assert_eq!(volume.open("/a/f.txt"), Err(QuickbeamError::NotReady));
}

#[test]
fn test_unmount_clears_handle_table() {
    let volume = fresh_volume();
    volume.mount(MountFlags::empty()).unwrap();

    let f = volume.open("/a/f.txt").unwrap();
    volume.unmount();

    // The entry is gone; the client's handle is an inert shell.
    assert!(!f.is_open());
}

/// A serial change across remount is a media change, and the fresh engine
/// mount is released again.
#[test]
fn test_media_change_detection() {
    let volume = fresh_volume();
    volume.mount(MountFlags::empty()).unwrap();
    volume.unmount();

    volume.engine().set_serial(2);
    assert_eq!(
        volume.mount(MountFlags::empty()),
        Err(QuickbeamError::MediaChanged)
    );
    assert!(!volume.is_mounted());
    assert_eq!(
        volume.engine().events().last(),
        Some(&quickbeam::EngineEvent::Unmount)
    );
}

/// A mount failure after a serial has been seen means the medium vanished.
#[test]
fn test_mount_failure_after_serial_is_no_media() {
    let volume = fresh_volume();
    volume.mount(MountFlags::empty()).unwrap();
    volume.unmount();

    volume.engine().inject_mount_error(EngineError::Corrupt);
    assert_eq!(
        volume.mount(MountFlags::empty()),
        Err(QuickbeamError::NoMedia)
    );
}

#[test]
fn test_first_mount_failure_mapping() {
    for (engine_err, expected) in [
        (EngineError::Corrupt, QuickbeamError::VolumeCorrupted),
        (EngineError::Locked, QuickbeamError::AccessDenied),
        (EngineError::OutOfMemory, QuickbeamError::OutOfResources),
        (EngineError::Io, QuickbeamError::NotFound),
    ] {
        let volume = fresh_volume();
        volume.engine().inject_mount_error(engine_err);
        assert_eq!(volume.mount(MountFlags::empty()), Err(expected));
        assert!(!volume.is_mounted());

        // The failed attempt holds no reference; a retry works.
        volume.mount(MountFlags::empty()).unwrap();
        assert_eq!(volume.mount_count(), 1);
    }
}

#[test]
fn test_label_round_trip() {
    let volume = fresh_volume();
    volume.mount(MountFlags::empty()).unwrap();
    assert_eq!(volume.label(), "SCRATCH");

    volume.relabel("ARCHIVE-2").unwrap();
    assert_eq!(volume.label(), "ARCHIVE-2");
}

#[test]
fn test_relabel_read_only_volume() {
    let volume = fresh_volume();
    volume.mount(MountFlags::READ_ONLY).unwrap();
    assert!(volume.is_read_only());
    assert_eq!(
        volume.relabel("NOPE"),
        Err(QuickbeamError::WriteProtected)
    );
    assert_eq!(volume.label(), "SCRATCH");
}

#[test]
fn test_read_only_volume_blocks_mutation() {
    let volume = fresh_volume();
    volume.mount(MountFlags::READ_ONLY).unwrap();

    let f = volume.open("/a/f.txt").unwrap();
    assert_eq!(volume.write(&f, b"x"), Err(QuickbeamError::WriteProtected));
    assert_eq!(volume.delete(&f), Err(QuickbeamError::WriteProtected));
    assert_eq!(
        volume.rename(&f, "/a/g.txt"),
        Err(QuickbeamError::WriteProtected)
    );
    assert_eq!(
        volume.create("/a/new.txt", NodeKind::File),
        Err(QuickbeamError::WriteProtected)
    );

    // Reads pass through, and do not touch timestamps on a read-only mount.
    let mut buf = [0u8; 8];
    let read = volume.read(&f, &mut buf).unwrap();
    assert_eq!(&buf[..read], b"data");

    // The read-only flag is reported on every entry.
    let info = volume.attrs_of(&f).unwrap();
    assert!(info.flags.contains(quickbeam::FileFlags::READ_ONLY));

    volume.close(&f);
    assert_eq!(volume.engine().violations(), 0);
}

#[test]
fn test_free_space_shrinks_with_writes() {
    let volume = fresh_volume();
    volume.mount(MountFlags::empty()).unwrap();

    let before = volume.free_space();
    let f = volume.open("/a/f.txt").unwrap();
    volume.set_position(&f, u64::MAX).unwrap();
    volume.write(&f, &[7u8; 1000]).unwrap();
    assert_eq!(volume.free_space(), before - 1000);
    volume.close(&f);
}
