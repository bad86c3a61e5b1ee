use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::SystemTime;

use crate::engine::{Engine, EngineError, FileFlags, InodeId, MountFlags, NodeAttrs};
use crate::error::{QuickbeamError, Result};
use crate::handle::FileHandle;
use crate::table::HandleTable;

/// Protocol-visible metadata snapshot of an entry.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub size: u64,
    pub physical_size: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub flags: FileFlags,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.flags.contains(FileFlags::DIRECTORY)
    }
}

/// Attribute update request.
///
/// `None` time fields are left untouched. `flags` always replaces the four
/// attribute bits, and its DIRECTORY bit must match the entry's actual kind;
/// a mismatch is a type change, which the protocol denies. A `path` naming a
/// different location routes the update through the move choreography first.
#[derive(Debug, Clone, Default)]
pub struct SetAttrs {
    pub path: Option<String>,
    pub size: Option<u64>,
    pub created: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub modified: Option<SystemTime>,
    pub flags: FileFlags,
}

pub(crate) struct VolumeInner<E: Engine> {
    pub(crate) engine: E,
    pub(crate) table: HandleTable<E>,
    pub(crate) mounts: Cell<u32>,
    /// Serial of the last successfully mounted medium; zero means "never
    /// mounted", nonzero survives unmount so a swap is detectable.
    pub(crate) serial: Cell<u64>,
    pub(crate) read_only: Cell<bool>,
    pub(crate) label: RefCell<String>,
    pub(crate) root: Cell<InodeId>,
}

/// One mounted filesystem and its handle cache.
///
/// All protocol entry points live on this type; the resolver, lifecycle,
/// choreography and I/O `impl` blocks are split across their own modules.
pub struct Volume<E: Engine> {
    pub(crate) inner: Rc<VolumeInner<E>>,
}

impl<E: Engine> Clone for Volume<E> {
    fn clone(&self) -> Self {
        Volume {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<E: Engine> Volume<E> {
    pub fn new(engine: E) -> Self {
        Volume {
            inner: Rc::new(VolumeInner {
                engine,
                table: HandleTable::new(),
                mounts: Cell::new(0),
                serial: Cell::new(0),
                read_only: Cell::new(false),
                label: RefCell::new(String::new()),
                root: Cell::new(InodeId(0)),
            }),
        }
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Mount the volume. Idempotent via reference counting: requests beyond
    /// the first only increment the count.
    pub fn mount(&self, flags: MountFlags) -> Result<()> {
        let inner = &self.inner;
        if inner.mounts.get() > 0 {
            inner.mounts.set(inner.mounts.get() + 1);
            return Ok(());
        }

        let mut flags = flags;
        if cfg!(feature = "readonly") {
            flags |= MountFlags::READ_ONLY;
        }

        let info = match inner.engine.mount(flags) {
            Ok(info) => info,
            Err(err) => {
                // A failure after we have seen a serial means the medium
                // went away.
                if inner.serial.get() != 0 {
                    return Err(QuickbeamError::NoMedia);
                }
                return Err(match err {
                    EngineError::Corrupt => QuickbeamError::VolumeCorrupted,
                    EngineError::Locked => QuickbeamError::AccessDenied,
                    EngineError::OutOfMemory => QuickbeamError::OutOfResources,
                    _ => QuickbeamError::NotFound,
                });
            }
        };

        if inner.serial.get() != 0 && info.serial != inner.serial.get() {
            inner.engine.unmount();
            return Err(QuickbeamError::MediaChanged);
        }

        inner.serial.set(info.serial);
        inner.read_only.set(info.read_only);
        inner.root.set(info.root);
        *inner.label.borrow_mut() = info.label;
        inner.mounts.set(1);
        tracing::info!("mounted volume '{}'", inner.label.borrow());
        Ok(())
    }

    /// Drop one mount reference; the last one releases the engine volume and
    /// clears the handle table.
    pub fn unmount(&self) {
        let inner = &self.inner;
        match inner.mounts.get() {
            0 => {}
            1 => {
                // Surviving client handles become inert shells; the engine
                // unmount invalidates every node they were holding.
                for handle in inner.table.drain() {
                    drop(handle.take_node());
                }
                inner.engine.unmount();
                inner.mounts.set(0);
                tracing::info!("unmounted volume '{}'", inner.label.borrow());
            }
            n => inner.mounts.set(n - 1),
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.mounts.get() > 0
    }

    pub fn mount_count(&self) -> u32 {
        self.inner.mounts.get()
    }

    pub fn is_read_only(&self) -> bool {
        cfg!(feature = "readonly") || self.inner.read_only.get()
    }

    pub fn label(&self) -> String {
        self.inner.label.borrow().clone()
    }

    /// Free space is re-queried from the engine on every call; the engine
    /// does not push updates.
    pub fn free_space(&self) -> u64 {
        self.inner.engine.free_space()
    }

    /// Change the volume label.
    pub fn relabel(&self, label: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }
        self.inner.engine.relabel(label)?;
        *self.inner.label.borrow_mut() = label.to_string();
        Ok(())
    }

    /// Metadata of an open handle.
    pub fn attrs_of(&self, handle: &Rc<FileHandle<E>>) -> Result<FileInfo> {
        let node = handle.node.borrow();
        let node = node.as_ref().ok_or(QuickbeamError::NotFound)?;
        Ok(self.file_info(self.inner.engine.attrs(node), handle.is_dir()))
    }

    /// Metadata by bare inode identity, as handed out by directory
    /// enumeration. An already-open handle is reused through the reverse
    /// lookup; otherwise the inode is opened transiently and closed again.
    pub fn attrs_by_id(&self, id: InodeId, is_dir: bool) -> Result<FileInfo> {
        let engine = &self.inner.engine;
        if let Some(existing) = self.inner.table.find_by_inode(engine, id) {
            let node = existing.node.borrow();
            let node = node.as_ref().ok_or(QuickbeamError::NotFound)?;
            return Ok(self.file_info(engine.attrs(node), is_dir));
        }
        let node = engine.open_by_id(id)?;
        let attrs = engine.attrs(&node);
        engine.close(node);
        Ok(self.file_info(attrs, is_dir))
    }

    fn file_info(&self, attrs: NodeAttrs, is_dir: bool) -> FileInfo {
        let mut flags = attrs.flags;
        if is_dir {
            flags |= FileFlags::DIRECTORY;
        }
        if self.is_read_only() {
            flags |= FileFlags::READ_ONLY;
        }
        FileInfo {
            size: attrs.size,
            physical_size: attrs.allocated,
            created: attrs.created,
            accessed: attrs.accessed,
            modified: attrs.modified,
            flags,
        }
    }
}
