use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::engine::Engine;
use crate::path;
use crate::volume::VolumeInner;

/// One client-visible open instance.
///
/// Two concurrent opens of the same path share a single `FileHandle` (and a
/// single engine node), tracked by `refs`. While `node` is populated the
/// handle is registered in exactly one handle-table slot; a `None` node means
/// closed, pending deletion, or awaiting reopen-by-identity during a
/// choreography.
pub struct FileHandle<E: Engine> {
    pub(crate) volume: Weak<VolumeInner<E>>,
    /// Normalized absolute path. Rewritten in place by a successful move.
    pub(crate) path: RefCell<String>,
    pub(crate) is_dir: Cell<bool>,
    pub(crate) is_root: bool,
    /// The owned engine inode handle, when this instance holds the open slot.
    pub(crate) node: RefCell<Option<E::Node>>,
    /// Byte cursor for read/write.
    pub(crate) offset: Cell<u64>,
    /// Client reference count; the handle is destroyed when it reaches zero
    /// and no engine node is held.
    pub(crate) refs: Cell<u32>,
}

impl<E: Engine> FileHandle<E> {
    pub(crate) fn new(volume: Weak<VolumeInner<E>>, path: String) -> Rc<Self> {
        let is_root = path::is_root(&path);
        Rc::new(FileHandle {
            volume,
            path: RefCell::new(path),
            is_dir: Cell::new(is_root),
            is_root,
            node: RefCell::new(None),
            offset: Cell::new(0),
            refs: Cell::new(0),
        })
    }

    pub fn path(&self) -> String {
        self.path.borrow().clone()
    }

    /// Final path component. Empty for the root.
    pub fn base_name(&self) -> String {
        if self.is_root {
            return String::new();
        }
        path::base_of(&self.path.borrow()).to_string()
    }

    /// Parent portion of the path; empty means "direct child of the root",
    /// which is how the table is probed for an open root entry.
    pub fn parent_path(&self) -> String {
        debug_assert!(!self.is_root);
        path::parent_of(&self.path.borrow()).to_string()
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir.get()
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn position(&self) -> u64 {
        self.offset.get()
    }

    /// Whether this instance currently holds the engine open slot.
    pub fn is_open(&self) -> bool {
        self.node.borrow().is_some()
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.get()
    }

    pub(crate) fn retain(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    /// Drop one client reference; returns the remaining count.
    pub(crate) fn release(&self) -> u32 {
        let refs = self.refs.get().saturating_sub(1);
        self.refs.set(refs);
        refs
    }

    pub(crate) fn take_node(&self) -> Option<E::Node> {
        self.node.borrow_mut().take()
    }

    pub(crate) fn put_node(&self, node: E::Node) {
        let prev = self.node.borrow_mut().replace(node);
        debug_assert!(prev.is_none(), "clobbered a live engine node");
    }
}

impl<E: Engine> PartialEq for FileHandle<E> {
    fn eq(&self, other: &Self) -> bool {
        self.is_root == other.is_root
            && self.is_dir.get() == other.is_dir.get()
            && *self.path.borrow() == *other.path.borrow()
            && self.offset.get() == other.offset.get()
            && self.refs.get() == other.refs.get()
    }
}

impl<E: Engine> fmt::Debug for FileHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &*self.path.borrow())
            .field("is_dir", &self.is_dir.get())
            .field("open", &self.is_open())
            .field("refs", &self.refs.get())
            .finish()
    }
}
