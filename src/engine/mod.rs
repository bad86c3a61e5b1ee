//! The engine boundary.
//!
//! The engine is the inode-level filesystem library underneath the handle
//! cache. Its defining constraint: it is not reentrant per inode. Asking it
//! to open an inode identity that already has a live handle anywhere in the
//! process is a contract violation, yet some of its own mutating calls
//! internally re-derive and re-open ancestor inodes while maintaining on-disk
//! consistency. The whole crate above this module exists to sequence calls so
//! that those internal re-opens never collide with externally held handles.

pub mod mem;

use std::fmt;
use std::time::SystemTime;

use bitflags::bitflags;

pub use mem::MemEngine;

/// Stable numeric identity of a filesystem entry, as assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(pub u64);

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

bitflags! {
    /// Entry attribute bits, protocol-visible.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        const READ_ONLY = 0x0001;
        const HIDDEN    = 0x0002;
        const SYSTEM    = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE   = 0x0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MountFlags: u32 {
        /// Mount the volume read-only.
        const READ_ONLY     = 0x0001;
        /// Refuse to share the volume with other writers.
        const EXCLUSIVE     = 0x0002;
        /// Fall back to a read-only mount when a writable one is not possible.
        const MAY_READ_ONLY = 0x0004;
    }
}

/// Metadata snapshot of an engine node.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttrs {
    pub kind: NodeKind,
    pub size: u64,
    pub allocated: u64,
    pub created: SystemTime,
    pub accessed: SystemTime,
    pub modified: SystemTime,
    pub flags: FileFlags,
}

/// Partial timestamp update; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeTimes {
    pub created: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

/// Which timestamps an operation refreshes to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUpdate {
    /// Data or directory contents changed: modified + accessed.
    Modified,
    /// Metadata-only touch: accessed.
    Accessed,
}

/// Volume-level facts reported by a successful mount.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Serial identifier of the medium; changes when the medium is swapped.
    pub serial: u64,
    pub label: String,
    pub read_only: bool,
    /// Identity of the root directory, the anchor for path resolution.
    pub root: InodeId,
}

/// Failures reported by the engine, pre-translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no such entry")]
    NotFound,
    #[error("entry already exists")]
    Exists,
    #[error("inode already open")]
    Busy,
    #[error("i/o failure")]
    Io,
    #[error("volume is corrupt")]
    Corrupt,
    #[error("volume is locked")]
    Locked,
    #[error("engine out of memory")]
    OutOfMemory,
    #[error("volume is full")]
    Full,
    #[error("volume is read-only")]
    ReadOnly,
    #[error("name is not valid")]
    InvalidName,
    #[error("no medium present")]
    NoMedia,
    #[error("engine not ready")]
    NotReady,
    #[error("engine timed out")]
    Timeout,
    #[error("operation not supported")]
    Unsupported,
    #[error("engine protocol error")]
    Protocol,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Contract of the underlying filesystem engine.
///
/// `Node` is a live, owned inode handle; holding one *is* holding the
/// single-open slot for that identity. Methods taking `Node` by value
/// (`close`, `remove`) invalidate the handle as part of the call, which is
/// exactly what the real engine does underneath.
pub trait Engine {
    type Node;

    fn mount(&self, flags: MountFlags) -> EngineResult<VolumeInfo>;
    fn unmount(&self);

    /// Open an inode by identity. Fails with [`EngineError::Busy`] if that
    /// identity already has a live handle anywhere in the process.
    fn open_by_id(&self, id: InodeId) -> EngineResult<Self::Node>;

    /// Resolve `rel` (possibly multi-component, `/`-separated, no leading
    /// separator) starting from `base`, or from the volume root when `base`
    /// is `None`. Intermediate inodes are opened and closed transiently
    /// during the walk, so none of them may be held open by the caller.
    fn resolve_path(&self, base: Option<&Self::Node>, rel: &str) -> EngineResult<Self::Node>;

    /// Close a handle. When the node is dirty this syncs it first, which
    /// internally re-opens the node's parent directory to refresh its
    /// filename index — the behavior the ancestor choreographies upstream
    /// are built around.
    fn close(&self, node: Self::Node);

    fn create(&self, dir: &Self::Node, name: &str, kind: NodeKind) -> EngineResult<Self::Node>;

    /// Add a second directory entry for `node` under `dir`. The new filename
    /// record lives on the node, leaving it dirty.
    fn link(&self, node: &Self::Node, dir: &Self::Node, name: &str) -> EngineResult<()>;

    /// Remove `name` from `dir` and drop `node`'s corresponding filename.
    /// Consumes and closes both handles; the directory is left dirty by the
    /// index update, so its internal close re-opens the *grandparent*.
    fn remove(&self, node: Self::Node, dir: Self::Node, name: &str) -> EngineResult<()>;

    /// Sync a dirty node to disk. Internally re-opens the parent directory
    /// of each of the node's names while the node is dirty.
    fn sync(&self, node: &Self::Node) -> EngineResult<()>;

    fn read(&self, node: &Self::Node, offset: u64, buf: &mut [u8]) -> EngineResult<usize>;
    fn write(&self, node: &Self::Node, offset: u64, buf: &[u8]) -> EngineResult<usize>;
    fn truncate(&self, node: &Self::Node, size: u64) -> EngineResult<()>;

    fn id(&self, node: &Self::Node) -> InodeId;
    fn is_dir(&self, node: &Self::Node) -> bool;
    fn is_dirty(&self, node: &Self::Node) -> bool;
    fn data_size(&self, node: &Self::Node) -> u64;
    fn attrs(&self, node: &Self::Node) -> NodeAttrs;
    fn set_attrs(&self, node: &Self::Node, times: NodeTimes, flags: FileFlags);
    fn touch_times(&self, node: &Self::Node, update: TimeUpdate);

    /// Refresh the engine's filename-lookup cache for `name` under `dir`.
    /// A cache write, not an index mutation: does not dirty the directory.
    fn update_name_index(&self, dir: &Self::Node, name: &str, id: InodeId);

    fn validate_name(&self, name: &str) -> bool;

    /// Whether `node` is a protected system container that entries may not
    /// be created in or deleted from.
    fn is_reserved_dir(&self, node: &Self::Node) -> bool;

    fn free_space(&self) -> u64;
    fn relabel(&self, label: &str) -> EngineResult<()>;
}
