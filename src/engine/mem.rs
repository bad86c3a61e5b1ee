//! In-memory reference engine.
//!
//! Faithful to the contract in [`super::Engine`], including the parts that
//! make the engine awkward to live above: a single open slot per inode
//! identity, and internal ancestor re-opens during close/sync/remove of
//! dirty nodes. Every open and close — external or internal — is recorded in
//! an event log, and every single-open violation is counted, which is what
//! the integration suites key their assertions on.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::SystemTime;

use fxhash::{FxHashMap, FxHashSet};

use super::{
    Engine, EngineError, EngineResult, FileFlags, InodeId, MountFlags, NodeAttrs, NodeKind,
    NodeTimes, TimeUpdate, VolumeInfo,
};

const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;
const ALLOCATION_BLOCK: u64 = 4096;

const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Live engine inode handle. Owning one of these is owning the open slot for
/// the identity; there is deliberately no `Clone`.
#[derive(Debug)]
pub struct MemHandle {
    id: InodeId,
}

/// One entry in the engine's operation trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Mount,
    Unmount,
    /// An open requested across the contract boundary.
    Open(InodeId),
    /// A close of an externally held handle.
    Close(InodeId),
    /// An ancestor re-open performed inside close/sync/remove.
    InternalOpen(InodeId),
    InternalClose(InodeId),
    /// An open was requested for an identity that already had a live handle.
    Violation(InodeId),
    Create(InodeId),
    Link(InodeId),
    Remove(InodeId),
    Sync(InodeId),
    IndexRefresh(InodeId),
}

struct MemNode {
    kind: NodeKind,
    /// Directory entries, present for directories only.
    children: BTreeMap<String, InodeId>,
    /// Filename records carried by this node: (parent directory, name).
    names: Vec<(InodeId, String)>,
    data: Vec<u8>,
    created: SystemTime,
    accessed: SystemTime,
    modified: SystemTime,
    flags: FileFlags,
    dirty: bool,
}

impl MemNode {
    fn new(kind: NodeKind) -> Self {
        let now = SystemTime::now();
        MemNode {
            kind,
            children: BTreeMap::new(),
            names: Vec::new(),
            data: Vec::new(),
            created: now,
            accessed: now,
            modified: now,
            flags: FileFlags::empty(),
            dirty: false,
        }
    }
}

struct MemState {
    nodes: FxHashMap<InodeId, MemNode>,
    /// The single-open arena: identities with a live handle.
    open: FxHashSet<InodeId>,
    reserved: FxHashSet<InodeId>,
    next_id: u64,
    root: InodeId,
    serial: u64,
    label: String,
    read_only: bool,
    mounted: bool,
    capacity: u64,
    used: u64,
    violations: u32,
    inject_mount_error: Option<EngineError>,
}

pub struct MemEngine {
    state: RefCell<MemState>,
    log: RefCell<Vec<EngineEvent>>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        let root = InodeId(1);
        let mut nodes = FxHashMap::default();
        nodes.insert(root, MemNode::new(NodeKind::Directory));
        MemEngine {
            state: RefCell::new(MemState {
                nodes,
                open: FxHashSet::default(),
                reserved: FxHashSet::default(),
                next_id: 2,
                root,
                serial: 1,
                label: String::new(),
                read_only: false,
                mounted: false,
                capacity,
                used: 0,
                violations: 0,
                inject_mount_error: None,
            }),
            log: RefCell::new(Vec::new()),
        }
    }

    // ---- seeding and instrumentation (bypass the open machinery) ----

    /// Create a directory chain, returning the identity of the last link.
    pub fn seed_dir(&self, path: &str) -> InodeId {
        self.seed(path, NodeKind::Directory, &[])
    }

    /// Create a regular file (and any missing parent directories).
    pub fn seed_file(&self, path: &str, data: &[u8]) -> InodeId {
        self.seed(path, NodeKind::File, data)
    }

    fn seed(&self, path: &str, kind: NodeKind, data: &[u8]) -> InodeId {
        let mut st = self.state.borrow_mut();
        let mut cur = st.root;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        assert!(!components.is_empty(), "cannot seed the root");
        for (i, comp) in components.iter().enumerate() {
            let last = i == components.len() - 1;
            if let Some(&existing) = st.nodes[&cur].children.get(*comp) {
                cur = existing;
                continue;
            }
            let id = InodeId(st.next_id);
            st.next_id += 1;
            let mut node = MemNode::new(if last { kind } else { NodeKind::Directory });
            node.names.push((cur, comp.to_string()));
            if last && kind == NodeKind::File {
                node.data = data.to_vec();
                st.used += data.len() as u64;
            }
            st.nodes.insert(id, node);
            st.nodes
                .get_mut(&cur)
                .unwrap()
                .children
                .insert(comp.to_string(), id);
            cur = id;
        }
        cur
    }

    /// Mark a seeded directory as a protected system container.
    pub fn mark_reserved(&self, id: InodeId) {
        self.state.borrow_mut().reserved.insert(id);
    }

    /// Override the volume serial; a different value on the next mount is a
    /// media change.
    pub fn set_serial(&self, serial: u64) {
        self.state.borrow_mut().serial = serial;
    }

    pub fn set_label(&self, label: &str) {
        self.state.borrow_mut().label = label.to_string();
    }

    /// Force the next mount attempt to fail with `err`.
    pub fn inject_mount_error(&self, err: EngineError) {
        self.state.borrow_mut().inject_mount_error = Some(err);
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.log.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<EngineEvent> {
        self.log.borrow_mut().drain(..).collect()
    }

    /// Count of single-open violations observed so far. The integration
    /// suites assert this stays at zero.
    pub fn violations(&self) -> u32 {
        self.state.borrow().violations
    }

    /// Number of identities with a live handle right now.
    pub fn live_opens(&self) -> usize {
        self.state.borrow().open.len()
    }

    pub fn is_open(&self, id: InodeId) -> bool {
        self.state.borrow().open.contains(&id)
    }

    /// Walk `path` through the directory tree without opening anything.
    /// Test convenience only; the real engine offers no such shortcut.
    pub fn lookup_id(&self, path: &str) -> Option<InodeId> {
        let st = self.state.borrow();
        let mut cur = st.root;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            cur = *st.nodes.get(&cur)?.children.get(comp)?;
        }
        Some(cur)
    }

    // ---- internals ----

    fn push(&self, ev: EngineEvent) {
        self.log.borrow_mut().push(ev);
    }

    /// Claim the open slot for `id`. Returns false (and records a violation)
    /// when the identity is already open.
    fn acquire(&self, id: InodeId) -> bool {
        let mut st = self.state.borrow_mut();
        if !st.open.insert(id) {
            st.violations += 1;
            drop(st);
            self.push(EngineEvent::Violation(id));
            tracing::error!("double open of inode {id}");
            return false;
        }
        true
    }

    fn release(&self, id: InodeId) {
        let removed = self.state.borrow_mut().open.remove(&id);
        debug_assert!(removed, "release of an inode that was not open");
    }

    /// Sync the filename records of a dirty node: re-open the parent
    /// directory of each name, refresh its index, close it again. This is
    /// the internal re-open the upstream choreographies exist to dodge.
    ///
    /// Two exceptions claim no slot: the root, which the engine pins
    /// internally and never re-derives, and `in_hand` — a directory handle
    /// the current engine call was given as an argument and uses directly.
    fn sync_filenames(&self, id: InodeId, in_hand: Option<InodeId>) {
        let (root, parents): (InodeId, Vec<InodeId>) = {
            let st = self.state.borrow();
            let Some(node) = st.nodes.get(&id) else {
                return;
            };
            let mut parents: Vec<InodeId> =
                node.names.iter().map(|(parent, _)| *parent).collect();
            parents.dedup();
            (st.root, parents)
        };
        for parent in parents {
            if Some(parent) == in_hand {
                continue;
            }
            if parent == root {
                self.push(EngineEvent::InternalOpen(parent));
                self.push(EngineEvent::InternalClose(parent));
                continue;
            }
            if !self.acquire(parent) {
                // The slot is externally held: the caller sequenced its
                // ancestors wrong. Recorded above; skip the sync step so the
                // arena stays consistent.
                continue;
            }
            self.push(EngineEvent::InternalOpen(parent));
            self.push(EngineEvent::InternalClose(parent));
            self.release(parent);
        }
        if let Some(node) = self.state.borrow_mut().nodes.get_mut(&id) {
            node.dirty = false;
        }
    }

    /// Close a handle's slot, syncing first when dirty.
    fn close_slot(&self, id: InodeId, in_hand: Option<InodeId>) {
        let dirty = self
            .state
            .borrow()
            .nodes
            .get(&id)
            .map(|n| n.dirty)
            .unwrap_or(false);
        if dirty {
            self.sync_filenames(id, in_hand);
        }
        self.release(id);
    }

    fn charge(&self, st: &mut MemState, growth: u64) -> EngineResult<()> {
        if st.used + growth > st.capacity {
            return Err(EngineError::Full);
        }
        st.used += growth;
        Ok(())
    }
}

impl Engine for MemEngine {
    type Node = MemHandle;

    fn mount(&self, flags: MountFlags) -> EngineResult<VolumeInfo> {
        let mut st = self.state.borrow_mut();
        if let Some(err) = st.inject_mount_error.take() {
            return Err(err);
        }
        st.mounted = true;
        let read_only = st.read_only || flags.contains(MountFlags::READ_ONLY);
        let info = VolumeInfo {
            serial: st.serial,
            label: st.label.clone(),
            read_only,
            root: st.root,
        };
        drop(st);
        self.push(EngineEvent::Mount);
        Ok(info)
    }

    fn unmount(&self) {
        let mut st = self.state.borrow_mut();
        st.mounted = false;
        st.open.clear();
        drop(st);
        self.push(EngineEvent::Unmount);
    }

    fn open_by_id(&self, id: InodeId) -> EngineResult<MemHandle> {
        if !self.state.borrow().nodes.contains_key(&id) {
            return Err(EngineError::NotFound);
        }
        if !self.acquire(id) {
            return Err(EngineError::Busy);
        }
        self.push(EngineEvent::Open(id));
        Ok(MemHandle { id })
    }

    fn resolve_path(&self, base: Option<&MemHandle>, rel: &str) -> EngineResult<MemHandle> {
        let root = self.state.borrow().root;
        if rel.is_empty() {
            return match base {
                // Resolving nothing from the root yields the root.
                None => self.open_by_id(root),
                // Resolving nothing relative to an open node would mean
                // re-opening it.
                Some(node) => {
                    if self.acquire(node.id) {
                        self.release(node.id);
                    }
                    Err(EngineError::Busy)
                }
            };
        }

        // `cur` starts borrowed from the caller (or transiently opened root)
        // and moves down the tree one transient open at a time.
        let mut cur = match base {
            Some(node) => node.id,
            None => {
                if !self.acquire(root) {
                    return Err(EngineError::Busy);
                }
                self.push(EngineEvent::InternalOpen(root));
                root
            }
        };
        let mut cur_transient = base.is_none();

        let release_cur = |engine: &Self, id: InodeId, transient: bool| {
            if transient {
                engine.push(EngineEvent::InternalClose(id));
                engine.release(id);
            }
        };

        let components: Vec<&str> = rel.split('/').collect();
        for (i, comp) in components.iter().enumerate() {
            let last = i == components.len() - 1;
            let lookup = {
                let st = self.state.borrow();
                match st.nodes.get(&cur) {
                    Some(node) if node.kind == NodeKind::Directory => {
                        node.children.get(*comp).copied().ok_or(EngineError::NotFound)
                    }
                    _ => Err(EngineError::NotFound),
                }
            };
            let child = match lookup {
                Ok(child) => child,
                Err(err) => {
                    release_cur(self, cur, cur_transient);
                    return Err(err);
                }
            };
            if !self.acquire(child) {
                release_cur(self, cur, cur_transient);
                return Err(EngineError::Busy);
            }
            self.push(if last {
                EngineEvent::Open(child)
            } else {
                EngineEvent::InternalOpen(child)
            });
            release_cur(self, cur, cur_transient);
            cur = child;
            cur_transient = !last;
        }

        Ok(MemHandle { id: cur })
    }

    fn close(&self, node: MemHandle) {
        self.push(EngineEvent::Close(node.id));
        self.close_slot(node.id, None);
    }

    fn create(&self, dir: &MemHandle, name: &str, kind: NodeKind) -> EngineResult<MemHandle> {
        let id = {
            let mut st = self.state.borrow_mut();
            if st.read_only {
                return Err(EngineError::ReadOnly);
            }
            let parent = st.nodes.get(&dir.id).ok_or(EngineError::NotFound)?;
            if parent.kind != NodeKind::Directory {
                return Err(EngineError::Io);
            }
            if parent.children.contains_key(name) {
                return Err(EngineError::Exists);
            }
            let id = InodeId(st.next_id);
            st.next_id += 1;
            let mut node = MemNode::new(kind);
            node.names.push((dir.id, name.to_string()));
            st.nodes.insert(id, node);
            st.nodes
                .get_mut(&dir.id)
                .unwrap()
                .children
                .insert(name.to_string(), id);
            id
        };
        self.push(EngineEvent::Create(id));
        if !self.acquire(id) {
            return Err(EngineError::Busy);
        }
        self.push(EngineEvent::Open(id));
        Ok(MemHandle { id })
    }

    fn link(&self, node: &MemHandle, dir: &MemHandle, name: &str) -> EngineResult<()> {
        {
            let mut st = self.state.borrow_mut();
            if st.read_only {
                return Err(EngineError::ReadOnly);
            }
            if !st.nodes.contains_key(&node.id) {
                return Err(EngineError::NotFound);
            }
            let parent = st.nodes.get(&dir.id).ok_or(EngineError::NotFound)?;
            if parent.kind != NodeKind::Directory {
                return Err(EngineError::Io);
            }
            if parent.children.contains_key(name) {
                return Err(EngineError::Exists);
            }
            st.nodes
                .get_mut(&dir.id)
                .unwrap()
                .children
                .insert(name.to_string(), node.id);
            let n = st.nodes.get_mut(&node.id).unwrap();
            n.names.push((dir.id, name.to_string()));
            // The new filename record lives on the node.
            n.dirty = true;
        }
        self.push(EngineEvent::Link(node.id));
        Ok(())
    }

    fn remove(&self, node: MemHandle, dir: MemHandle, name: &str) -> EngineResult<()> {
        let status = {
            let mut st = self.state.borrow_mut();
            if st.read_only {
                Err(EngineError::ReadOnly)
            } else if st
                .nodes
                .get(&dir.id)
                .and_then(|d| d.children.get(name))
                .copied()
                != Some(node.id)
            {
                Err(EngineError::NotFound)
            } else if st
                .nodes
                .get(&node.id)
                .map(|n| {
                    // Dropping the last name of a non-empty directory would
                    // orphan its contents; unlinking one of several names
                    // (a rename in flight) is fine.
                    n.kind == NodeKind::Directory && !n.children.is_empty() && n.names.len() <= 1
                })
                .unwrap_or(false)
            {
                Err(EngineError::Io)
            } else {
                st.nodes
                    .get_mut(&dir.id)
                    .unwrap()
                    .children
                    .remove(name);
                let n = st.nodes.get_mut(&node.id).unwrap();
                n.names.retain(|(p, nm)| !(*p == dir.id && nm == name));
                // The index update leaves the directory dirty; its close
                // below is what re-opens the grandparent.
                st.nodes.get_mut(&dir.id).unwrap().dirty = true;
                Ok(())
            }
        };
        self.push(EngineEvent::Remove(node.id));

        // Both handles are consumed by this call, success or not, matching
        // the engine contract. The node's filename sync uses the directory
        // handle in hand instead of re-opening it.
        let node_id = node.id;
        self.push(EngineEvent::Close(node_id));
        self.close_slot(node_id, Some(dir.id));
        if status.is_ok() {
            let mut st = self.state.borrow_mut();
            let orphaned = st
                .nodes
                .get(&node_id)
                .map(|n| n.names.is_empty())
                .unwrap_or(false);
            if orphaned {
                if let Some(n) = st.nodes.remove(&node_id) {
                    st.used = st.used.saturating_sub(n.data.len() as u64);
                }
            }
        }
        self.push(EngineEvent::Close(dir.id));
        self.close_slot(dir.id, None);
        status
    }

    fn sync(&self, node: &MemHandle) -> EngineResult<()> {
        self.push(EngineEvent::Sync(node.id));
        let dirty = self
            .state
            .borrow()
            .nodes
            .get(&node.id)
            .ok_or(EngineError::NotFound)?
            .dirty;
        if dirty {
            self.sync_filenames(node.id, None);
        }
        Ok(())
    }

    fn read(&self, node: &MemHandle, offset: u64, buf: &mut [u8]) -> EngineResult<usize> {
        let st = self.state.borrow();
        let data = &st.nodes.get(&node.id).ok_or(EngineError::NotFound)?.data;
        let start = offset.min(data.len() as u64) as usize;
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write(&self, node: &MemHandle, offset: u64, buf: &[u8]) -> EngineResult<usize> {
        let mut st = self.state.borrow_mut();
        if st.read_only {
            return Err(EngineError::ReadOnly);
        }
        if !st.nodes.contains_key(&node.id) {
            return Err(EngineError::NotFound);
        }
        let end = offset + buf.len() as u64;
        let old_len = st.nodes[&node.id].data.len() as u64;
        if end > old_len {
            self.charge(&mut st, end - old_len)?;
        }
        let data = &mut st.nodes.get_mut(&node.id).unwrap().data;
        if end > data.len() as u64 {
            data.resize(end as usize, 0);
        }
        data[offset as usize..end as usize].copy_from_slice(buf);
        st.nodes.get_mut(&node.id).unwrap().dirty = true;
        Ok(buf.len())
    }

    fn truncate(&self, node: &MemHandle, size: u64) -> EngineResult<()> {
        let mut st = self.state.borrow_mut();
        if st.read_only {
            return Err(EngineError::ReadOnly);
        }
        let old_len = st.nodes.get(&node.id).ok_or(EngineError::NotFound)?.data.len() as u64;
        if size > old_len {
            self.charge(&mut st, size - old_len)?;
        } else {
            st.used = st.used.saturating_sub(old_len - size);
        }
        let n = st.nodes.get_mut(&node.id).unwrap();
        n.data.resize(size as usize, 0);
        n.dirty = true;
        Ok(())
    }

    fn id(&self, node: &MemHandle) -> InodeId {
        node.id
    }

    fn is_dir(&self, node: &MemHandle) -> bool {
        self.state.borrow().nodes[&node.id].kind == NodeKind::Directory
    }

    fn is_dirty(&self, node: &MemHandle) -> bool {
        self.state
            .borrow()
            .nodes
            .get(&node.id)
            .map(|n| n.dirty)
            .unwrap_or(false)
    }

    fn data_size(&self, node: &MemHandle) -> u64 {
        self.state
            .borrow()
            .nodes
            .get(&node.id)
            .map(|n| n.data.len() as u64)
            .unwrap_or(0)
    }

    fn attrs(&self, node: &MemHandle) -> NodeAttrs {
        let st = self.state.borrow();
        let n = &st.nodes[&node.id];
        let size = n.data.len() as u64;
        NodeAttrs {
            kind: n.kind,
            size,
            allocated: size.div_ceil(ALLOCATION_BLOCK) * ALLOCATION_BLOCK,
            created: n.created,
            accessed: n.accessed,
            modified: n.modified,
            flags: n.flags,
        }
    }

    fn set_attrs(&self, node: &MemHandle, times: NodeTimes, flags: FileFlags) {
        let mut st = self.state.borrow_mut();
        let Some(n) = st.nodes.get_mut(&node.id) else {
            return;
        };
        if let Some(created) = times.created {
            n.created = created;
        }
        if let Some(accessed) = times.accessed {
            n.accessed = accessed;
        }
        if let Some(modified) = times.modified {
            n.modified = modified;
        }
        n.flags = flags
            & (FileFlags::READ_ONLY | FileFlags::HIDDEN | FileFlags::SYSTEM | FileFlags::ARCHIVE);
        n.dirty = true;
    }

    fn touch_times(&self, node: &MemHandle, update: TimeUpdate) {
        let mut st = self.state.borrow_mut();
        let Some(n) = st.nodes.get_mut(&node.id) else {
            return;
        };
        let now = SystemTime::now();
        n.accessed = now;
        if update == TimeUpdate::Modified {
            n.modified = now;
        }
        n.dirty = true;
    }

    fn update_name_index(&self, dir: &MemHandle, _name: &str, _id: InodeId) {
        self.push(EngineEvent::IndexRefresh(dir.id));
    }

    fn validate_name(&self, name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 255
            && name != "."
            && name != ".."
            && !name.ends_with([' ', '.'])
            && !name
                .chars()
                .any(|c| c.is_control() || FORBIDDEN_NAME_CHARS.contains(&c))
    }

    fn is_reserved_dir(&self, node: &MemHandle) -> bool {
        self.state.borrow().reserved.contains(&node.id)
    }

    fn free_space(&self) -> u64 {
        let st = self.state.borrow();
        st.capacity.saturating_sub(st.used)
    }

    fn relabel(&self, label: &str) -> EngineResult<()> {
        let mut st = self.state.borrow_mut();
        if st.read_only {
            return Err(EngineError::ReadOnly);
        }
        st.label = label.to_string();
        Ok(())
    }
}
