//! Mutating choreographies: create, delete, move, flush, set_attrs.
//!
//! Every one of them is, structurally, the same dance: close conflicting
//! ancestors in dependency order, perform the one engine call that needs
//! exclusivity, reopen what was closed by remembered identity, repair the
//! handle table. The ordering rule throughout: an ancestor's engine node
//! must be free before any step that internally re-opens it from a
//! descendant — closing a dirty descendant syncs it, and the sync re-opens
//! its direct parent.

use std::rc::Rc;

use crate::engine::{
    Engine, EngineError, FileFlags, InodeId, NodeKind, NodeTimes, TimeUpdate,
};
use crate::error::{QuickbeamError, Result};
use crate::handle::FileHandle;
use crate::path;
use crate::volume::{SetAttrs, Volume};

impl<E: Engine> Volume<E> {
    /// Create a file or directory, or share an already-open instance of the
    /// same kind.
    pub fn create(&self, raw_path: &str, kind: NodeKind) -> Result<Rc<FileHandle<E>>> {
        if cfg!(feature = "readonly") {
            return Err(QuickbeamError::WriteProtected);
        }
        self.ensure_mounted()?;
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }
        let vpath = path::normalize(raw_path)?;
        if path::is_root(&vpath) {
            return Err(QuickbeamError::AccessDenied);
        }
        let want_dir = kind == NodeKind::Directory;

        // Dedup as in open, but entries must be of the same kind.
        if let Some(existing) = self.inner.table.find_by_path(&vpath, None) {
            if existing.is_dir() != want_dir {
                return Err(QuickbeamError::AccessDenied);
            }
            existing.retain();
            return Ok(existing);
        }

        let engine = &self.inner.engine;
        let base = path::base_of(&vpath).to_string();
        if !engine.validate_name(&base) {
            return Err(QuickbeamError::InvalidParameter);
        }

        // Reuse an open parent; otherwise open it transiently for this call.
        let parent_path = path::parent_of(&vpath).to_string();
        let parent = self
            .inner
            .table
            .find_by_path(&parent_path, None)
            .filter(|p| p.is_open());
        let transient = match &parent {
            Some(_) => None,
            None => Some(self.open_node_at(&parent_path)?),
        };
        let parent_guard = parent.as_ref().map(|p| p.node.borrow());
        let dir: &E::Node = match (&parent_guard, &transient) {
            (Some(guard), _) => guard.as_ref().expect("filtered on is_open"),
            (None, Some(node)) => node,
            (None, None) => unreachable!("parent is open or transient"),
        };

        let outcome = self.create_in_dir(dir, &base, kind);

        drop(parent_guard);
        if let Some(node) = transient {
            engine.close(node);
        }

        let node = outcome?;
        let handle = FileHandle::new(Rc::downgrade(&self.inner), vpath);
        handle.is_dir.set(want_dir);
        handle.put_node(node);
        handle.retain();
        self.inner.table.insert(Rc::clone(&handle));
        tracing::debug!("created {} ({:?})", handle.path(), kind);
        Ok(handle)
    }

    /// Adopt an existing entry of the right kind or create a fresh one, then
    /// refresh the parent's name-lookup cache and the entry's timestamps.
    fn create_in_dir(&self, dir: &E::Node, base: &str, kind: NodeKind) -> Result<E::Node> {
        let engine = &self.inner.engine;
        if engine.is_reserved_dir(dir) {
            return Err(QuickbeamError::AccessDenied);
        }
        let node = match engine.resolve_path(Some(dir), base) {
            Ok(existing) => {
                if engine.is_dir(&existing) != (kind == NodeKind::Directory) {
                    engine.close(existing);
                    return Err(QuickbeamError::AccessDenied);
                }
                existing
            }
            Err(EngineError::NotFound) => {
                let node = engine.create(dir, base, kind)?;
                // Regular files carry the archive bit from birth.
                if kind == NodeKind::File {
                    engine.set_attrs(&node, NodeTimes::default(), FileFlags::ARCHIVE);
                }
                node
            }
            Err(err) => return Err(err.into()),
        };
        engine.update_name_index(dir, base, engine.id(&node));
        engine.touch_times(&node, TimeUpdate::Modified);
        Ok(node)
    }

    /// Delete the entry behind `handle`. The handle is unregistered and
    /// inert afterwards, success or not.
    ///
    /// The engine delete closes the parent directory as a side effect, and
    /// that close syncs the now-dirty parent — re-opening the *grandparent*
    /// inode, one level beyond the close bracket. An open grandparent handle
    /// therefore steps aside first, in both the open-parent and the
    /// transient-parent branch. The root is exempt: the engine pins the root
    /// inode internally and never re-derives it.
    pub fn delete(&self, handle: &Rc<FileHandle<E>>) -> Result<()> {
        if cfg!(feature = "readonly") {
            return Err(QuickbeamError::WriteProtected);
        }
        self.ensure_mounted()?;
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }
        if handle.is_root() {
            return Err(QuickbeamError::AccessDenied);
        }

        let engine = &self.inner.engine;
        let node = handle.take_node().ok_or(QuickbeamError::NotFound)?;
        let base = handle.base_name();
        let parent_path = handle.parent_path();

        let mut parent_entry: Option<(Rc<FileHandle<E>>, InodeId)> = None;
        let mut grandparent: Option<(Rc<FileHandle<E>>, InodeId)> = None;

        let dir_node = match self.open_parent_of(handle) {
            Some(parent) => {
                let dir_node = parent
                    .take_node()
                    .expect("open_parent_of returns live handles");
                // Deny before any ancestor is disturbed.
                if engine.is_reserved_dir(&dir_node) {
                    parent.put_node(dir_node);
                    handle.put_node(node);
                    return Err(QuickbeamError::AccessDenied);
                }
                parent_entry = Some((Rc::clone(&parent), engine.id(&dir_node)));
                if let Some(gp) = self.open_parent_of(&parent).filter(|gp| !gp.is_root()) {
                    let gp_node = gp.take_node().expect("open_parent_of returns live handles");
                    let gp_id = engine.id(&gp_node);
                    self.release_node(gp_node, &gp.path());
                    grandparent = Some((gp, gp_id));
                }
                dir_node
            }
            None => {
                let dir_node = match self.open_node_at(&parent_path) {
                    Ok(dir_node) => dir_node,
                    Err(err) => {
                        handle.put_node(node);
                        return Err(err);
                    }
                };
                if engine.is_reserved_dir(&dir_node) {
                    engine.close(dir_node);
                    handle.put_node(node);
                    return Err(QuickbeamError::AccessDenied);
                }
                // The transiently opened parent is closed inside the engine
                // delete too, so its grandparent needs the same bracket.
                if !parent_path.is_empty() {
                    let gp = self
                        .inner
                        .table
                        .find_by_path(path::parent_of(&parent_path), None)
                        .filter(|gp| gp.is_open() && !gp.is_root());
                    if let Some(gp) = gp {
                        let gp_node = gp.take_node().expect("filtered on is_open");
                        let gp_id = engine.id(&gp_node);
                        self.release_node(gp_node, &gp.path());
                        grandparent = Some((gp, gp_id));
                    }
                }
                dir_node
            }
        };

        let removed = engine.remove(node, dir_node, &base);
        self.inner.table.remove(handle);
        handle.refs.set(0);

        let mut status = removed.map_err(|err| {
            tracing::error!("delete of '{}' failed: {}", handle.path(), err);
            QuickbeamError::DeviceError
        });

        // Reopen released ancestors by remembered identity. A failure here
        // does not undo the delete, but it is reported.
        if let Some((parent, parent_id)) = parent_entry {
            if let Err(err) = self.reopen_into(&parent, parent_id) {
                status = status.and(Err(err));
            }
        }
        if let Some((gp, gp_id)) = grandparent {
            if let Err(err) = self.reopen_into(&gp, gp_id) {
                status = status.and(Err(err));
            }
        }
        status
    }

    /// Move/rename the entry behind `handle` to `new_raw`.
    pub fn rename(&self, handle: &Rc<FileHandle<E>>, new_raw: &str) -> Result<()> {
        if cfg!(feature = "readonly") {
            return Err(QuickbeamError::WriteProtected);
        }
        self.ensure_mounted()?;
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }
        if handle.is_root() {
            return Err(QuickbeamError::AccessDenied);
        }

        let engine = &self.inner.engine;
        let new_path = path::normalize(new_raw)?;
        if path::is_root(&new_path) {
            return Err(QuickbeamError::AccessDenied);
        }

        let old_path = handle.path();
        if new_path == old_path {
            return Ok(());
        }
        // A directory cannot be moved beneath itself.
        if handle.is_dir() && new_path.starts_with(&format!("{}/", old_path)) {
            return Err(QuickbeamError::AccessDenied);
        }

        {
            let guard = handle.node.borrow();
            let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;
            // A dirty entry must be flushed before it can be moved.
            if engine.is_dirty(node) {
                return Err(QuickbeamError::AccessDenied);
            }
        }

        let new_base = path::base_of(&new_path).to_string();
        if !engine.validate_name(&new_base) {
            return Err(QuickbeamError::InvalidParameter);
        }
        let new_parent_path = path::parent_of(&new_path).to_string();
        let old_base = handle.base_name();
        let old_parent_path = handle.parent_path();
        let same_dir = new_parent_path == old_parent_path;

        // Old parent: open handle or transient node.
        let parent = self.open_parent_of(handle);
        let parent_ref = parent.as_ref();
        let mut parent_node = match &parent {
            Some(p) => p.take_node().expect("open_parent_of returns live handles"),
            None => self.open_node_at(&old_parent_path)?,
        };
        let parent_id = engine.id(&parent_node);

        // New parent, when the directory changes.
        let mut new_parent: Option<Rc<FileHandle<E>>> = None;
        let mut new_parent_node: Option<E::Node> = None;
        let mut new_parent_id = InodeId(0);
        let mut parent_is_child_of_new_parent = false;
        if !same_dir {
            let found = self
                .inner
                .table
                .find_by_path(&new_parent_path, Some(handle))
                .filter(|h| h.is_open());
            match found {
                Some(np) => {
                    new_parent_node = Some(np.take_node().expect("filtered on is_open"));
                    new_parent = Some(np);
                }
                None => {
                    // The old parent's node may sit on the path to the new
                    // parent; release its slot while probing for the new
                    // parent's identity, then take it back.
                    self.release_node(parent_node, &old_parent_path);
                    let probed = self.open_node_at(&new_parent_path);
                    parent_node = match engine.open_by_id(parent_id) {
                        Ok(node) => node,
                        Err(err) => {
                            tracing::error!(
                                "move: failed to reacquire old parent {}: {}",
                                parent_id,
                                err
                            );
                            if let Ok(node) = probed {
                                engine.close(node);
                            }
                            if let Some(p) = parent_ref {
                                self.inner.table.remove(p);
                            }
                            return Err(err.into());
                        }
                    };
                    match probed {
                        Ok(node) => new_parent_node = Some(node),
                        Err(err) => {
                            self.settle_ancestor(parent_ref, Some(parent_node), &old_parent_path);
                            return Err(err);
                        }
                    }
                }
            }
            new_parent_id = engine.id(new_parent_node.as_ref().expect("just set"));
            // Decides the release order below: if the old parent is a direct
            // child of the new parent, the new parent is the ancestor and its
            // slot must come free first.
            parent_is_child_of_new_parent = !old_parent_path.is_empty()
                && path::is_direct_parent(&new_parent_path, &old_parent_path);
        }

        // Link the inode under its new name.
        {
            let guard = handle.node.borrow();
            let node = guard.as_ref().expect("checked above");
            let dir = if same_dir {
                &parent_node
            } else {
                new_parent_node.as_ref().expect("set when !same_dir")
            };
            if let Err(err) = engine.link(node, dir, &new_base) {
                drop(guard);
                self.settle_pair(
                    parent_ref,
                    Some(parent_node),
                    &old_parent_path,
                    new_parent.as_ref(),
                    new_parent_node,
                    &new_parent_path,
                    parent_is_child_of_new_parent,
                );
                return Err(err.into());
            }
        }

        // Adopt the new path; from here the handle describes the target.
        *handle.path.borrow_mut() = new_path.clone();

        // The new parent's slot must be free before the delete below walks
        // the parent chain.
        if let Some(node) = new_parent_node.take() {
            self.release_node(node, &new_parent_path);
        }

        // The delete also closes the (now dirty) old parent internally,
        // re-opening *its* parent — the same grandparent exposure delete has.
        // An open old-grandparent handle steps aside; if it is the new
        // parent, its slot is already free.
        let mut old_grandparent: Option<(Rc<FileHandle<E>>, InodeId)> = None;
        if !old_parent_path.is_empty() {
            let gp = self
                .inner
                .table
                .find_by_path(path::parent_of(&old_parent_path), Some(handle))
                .filter(|gp| gp.is_open() && !gp.is_root());
            if let Some(gp) = gp {
                let gp_node = gp.take_node().expect("filtered on is_open");
                let gp_id = engine.id(&gp_node);
                self.release_node(gp_node, &gp.path());
                old_grandparent = Some((gp, gp_id));
            }
        }

        // Drop the old name. Consumes the moved node and the old parent's.
        let node = handle.take_node().expect("checked above");
        let mut status: Result<()> = engine
            .remove(node, parent_node, &old_base)
            .map_err(|err| {
                tracing::error!("move: removing old name '{}' failed: {}", old_base, err);
                err.into()
            });

        // Reacquire the released ancestors by remembered identity.
        let mut parent_node = None;
        match engine.open_by_id(parent_id) {
            Ok(node) => parent_node = Some(node),
            Err(err) => {
                tracing::error!("move: failed to reopen old parent {}: {}", parent_id, err);
                if let Some(p) = parent_ref {
                    self.inner.table.remove(p);
                }
                status = status.and(Err(err.into()));
            }
        }
        let mut np_node = None;
        if !same_dir {
            match engine.open_by_id(new_parent_id) {
                Ok(node) => np_node = Some(node),
                Err(err) => {
                    tracing::error!("move: failed to reopen new parent {}: {}", new_parent_id, err);
                    if let Some(np) = new_parent.as_ref() {
                        self.inner.table.remove(np);
                    }
                    status = status.and(Err(err.into()));
                }
            }
        }

        // Re-resolve the moved inode at its new location and refresh the
        // target directory's lookup cache and timestamps.
        if status.is_ok() {
            let dir = if same_dir {
                parent_node.as_ref()
            } else {
                np_node.as_ref()
            };
            if let Some(dir) = dir {
                match engine.resolve_path(Some(dir), &new_base) {
                    Ok(node) => {
                        engine.update_name_index(dir, &new_base, engine.id(&node));
                        engine.touch_times(&node, TimeUpdate::Accessed);
                        handle.put_node(node);
                        if let Some(np) = np_node.as_ref() {
                            engine.touch_times(np, TimeUpdate::Modified);
                        }
                        if let Some(p) = parent_node.as_ref() {
                            engine.touch_times(p, TimeUpdate::Modified);
                        }
                    }
                    Err(err) => {
                        tracing::error!("move: lost track of '{}': {}", new_path, err);
                        status = Err(err.into());
                    }
                }
            }
        }

        // Release or restore the ancestors, ancestor side first. The
        // grandparent is reacquired only after any transient descendant of
        // it has finished closing.
        self.settle_pair(
            parent_ref,
            parent_node,
            &old_parent_path,
            new_parent.as_ref(),
            np_node,
            &new_parent_path,
            parent_is_child_of_new_parent,
        );
        if let Some((gp, gp_id)) = old_grandparent {
            if let Err(err) = self.reopen_into(&gp, gp_id) {
                status = status.and(Err(err));
            }
        }

        if status.is_ok() {
            // Open descendants of a moved directory keep their handles; their
            // registered paths follow the subtree to its new location.
            if handle.is_dir() {
                self.inner.table.rebase_descendants(&old_path, &new_path);
            }
            tracing::debug!("moved '{}' to '{}'", old_path, new_path);
        }
        status
    }

    /// Flush pending changes of `handle` to the medium.
    pub fn flush(&self, handle: &Rc<FileHandle<E>>) -> Result<()> {
        if cfg!(feature = "readonly") {
            // Nothing can be dirty in a write-protected build.
            return Ok(());
        }
        self.ensure_mounted()?;

        let engine = &self.inner.engine;
        {
            let guard = handle.node.borrow();
            let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;
            if !engine.is_dirty(node) {
                return Ok(());
            }
        }

        // Same bracket as close: the sync re-opens the parent inode, so an
        // open parent steps aside for the duration.
        let mut parked: Option<(Rc<FileHandle<E>>, InodeId)> = None;
        if let Some(parent) = self.open_parent_of(handle) {
            let parent_node = parent
                .take_node()
                .expect("open_parent_of returns live handles");
            let parent_id = engine.id(&parent_node);
            self.release_node(parent_node, &parent.path());
            parked = Some((parent, parent_id));
        }

        let result = {
            let guard = handle.node.borrow();
            engine.sync(guard.as_ref().expect("checked above")).map_err(|err| {
                tracing::error!("flush of '{}' failed: {}", handle.path(), err);
                QuickbeamError::from(err)
            })
        };

        if let Some((parent, parent_id)) = parked {
            // The flush itself is decided above; a failed parent reopen is
            // logged and absorbed, and the stale entry evicted.
            let _ = self.reopen_into(&parent, parent_id);
        }
        result
    }

    /// Apply an attribute update to `handle`.
    ///
    /// A `path` naming a different location is routed through the move
    /// choreography first; size, time and flag changes are then applied to
    /// the (possibly relocated) node. `read_only_open` enforces the protocol
    /// rule that a read-only open may change attribute flags but nothing
    /// else — except no-op writes matching current metadata.
    pub fn set_attrs(
        &self,
        handle: &Rc<FileHandle<E>>,
        attrs: SetAttrs,
        read_only_open: bool,
    ) -> Result<()> {
        if cfg!(feature = "readonly") {
            return Err(QuickbeamError::WriteProtected);
        }
        self.ensure_mounted()?;
        if self.is_read_only() {
            return Err(QuickbeamError::WriteProtected);
        }

        // Changing the entry type is denied outright.
        let is_dir = handle.is_dir();
        if attrs.flags.contains(FileFlags::DIRECTORY) != is_dir {
            return Err(QuickbeamError::AccessDenied);
        }

        if read_only_open
            && (attrs.created.is_some() || attrs.accessed.is_some() || attrs.modified.is_some())
        {
            return Err(QuickbeamError::AccessDenied);
        }

        if let Some(raw) = &attrs.path {
            let target = path::normalize(raw)?;
            if target != handle.path() {
                if read_only_open {
                    return Err(QuickbeamError::AccessDenied);
                }
                self.rename(handle, &target)?;
            }
        }

        let engine = &self.inner.engine;
        let guard = handle.node.borrow();
        let node = guard.as_ref().ok_or(QuickbeamError::NotFound)?;

        if !is_dir {
            if let Some(size) = attrs.size {
                if size != engine.data_size(node) {
                    if read_only_open {
                        return Err(QuickbeamError::AccessDenied);
                    }
                    engine.truncate(node, size)?;
                }
            }
        }

        engine.set_attrs(
            node,
            NodeTimes {
                created: attrs.created,
                accessed: attrs.accessed,
                modified: attrs.modified,
            },
            attrs.flags,
        );
        // No sync here: attribute changes apply on close.
        Ok(())
    }

    /// Hand an ancestor's node back to its handle, or release it when the
    /// ancestor was only opened transiently. A `None` node means a reopen
    /// already failed and evicted the entry; nothing to do.
    fn settle_ancestor(
        &self,
        entry: Option<&Rc<FileHandle<E>>>,
        node: Option<E::Node>,
        dir_path: &str,
    ) {
        match (entry, node) {
            (Some(entry), Some(node)) => entry.put_node(node),
            (None, Some(node)) => self.release_node(node, dir_path),
            _ => {}
        }
    }

    /// Settle both move ancestors. `new_parent_first` is the
    /// ParentIsChildOfNewParent ordering: when the old parent is a direct
    /// child of the new parent, the new parent (the ancestor) must come
    /// first — closing the dirty old parent re-opens it internally.
    #[allow(clippy::too_many_arguments)]
    fn settle_pair(
        &self,
        parent: Option<&Rc<FileHandle<E>>>,
        parent_node: Option<E::Node>,
        parent_path: &str,
        new_parent: Option<&Rc<FileHandle<E>>>,
        new_parent_node: Option<E::Node>,
        new_parent_path: &str,
        new_parent_first: bool,
    ) {
        if new_parent_first {
            self.settle_ancestor(new_parent, new_parent_node, new_parent_path);
            self.settle_ancestor(parent, parent_node, parent_path);
        } else {
            self.settle_ancestor(parent, parent_node, parent_path);
            self.settle_ancestor(new_parent, new_parent_node, new_parent_path);
        }
    }
}
