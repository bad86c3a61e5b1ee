//! Handle lifecycle: open, close, and the repair helpers shared by every
//! choreography.

use std::rc::Rc;

use crate::engine::{Engine, InodeId};
use crate::error::{QuickbeamError, Result};
use crate::handle::FileHandle;
use crate::path;
use crate::volume::Volume;

impl<E: Engine> Volume<E> {
    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.inner.mounts.get() == 0 {
            return Err(QuickbeamError::NotReady);
        }
        Ok(())
    }

    /// Open a client handle on `raw_path`.
    ///
    /// Two concurrent opens of one path share a single handle and a single
    /// engine node: if the table already has a live entry, the caller gets
    /// another reference to it and no engine call is made. Otherwise the
    /// inode is resolved below the nearest open ancestor and registered.
    pub fn open(&self, raw_path: &str) -> Result<Rc<FileHandle<E>>> {
        self.ensure_mounted()?;
        let vpath = path::normalize(raw_path)?;

        if let Some(existing) = self.inner.table.find_by_path(&vpath, None) {
            existing.retain();
            tracing::debug!(
                "open {}: shared existing handle (refs={})",
                vpath,
                existing.ref_count()
            );
            return Ok(existing);
        }

        let node = self.open_node_at(&vpath)?;
        let handle = FileHandle::new(Rc::downgrade(&self.inner), vpath);
        handle.is_dir.set(self.inner.engine.is_dir(&node));
        handle.put_node(node);
        handle.retain();
        self.inner.table.insert(Rc::clone(&handle));
        tracing::debug!("open {}: new handle", handle.path());
        Ok(handle)
    }

    /// Drop one client reference. The last reference runs the real close
    /// choreography; earlier ones only decrement.
    pub fn close(&self, handle: &Rc<FileHandle<E>>) {
        let remaining = handle.release();
        if remaining > 0 {
            tracing::trace!("close {}: {} refs remain", handle.path(), remaining);
            return;
        }
        self.close_handle(handle);
    }

    /// Close the engine node and unregister the handle.
    ///
    /// Closing a dirty node makes the engine sync it, and the sync re-opens
    /// the node's parent inode internally. If we hold that parent open, the
    /// internal re-open would be a double open — so the parent steps aside
    /// first: close its node, remember its identity, close the target, then
    /// reopen the parent by identity and re-register it. The parent's own
    /// release goes through [`Self::release_node`], which unwinds a chain of
    /// dirty open ancestors one level at a time.
    fn close_handle(&self, handle: &Rc<FileHandle<E>>) {
        let engine = &self.inner.engine;
        let Some(node) = handle.take_node() else {
            self.inner.table.remove(handle);
            return;
        };

        let mut parked: Option<(Rc<FileHandle<E>>, InodeId)> = None;
        if engine.is_dirty(&node) {
            if let Some(parent) = self.open_parent_of(handle) {
                let parent_node = parent
                    .take_node()
                    .expect("open_parent_of returns live handles");
                let parent_id = engine.id(&parent_node);
                self.release_node(parent_node, &parent.path());
                parked = Some((parent, parent_id));
            }
        }

        engine.close(node);

        if let Some((parent, parent_id)) = parked {
            // The close of the target has already succeeded; a failed parent
            // reopen is logged and absorbed, and the stale entry evicted.
            let _ = self.reopen_into(&parent, parent_id);
        }

        self.inner.table.remove(handle);
        tracing::debug!("closed {}", handle.path());
    }

    /// The open handle for this handle's direct parent, if any. Exact parent
    /// path only — not a general ancestor — excluding the handle itself, and
    /// skipping entries whose node is detached by an ongoing choreography.
    pub(crate) fn open_parent_of(
        &self,
        handle: &Rc<FileHandle<E>>,
    ) -> Option<Rc<FileHandle<E>>> {
        if handle.is_root() {
            return None;
        }
        self.inner
            .table
            .find_by_path(&handle.parent_path(), Some(handle))
            .filter(|parent| parent.is_open())
    }

    /// Close an engine node we hold, without tripping the engine's internal
    /// ancestor re-open. A dirty node's close syncs it against its direct
    /// parent; if we hold that parent open, it steps aside first — released
    /// through this same helper, so a chain of dirty open ancestors unwinds
    /// one level at a time, each against a freed slot. `own_path` is the
    /// path of the node being released; the empty path and the root need no
    /// bracket (the engine pins the root inode).
    pub(crate) fn release_node(&self, node: E::Node, own_path: &str) {
        let engine = &self.inner.engine;
        let mut parked: Option<(Rc<FileHandle<E>>, InodeId)> = None;
        if engine.is_dirty(&node) && !own_path.is_empty() && !path::is_root(own_path) {
            let parent = self
                .inner
                .table
                .find_by_path(path::parent_of(own_path), None)
                .filter(|parent| parent.is_open() && !parent.is_root());
            if let Some(parent) = parent {
                let parent_node = parent.take_node().expect("filtered on is_open");
                let parent_id = engine.id(&parent_node);
                self.release_node(parent_node, &parent.path());
                parked = Some((parent, parent_id));
            }
        }
        engine.close(node);
        if let Some((parent, parent_id)) = parked {
            let _ = self.reopen_into(&parent, parent_id);
        }
    }

    /// Reopen `id` into a handle whose node a choreography released. On
    /// failure the entry is evicted from the table — it no longer describes
    /// anything trustworthy — and a subsequent access to that path simply
    /// re-resolves from scratch.
    pub(crate) fn reopen_into(&self, handle: &Rc<FileHandle<E>>, id: InodeId) -> Result<()> {
        match self.inner.engine.open_by_id(id) {
            Ok(node) => {
                handle.put_node(node);
                Ok(())
            }
            Err(err) => {
                tracing::error!("failed to reopen {} for '{}': {}", id, handle.path(), err);
                self.inner.table.remove(handle);
                Err(err.into())
            }
        }
    }
}
