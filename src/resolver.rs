//! Path resolution against the handle table.
//!
//! The engine refuses to open an inode that already has a live handle, and
//! its path resolution opens every intermediate inode transiently. Resolving
//! `/a/b/c` from the root while `/a/b` is held open would therefore collide
//! inside the engine. The resolver instead walks the requested path toward
//! the root, finds the nearest ancestor we already hold open, and asks the
//! engine to resolve only the remaining suffix relative to it — so the walk
//! never touches an inode that is open along the way.

use std::rc::Rc;

use crate::engine::Engine;
use crate::error::Result;
use crate::handle::FileHandle;
use crate::path;
use crate::volume::Volume;

impl<E: Engine> Volume<E> {
    /// Find the nearest open ancestor of `path`, truncating one trailing
    /// component at a time. The empty prefix is probed last and matches an
    /// open root entry. Returns the ancestor (or `None`, meaning "start from
    /// the true root") and the suffix still to resolve, relative to it.
    ///
    /// Entries whose engine node is temporarily detached by a choreography
    /// in progress cannot anchor a resolution and are walked past.
    pub(crate) fn nearest_open_ancestor<'a>(
        &self,
        full_path: &'a str,
    ) -> (Option<Rc<FileHandle<E>>>, &'a str) {
        debug_assert!(full_path.starts_with(path::SEPARATOR) && !path::is_root(full_path));
        let mut end = full_path.len();
        loop {
            end = full_path[..end]
                .rfind(path::SEPARATOR)
                .expect("path is normalized and absolute");
            let prefix = &full_path[..end];
            if let Some(ancestor) = self.inner.table.find_by_path(prefix, None) {
                if ancestor.is_open() {
                    tracing::trace!(
                        "resolve {}: anchored at open ancestor {:?}",
                        full_path,
                        prefix
                    );
                    return (Some(ancestor), &full_path[end + 1..]);
                }
            }
            if end == 0 {
                tracing::trace!("resolve {}: no open ancestor, starting from root", full_path);
                return (None, &full_path[1..]);
            }
        }
    }

    /// Open the engine inode for `path` without colliding with any handle we
    /// already hold. The root (and the empty path, its lookup alias) is
    /// special-cased through its well-known identity; everything else goes
    /// through the ancestor walk.
    pub(crate) fn open_node_at(&self, full_path: &str) -> Result<E::Node> {
        let engine = &self.inner.engine;

        if full_path.is_empty() || path::is_root(full_path) {
            return Ok(engine.open_by_id(self.inner.root.get())?);
        }

        let (ancestor, suffix) = self.nearest_open_ancestor(full_path);
        let node = match &ancestor {
            Some(anchor) => {
                let guard = anchor.node.borrow();
                let base = guard
                    .as_ref()
                    .expect("resolver only anchors at live ancestors");
                engine.resolve_path(Some(base), suffix)?
            }
            None => engine.resolve_path(None, suffix)?,
        };
        Ok(node)
    }
}
