use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{Engine, InodeId};
use crate::handle::FileHandle;

/// Per-volume registry of live client handles.
///
/// Membership is the only contract: no ordering, no eviction. This is a
/// plain vector with linear scans rather than a path-keyed map because a
/// move rewrites a registered handle's path in place, which would strand a
/// map key mid-choreography.
pub struct HandleTable<E: Engine> {
    entries: RefCell<Vec<Rc<FileHandle<E>>>>,
}

impl<E: Engine> HandleTable<E> {
    pub fn new() -> Self {
        HandleTable {
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Exact-match lookup on normalized path. An empty query path matches
    /// the registered root entry regardless of its stored path. `exclude`
    /// lets a caller probe while tolerant of its own (possibly detached or
    /// rewritten) entry.
    pub fn find_by_path(
        &self,
        path: &str,
        exclude: Option<&Rc<FileHandle<E>>>,
    ) -> Option<Rc<FileHandle<E>>> {
        self.entries
            .borrow()
            .iter()
            .find(|entry| {
                if let Some(excluded) = exclude {
                    if Rc::ptr_eq(entry, excluded) {
                        return false;
                    }
                }
                if path.is_empty() {
                    entry.is_root()
                } else {
                    *entry.path.borrow() == path
                }
            })
            .cloned()
    }

    /// Reverse lookup by inode identity. Linear, and used only when a bare
    /// identity arrives from directory enumeration.
    pub fn find_by_inode(&self, engine: &E, id: InodeId) -> Option<Rc<FileHandle<E>>> {
        self.entries
            .borrow()
            .iter()
            .find(|entry| {
                entry
                    .node
                    .borrow()
                    .as_ref()
                    .map(|node| engine.id(node) == id)
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn insert(&self, handle: Rc<FileHandle<E>>) {
        debug_assert!(
            self.find_by_path(&handle.path.borrow(), None).is_none(),
            "duplicate path registered in handle table"
        );
        self.entries.borrow_mut().push(handle);
    }

    pub fn remove(&self, handle: &Rc<FileHandle<E>>) {
        self.entries
            .borrow_mut()
            .retain(|entry| !Rc::ptr_eq(entry, handle));
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Empty the table, handing back the entries that were registered.
    pub fn drain(&self) -> Vec<Rc<FileHandle<E>>> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }

    /// Rewrite the path prefix of every entry below a directory that just
    /// moved, so open descendants keep resolving and keep their parent
    /// lookups coherent.
    pub fn rebase_descendants(&self, old_prefix: &str, new_prefix: &str) {
        let old_tree = format!("{}/", old_prefix);
        for entry in self.entries.borrow().iter() {
            let rebased = {
                let path = entry.path.borrow();
                path.strip_prefix(&old_tree)
                    .map(|rest| format!("{}/{}", new_prefix, rest))
            };
            if let Some(rebased) = rebased {
                tracing::debug!(
                    "rebasing open descendant {} -> {}",
                    entry.path.borrow(),
                    rebased
                );
                *entry.path.borrow_mut() = rebased;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<E: Engine> Default for HandleTable<E> {
    fn default() -> Self {
        Self::new()
    }
}
