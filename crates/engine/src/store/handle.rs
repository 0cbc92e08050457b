//! Scratch revision handles
//!
//! Every revision an operation creates before it is published (a new
//! object's first entry, a clone being populated) is pushed here. The
//! operation runs inside [`Store::guarded`]; when it fails, the revisions
//! pushed since it started are killed, so a failed write never leaves a
//! half-populated clone in memory. Whatever survives a crash is removed by
//! the next mount's recovery.

use super::Store;
use flashstore_core::{ObjectId, ObjectState, StoreResult};
use flashstore_storage::MediaDriver;
use tracing::warn;

/// A revision owned by an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handle {
    pub id: ObjectId,
    pub state: ObjectState,
}

#[derive(Debug, Default)]
pub(crate) struct HandleStack {
    handles: Vec<Handle>,
}

impl HandleStack {
    pub fn depth(&self) -> usize {
        self.handles.len()
    }

    pub fn push(&mut self, handle: Handle) {
        self.handles.push(handle);
    }

    /// Pop every handle above `depth`, newest first.
    pub fn release_above(&mut self, depth: usize) -> Vec<Handle> {
        let mut released = self.handles.split_off(depth.min(self.handles.len()));
        released.reverse();
        released
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

impl<M: MediaDriver> Store<M> {
    /// Run `f`, then release its handles. On error the handled revisions
    /// are killed, best effort.
    pub(crate) fn guarded<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let depth = self.handles.depth();
        let result = f(self);
        let released = self.handles.release_above(depth);
        if let Err(err) = &result {
            if err.is_power_loss() {
                return result;
            }
            for handle in released {
                if let Some(loc) = self.find(handle.id, handle.state) {
                    if let Err(e) = self.with_dir(loc.logical, |dir, media| dir.kill(media, loc.slot)) {
                        warn!(target: "flashstore::store", id = %handle.id, state = %handle.state, error = %e, "Failed to release scratch revision");
                    }
                    self.cache.forget(handle.id);
                }
            }
        }
        result
    }
}
