//! Thread-safe store handle
//!
//! `Store` itself is single-threaded. `SharedStore` puts it behind a
//! `parking_lot::Mutex` so several threads can use one store; the mutex is
//! the store's external lock, and `transaction` holds it for the whole
//! commit-or-abort unit.

use crate::store::Store;
use flashstore_core::StoreResult;
use flashstore_storage::MediaDriver;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Cloneable, thread-safe handle to one store.
pub struct SharedStore<M: MediaDriver> {
    inner: Arc<Mutex<Store<M>>>,
}

impl<M: MediaDriver> Clone for SharedStore<M> {
    fn clone(&self) -> Self {
        SharedStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: MediaDriver> SharedStore<M> {
    /// Wrap a store (usually already mounted).
    pub fn new(store: Store<M>) -> Self {
        SharedStore {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut Store<M>) -> R) -> R {
        let mut store = self.inner.lock();
        f(&mut store)
    }

    /// Run `f` inside a transaction: commit if it returns `Ok`, abort if it
    /// returns `Err`.
    ///
    /// # Errors
    ///
    /// The closure's error, or the commit's.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut Store<M>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut store = self.inner.lock();
        store.lock_store()?;
        match f(&mut store) {
            Ok(value) => {
                store.unlock_store()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = store.abort() {
                    warn!(target: "flashstore::txn", error = %abort_err, "Abort after failed transaction also failed");
                }
                // Close the level opened above; nothing is left to commit
                if let Err(unlock_err) = store.unlock_store() {
                    warn!(target: "flashstore::txn", error = %unlock_err, "Unlock after abort failed");
                }
                Err(e)
            }
        }
    }

    /// Take the store back if this is the last handle.
    pub fn try_unwrap(self) -> Result<Store<M>, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| SharedStore { inner })
    }
}
