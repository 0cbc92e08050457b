//! Reference model for tracking expected store contents
//!
//! The model is a plain map from object id to bytes. Capture one from a
//! store before and after a workload, then compare the recovered store
//! against both.
//!
//! # Example
//!
//! ```ignore
//! use flashstore_engine::testing::ReferenceModel;
//!
//! let before = ReferenceModel::capture(&mut store)?;
//! // ... run the workload, crash, remount ...
//! let actual = ReferenceModel::capture(&mut recovered)?;
//! assert!(before.compare(&actual).is_empty());
//! ```

use crate::store::Store;
use flashstore_core::{ObjectId, StoreResult};
use flashstore_storage::MediaDriver;
use std::collections::BTreeMap;
use std::fmt;

/// Expected content of every visible object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceModel {
    objects: BTreeMap<ObjectId, Vec<u8>>,
}

impl ReferenceModel {
    /// Empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every visible object out of a mounted store.
    pub fn capture<M: MediaDriver>(store: &mut Store<M>) -> StoreResult<Self> {
        let mut objects = BTreeMap::new();
        for id in store.object_ids()? {
            let size = store.get_object_size(id)?;
            objects.insert(id, store.read(id, 0, size)?);
        }
        Ok(ReferenceModel { objects })
    }

    /// Record an object's expected content.
    pub fn put(&mut self, id: ObjectId, bytes: Vec<u8>) {
        self.objects.insert(id, bytes);
    }

    /// Expect an object to be gone.
    pub fn delete(&mut self, id: ObjectId) {
        self.objects.remove(&id);
    }

    /// Expected content of one object.
    pub fn get(&self, id: ObjectId) -> Option<&[u8]> {
        self.objects.get(&id).map(Vec::as_slice)
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True if no object is expected.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Compare this (expected) model against `actual`.
    ///
    /// Returns list of mismatches found.
    pub fn compare(&self, actual: &ReferenceModel) -> Vec<StateMismatch> {
        let mut mismatches = Vec::new();

        for (id, expected) in &self.objects {
            match actual.objects.get(id) {
                Some(found) if found == expected => {}
                Some(found) => mismatches.push(StateMismatch {
                    entity: format!("object:{}", id),
                    expected: format!("{:?}", expected),
                    actual: format!("{:?}", found),
                }),
                None => mismatches.push(StateMismatch {
                    entity: format!("object:{}", id),
                    expected: format!("{:?}", expected),
                    actual: "not found".to_string(),
                }),
            }
        }

        for id in actual.objects.keys() {
            if !self.objects.contains_key(id) {
                mismatches.push(StateMismatch {
                    entity: format!("object:{}", id),
                    expected: "not present".to_string(),
                    actual: "found".to_string(),
                });
            }
        }

        mismatches
    }
}

/// State mismatch found during comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMismatch {
    /// Entity identifier (e.g., "object:#00000300")
    pub entity: String,
    /// Expected value
    pub expected: String,
    /// Actual value
    pub actual: String,
}

impl fmt::Display for StateMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.entity, self.expected, self.actual
        )
    }
}
