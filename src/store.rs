//! An opaque in-memory CRUD collaborator for record-keeping handlers.
//!
//! Handlers own a `Store` behind `Arc` and translate its misses into
//! `NotFound`. Conditional-update semantics are out of scope; read-then-act
//! sequences race like any other concurrent access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Opaque record key, assigned by the store at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(u64);

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait Store<R>: Send + Sync {
    fn create(&self, record: R) -> RecordId;
    fn read(&self, id: RecordId) -> Option<R>;
    /// The stored record after replacement, or `None` if nothing exists
    /// under `id` (in which case the store is untouched).
    fn update(&self, id: RecordId, record: R) -> Option<R>;
    /// `false` if no record exists under `id`.
    fn delete(&self, id: RecordId) -> bool;
    /// All records in id order.
    fn list(&self) -> Vec<(RecordId, R)>;
}

/// Hash map store with monotone id assignment.
pub struct MemStore<R> {
    records: Mutex<HashMap<RecordId, R>>,
    next_id: AtomicU64,
}

impl<R> MemStore<R> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<R> Default for MemStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send + Sync> Store<R> for MemStore<R> {
    fn create(&self, record: R) -> RecordId {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.lock().insert(id, record);
        id
    }

    fn read(&self, id: RecordId) -> Option<R> {
        self.records.lock().get(&id).cloned()
    }

    fn update(&self, id: RecordId, record: R) -> Option<R> {
        let mut records = self.records.lock();
        match records.get_mut(&id) {
            Some(slot) => {
                *slot = record;
                Some(slot.clone())
            }
            None => None,
        }
    }

    fn delete(&self, id: RecordId) -> bool {
        self.records.lock().remove(&id).is_some()
    }

    fn list(&self) -> Vec<(RecordId, R)> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        records.sort_by_key(|(id, _)| *id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_read_round_trips() {
        let store = MemStore::new();
        let id = store.create("first".to_owned());
        assert_eq!(store.read(id), Some("first".to_owned()));
    }

    #[test]
    fn delete_makes_reads_miss() {
        let store = MemStore::new();
        let id = store.create(1u32);
        assert!(store.delete(id));
        assert_eq!(store.read(id), None);
        assert!(!store.delete(id));
    }

    #[test]
    fn update_requires_an_existing_record() {
        let store = MemStore::new();
        let id = store.create(1u32);
        assert_eq!(store.update(id, 2), Some(2));
        assert_eq!(store.read(id), Some(2));
        assert!(store.delete(id));
        assert_eq!(store.update(id, 3), None);
    }

    #[test]
    fn list_is_ordered_by_id() {
        let store = MemStore::new();
        let a = store.create("a".to_owned());
        let b = store.create("b".to_owned());
        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, a);
        assert_eq!(listed[1].0, b);
        assert!(a < b);
    }
}
