//! Row store (C2): an append-only arena of documents keyed by stable row ids.
//!
//! `documents[rowId]` holds the original ingested document for the lifetime
//! of that row id; writes to a logical row always go through remove+add at
//! the collection level (C9), never in-place mutation here. `liveSet` is a
//! bitset over all assigned row ids; removal clears the bit but never shifts
//! indices, so row ids remain stable keys across every operator.

use std::sync::Arc;

use crate::bitset::BitVector;
use crate::error::{AggError, AggResult};
use crate::value::{RowId, Value};

const GROWTH_CHUNK: usize = 1024;

pub struct RowStore {
    documents: Vec<Arc<Value>>,
    live_set: BitVector,
    row_id_counter: u32,
}

impl RowStore {
    pub fn new() -> Self {
        RowStore {
            documents: Vec::new(),
            live_set: BitVector::new(0),
            row_id_counter: 0,
        }
    }

    /// Appends a document and returns its freshly assigned row id. Nested
    /// scalars are not copied (the document is moved behind an `Arc`); a
    /// caller holding externally-mutable sub-structures is responsible for
    /// cloning before insertion, matching the "never mutate in place"
    /// contract of the row store.
    pub fn add_document(&mut self, doc: Value) -> RowId {
        let row_id = self.row_id_counter;
        self.row_id_counter += 1;

        let idx = row_id as usize;
        if idx >= self.documents.len() {
            self.documents.resize(idx + 1, Arc::new(Value::Null));
            if self.live_set.len() <= idx {
                self.live_set.grow_to(idx + GROWTH_CHUNK);
            }
        }
        self.documents[idx] = Arc::new(doc);
        self.live_set.set(idx);
        row_id
    }

    /// Idempotent: removing an already-dead or never-allocated id is a
    /// no-op for ids beyond the allocated range, but raises
    /// `InvariantViolation` for ids within range that map to a dead slot
    /// that was never truly allocated (defensive; in practice every slot
    /// below `row_id_counter` was allocated by `add_document`).
    pub fn remove_row(&mut self, row_id: RowId) -> AggResult<()> {
        let idx = row_id as usize;
        if idx >= self.row_id_counter as usize {
            return Err(AggError::InvariantViolation {
                stage: "row_store".to_string(),
                message: format!("row id {row_id} was never allocated"),
            });
        }
        if idx < self.live_set.len() {
            self.live_set.clear(idx);
        }
        Ok(())
    }

    pub fn get(&self, row_id: RowId) -> AggResult<&Value> {
        let idx = row_id as usize;
        if idx >= self.documents.len() {
            return Err(AggError::InvariantViolation {
                stage: "row_store".to_string(),
                message: format!("row id {row_id} was never allocated"),
            });
        }
        Ok(&self.documents[idx])
    }

    pub fn is_live(&self, row_id: RowId) -> bool {
        (row_id as usize) < self.live_set.len() && self.live_set.get(row_id as usize)
    }

    pub fn live_ids(&self) -> impl Iterator<Item = RowId> + '_ {
        self.live_set.set_bits().map(|i| i as RowId)
    }

    pub fn size(&self) -> usize {
        self.live_set.popcount()
    }

    pub fn next_row_id(&self) -> RowId {
        self.row_id_counter
    }
}

impl Default for RowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Doc;

    fn doc(n: i64) -> Value {
        let mut d = Doc::new();
        d.insert("n".to_string(), Value::Int64(n));
        Value::Object(d)
    }

    #[test]
    fn add_then_get_then_remove() {
        let mut store = RowStore::new();
        let id0 = store.add_document(doc(1));
        let id1 = store.add_document(doc(2));
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert_eq!(store.size(), 2);

        store.remove_row(id0).unwrap();
        assert_eq!(store.size(), 1);
        assert!(!store.is_live(id0));
        assert!(store.is_live(id1));

        // idempotent
        store.remove_row(id0).unwrap();
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn unknown_row_id_is_invariant_violation() {
        let store = RowStore::new();
        assert!(store.get(42).is_err());
    }

    #[test]
    fn row_ids_never_shift() {
        let mut store = RowStore::new();
        let ids: Vec<_> = (0..5).map(|i| store.add_document(doc(i))).collect();
        store.remove_row(ids[2]).unwrap();
        let live: Vec<_> = store.live_ids().collect();
        assert_eq!(live, vec![0, 1, 3, 4]);
    }
}
