//! Read-only view of the shared object store.
//!
//! The control plane treats the distributed store as a
//! `key -> 64-bit word[slot]` map and only ever reads from it: sync
//! primitives materialize their initial state (threshold, initial count,
//! reset mode, signaled flag) from well-known slots of their key at
//! first use.

use std::collections::HashMap;

use parking_lot::RwLock;
use starmem_types::ObjectKey;

/// The store interface consumed by the sync registry.
pub trait SharedStore: Send + Sync {
    /// Read the 64-bit word at `slot` of `key`. Absent cells read as 0.
    fn get(&self, key: ObjectKey, slot: u32) -> u64;
}

/// Heap-backed store for tests and single-process embeddings.
///
/// Embedders and tests populate it with [`InMemoryStore::put`]; the
/// control plane itself never writes.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    cells: RwLock<HashMap<(u64, u32), u64>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the word at `slot` of `key`.
    pub fn put(&self, key: ObjectKey, slot: u32, value: u64) {
        self.cells.write().insert((key.get(), slot), value);
    }
}

impl SharedStore for InMemoryStore {
    fn get(&self, key: ObjectKey, slot: u32) -> u64 {
        self.cells
            .read()
            .get(&(key.get(), slot))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_cells_read_zero() {
        let store = InMemoryStore::new();
        assert_eq!(store.get(ObjectKey::new(1), 0), 0);
        store.put(ObjectKey::new(1), 0, 7);
        store.put(ObjectKey::new(1), 2, 1);
        assert_eq!(store.get(ObjectKey::new(1), 0), 7);
        assert_eq!(store.get(ObjectKey::new(1), 2), 1);
        assert_eq!(store.get(ObjectKey::new(2), 0), 0);
    }
}
