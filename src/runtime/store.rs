use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb: {0}")]
    Rocks(#[from] rocksdb::Error),
}

pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Staged writes, applied atomically by `IndexStore::commit`.
#[derive(Default)]
pub struct StoreBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn put(&mut self, k: &[u8], v: &[u8]) {
        self.ops.push(BatchOp::Put(k.to_vec(), v.to_vec()));
    }

    #[inline]
    pub fn delete(&mut self, k: &[u8]) {
        self.ops.push(BatchOp::Delete(k.to_vec()));
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub type KvPair = (Vec<u8>, Vec<u8>);

/// Ordered key-value store as the index sees it: point reads, atomic batch
/// commits, and forward iteration from a seek key over a consistent snapshot.
/// Keys are namespace-relative; a backend may map them onto a shared physical
/// keyspace.
pub trait IndexStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every staged op or none of them. Durable on Ok.
    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError>;

    /// Ascending iteration starting at `seek` (inclusive). The sequence
    /// reflects a single point-in-time view of the store.
    fn iter_from<'a>(
        &'a self,
        seek: &[u8],
    ) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + 'a>;
}

/// BTreeMap-backed store. Iteration materializes the matching tail so readers
/// see a stable snapshot even while writers commit.
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.lock().expect("mem store poisoned");
        Ok(map.get(key).cloned())
    }

    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut map = self.map.lock().expect("mem store poisoned");
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }

    fn iter_from<'a>(
        &'a self,
        seek: &[u8],
    ) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + 'a> {
        let map = self.map.lock().expect("mem store poisoned");
        let pairs: Vec<KvPair> = map
            .range(seek.to_vec()..)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Box::new(pairs.into_iter().map(Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_atomic_unit() {
        let store = MemStore::new();
        let mut batch = StoreBatch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        store.commit(batch).unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn iter_from_is_ordered_and_inclusive() {
        let store = MemStore::new();
        let mut batch = StoreBatch::new();
        for k in [&b"ab"[..], b"aa", b"b", b"ac"] {
            batch.put(k, b"x");
        }
        store.commit(batch).unwrap();

        let keys: Vec<Vec<u8>> = store
            .iter_from(b"ab")
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"ab".to_vec(), b"ac".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn iteration_snapshot_survives_concurrent_commit() {
        let store = MemStore::new();
        let mut batch = StoreBatch::new();
        batch.put(b"k1", b"v1");
        batch.put(b"k2", b"v2");
        store.commit(batch).unwrap();

        let mut it = store.iter_from(b"k1");
        let first = it.next().unwrap().unwrap();
        assert_eq!(first.0, b"k1".to_vec());

        let mut batch = StoreBatch::new();
        batch.delete(b"k2");
        store.commit(batch).unwrap();

        // The in-flight iteration still sees the pre-commit view.
        let second = it.next().unwrap().unwrap();
        assert_eq!(second.0, b"k2".to_vec());
    }
}
