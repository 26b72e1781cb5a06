use rocksdb::{
    BlockBasedOptions, Cache, DB, Direction, IteratorMode, Options, WriteBatch,
};
use std::{path::Path, sync::Arc};

use crate::runtime::store::{BatchOp, IndexStore, KvPair, StoreBatch, StoreError};

/// LRU block cache size (data + index/filter blocks).
pub const ROCKS_BLOCK_CACHE_BYTES: usize = 256 << 20; // 256 MiB

/// Bloom filter bits/key (helps point lookups).
pub const BLOOM_BITS_PER_KEY: f64 = 10.0;

/// Namespaced handle over a shared RocksDB instance. Every key the caller
/// sees is relative; the namespace prefix is applied on the way in and
/// stripped on the way out, so several subsystems can share one database
/// without key collisions.
#[derive(Clone)]
pub struct Mdb {
    db: Arc<DB>,
    prefix: Vec<u8>,
    // Keep the cache alive as long as this handle is alive (important!)
    _cache: Option<Cache>,
}

impl Mdb {
    fn from_parts(db: Arc<DB>, prefix: impl AsRef<[u8]>, cache: Option<Cache>) -> Self {
        Self { db, prefix: prefix.as_ref().to_vec(), _cache: cache }
    }

    /// Namespace view over an already-open database.
    pub fn from_db(db: Arc<DB>, prefix: impl AsRef<[u8]>) -> Self {
        Self::from_parts(db, prefix, None)
    }

    pub fn open(path: impl AsRef<Path>, prefix: impl AsRef<[u8]>) -> Result<Self, StoreError> {
        let cache = Cache::new_lru_cache(ROCKS_BLOCK_CACHE_BYTES);

        let mut table = BlockBasedOptions::default();
        table.set_block_cache(&cache);
        // Keep hot metadata (index + filter blocks) in the cache
        table.set_cache_index_and_filter_blocks(true);
        table.set_pin_l0_filter_and_index_blocks_in_cache(true);
        table.set_bloom_filter(BLOOM_BITS_PER_KEY, false);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        // Keep readers open (avoid fd thrash)
        opts.set_max_open_files(-1);
        opts.set_block_based_table_factory(&table);

        let db = DB::open(&opts, path)?;
        Ok(Self::from_parts(Arc::new(db), prefix, Some(cache)))
    }

    #[inline]
    fn prefixed(&self, k: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + k.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(k);
        out
    }

    #[inline]
    pub fn db_handle(&self) -> Arc<DB> {
        self.db.clone()
    }

    #[inline]
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }
}

impl IndexStore for Mdb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(self.prefixed(key))?)
    }

    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut wb = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => wb.put(self.prefixed(&k), v),
                BatchOp::Delete(k) => wb.delete(self.prefixed(&k)),
            }
        }
        Ok(self.db.write(wb)?)
    }

    fn iter_from<'a>(
        &'a self,
        seek: &[u8],
    ) -> Box<dyn Iterator<Item = Result<KvPair, StoreError>> + 'a> {
        // RocksDB iterators pin an implicit snapshot at creation, which is
        // what gives readers a consistent view across concurrent commits.
        let ns = self.prefix.clone();
        let ns_strip = ns.clone();
        let start = self.prefixed(seek);
        let it = self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
            .map(|res| {
                res.map(|(k, v)| (k.to_vec(), v.to_vec())).map_err(StoreError::from)
            })
            .take_while(move |res| match res {
                Ok((k, _)) => k.starts_with(&ns),
                Err(_) => true,
            })
            .map(move |res| res.map(|(k, v)| (k[ns_strip.len()..].to_vec(), v)));
        Box::new(it)
    }
}
