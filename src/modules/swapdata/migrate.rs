use crate::modules::swapdata::consts::{
    DB_HISTORY, DB_LEGACY, DB_OPEN_ORDER, DB_VERSION, SWAP_SCHEMA_VERSION,
};
use crate::modules::swapdata::main::SwapIndexError;
use crate::modules::swapdata::storage::{
    decode_offer_v1, encode_offer, make_type_seek_key, stage_open_write,
};
use crate::runtime::store::{IndexStore, StoreBatch, StoreError};

pub fn read_schema_version<S: IndexStore + ?Sized>(store: &S) -> Result<Option<u8>, StoreError> {
    Ok(store.get(&[DB_VERSION])?.and_then(|v| v.first().copied()))
}

pub fn write_schema_version<S: IndexStore + ?Sized>(
    store: &S,
    version: u8,
) -> Result<(), StoreError> {
    let mut batch = StoreBatch::new();
    batch.put(&[DB_VERSION], &[version]);
    store.commit(batch)
}

/// Rewrite pre-versioning entries from the legacy prefix into the open
/// family. One batch per record keeps a crash mid-way re-runnable: a record
/// is either still legacy or fully rewritten.
pub fn migrate_legacy<S: IndexStore + ?Sized>(store: &S) -> Result<usize, SwapIndexError> {
    let seek = make_type_seek_key(DB_LEGACY);
    let mut migrated = 0usize;

    for item in store.iter_from(&seek) {
        let (key, value) = item?;
        if key.first() != Some(&DB_LEGACY) {
            break;
        }
        let legacy = match decode_offer_v1(&value) {
            Ok(l) => l,
            Err(_) => continue,
        };

        let offer = legacy.widen();
        let mut batch = StoreBatch::new();
        stage_open_write(&mut batch, &offer)?;
        batch.delete(&key);
        store.commit(batch)?;
        migrated += 1;
    }

    Ok(migrated)
}

/// Widen v1-encoded values under the open and history families in place.
/// Values that no longer decode as v1 are already v2 and are left alone,
/// which is what makes a crashed half-migration safe to re-run.
pub fn migrate_offer_schema<S: IndexStore + ?Sized>(
    store: &S,
    old_version: u8,
) -> Result<usize, SwapIndexError> {
    if old_version >= SWAP_SCHEMA_VERSION {
        return Ok(0);
    }

    let mut keys: Vec<Vec<u8>> = Vec::new();
    for prefix in [DB_OPEN_ORDER, DB_HISTORY] {
        let seek = make_type_seek_key(prefix);
        for item in store.iter_from(&seek) {
            let (key, _) = item?;
            if key.first() != Some(&prefix) {
                break;
            }
            keys.push(key);
        }
    }

    let mut batch = StoreBatch::new();
    let mut rewritten = 0usize;
    for key in keys {
        let value = match store.get(&key)? {
            Some(v) => v,
            None => continue,
        };
        let legacy = match decode_offer_v1(&value) {
            Ok(l) => l,
            Err(_) => continue,
        };
        batch.put(&key, &encode_offer(&legacy.widen())?);
        rewritten += 1;
    }

    if !batch.is_empty() {
        store.commit(batch)?;
    }
    Ok(rewritten)
}

/// Bring the store to the current schema version. Safe to call on every
/// startup; every step tolerates being re-run after a crash.
pub fn run_migrations<S: IndexStore + ?Sized>(store: &S) -> Result<(), SwapIndexError> {
    let version = read_schema_version(store)?;

    let effective = match version {
        Some(v) => v,
        None => {
            // No version cell: either a fresh database or one from before
            // versioning. Sweep the legacy prefix either way.
            let migrated = migrate_legacy(store)?;
            if migrated > 0 {
                eprintln!("[SWAPDATA] migrated {migrated} legacy entries");
            }
            1
        }
    };

    if effective < SWAP_SCHEMA_VERSION {
        let rewritten = migrate_offer_schema(store, effective)?;
        if rewritten > 0 {
            eprintln!(
                "[SWAPDATA] widened {rewritten} entries from schema v{effective} to v{SWAP_SCHEMA_VERSION}"
            );
        }
    }

    if version != Some(SWAP_SCHEMA_VERSION) {
        write_schema_version(store, SWAP_SCHEMA_VERSION)?;
        eprintln!("[SWAPDATA] schema version set to {SWAP_SCHEMA_VERSION}");
    }

    Ok(())
}
