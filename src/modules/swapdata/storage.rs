use std::io;

use borsh::BorshDeserialize;

use crate::modules::swapdata::consts::{
    DB_HISTORY, DB_HISTORY_WANT, DB_OPEN_ORDER, DB_OPEN_WANT, MAX_SWAP_COUNT_ITERATIONS,
};
use crate::modules::swapdata::schemas::{SwapOffer, SwapOfferV1};
use crate::runtime::store::{IndexStore, StoreBatch, StoreError};

/* ---------------- key codec ---------------- */

/// Full key length for a prefix. Primary keys carry the offered token,
/// secondary (`_WANT`) keys carry the wanted token in front of it.
pub fn key_len_for_prefix(prefix: u8) -> usize {
    match prefix {
        DB_OPEN_ORDER | DB_HISTORY => 1 + 32 + 32 + 4,
        DB_OPEN_WANT | DB_HISTORY_WANT => 1 + 32 + 32 + 32 + 4,
        _ => 1,
    }
}

/// `prefix | token_id | utxo_hash | utxo_index(BE)`
pub fn make_key(prefix: u8, offer: &SwapOffer) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 32 + 4);
    key.push(prefix);
    key.extend_from_slice(&offer.token_id);
    key.extend_from_slice(&offer.offered_utxo_hash);
    // Big-endian index for consistent sorting
    key.extend_from_slice(&offer.offered_utxo_index.to_be_bytes());
    key
}

/// `prefix | want_token_id | token_id | utxo_hash | utxo_index(BE)`
pub fn make_want_key(prefix: u8, offer: &SwapOffer) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 32 + 32 + 4);
    key.push(prefix);
    key.extend_from_slice(&offer.want_token_id);
    key.extend_from_slice(&offer.token_id);
    key.extend_from_slice(&offer.offered_utxo_hash);
    key.extend_from_slice(&offer.offered_utxo_index.to_be_bytes());
    key
}

/// Shortest prefix identifying the run of entries for one token. Iteration
/// must re-check returned keys against this and stop on the first mismatch.
pub fn make_match_prefix(prefix: u8, key_hash: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 32);
    out.push(prefix);
    out.extend_from_slice(key_hash);
    out
}

/// Full-length key positioned at the start of one token's run.
pub fn make_seek_key(prefix: u8, key_hash: &[u8; 32]) -> Vec<u8> {
    let mut out = vec![0u8; key_len_for_prefix(prefix)];
    out[0] = prefix;
    out[1..1 + 32].copy_from_slice(key_hash);
    out
}

/// Full-length key positioned at the very first entry of a prefix family.
pub fn make_type_seek_key(prefix: u8) -> Vec<u8> {
    let mut out = vec![0u8; key_len_for_prefix(prefix)];
    out[0] = prefix;
    out
}

/* ---------------- value codec ---------------- */

pub fn encode_offer(offer: &SwapOffer) -> Result<Vec<u8>, io::Error> {
    borsh::to_vec(offer)
}

pub fn decode_offer(bytes: &[u8]) -> Result<SwapOffer, io::Error> {
    SwapOffer::try_from_slice(bytes)
}

pub fn decode_offer_v1(bytes: &[u8]) -> Result<SwapOfferV1, io::Error> {
    SwapOfferV1::try_from_slice(bytes)
}

/* ---------------- staged transitions ---------------- */

/// Stage open -> history for one offer: both open keys go away, both history
/// keys appear, in the same batch.
pub fn stage_move_to_history(batch: &mut StoreBatch, offer: &SwapOffer) -> Result<(), io::Error> {
    let value = encode_offer(offer)?;
    batch.delete(&make_key(DB_OPEN_ORDER, offer));
    batch.put(&make_key(DB_HISTORY, offer), &value);
    if offer.has_want() {
        batch.delete(&make_want_key(DB_OPEN_WANT, offer));
        batch.put(&make_want_key(DB_HISTORY_WANT, offer), &value);
    }
    Ok(())
}

/// Stage history -> open, the reorg direction.
pub fn stage_move_to_open(batch: &mut StoreBatch, offer: &SwapOffer) -> Result<(), io::Error> {
    let value = encode_offer(offer)?;
    batch.delete(&make_key(DB_HISTORY, offer));
    batch.put(&make_key(DB_OPEN_ORDER, offer), &value);
    if offer.has_want() {
        batch.delete(&make_want_key(DB_HISTORY_WANT, offer));
        batch.put(&make_want_key(DB_OPEN_WANT, offer), &value);
    }
    Ok(())
}

/// Stage a freshly parsed advertisement under the open family.
pub fn stage_open_write(batch: &mut StoreBatch, offer: &SwapOffer) -> Result<(), io::Error> {
    let value = encode_offer(offer)?;
    batch.put(&make_key(DB_OPEN_ORDER, offer), &value);
    if offer.has_want() {
        batch.put(&make_want_key(DB_OPEN_WANT, offer), &value);
    }
    Ok(())
}

/// Stage a freshly parsed advertisement directly under the history family
/// (its offered UTXO was consumed in the very block that carried it).
pub fn stage_history_write(batch: &mut StoreBatch, offer: &SwapOffer) -> Result<(), io::Error> {
    let value = encode_offer(offer)?;
    batch.put(&make_key(DB_HISTORY, offer), &value);
    if offer.has_want() {
        batch.put(&make_want_key(DB_HISTORY_WANT, offer), &value);
    }
    Ok(())
}

pub fn stage_delete_open(batch: &mut StoreBatch, offer: &SwapOffer) {
    batch.delete(&make_key(DB_OPEN_ORDER, offer));
    if offer.has_want() {
        batch.delete(&make_want_key(DB_OPEN_WANT, offer));
    }
}

pub fn stage_delete_history(batch: &mut StoreBatch, offer: &SwapOffer) {
    batch.delete(&make_key(DB_HISTORY, offer));
    if offer.has_want() {
        batch.delete(&make_want_key(DB_HISTORY_WANT, offer));
    }
}

/* ---------------- reads ---------------- */

/// Paginated scan of one token's run under `prefix`. Undecodable values are
/// skipped, they do not consume the limit.
pub fn read_swaps_with_prefix<S: IndexStore + ?Sized>(
    store: &S,
    prefix: u8,
    key_hash: &[u8; 32],
    limit: usize,
    offset: usize,
) -> Result<Vec<SwapOffer>, StoreError> {
    let mut orders = Vec::new();
    if limit == 0 {
        return Ok(orders);
    }

    let match_prefix = make_match_prefix(prefix, key_hash);
    let seek = make_seek_key(prefix, key_hash);
    let mut skipped = 0usize;

    for item in store.iter_from(&seek) {
        let (key, value) = item?;
        if !key.starts_with(&match_prefix) {
            break;
        }
        if skipped < offset {
            skipped += 1;
            continue;
        }
        if let Ok(offer) = decode_offer(&value) {
            orders.push(offer);
            if orders.len() >= limit {
                break;
            }
        }
    }
    Ok(orders)
}

/// Bounded count of one token's run under `prefix`.
pub fn count_swaps_with_prefix<S: IndexStore + ?Sized>(
    store: &S,
    prefix: u8,
    key_hash: &[u8; 32],
) -> Result<usize, StoreError> {
    let match_prefix = make_match_prefix(prefix, key_hash);
    let seek = make_seek_key(prefix, key_hash);
    let mut count = 0usize;

    for item in store.iter_from(&seek) {
        let (key, _) = item?;
        if !key.starts_with(&match_prefix) || count >= MAX_SWAP_COUNT_ITERATIONS {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Every offer currently under the open family, with its stored key.
pub fn scan_open_orders<S: IndexStore + ?Sized>(
    store: &S,
) -> Result<Vec<(Vec<u8>, SwapOffer)>, StoreError> {
    scan_family(store, DB_OPEN_ORDER)
}

/// Every offer currently under the primary history family, with its key.
pub fn scan_history_orders<S: IndexStore + ?Sized>(
    store: &S,
) -> Result<Vec<(Vec<u8>, SwapOffer)>, StoreError> {
    scan_family(store, DB_HISTORY)
}

fn scan_family<S: IndexStore + ?Sized>(
    store: &S,
    prefix: u8,
) -> Result<Vec<(Vec<u8>, SwapOffer)>, StoreError> {
    let seek = make_type_seek_key(prefix);
    let mut out = Vec::new();
    for item in store.iter_from(&seek) {
        let (key, value) = item?;
        if key.first() != Some(&prefix) {
            break;
        }
        if let Ok(offer) = decode_offer(&value) {
            out.push((key, offer));
        }
    }
    Ok(out)
}

/// Keys of history entries (primary and secondary) whose recorded height is
/// below the cutoff.
pub fn collect_history_older_than<S: IndexStore + ?Sized>(
    store: &S,
    cutoff_height: i32,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let mut keys = Vec::new();
    for prefix in [DB_HISTORY, DB_HISTORY_WANT] {
        let seek = make_type_seek_key(prefix);
        for item in store.iter_from(&seek) {
            let (key, value) = item?;
            if key.first() != Some(&prefix) {
                break;
            }
            if let Ok(offer) = decode_offer(&value) {
                if offer.block_height < cutoff_height {
                    keys.push(key);
                }
            }
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::swapdata::consts::{DB_LEGACY, FLAG_HAS_WANT};
    use crate::runtime::store::MemStore;

    fn offer(token: u8, hash: u8, index: u32) -> SwapOffer {
        SwapOffer {
            version: 2,
            flags: 0,
            offered_type: 0,
            terms_type: 0,
            token_id: [token; 32],
            offered_utxo_hash: [hash; 32],
            offered_utxo_index: index,
            price_terms: vec![1, 2, 3],
            want_token_id: [0u8; 32],
            signature: vec![9, 9],
            block_height: 100,
        }
    }

    #[test]
    fn key_layout_and_lengths() {
        let o = offer(0x11, 0xAA, 3);
        let key = make_key(DB_OPEN_ORDER, &o);
        assert_eq!(key.len(), key_len_for_prefix(DB_OPEN_ORDER));
        assert_eq!(key[0], DB_OPEN_ORDER);
        assert_eq!(&key[1..33], &[0x11; 32]);
        assert_eq!(&key[33..65], &[0xAA; 32]);
        assert_eq!(&key[65..69], &[0, 0, 0, 3]);

        let mut want = offer(0x11, 0xAA, 3);
        want.flags = 1;
        want.want_token_id = [0x22; 32];
        let wkey = make_want_key(DB_OPEN_WANT, &want);
        assert_eq!(wkey.len(), key_len_for_prefix(DB_OPEN_WANT));
        assert_eq!(wkey[0], DB_OPEN_WANT);
        assert_eq!(&wkey[1..33], &[0x22; 32]);
        assert_eq!(&wkey[33..65], &[0x11; 32]);

        assert_eq!(key_len_for_prefix(DB_LEGACY), 1);
    }

    #[test]
    fn big_endian_index_sorts_numerically() {
        let mut keys: Vec<Vec<u8>> = [0u32, 1, 255, 256, 65536, u32::MAX]
            .iter()
            .map(|&i| make_key(DB_OPEN_ORDER, &offer(0x11, 0xAA, i)))
            .collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn seek_key_starts_the_run() {
        let token = [0x11u8; 32];
        let seek = make_seek_key(DB_OPEN_ORDER, &token);
        let first = make_key(DB_OPEN_ORDER, &offer(0x11, 0x00, 0));
        assert!(seek <= first);
        assert!(seek.starts_with(&make_match_prefix(DB_OPEN_ORDER, &token)));

        let type_seek = make_type_seek_key(DB_OPEN_ORDER);
        assert!(type_seek <= seek);
        assert_eq!(type_seek[0], DB_OPEN_ORDER);
    }

    #[test]
    fn offer_round_trip() {
        let mut o = offer(0x42, 0x7F, 7);
        o.flags = FLAG_HAS_WANT;
        o.want_token_id = [0x33; 32];
        o.price_terms = vec![0xDE, 0xAD, 0xBE, 0xEF];
        o.signature = (0..70).collect();
        o.block_height = -1;

        let bytes = encode_offer(&o).expect("encode");
        let decoded = decode_offer(&bytes).expect("decode");
        assert_eq!(o, decoded);
    }

    #[test]
    fn read_with_prefix_pages_without_gaps() {
        let store = MemStore::new();
        let mut batch = StoreBatch::new();
        for i in 0..10u32 {
            stage_open_write(&mut batch, &offer(0x11, 0xAA, i)).unwrap();
        }
        // Another token's run must not bleed into the page.
        stage_open_write(&mut batch, &offer(0x12, 0xBB, 0)).unwrap();
        store.commit(batch).unwrap();

        let token = [0x11u8; 32];
        let page1 = read_swaps_with_prefix(&store, DB_OPEN_ORDER, &token, 4, 0).unwrap();
        let page2 = read_swaps_with_prefix(&store, DB_OPEN_ORDER, &token, 4, 4).unwrap();
        let page3 = read_swaps_with_prefix(&store, DB_OPEN_ORDER, &token, 4, 8).unwrap();

        let indices: Vec<u32> = page1
            .iter()
            .chain(page2.iter())
            .chain(page3.iter())
            .map(|o| o.offered_utxo_index)
            .collect();
        assert_eq!(indices, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn count_matches_full_iteration() {
        let store = MemStore::new();
        let mut batch = StoreBatch::new();
        for i in 0..25u32 {
            stage_open_write(&mut batch, &offer(0x11, 0xAA, i)).unwrap();
        }
        store.commit(batch).unwrap();

        let token = [0x11u8; 32];
        let count = count_swaps_with_prefix(&store, DB_OPEN_ORDER, &token).unwrap();
        let all = read_swaps_with_prefix(&store, DB_OPEN_ORDER, &token, usize::MAX, 0).unwrap();
        assert_eq!(count, all.len());
        assert_eq!(count, 25);
    }

    #[test]
    fn v1_decoding_rejects_v2_records() {
        let mut o = offer(0x01, 0x02, 3);
        o.flags = 0x01;
        o.want_token_id = [0x44; 32];
        let bytes = encode_offer(&o).unwrap();
        assert!(decode_offer_v1(&bytes).is_err());
    }
}
