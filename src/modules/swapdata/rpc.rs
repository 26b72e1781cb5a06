use serde_json::{Value, json};
use std::sync::Arc;

use crate::modules::defs::{MempoolView, RpcRegistry};
use crate::modules::swapdata::consts::{
    DB_HISTORY, DB_HISTORY_WANT, DB_OPEN_ORDER, DB_OPEN_WANT, DEFAULT_SWAP_QUERY_LIMIT,
    MAX_SWAP_QUERY_LIMIT,
};
use crate::modules::swapdata::schemas::SwapOffer;
use crate::modules::swapdata::storage::{count_swaps_with_prefix, read_swaps_with_prefix};
use crate::runtime::store::IndexStore;

/* ---------------- register ---------------- */

pub fn register_rpc<S: IndexStore + 'static>(
    reg: RpcRegistry,
    store: Arc<S>,
    mempool: Arc<dyn MempoolView>,
) {
    eprintln!("[RPC_SWAPDATA] registering RPC handlers…");

    let reg_open = reg.clone();
    let store_open = store.clone();
    let mp_open = mempool.clone();
    tokio::spawn(async move {
        reg_open
            .register("getopenorders", move |payload| {
                let store = store_open.clone();
                let mempool = mp_open.clone();
                async move {
                    open_orders_response(
                        store.as_ref(),
                        mempool.as_ref(),
                        &payload,
                        "token_ref",
                        DB_OPEN_ORDER,
                    )
                }
            })
            .await;
    });

    let reg_open_want = reg.clone();
    let store_open_want = store.clone();
    let mp_open_want = mempool.clone();
    tokio::spawn(async move {
        reg_open_want
            .register("getopenordersbywant", move |payload| {
                let store = store_open_want.clone();
                let mempool = mp_open_want.clone();
                async move {
                    open_orders_response(
                        store.as_ref(),
                        mempool.as_ref(),
                        &payload,
                        "want_token_ref",
                        DB_OPEN_WANT,
                    )
                }
            })
            .await;
    });

    let reg_hist = reg.clone();
    let store_hist = store.clone();
    let mp_hist = mempool.clone();
    tokio::spawn(async move {
        reg_hist
            .register("getswaphistory", move |payload| {
                let store = store_hist.clone();
                let mempool = mp_hist.clone();
                async move {
                    history_orders_response(
                        store.as_ref(),
                        mempool.as_ref(),
                        &payload,
                        "token_ref",
                        DB_HISTORY,
                        DB_OPEN_ORDER,
                    )
                }
            })
            .await;
    });

    let reg_hist_want = reg.clone();
    let store_hist_want = store.clone();
    let mp_hist_want = mempool.clone();
    tokio::spawn(async move {
        reg_hist_want
            .register("getswaphistorybywant", move |payload| {
                let store = store_hist_want.clone();
                let mempool = mp_hist_want.clone();
                async move {
                    history_orders_response(
                        store.as_ref(),
                        mempool.as_ref(),
                        &payload,
                        "want_token_ref",
                        DB_HISTORY_WANT,
                        DB_OPEN_WANT,
                    )
                }
            })
            .await;
    });

    let reg_count = reg.clone();
    let store_count = store.clone();
    tokio::spawn(async move {
        reg_count
            .register("getswapcount", move |payload| {
                let store = store_count.clone();
                async move {
                    counts_response(store.as_ref(), &payload, "token_ref", DB_OPEN_ORDER, DB_HISTORY)
                }
            })
            .await;
    });

    let reg_count_want = reg.clone();
    tokio::spawn(async move {
        reg_count_want
            .register("getswapcountbywant", move |payload| {
                let store = store.clone();
                async move {
                    counts_response(
                        store.as_ref(),
                        &payload,
                        "want_token_ref",
                        DB_OPEN_WANT,
                        DB_HISTORY_WANT,
                    )
                }
            })
            .await;
    });
}

/* ---------------- responses ---------------- */

fn open_orders_response<S: IndexStore + ?Sized>(
    store: &S,
    mempool: &dyn MempoolView,
    payload: &Value,
    param: &str,
    prefix: u8,
) -> Value {
    let key_hash = match parse_hash_param(payload.get(param)) {
        Some(h) => h,
        None => return missing_hash_error(param),
    };
    let (limit, offset) = match parse_page_params(payload) {
        Ok(p) => p,
        Err(e) => return e,
    };

    // A store failure degrades to an empty page, the same way counts degrade
    // to zero.
    let orders = match read_swaps_with_prefix(store, prefix, &key_hash, limit, offset) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[RPC_SWAPDATA] open order read failed: {e}");
            return json!({ "ok": true, "orders": [] });
        }
    };

    // Offers spent in the mempool are not really open anymore; drop them
    // before the caller sees them.
    let visible: Vec<Value> = orders
        .iter()
        .filter(|o| !mempool.is_spent(&o.outpoint()))
        .map(offer_to_json)
        .collect();

    json!({ "ok": true, "orders": visible })
}

fn history_orders_response<S: IndexStore + ?Sized>(
    store: &S,
    mempool: &dyn MempoolView,
    payload: &Value,
    param: &str,
    hist_prefix: u8,
    open_prefix: u8,
) -> Value {
    let key_hash = match parse_hash_param(payload.get(param)) {
        Some(h) => h,
        None => return missing_hash_error(param),
    };
    let (limit, offset) = match parse_page_params(payload) {
        Ok(p) => p,
        Err(e) => return e,
    };

    let history = match read_swaps_with_prefix(store, hist_prefix, &key_hash, limit, offset) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[RPC_SWAPDATA] history read failed: {e}");
            return json!({ "ok": true, "orders": [] });
        }
    };
    let mut result: Vec<Value> = history.iter().map(offer_to_json).collect();

    // Mempool-aware history: open offers already spent by unconfirmed
    // transactions show up here before the spending block lands.
    if result.len() < limit {
        let open = read_swaps_with_prefix(store, open_prefix, &key_hash, MAX_SWAP_QUERY_LIMIT, 0)
            .unwrap_or_default();
        for offer in &open {
            if result.len() >= limit {
                break;
            }
            if mempool.is_spent(&offer.outpoint()) {
                result.push(offer_to_json(offer));
            }
        }
    }

    json!({ "ok": true, "orders": result })
}

fn counts_response<S: IndexStore + ?Sized>(
    store: &S,
    payload: &Value,
    param: &str,
    open_prefix: u8,
    hist_prefix: u8,
) -> Value {
    let key_hash = match parse_hash_param(payload.get(param)) {
        Some(h) => h,
        None => return missing_hash_error(param),
    };

    // Counts may under-report on store trouble, never over-report.
    let open = count_swaps_with_prefix(store, open_prefix, &key_hash).unwrap_or(0);
    let history = count_swaps_with_prefix(store, hist_prefix, &key_hash).unwrap_or(0);

    json!({ "ok": true, "open": open, "history": history })
}

/* ---------------- helpers ---------------- */

fn missing_hash_error(param: &str) -> Value {
    json!({
        "ok": false,
        "error": "missing_or_invalid_hash",
        "hint": format!("{param} should be a 64-character hex string")
    })
}

fn parse_page_params(payload: &Value) -> Result<(usize, usize), Value> {
    let limit = match payload.get("limit") {
        None | Some(Value::Null) => DEFAULT_SWAP_QUERY_LIMIT,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => (n as usize).min(MAX_SWAP_QUERY_LIMIT),
            _ => return Err(json!({ "ok": false, "error": "limit must be non-negative" })),
        },
    };
    let offset = match payload.get("offset") {
        None | Some(Value::Null) => 0,
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => n as usize,
            _ => return Err(json!({ "ok": false, "error": "offset must be non-negative" })),
        },
    };
    Ok((limit, offset))
}

/// Hashes travel over RPC in the usual reversed (txid-style) hex order.
fn parse_hash_param(v: Option<&Value>) -> Option<[u8; 32]> {
    let s = v?.as_str()?;
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    arr.reverse();
    Some(arr)
}

fn hash_to_hex(hash: &[u8; 32]) -> String {
    let mut rev = *hash;
    rev.reverse();
    hex::encode(rev)
}

fn offer_to_json(offer: &SwapOffer) -> Value {
    let mut obj = json!({
        "version": offer.version,
        "flags": offer.flags,
        "offered_type": offer.offered_type,
        "terms_type": offer.terms_type,
        "tokenid": hash_to_hex(&offer.token_id),
        "utxo": {
            "txid": hash_to_hex(&offer.offered_utxo_hash),
            "vout": offer.offered_utxo_index,
        },
        "price_terms": hex::encode(&offer.price_terms),
        "signature": hex::encode(&offer.signature),
        "block_height": offer.block_height,
    });
    if offer.has_want() {
        obj["want_tokenid"] = Value::String(hash_to_hex(&offer.want_token_id));
    }
    obj
}
