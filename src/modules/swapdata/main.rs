use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitcoin::{Block, OutPoint};
use thiserror::Error;

use crate::modules::defs::{ChainTipSource, IndexModule, MempoolView, RpcRegistry};
use crate::modules::swapdata::consts::{
    DB_HISTORY, DB_HISTORY_WANT, DB_OPEN_ORDER, DB_OPEN_WANT, MAX_SWAP_QUERY_LIMIT,
    SWAP_PRUNE_INTERVAL_SECS,
};
use crate::modules::swapdata::migrate;
use crate::modules::swapdata::rpc;
use crate::modules::swapdata::schemas::{SwapOffer, SwapOrderCounts};
use crate::modules::swapdata::storage;
use crate::modules::swapdata::utils::offers::parse_swap_offer;
use crate::runtime::store::{IndexStore, StoreBatch, StoreError};

#[derive(Debug, Error)]
pub enum SwapIndexError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("offer codec: {0}")]
    Codec(#[from] std::io::Error),
    #[error("schema migration failed: {0}")]
    Migration(String),
}

/// The swap advertisement index. One serial writer (the chain follower)
/// drives `connect_block`/`disconnect_block`; the prune thread and any number
/// of readers run concurrently against store snapshots.
pub struct SwapData<S: IndexStore> {
    store: Arc<S>,
    history_blocks: i64,
    chain_tip: Arc<dyn ChainTipSource>,
    mempool: Arc<dyn MempoolView>,
    shutdown: Arc<AtomicBool>,
    prune_interrupt: Arc<AtomicBool>,
    prune_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: IndexStore + 'static> SwapData<S> {
    pub fn new(
        store: Arc<S>,
        history_blocks: i64,
        chain_tip: Arc<dyn ChainTipSource>,
        mempool: Arc<dyn MempoolView>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            history_blocks,
            chain_tip,
            mempool,
            shutdown,
            prune_interrupt: Arc::new(AtomicBool::new(false)),
            prune_thread: Mutex::new(None),
        }
    }

    /// Run schema migrations, then start the background pruner. A migration
    /// failure leaves the pruner stopped and the index unusable.
    pub fn init(&self) -> Result<(), SwapIndexError> {
        migrate::run_migrations(self.store.as_ref())
            .map_err(|e| SwapIndexError::Migration(e.to_string()))?;
        self.start_prune_thread();
        Ok(())
    }

    pub fn interrupt_prune(&self) {
        self.prune_interrupt.store(true, Ordering::Relaxed);
    }

    /// Interrupt and join the prune thread. Idempotent.
    pub fn shutdown(&self) {
        self.interrupt_prune();
        if let Some(handle) = self.prune_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /* ---------------- block ingest ---------------- */

    pub fn connect_block(&self, block: &Block, height: i32) -> Result<(), SwapIndexError> {
        let spent = collect_spent_outpoints(block);

        // Spend check first, against the open set as of the previous block.
        // Each move is its own batch; the spend is authoritative whether or
        // not the history entry lands, so failures only warn.
        let mut moved = 0usize;
        if !spent.is_empty() {
            for (_, mut offer) in storage::scan_open_orders(self.store.as_ref())? {
                if !spent.contains(&offer.outpoint()) {
                    continue;
                }
                offer.block_height = height; // record when it was spent
                match self.move_to_history(&offer) {
                    Ok(()) => moved += 1,
                    Err(e) => eprintln!(
                        "[SWAPDATA] warning: failed to move spent order to history: {e}"
                    ),
                }
            }
        }

        // Ingest new advertisements. An offer whose outpoint is consumed by
        // this same block goes straight to history: the open family only ever
        // reflects live UTXOs.
        let mut batch = StoreBatch::new();
        let mut indexed = 0usize;
        for tx in &block.txdata {
            for txout in &tx.output {
                let offer = match parse_swap_offer(&txout.script_pubkey, height) {
                    Some(o) => o,
                    None => continue,
                };
                if spent.contains(&offer.outpoint()) {
                    storage::stage_history_write(&mut batch, &offer)?;
                } else {
                    storage::stage_open_write(&mut batch, &offer)?;
                }
                indexed += 1;
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }

        if indexed > 0 || moved > 0 {
            eprintln!(
                "[SWAPDATA] block #{height}: {indexed} advertisements indexed, {moved} open orders spent"
            );
        }
        Ok(())
    }

    /// Undo a block's effects: spends it contained are restored to open, and
    /// advertisements it introduced are dropped from the open family. One
    /// merged batch, so no intermediate state is observable.
    pub fn disconnect_block(&self, block: &Block) -> Result<(), SwapIndexError> {
        let restored = collect_spent_outpoints(block);

        // Identities advertised by this block. There is no stored back-pointer
        // from an offer to its advertising block, but an open entry matching
        // one of these pairs was necessarily written by a block carrying such
        // an output, and the block being disconnected is one.
        let mut block_ads: HashSet<([u8; 32], [u8; 32])> = HashSet::new();
        for tx in &block.txdata {
            for txout in &tx.output {
                if let Some(ad) = parse_swap_offer(&txout.script_pubkey, 0) {
                    block_ads.insert((ad.token_id, ad.offered_utxo_hash));
                }
            }
        }

        let mut batch = StoreBatch::new();
        let mut reopened = 0usize;
        let mut removed = 0usize;

        if !restored.is_empty() {
            for (_, offer) in storage::scan_history_orders(self.store.as_ref())? {
                if !restored.contains(&offer.outpoint()) {
                    continue;
                }
                if block_ads.contains(&(offer.token_id, offer.offered_utxo_hash)) {
                    // Advertised and spent inside the block being undone:
                    // the whole identity disappears with it.
                    storage::stage_delete_history(&mut batch, &offer);
                    removed += 1;
                } else {
                    // block_height keeps the spend height; the original
                    // advertisement height is not recoverable here.
                    storage::stage_move_to_open(&mut batch, &offer)?;
                    reopened += 1;
                }
            }
        }

        if !block_ads.is_empty() {
            for (_, offer) in storage::scan_open_orders(self.store.as_ref())? {
                if block_ads.contains(&(offer.token_id, offer.offered_utxo_hash)) {
                    storage::stage_delete_open(&mut batch, &offer);
                    removed += 1;
                }
            }
        }

        if !batch.is_empty() {
            self.store.commit(batch)?;
        }
        eprintln!("[SWAPDATA] disconnected block: restored {reopened} orders, removed {removed} ads");
        Ok(())
    }

    /* ---------------- queries ---------------- */

    pub fn get_open_orders(&self, token_id: &[u8; 32], limit: usize, offset: usize) -> Vec<SwapOffer> {
        self.read_orders(DB_OPEN_ORDER, token_id, limit, offset)
    }

    pub fn get_history_orders(
        &self,
        token_id: &[u8; 32],
        limit: usize,
        offset: usize,
    ) -> Vec<SwapOffer> {
        self.read_orders(DB_HISTORY, token_id, limit, offset)
    }

    pub fn get_open_orders_by_want(
        &self,
        want_token_id: &[u8; 32],
        limit: usize,
        offset: usize,
    ) -> Vec<SwapOffer> {
        self.read_orders(DB_OPEN_WANT, want_token_id, limit, offset)
    }

    pub fn get_history_orders_by_want(
        &self,
        want_token_id: &[u8; 32],
        limit: usize,
        offset: usize,
    ) -> Vec<SwapOffer> {
        self.read_orders(DB_HISTORY_WANT, want_token_id, limit, offset)
    }

    pub fn get_counts(&self, token_id: &[u8; 32]) -> SwapOrderCounts {
        SwapOrderCounts {
            open_count: self.count_orders(DB_OPEN_ORDER, token_id),
            history_count: self.count_orders(DB_HISTORY, token_id),
        }
    }

    pub fn get_counts_by_want(&self, want_token_id: &[u8; 32]) -> SwapOrderCounts {
        SwapOrderCounts {
            open_count: self.count_orders(DB_OPEN_WANT, want_token_id),
            history_count: self.count_orders(DB_HISTORY_WANT, want_token_id),
        }
    }

    fn read_orders(
        &self,
        prefix: u8,
        key_hash: &[u8; 32],
        limit: usize,
        offset: usize,
    ) -> Vec<SwapOffer> {
        let limit = limit.min(MAX_SWAP_QUERY_LIMIT);
        match storage::read_swaps_with_prefix(self.store.as_ref(), prefix, key_hash, limit, offset)
        {
            Ok(orders) => orders,
            Err(e) => {
                eprintln!("[SWAPDATA] order query failed: {e}");
                Vec::new()
            }
        }
    }

    fn count_orders(&self, prefix: u8, key_hash: &[u8; 32]) -> usize {
        match storage::count_swaps_with_prefix(self.store.as_ref(), prefix, key_hash) {
            Ok(n) => n,
            Err(e) => {
                eprintln!("[SWAPDATA] order count failed: {e}");
                0
            }
        }
    }

    /* ---------------- transitions ---------------- */

    fn move_to_history(&self, offer: &SwapOffer) -> Result<(), SwapIndexError> {
        let mut batch = StoreBatch::new();
        storage::stage_move_to_history(&mut batch, offer)?;
        self.store.commit(batch)?;
        Ok(())
    }

    /* ---------------- pruning ---------------- */

    fn start_prune_thread(&self) {
        let mut slot = self.prune_thread.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let store = self.store.clone();
        let chain_tip = self.chain_tip.clone();
        let history_blocks = self.history_blocks;
        let interrupt = self.prune_interrupt.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("swap-prune".into())
            .spawn(move || prune_loop(store, chain_tip, history_blocks, interrupt, shutdown))
            .expect("failed to spawn swap prune thread");
        *slot = Some(handle);
    }
}

impl<S: IndexStore> Drop for SwapData<S> {
    fn drop(&mut self) {
        self.prune_interrupt.store(true, Ordering::Relaxed);
        if let Some(handle) = self.prune_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl<S: IndexStore + 'static> IndexModule for SwapData<S> {
    fn get_name(&self) -> &'static str {
        "swapdata"
    }

    fn init(&self) -> anyhow::Result<()> {
        SwapData::init(self)?;
        Ok(())
    }

    fn connect_block(&self, block: &Block, height: i32) -> anyhow::Result<()> {
        SwapData::connect_block(self, block, height)?;
        Ok(())
    }

    fn disconnect_block(&self, block: &Block) -> anyhow::Result<()> {
        SwapData::disconnect_block(self, block)?;
        Ok(())
    }

    fn register_rpc(&self, reg: &RpcRegistry) {
        rpc::register_rpc(reg.clone(), self.store.clone(), self.mempool.clone());
    }

    fn shutdown(&self) {
        SwapData::shutdown(self);
    }
}

fn collect_spent_outpoints(block: &Block) -> HashSet<OutPoint> {
    let mut spent = HashSet::new();
    for tx in &block.txdata {
        if tx.is_coinbase() {
            continue;
        }
        for txin in &tx.input {
            spent.insert(txin.previous_output);
        }
    }
    spent
}

/// Prune cycle body, also used directly by tests.
pub(crate) fn prune_history_older_than<S: IndexStore + ?Sized>(
    store: &S,
    cutoff_height: i32,
) -> Result<usize, SwapIndexError> {
    let keys = storage::collect_history_older_than(store, cutoff_height)?;
    if keys.is_empty() {
        return Ok(0);
    }
    let mut batch = StoreBatch::new();
    for key in &keys {
        batch.delete(key);
    }
    store.commit(batch)?;
    Ok(keys.len())
}

fn prune_loop<S: IndexStore + 'static>(
    store: Arc<S>,
    chain_tip: Arc<dyn ChainTipSource>,
    history_blocks: i64,
    interrupt: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    eprintln!("[SWAPDATA] prune thread started");
    let should_stop =
        || interrupt.load(Ordering::Relaxed) || shutdown.load(Ordering::Relaxed);

    'outer: loop {
        // Sleep in one-second steps so interrupts take effect promptly.
        for _ in 0..SWAP_PRUNE_INTERVAL_SECS {
            if should_stop() {
                break 'outer;
            }
            thread::sleep(Duration::from_secs(1));
        }
        if should_stop() {
            break;
        }

        let tip = chain_tip.current_tip_height();
        if tip <= 0 || history_blocks <= 0 {
            continue;
        }
        let cutoff = tip - history_blocks as i32;
        if cutoff <= 0 {
            continue;
        }

        match prune_history_older_than(store.as_ref(), cutoff) {
            Ok(0) => {}
            Ok(n) => eprintln!("[SWAPDATA] pruned {n} history entries below height {cutoff}"),
            Err(e) => eprintln!("[SWAPDATA] prune cycle failed: {e}"),
        }
    }
    eprintln!("[SWAPDATA] prune thread stopped");
}
