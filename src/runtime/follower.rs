use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash};
use bitcoincore_rpc::RpcApi;

use crate::modules::defs::{ChainTipSource, ModuleRegistry};
use crate::runtime::store::{IndexStore, StoreBatch};

/// How many recent block hashes we retain; doubles as the maximum reorg
/// depth the follower can unwind.
pub const REORG_DEPTH: i32 = 100;

const KEY_TIP: &[u8] = b"/tip";
const KEY_HASH: &[u8] = b"/hash/";

fn hash_key(height: i32) -> Vec<u8> {
    let mut k = KEY_HASH.to_vec();
    k.extend_from_slice(&(height as u32).to_be_bytes());
    k
}

/// Shared view of chain progress: the node tip we last observed (what the
/// pruner keys its cutoff on) and the height the index has consumed.
pub struct TipTracker {
    node_tip: AtomicI32,
    indexed: AtomicI32,
}

impl TipTracker {
    pub fn new() -> Self {
        Self { node_tip: AtomicI32::new(-1), indexed: AtomicI32::new(-1) }
    }

    pub fn set_node_tip(&self, height: i32) {
        self.node_tip.store(height, Ordering::Relaxed);
    }

    pub fn set_indexed(&self, height: i32) {
        self.indexed.store(height, Ordering::Relaxed);
    }

    pub fn indexed_height(&self) -> i32 {
        self.indexed.load(Ordering::Relaxed)
    }
}

impl Default for TipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainTipSource for TipTracker {
    fn current_tip_height(&self) -> i32 {
        self.node_tip.load(Ordering::Relaxed)
    }
}

/// Where blocks come from. The production source is a node's JSON-RPC
/// interface; tests script their own chains.
pub trait BlockSource: Send + Sync {
    fn tip_height(&self) -> Result<i32>;
    fn block_hash(&self, height: i32) -> Result<BlockHash>;
    fn block(&self, hash: &BlockHash) -> Result<Block>;
}

impl BlockSource for bitcoincore_rpc::Client {
    fn tip_height(&self) -> Result<i32> {
        Ok(self.get_block_count()? as i32)
    }

    fn block_hash(&self, height: i32) -> Result<BlockHash> {
        Ok(self.get_block_hash(height as u64)?)
    }

    fn block(&self, hash: &BlockHash) -> Result<Block> {
        Ok(self.get_block(hash)?)
    }
}

/// Polls the block source and keeps every registered module in lockstep with
/// the active chain: connect toward the tip, disconnect when the recorded
/// hash chain stops matching.
pub struct ChainFollower<S: IndexStore> {
    store: Arc<S>,
    modules: Arc<ModuleRegistry>,
    source: Arc<dyn BlockSource>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
    tracker: Arc<TipTracker>,
}

impl<S: IndexStore> ChainFollower<S> {
    pub fn new(
        store: Arc<S>,
        modules: Arc<ModuleRegistry>,
        source: Arc<dyn BlockSource>,
        poll_interval: Duration,
        shutdown: Arc<AtomicBool>,
        tracker: Arc<TipTracker>,
    ) -> Self {
        Self { store, modules, source, poll_interval, shutdown, tracker }
    }

    /// Blocking loop; runs until the shutdown flag is set.
    pub fn run(&self) {
        eprintln!("[FOLLOWER] chain follower started");
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.sync_once() {
                eprintln!("[FOLLOWER] sync error: {e:#}");
            }
            let mut slept = Duration::ZERO;
            while slept < self.poll_interval && !self.shutdown.load(Ordering::Relaxed) {
                let step = Duration::from_millis(250).min(self.poll_interval - slept);
                thread::sleep(step);
                slept += step;
            }
        }
        eprintln!("[FOLLOWER] chain follower stopped");
    }

    /// One catch-up pass: unwind any mismatching tip blocks, then advance to
    /// the node tip. Returns whether any block was applied.
    pub fn sync_once(&self) -> Result<bool> {
        let node_tip = self.source.tip_height()?;
        self.tracker.set_node_tip(node_tip);

        let mut local = self.load_local_height()?;
        let mut progressed = false;

        while local < node_tip && !self.shutdown.load(Ordering::Relaxed) {
            let next = local + 1;
            let next_hash = self.source.block_hash(next)?;
            let block = self.source.block(&next_hash)?;

            if local >= 0 {
                if let Some(prev) = self.stored_hash(local)? {
                    if block.header.prev_blockhash != prev {
                        self.disconnect_tip(local)?;
                        local -= 1;
                        progressed = true;
                        continue;
                    }
                }
            }

            self.modules.connect_block(&block, next)?;

            let mut batch = StoreBatch::new();
            batch.put(&hash_key(next), next_hash.as_byte_array());
            batch.put(KEY_TIP, &next.to_le_bytes());
            let stale = next - REORG_DEPTH;
            if stale >= 0 {
                batch.delete(&hash_key(stale));
            }
            self.store.commit(batch)?;

            self.tracker.set_indexed(next);
            local = next;
            progressed = true;
        }

        Ok(progressed)
    }

    fn disconnect_tip(&self, height: i32) -> Result<()> {
        let hash = self
            .stored_hash(height)?
            .with_context(|| format!("reorg past the stored hash window at height {height}"))?;
        let block = self.source.block(&hash)?;

        self.modules.disconnect_block(&block)?;

        let mut batch = StoreBatch::new();
        batch.delete(&hash_key(height));
        batch.put(KEY_TIP, &(height - 1).to_le_bytes());
        self.store.commit(batch)?;

        self.tracker.set_indexed(height - 1);
        eprintln!("[FOLLOWER] disconnected block #{height} ({hash})");
        Ok(())
    }

    fn load_local_height(&self) -> Result<i32> {
        match self.store.get(KEY_TIP)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .context("invalid /tip cell length")?;
                Ok(i32::from_le_bytes(arr))
            }
            None => Ok(-1),
        }
    }

    fn stored_hash(&self, height: i32) -> Result<Option<BlockHash>> {
        match self.store.get(&hash_key(height))? {
            Some(bytes) => {
                let arr: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .context("invalid stored block hash length")?;
                Ok(Some(BlockHash::from_byte_array(arr)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::defs::{IndexModule, RpcRegistry};
    use crate::runtime::store::MemStore;
    use bitcoin::{CompactTarget, TxMerkleNode};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn mk_block(prev: BlockHash, nonce: u32) -> Block {
        Block {
            header: bitcoin::block::Header {
                version: bitcoin::block::Version::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0),
                nonce,
            },
            txdata: vec![],
        }
    }

    struct FakeSource {
        active: Mutex<Vec<Block>>,
        all: Mutex<HashMap<BlockHash, Block>>,
    }

    impl FakeSource {
        fn new(chain: Vec<Block>) -> Self {
            let all = chain.iter().map(|b| (b.block_hash(), b.clone())).collect();
            Self { active: Mutex::new(chain), all: Mutex::new(all) }
        }

        fn switch_chain(&self, chain: Vec<Block>) {
            let mut all = self.all.lock().unwrap();
            for b in &chain {
                all.insert(b.block_hash(), b.clone());
            }
            *self.active.lock().unwrap() = chain;
        }
    }

    impl BlockSource for FakeSource {
        fn tip_height(&self) -> Result<i32> {
            Ok(self.active.lock().unwrap().len() as i32 - 1)
        }

        fn block_hash(&self, height: i32) -> Result<BlockHash> {
            let active = self.active.lock().unwrap();
            active
                .get(height as usize)
                .map(|b| b.block_hash())
                .context("height beyond fake tip")
        }

        fn block(&self, hash: &BlockHash) -> Result<Block> {
            self.all.lock().unwrap().get(hash).cloned().context("unknown fake block")
        }
    }

    #[derive(Debug, PartialEq)]
    enum Ev {
        Connect(i32, BlockHash),
        Disconnect(BlockHash),
    }

    struct Recorder {
        events: Arc<Mutex<Vec<Ev>>>,
    }

    impl IndexModule for Recorder {
        fn get_name(&self) -> &'static str {
            "recorder"
        }

        fn init(&self) -> Result<()> {
            Ok(())
        }

        fn connect_block(&self, block: &Block, height: i32) -> Result<()> {
            self.events.lock().unwrap().push(Ev::Connect(height, block.block_hash()));
            Ok(())
        }

        fn disconnect_block(&self, block: &Block) -> Result<()> {
            self.events.lock().unwrap().push(Ev::Disconnect(block.block_hash()));
            Ok(())
        }

        fn register_rpc(&self, _reg: &RpcRegistry) {}

        fn shutdown(&self) {}
    }

    fn follower_with(
        source: Arc<FakeSource>,
    ) -> (ChainFollower<MemStore>, Arc<Mutex<Vec<Ev>>>, Arc<TipTracker>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        registry.register_module(Recorder { events: events.clone() });
        let tracker = Arc::new(TipTracker::new());
        let follower = ChainFollower::new(
            Arc::new(MemStore::new()),
            Arc::new(registry),
            source,
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
            tracker.clone(),
        );
        (follower, events, tracker)
    }

    #[test]
    fn follows_a_linear_chain() {
        let g = mk_block(BlockHash::all_zeros(), 0);
        let a1 = mk_block(g.block_hash(), 1);
        let a2 = mk_block(a1.block_hash(), 2);
        let source = Arc::new(FakeSource::new(vec![g.clone(), a1.clone(), a2.clone()]));
        let (follower, events, tracker) = follower_with(source);

        assert!(follower.sync_once().unwrap());
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Ev::Connect(0, g.block_hash()),
                Ev::Connect(1, a1.block_hash()),
                Ev::Connect(2, a2.block_hash()),
            ]
        );
        assert_eq!(tracker.indexed_height(), 2);
        assert_eq!(tracker.current_tip_height(), 2);

        // Nothing new: no further events.
        assert!(!follower.sync_once().unwrap());
        assert_eq!(events.lock().unwrap().len(), 3);
    }

    #[test]
    fn unwinds_a_reorg_and_follows_the_new_branch() {
        let g = mk_block(BlockHash::all_zeros(), 0);
        let a1 = mk_block(g.block_hash(), 1);
        let a2 = mk_block(a1.block_hash(), 2);
        let source = Arc::new(FakeSource::new(vec![g.clone(), a1.clone(), a2.clone()]));
        let (follower, events, tracker) = follower_with(source.clone());

        follower.sync_once().unwrap();
        events.lock().unwrap().clear();

        // Competing branch from height 2 onward wins.
        let b2 = mk_block(a1.block_hash(), 102);
        let b3 = mk_block(b2.block_hash(), 103);
        source.switch_chain(vec![g.clone(), a1.clone(), b2.clone(), b3.clone()]);

        follower.sync_once().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Ev::Disconnect(a2.block_hash()),
                Ev::Connect(2, b2.block_hash()),
                Ev::Connect(3, b3.block_hash()),
            ]
        );
        assert_eq!(tracker.indexed_height(), 3);
    }
}
