pub mod config;
pub mod modules;
pub mod runtime;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitcoincore_rpc::Auth;

use crate::modules::defs::{ModuleRegistry, NullMempool};
use crate::modules::swapdata::main::SwapData;
use crate::runtime::follower::{ChainFollower, TipTracker};
use crate::runtime::mdb::Mdb;
use crate::runtime::store::{IndexStore, MemStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config()?;
    let cfg = config::get_config();

    if cfg.in_memory {
        eprintln!("[swapindex] running with an in-memory store");
        run(Arc::new(MemStore::new()), Arc::new(MemStore::new())).await
    } else {
        let db_path = config::swapindex_db_path();
        let swap_mdb = Mdb::open(&db_path, b"")?;
        let follower_mdb = Mdb::from_db(swap_mdb.db_handle(), b"F:");
        run(Arc::new(swap_mdb), Arc::new(follower_mdb)).await
    }
}

async fn run<S: IndexStore + 'static>(
    swap_store: Arc<S>,
    follower_store: Arc<S>,
) -> anyhow::Result<()> {
    let cfg = config::get_config();
    let shutdown = Arc::new(AtomicBool::new(false));
    let tracker = Arc::new(TipTracker::new());

    let swap = SwapData::new(
        swap_store,
        cfg.history_blocks,
        tracker.clone(),
        Arc::new(NullMempool),
        shutdown.clone(),
    );

    let mut registry = ModuleRegistry::new();
    registry.register_module(swap);
    registry.init_all()?;
    let registry = Arc::new(registry);

    let auth = match (&cfg.node_rpc_user, &cfg.node_rpc_pass) {
        (Some(user), Some(pass)) => Auth::UserPass(user.clone(), pass.clone()),
        _ => Auth::None,
    };
    let client = bitcoincore_rpc::Client::new(&cfg.node_rpc_url, auth)?;

    let follower = ChainFollower::new(
        follower_store,
        registry.clone(),
        Arc::new(client),
        Duration::from_millis(cfg.poll_ms as u64),
        shutdown.clone(),
        tracker.clone(),
    );
    let follower_handle = std::thread::Builder::new()
        .name("chain-follower".into())
        .spawn(move || follower.run())?;

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let rpc = runtime::rpc::run_rpc(registry.router.clone(), tracker.clone(), addr);

    tokio::select! {
        res = rpc => {
            if let Err(e) = res {
                eprintln!("[rpc] server error: {e:#}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[swapindex] shutdown requested");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    registry.shutdown_all();
    if follower_handle.join().is_err() {
        eprintln!("[FOLLOWER] thread panicked during shutdown");
    }
    Ok(())
}
