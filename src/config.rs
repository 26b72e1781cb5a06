use anyhow::Result;
use clap::Parser;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use crate::modules::swapdata::consts::DEFAULT_SWAP_HISTORY_BLOCKS;

static CONFIG: OnceLock<CliArgs> = OnceLock::new();

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Data directory; the index database lives at <datadir>/indexes/swapindex.
    #[arg(short, long, default_value = "./data")]
    pub datadir: String,

    /// Node JSON-RPC endpoint, e.g. http://127.0.0.1:7332
    #[arg(short, long)]
    pub node_rpc_url: String,

    #[arg(long)]
    pub node_rpc_user: Option<String>,

    #[arg(long)]
    pub node_rpc_pass: Option<String>,

    /// Milliseconds between chain polls.
    #[arg(short = 'i', long, default_value_t = 5000)]
    pub poll_ms: u16,

    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// Blocks of history retained before the pruner deletes old entries.
    /// Zero disables pruning.
    #[arg(long, default_value_t = DEFAULT_SWAP_HISTORY_BLOCKS)]
    pub history_blocks: i64,

    /// Keep the whole index in memory instead of RocksDB (development only;
    /// nothing survives a restart).
    #[arg(long, default_value_t = false)]
    pub in_memory: bool,
}

pub fn init_config() -> Result<()> {
    let args = CliArgs::parse();

    // --- validations ---
    if args.poll_ms == 0 {
        anyhow::bail!("poll_ms must be greater than 0");
    }
    if args.history_blocks < 0 {
        anyhow::bail!("history_blocks must be non-negative");
    }

    if !args.in_memory {
        let db_dir = db_path_for(&args.datadir);
        if !db_dir.exists() {
            fs::create_dir_all(&db_dir).map_err(|e| {
                anyhow::anyhow!("Failed to create index directory {}: {e}", db_dir.display())
            })?;
        } else if !db_dir.is_dir() {
            anyhow::bail!("Index path is not a directory: {}", db_dir.display());
        }
    }

    CONFIG
        .set(args)
        .map_err(|_| anyhow::anyhow!("config already initialized"))?;

    Ok(())
}

pub fn get_config() -> &'static CliArgs {
    CONFIG.get().expect("init_config() must be called once at startup")
}

fn db_path_for(datadir: &str) -> PathBuf {
    Path::new(datadir).join("indexes").join("swapindex")
}

pub fn swapindex_db_path() -> PathBuf {
    db_path_for(&get_config().datadir)
}
