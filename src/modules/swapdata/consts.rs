/// Key prefixes for the swap index database
pub const DB_OPEN_ORDER: u8 = b'o'; // Open (active) orders
pub const DB_HISTORY: u8 = b'h'; // Historical (spent/cancelled) orders
pub const DB_OPEN_WANT: u8 = b'p'; // Open orders indexed by want_token_id
pub const DB_HISTORY_WANT: u8 = b'q'; // Historical orders indexed by want_token_id
pub const DB_VERSION: u8 = b'V'; // Index version marker
pub const DB_LEGACY: u8 = b's'; // Legacy prefix (for migration)

/// Schema version written to the version cell after migrations run.
pub const SWAP_SCHEMA_VERSION: u8 = 2;

/// Protocol tag opening every swap advertisement payload.
pub const RSWP_TAG: [u8; 4] = *b"RSWP";

/// Offer flag bit: a wanted token id follows the offered token id.
pub const FLAG_HAS_WANT: u8 = 0x01;

pub const DEFAULT_SWAP_QUERY_LIMIT: usize = 100;
pub const MAX_SWAP_QUERY_LIMIT: usize = 1000;

/// Ceiling on a single count scan so a huge run cannot stall a query.
pub const MAX_SWAP_COUNT_ITERATIONS: usize = 1_000_000;

/// ~35 days at 5 min blocks
pub const DEFAULT_SWAP_HISTORY_BLOCKS: i64 = 10_000;

/// Seconds between prune cycles.
pub const SWAP_PRUNE_INTERVAL_SECS: u64 = 60;
