use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use borsh::{BorshDeserialize, BorshSerialize};

/// A parsed swap advertisement, as stored in the index (schema v2).
///
/// `block_height` is the height at which the offer was last indexed, or the
/// height at which its offered UTXO was spent once it reaches history.
#[derive(BorshSerialize, BorshDeserialize, PartialEq, Eq, Debug, Clone)]
pub struct SwapOffer {
    pub version: u8,
    pub flags: u8,
    pub offered_type: u8,
    pub terms_type: u8,
    pub token_id: [u8; 32],
    pub offered_utxo_hash: [u8; 32],
    pub offered_utxo_index: u32,
    pub price_terms: Vec<u8>,
    pub want_token_id: [u8; 32],
    pub signature: Vec<u8>,
    pub block_height: i32,
}

impl SwapOffer {
    /// A zero wanted token id means "no wanted side indexed".
    #[inline]
    pub fn has_want(&self) -> bool {
        self.want_token_id != [0u8; 32]
    }

    #[inline]
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array(self.offered_utxo_hash),
            vout: self.offered_utxo_index,
        }
    }
}

/// Pre-v2 stored form, read only during schema migration.
#[derive(BorshSerialize, BorshDeserialize, PartialEq, Eq, Debug, Clone)]
pub struct SwapOfferV1 {
    pub version: u8,
    pub offer_type: u8,
    pub token_id: [u8; 32],
    pub offered_utxo_hash: [u8; 32],
    pub offered_utxo_index: u32,
    pub price_terms: Vec<u8>,
    pub signature: Vec<u8>,
    pub block_height: i32,
}

impl SwapOfferV1 {
    /// Widen to the v2 schema. The fields v2 introduced are zeroed.
    pub fn widen(self) -> SwapOffer {
        SwapOffer {
            version: self.version,
            flags: 0,
            offered_type: 0,
            terms_type: 0,
            token_id: self.token_id,
            offered_utxo_hash: self.offered_utxo_hash,
            offered_utxo_index: self.offered_utxo_index,
            price_terms: self.price_terms,
            want_token_id: [0u8; 32],
            signature: self.signature,
            block_height: self.block_height,
        }
    }
}

/// Open/history tallies for one token, never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwapOrderCounts {
    pub open_count: usize,
    pub history_count: usize,
}
