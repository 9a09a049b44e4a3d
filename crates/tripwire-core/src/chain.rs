//! Chain-query capability.
//!
//! Status tracking never talks to a node directly; it walks the chain
//! through this trait. The Electrum backend lives in `tripwire-electrum`,
//! mocks live in tests. The core never retries a failed query; the caller
//! polls afresh.

use bitcoin::{BlockHash, Script, Transaction, Txid};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain backend error: {0}")]
    Backend(String),

    #[error("transaction not found: {0}")]
    TxNotFound(Txid),
}

/// One entry of a script's transaction history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    pub txid: Txid,
    /// Confirmation height, 0 while the transaction sits in the mempool.
    pub height: u32,
}

pub trait ChainQuery {
    /// Fetch a full transaction by id.
    fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError>;

    /// Every transaction funding or spending `script`, mempool included.
    fn script_history(&self, script: &Script) -> Result<Vec<TxSummary>, ChainError>;

    /// Current chain tip height.
    fn tip_height(&self) -> Result<u32, ChainError>;

    /// Hash of the block at `height`, or `None` past the tip.
    fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError>;
}
