//! Tripwire Core
//!
//! Shared building blocks for the Tripwire vault stack:
//!
//! - Fee-rate grids and integer fee arithmetic
//! - Candidate coins (the slice of the wallet relevant to one vault)
//! - The coin-selection capability trait plus a reference selector
//! - The chain-query capability trait used by status tracking
//!
//! Everything here is pure and network-free; backends live in sibling crates.

pub mod chain;
pub mod fee;
pub mod select;
pub mod utxo;
pub mod weights;

pub use chain::{ChainError, ChainQuery, TxSummary};
pub use fee::{fee_for_vsize, sample_rates, FeeError};
pub use select::{
    CoinSelector, LargestFirstSelector, SelectError, Selection, SelectionMode, SelectionRequest,
};
pub use utxo::{CandidateUtxo, UtxosData};
