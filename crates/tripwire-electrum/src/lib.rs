//! Tripwire Electrum Backend
//!
//! Implements the [`ChainQuery`] capability over the Electrum protocol:
//! script histories for spend discovery, full transactions for spender
//! classification, and header data for timelock tracking. Also exposes
//! transaction broadcast for pushing vault, trigger and panic transactions.
//!
//! # Security
//!
//! - Always use SSL/TLS connections (ssl:// or tcp+tls://)
//! - Validate all data received from the server
//! - Private keys never pass through this crate
//!
//! # Example
//!
//! ```ignore
//! use tripwire_electrum::{default_server, ElectrumChain};
//! use tripwire_core::ChainQuery;
//! use bitcoin::Network;
//!
//! let chain = ElectrumChain::new(default_server(Network::Bitcoin), Network::Bitcoin)?;
//! let height = chain.tip_height()?;
//! println!("Current block height: {}", height);
//! ```

use bitcoin::{BlockHash, Network, Script, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};
use thiserror::Error;

use tripwire_core::chain::{ChainError, ChainQuery, TxSummary};

// Re-export the raw client for direct usage
pub use electrum_client::Client as RawClient;

/// Errors from Electrum operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Electrum protocol error: {0}")]
    Protocol(#[from] ElectrumError),

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),
}

/// Electrum-backed chain access for vault tracking.
pub struct ElectrumChain {
    client: electrum_client::Client,
    network: Network,
}

impl ElectrumChain {
    /// Create a new Electrum chain backend.
    ///
    /// # Arguments
    /// * `url` - Electrum server URL (e.g., "ssl://electrum.blockstream.info:60002")
    /// * `network` - Bitcoin network (Mainnet, Testnet, Signet, Regtest)
    ///
    /// # Security
    /// Always use SSL URLs in production. Plaintext connections can be MITM'd.
    pub fn new(url: &str, network: Network) -> Result<Self, Error> {
        // Warn if not using SSL
        if !url.starts_with("ssl://") && !url.contains("tls") {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ElectrumError| Error::Connection(e.to_string()))?;

        Ok(Self { client, network })
    }

    /// Broadcast a signed transaction, returning its txid.
    pub fn broadcast(&self, tx: &Transaction) -> Result<Txid, Error> {
        self.client
            .transaction_broadcast(tx)
            .map_err(|e: ElectrumError| Error::BroadcastFailed(e.to_string()))
    }

    /// Get the network this backend is configured for
    pub fn network(&self) -> Network {
        self.network
    }
}

impl ChainQuery for ElectrumChain {
    fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        self.client
            .transaction_get(txid)
            .map_err(|_| ChainError::TxNotFound(*txid))
    }

    fn script_history(&self, script: &Script) -> Result<Vec<TxSummary>, ChainError> {
        let history = self
            .client
            .script_get_history(script)
            .map_err(|e| ChainError::Backend(e.to_string()))?;

        // Electrum reports mempool entries with height 0 (or -1 when a
        // parent is also unconfirmed); both collapse to "not confirmed".
        Ok(history
            .into_iter()
            .map(|item| TxSummary {
                txid: item.tx_hash,
                height: item.height.max(0) as u32,
            })
            .collect())
    }

    fn tip_height(&self) -> Result<u32, ChainError> {
        let header = self
            .client
            .block_headers_subscribe()
            .map_err(|e| ChainError::Backend(e.to_string()))?;
        Ok(header.height as u32)
    }

    fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError> {
        if height > self.tip_height()? {
            return Ok(None);
        }
        let header = self
            .client
            .block_header(height as usize)
            .map_err(|e| ChainError::Backend(e.to_string()))?;
        Ok(Some(header.block_hash()))
    }
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://electrum.blockstream.info:60004",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://electrum.blockstream.info:60002",
    }
}
