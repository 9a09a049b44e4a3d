//! Tripwire Watch
//!
//! Reconstructs vault state purely by walking chain data: has the vault been
//! triggered, panicked, or spent normally, and how many timelock blocks
//! remain. The tracker holds no network code of its own: it sees the chain
//! through the [`ChainQuery`] capability and answers afresh each poll, so
//! callers own the retry policy.
//!
//! The tracker may run concurrently across distinct vaults (it is a pure
//! function over chain queries plus the injected cache), but status merges
//! for one vault must be serialized by the caller.

pub mod cache;
pub mod candidates;

pub use cache::{CachedSpend, SpendCache};
pub use candidates::{spendable_triggers, watchtower_candidates, SpendableTrigger, WatchtowerCandidate};

use bitcoin::consensus::encode;
use bitcoin::{Address, OutPoint, Script, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tripwire_core::chain::{ChainError, ChainQuery};
use tripwire_vault::{Vault, VaultStatus};

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("chain query failed: {0}")]
    Chain(#[from] ChainError),

    #[error("vault record is malformed: {0}")]
    BadVault(String),
}

/// Tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Confirmations after which an observed spend is permanent and never
    /// re-queried. Six is the conventional reorg-safety bound; regtest
    /// tests want one.
    #[serde(default = "default_confirmations")]
    pub confirmations_for_irreversible: u32,
}

fn default_confirmations() -> u32 {
    6
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            confirmations_for_irreversible: default_confirmations(),
        }
    }
}

/// Where one vault stands relative to its timelock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingBlocks {
    /// No trigger observed on chain.
    NotPushed,
    /// Panicked or hot-spent; the countdown is over for good.
    Spent,
    /// Blocks until the unvault path opens; 0 means spendable now.
    Blocks(u32),
}

/// Blocks left before the unvault path of `vault` opens.
///
/// While the trigger sits in the mempool the full timelock still applies.
/// Once confirmed at height `h`, the path opens after `lock_blocks`
/// confirmations, the trigger's own block included (hence the `- 1`).
pub fn remaining_blocks(vault: &Vault, status: &VaultStatus, chain_tip: u32) -> RemainingBlocks {
    if status.is_terminal() {
        return RemainingBlocks::Spent;
    }
    match (&status.trigger_tx_hex, status.trigger_tx_height) {
        (None, _) => RemainingBlocks::NotPushed,
        (Some(_), None) | (Some(_), Some(0)) => RemainingBlocks::Blocks(vault.lock_blocks as u32),
        (Some(_), Some(height)) => {
            let remaining =
                vault.lock_blocks as i64 - (chain_tip as i64 - height as i64) - 1;
            RemainingBlocks::Blocks(remaining.max(0) as u32)
        }
    }
}

/// Determines vault stages by walking the chain.
pub struct VaultStatusTracker<'a> {
    chain: &'a dyn ChainQuery,
    config: TrackerConfig,
}

impl<'a> VaultStatusTracker<'a> {
    pub fn new(chain: &'a dyn ChainQuery, config: TrackerConfig) -> Self {
        Self { chain, config }
    }

    /// Re-derive a vault's status from chain data.
    ///
    /// Looks up what spent the vault output (the trigger, if anything) and,
    /// if found, what spent the trigger output, classified as panic when
    /// the spender's hex appears in that trigger's panic ladder, hot-spend
    /// otherwise. Stages only move forward; local push timestamps in
    /// `prior` pass through untouched.
    pub fn fetch_vault_status(
        &self,
        vault: &Vault,
        prior: &VaultStatus,
        cache: &mut SpendCache,
    ) -> Result<VaultStatus, TrackError> {
        let mut status = prior.clone();
        if status.vault_id.is_empty() {
            status.vault_id = vault.vault_id.clone();
        }

        let vault_tx = decode_tx(&vault.vault_tx_hex)?;
        let vault_txid = vault_tx.compute_txid();
        let vault_script = address_script(&vault.vault_address)?;
        let vault_vout = vault_tx
            .output
            .iter()
            .position(|o| o.script_pubkey == vault_script)
            .ok_or_else(|| {
                TrackError::BadVault("vault transaction pays nothing to the vault address".into())
            })? as u32;

        // Stage 1: what spent the vault output?
        if !status.is_terminal() {
            let outpoint = OutPoint {
                txid: vault_txid,
                vout: vault_vout,
            };
            if let Some(spend) = self.lookup_spend(cache, &outpoint, &vault_script, &vault_txid)? {
                if status.trigger_tx_hex.as_deref() != Some(spend.tx_hex.as_str()) {
                    log::info!(
                        "vault {}: trigger {} observed at height {}",
                        vault.vault_id,
                        spend.txid,
                        spend.height
                    );
                }
                status.trigger_tx_hex = Some(spend.tx_hex);
                status.trigger_tx_height = Some(spend.height);
            }
        }

        // Stage 2: what spent the trigger output?
        if let Some(trigger_hex) = status.trigger_tx_hex.clone() {
            let trigger_tx = decode_tx(&trigger_hex)?;
            let trigger_txid = trigger_tx.compute_txid();
            let trigger_script = trigger_tx
                .output
                .first()
                .ok_or_else(|| TrackError::BadVault("trigger transaction has no output".into()))?
                .script_pubkey
                .clone();
            let outpoint = OutPoint {
                txid: trigger_txid,
                vout: 0,
            };

            if let Some(spend) =
                self.lookup_spend(cache, &outpoint, &trigger_script, &trigger_txid)?
            {
                let is_panic = vault
                    .panics_for(&trigger_hex)
                    .map_or(false, |panics| panics.iter().any(|p| p == &spend.tx_hex));
                if is_panic {
                    if status.panic_tx_hex.is_none() {
                        log::info!("vault {}: panic {} observed", vault.vault_id, spend.txid);
                    }
                    status.panic_tx_hex = Some(spend.tx_hex);
                    status.panic_tx_height = Some(spend.height);
                } else {
                    if status.spend_as_hot_tx_hex.is_none() {
                        log::info!("vault {}: hot spend {} observed", vault.vault_id, spend.txid);
                    }
                    status.spend_as_hot_tx_hex = Some(spend.tx_hex);
                    status.spend_as_hot_tx_height = Some(spend.height);
                }
            }
        }

        debug_assert!(status.invariants_hold());
        Ok(status)
    }

    /// Find the transaction spending `outpoint`, walking the script's
    /// history. Irreversible cache entries short-circuit the chain round
    /// trip; anything shallower is re-queried so heights can move (mempool
    /// to block, or across a reorg).
    fn lookup_spend(
        &self,
        cache: &mut SpendCache,
        outpoint: &OutPoint,
        script: &Script,
        funding_txid: &Txid,
    ) -> Result<Option<CachedSpend>, TrackError> {
        if let Some(hit) = cache.get(outpoint) {
            if hit.irreversible {
                return Ok(Some(hit.clone()));
            }
        }

        let tip = self.chain.tip_height()?;
        let history = self.chain.script_history(script)?;
        for item in &history {
            // Skip the transaction that funded the outpoint itself.
            if item.txid == *funding_txid {
                continue;
            }
            let tx = self.chain.transaction(&item.txid)?;
            if tx.input.iter().any(|i| i.previous_output == *outpoint) {
                let confirmations = if item.height == 0 || item.height > tip {
                    0
                } else {
                    tip - item.height + 1
                };
                let spend = CachedSpend {
                    tx_hex: hex::encode(encode::serialize(&tx)),
                    txid: item.txid,
                    height: item.height,
                    irreversible: confirmations >= self.config.confirmations_for_irreversible,
                };
                cache.insert(*outpoint, spend.clone());
                return Ok(Some(spend));
            }
        }
        Ok(None)
    }
}

fn decode_tx(tx_hex: &str) -> Result<Transaction, TrackError> {
    let bytes = hex::decode(tx_hex)
        .map_err(|e| TrackError::BadVault(format!("invalid transaction hex: {}", e)))?;
    encode::deserialize(&bytes)
        .map_err(|e| TrackError::BadVault(format!("invalid transaction: {}", e)))
}

fn address_script(address: &str) -> Result<ScriptBuf, TrackError> {
    // Addresses in a Vault record were written by our own builder; the
    // network was checked at creation time.
    let parsed: Address<bitcoin::address::NetworkUnchecked> = address
        .parse()
        .map_err(|e| TrackError::BadVault(format!("invalid address: {}", e)))?;
    Ok(parsed.assume_checked().script_pubkey())
}
