//! Vault construction.
//!
//! Builds the full pre-signed tree for one vault: the funding transaction,
//! one trigger per sampled fee rate and one panic per trigger per sampled
//! fee rate, `1 + S + S²` transactions in total. Mid-build state is never
//! observable: a build either returns a complete [`Vault`] or one of the
//! closed set of [`BuildError`] outcomes, and cancellation discards
//! everything.
//!
//! The builder runs on one logical thread of control. Its only suspension
//! points are the cooperative progress checks (every ten signatures) and
//! calls into the injected capabilities; callers must not run two builds
//! for the same vault concurrently.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, CompressedPublicKey, Network, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use miniscript::descriptor::{DefiniteDescriptorKey, DescriptorPublicKey};
use miniscript::Descriptor;
use rand::thread_rng;
use thiserror::Error;

use tripwire_core::fee::{fee_for_vsize, sample_rates};
use tripwire_core::select::{CoinSelector, SelectError, SelectionMode, SelectionRequest};
use tripwire_core::utxo::UtxosData;

use crate::estimate::split_transaction_amount;
use crate::model::{TriggerEntry, TxMeta, Vault};
use crate::policy::{LockBlocks, TriggerPolicy};
use crate::registry::VaultIdAllocator;
use crate::sign::{sign_p2wpkh, sign_p2wsh, Signer};
use crate::weights::{panic_vsize, trigger_vsize};

/// Signatures between two cooperative cancellation checks.
const PROGRESS_INTERVAL: usize = 10;

/// The closed set of build outcomes besides success.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Coin selection found no feasible input/output assignment.
    #[error("coin selection found no feasible assignment")]
    CoinSelect,

    /// A required output would fall to or below its dust threshold.
    #[error("not enough funds: {0}")]
    NotEnoughFunds(String),

    /// The caller's progress callback asked to stop.
    #[error("build cancelled by caller")]
    UserCancel,

    /// Anything unexpected. The cause is logged for diagnosis but never
    /// becomes vault state.
    #[error("vault construction failed unexpectedly: {0}")]
    Unknown(anyhow::Error),
}

/// Everything one build needs besides the injected capabilities.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Total transaction amount to lock; the service cut comes out of it
    /// per the split rule.
    pub amount: Amount,
    /// Key gating the delayed unvault path.
    pub unvault_key: PublicKey,
    /// Number of fee-rate grid points (S).
    pub samples: usize,
    /// Fee rate for the vault transaction and the grid floor, sat/vB.
    pub fee_rate: f64,
    /// Service fee in basis points of the total amount; 0 disables it.
    pub service_fee_rate: u32,
    /// Grid ceiling: the highest rate a trigger/panic pair is pre-signed for.
    pub fee_rate_ceiling: f64,
    /// Pre-committed recovery destination for panic transactions.
    pub cold_address: Address,
    /// Descriptor whose index-0 script receives vault-tx change.
    pub change_descriptor: Descriptor<DescriptorPublicKey>,
    pub service_address: Address,
    pub lock_blocks: LockBlocks,
    /// Candidate coins; never mutated.
    pub coins: UtxosData,
}

/// Assembles pre-signed vault trees from injected capabilities.
pub struct VaultBuilder<'a> {
    network: Network,
    selector: &'a dyn CoinSelector,
    signer: &'a dyn Signer,
    allocator: &'a dyn VaultIdAllocator,
}

/// Cooperative progress/cancellation bookkeeping.
struct Progress<'a> {
    done: usize,
    total: usize,
    since_checkpoint: usize,
    on_progress: &'a mut dyn FnMut(f64) -> bool,
}

impl<'a> Progress<'a> {
    fn new(total: usize, on_progress: &'a mut dyn FnMut(f64) -> bool) -> Self {
        Self {
            done: 0,
            total: total.max(1),
            since_checkpoint: 0,
            on_progress,
        }
    }

    fn checkpoint(&mut self) -> Result<(), BuildError> {
        self.since_checkpoint = 0;
        if (self.on_progress)(self.done as f64 / self.total as f64) {
            Ok(())
        } else {
            Err(BuildError::UserCancel)
        }
    }

    fn signed(&mut self) -> Result<(), BuildError> {
        self.done += 1;
        self.since_checkpoint += 1;
        if self.since_checkpoint >= PROGRESS_INTERVAL {
            self.checkpoint()
        } else {
            Ok(())
        }
    }
}

impl<'a> VaultBuilder<'a> {
    pub fn new(
        network: Network,
        selector: &'a dyn CoinSelector,
        signer: &'a dyn Signer,
        allocator: &'a dyn VaultIdAllocator,
    ) -> Self {
        Self {
            network,
            selector,
            signer,
            allocator,
        }
    }

    /// Build the complete tree and allocate the vault's identity.
    ///
    /// `on_progress` is polled with `done/total` before the first signature
    /// and after every ten; returning `false` aborts with
    /// [`BuildError::UserCancel`] and nothing of the build survives.
    pub fn build(
        &self,
        request: &BuildRequest,
        on_progress: &mut dyn FnMut(f64) -> bool,
    ) -> Result<Vault, BuildError> {
        let result = self.build_inner(request, on_progress);
        if let Err(BuildError::Unknown(cause)) = &result {
            // The typed outcome carries no detail; the log is where the
            // original cause goes for diagnosis.
            log::error!("unexpected vault build failure: {:#}", cause);
        }
        result
    }

    fn build_inner(
        &self,
        request: &BuildRequest,
        on_progress: &mut dyn FnMut(f64) -> bool,
    ) -> Result<Vault, BuildError> {
        let secp = Secp256k1::new();

        // Fresh single-key lock for the vault stage.
        let vault_secret = SecretKey::new(&mut thread_rng());
        let vault_pubkey = CompressedPublicKey(vault_secret.public_key(&secp));
        let vault_script = ScriptBuf::new_p2wpkh(&vault_pubkey.wpubkey_hash());
        let vault_address = Address::p2wpkh(&vault_pubkey, self.network);

        let service_script = request.service_address.script_pubkey();
        let cold_script = request.cold_address.script_pubkey();

        let split = split_transaction_amount(
            request.amount,
            request.service_fee_rate,
            &service_script,
            &vault_script,
        );
        if split.vaulted <= vault_script.minimal_non_dust() {
            return Err(BuildError::NotEnoughFunds(
                "vault output would not clear dust after fees".into(),
            ));
        }

        let change_script = derive_change_script(&request.change_descriptor)?;

        let mut outputs = vec![TxOut {
            value: split.vaulted,
            script_pubkey: vault_script.clone(),
        }];
        if split.service_fee > Amount::ZERO {
            outputs.push(TxOut {
                value: split.service_fee,
                script_pubkey: service_script,
            });
        }

        let selection = self
            .selector
            .select(&SelectionRequest {
                candidates: request.coins.clone(),
                outputs,
                change_script,
                fee_rate: request.fee_rate,
                mode: SelectionMode::Fund,
            })
            .map_err(|e| match e {
                SelectError::Infeasible => BuildError::CoinSelect,
                other => BuildError::Unknown(anyhow::Error::new(other)),
            })?;

        let rates = sample_rates(
            request.fee_rate,
            request.fee_rate_ceiling,
            request.samples,
            true,
        )
        .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;
        let samples = rates.len();

        let total_signatures = selection.inputs.len() + samples + samples * samples;
        let mut progress = Progress::new(total_signatures, on_progress);
        // A build cancelled at the very first poll signs nothing at all.
        progress.checkpoint()?;

        // ── Vault transaction ────────────────────────────────────────────
        let inputs = selection
            .inputs
            .iter()
            .map(|c| {
                Ok(TxIn {
                    previous_output: c
                        .outpoint()
                        .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>, BuildError>>()?;

        let mut vault_tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: selection.outputs.clone(),
        };
        for (index, candidate) in selection.inputs.iter().enumerate() {
            let witness = self
                .signer
                .sign_input(&vault_tx, index, &candidate.txout)
                .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;
            vault_tx.input[index].witness = witness;
            progress.signed()?;
        }

        let vault_txid = vault_tx.compute_txid();
        let vault_tx_hex = hex::encode(encode::serialize(&vault_tx));
        // Selection keeps requested outputs first: the vault output is vout 0.
        let vault_vout = 0u32;

        let mut tx_map = HashMap::new();
        tx_map.insert(
            vault_tx_hex.clone(),
            TxMeta {
                txid: vault_txid,
                fee: selection.fee,
                fee_rate: request.fee_rate,
            },
        );

        // ── Trigger policy, compiled once ────────────────────────────────
        let panic_secret = SecretKey::new(&mut thread_rng());
        let panic_pubkey = PublicKey::new(panic_secret.public_key(&secp));
        let policy = TriggerPolicy::compile(panic_pubkey, request.unvault_key, request.lock_blocks)
            .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;
        let trigger_script = policy.script_pubkey();
        let trigger_dust = trigger_script.minimal_non_dust();
        let cold_dust = cold_script.minimal_non_dust();

        // ── Triggers: one per sampled rate ───────────────────────────────
        let mut trigger_map: Vec<TriggerEntry> = Vec::with_capacity(samples);
        let mut trigger_refs: Vec<(Txid, Amount)> = Vec::with_capacity(samples);

        for &rate in &rates {
            let fee = fee_for_vsize(rate, trigger_vsize());
            let value = split
                .vaulted
                .checked_sub(fee)
                .filter(|v| *v > trigger_dust)
                .ok_or_else(|| {
                    BuildError::NotEnoughFunds(format!(
                        "trigger output would not clear dust at {} sat/vB",
                        rate
                    ))
                })?;

            let mut tx = Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: vec![TxIn {
                    previous_output: OutPoint {
                        txid: vault_txid,
                        vout: vault_vout,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                }],
                output: vec![TxOut {
                    value,
                    script_pubkey: trigger_script.clone(),
                }],
            };
            let witness = sign_p2wpkh(&secp, &tx, 0, split.vaulted, &vault_secret)
                .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;
            tx.input[0].witness = witness;
            progress.signed()?;

            let txid = tx.compute_txid();
            let tx_hex = hex::encode(encode::serialize(&tx));
            tx_map.insert(
                tx_hex.clone(),
                TxMeta {
                    txid,
                    fee,
                    fee_rate: rate,
                },
            );
            trigger_refs.push((txid, value));
            trigger_map.push(TriggerEntry {
                trigger_tx_hex: tx_hex,
                panic_tx_hexes: Vec::new(),
            });
        }

        // ── Panics: one per trigger per sampled rate ─────────────────────
        let ws_len = policy.witness_script().len();
        let mut min_panic_balance = Amount::MAX_MONEY;

        for (entry, (trigger_txid, trigger_value)) in trigger_map.iter_mut().zip(&trigger_refs) {
            for &rate in &rates {
                let fee = fee_for_vsize(rate, panic_vsize(ws_len, cold_script.len()));
                let value = trigger_value
                    .checked_sub(fee)
                    .filter(|v| *v > cold_dust)
                    .ok_or_else(|| {
                        BuildError::NotEnoughFunds(format!(
                            "panic output would not clear dust at {} sat/vB",
                            rate
                        ))
                    })?;

                let mut tx = Transaction {
                    version: Version::TWO,
                    lock_time: LockTime::ZERO,
                    input: vec![TxIn {
                        previous_output: OutPoint {
                            txid: *trigger_txid,
                            vout: 0,
                        },
                        script_sig: ScriptBuf::new(),
                        sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                        witness: Witness::new(),
                    }],
                    output: vec![TxOut {
                        value,
                        script_pubkey: cold_script.clone(),
                    }],
                };
                let signature = sign_p2wsh(
                    &secp,
                    &tx,
                    0,
                    policy.witness_script(),
                    *trigger_value,
                    &panic_secret,
                )
                .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;
                tx.input[0].witness = policy.panic_witness(&signature);
                progress.signed()?;

                let tx_hex = hex::encode(encode::serialize(&tx));
                tx_map.insert(
                    tx_hex.clone(),
                    TxMeta {
                        txid: tx.compute_txid(),
                        fee,
                        fee_rate: rate,
                    },
                );
                entry.panic_tx_hexes.push(tx_hex);
                min_panic_balance = min_panic_balance.min(value);
            }
        }
        progress.checkpoint()?;

        // Sampling guarantees at least the ceiling-rate panic fit once the
        // loops above succeeded; an empty ladder here is a bug, not bad input.
        assert!(
            trigger_map.iter().all(|e| !e.panic_tx_hexes.is_empty()),
            "trigger entry without panic ladder"
        );

        let (vault_id, vault_path) = self
            .allocator
            .allocate()
            .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;

        let trigger_address = policy
            .address(self.network)
            .map_err(|e| BuildError::Unknown(anyhow::Error::new(e)))?;

        log::info!(
            "built vault {} ({} transactions, min panic balance {})",
            vault_id,
            tx_map.len(),
            min_panic_balance
        );

        Ok(Vault {
            vault_id,
            vault_path,
            amount: request.amount,
            vault_address: vault_address.to_string(),
            trigger_address: trigger_address.to_string(),
            cold_address: request.cold_address.to_string(),
            fee_rate_ceiling: request.fee_rate_ceiling,
            lock_blocks: request.lock_blocks.blocks(),
            vault_tx_hex,
            tx_map,
            trigger_map,
            min_panic_balance,
            unvault_key: request.unvault_key,
            trigger_descriptor: policy.descriptor_string(),
            created_at: current_timestamp(),
        })
    }
}

fn derive_change_script(
    descriptor: &Descriptor<DescriptorPublicKey>,
) -> Result<ScriptBuf, BuildError> {
    let derived: Descriptor<DefiniteDescriptorKey> = descriptor
        .at_derivation_index(0)
        .map_err(|e| BuildError::Unknown(anyhow::anyhow!("invalid change descriptor: {}", e)))?;
    Ok(derived.script_pubkey())
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
