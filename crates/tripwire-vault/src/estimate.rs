//! Vault amount range estimation.
//!
//! Before a vault is built, the wallet needs to know which total amounts are
//! even possible: the maximum the current coins can fund at a fee rate, and
//! the minimum that still leaves the owner a guaranteed share after a
//! worst-case trigger + panic at the fee ceiling.
//!
//! All amounts are integer satoshis. Ratios (service fee, recoverable share)
//! are basis points so that every multiplication stays in integer arithmetic
//! with explicit rounding: round-half-up for service fees, ceiling for miner
//! fees and the recoverability bound.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, Script, ScriptBuf, TxOut, WPubkeyHash};
use thiserror::Error;

use tripwire_core::fee::fee_for_vsize;
use tripwire_core::select::{CoinSelector, SelectError, SelectionMode, SelectionRequest};
use tripwire_core::utxo::UtxosData;
use tripwire_core::weights::{estimate_vsize, P2WPKH_WITNESS_SIZE};

use crate::policy::LockBlocks;
use crate::weights::worst_case_recovery_fees;

/// Iteration budget for the minimum-amount search. Fixed rather than
/// convergence-based: the feasibility predicate is not perfectly monotonic,
/// and 50 halvings cover any satoshi range.
const SEARCH_BUDGET: usize = 50;

const BPS_DENOMINATOR: u128 = 10_000;

#[derive(Error, Debug)]
pub enum EstimateError {
    /// The coin set cannot fund any vault under the requested constraints.
    /// An expected business outcome, not a fault.
    #[error("coin set cannot fund a vault under the requested constraints")]
    Infeasible,

    /// The chosen vaulted amount lies outside the precomputed envelope.
    /// This is caller misuse, distinct from [`EstimateError::Infeasible`].
    #[error("vaulted amount {amount} outside [{min}, {max}]")]
    AmountOutOfRange {
        amount: Amount,
        min: Amount,
        max: Amount,
    },

    #[error("invalid estimation parameter: {0}")]
    InvalidParameter(String),
}

/// The authoritative total → (vaulted, service) decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountSplit {
    pub vaulted: Amount,
    pub service_fee: Amount,
}

/// A feasible point of the vault-amount range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultAmountEstimate {
    pub vaulted: Amount,
    pub service_fee: Amount,
    /// Total spendable amount consumed: `vaulted + service_fee`.
    pub transaction_amount: Amount,
    /// Miner fee of the funding transaction.
    pub fee: Amount,
}

/// `round(total × rate)` in basis points, half-up, without overflow.
fn round_bps(total: Amount, bps: u32) -> Amount {
    let product = total.to_sat() as u128 * bps as u128;
    Amount::from_sat(((product + BPS_DENOMINATOR / 2) / BPS_DENOMINATOR) as u64)
}

/// `ceil(numerator / denominator)` over satoshi amounts.
fn ceil_div(numerator: u128, denominator: u128) -> u64 {
    ((numerator + denominator - 1) / denominator) as u64
}

/// Split a total spendable amount into its vault and service parts.
///
/// This is the one-directional, authoritative mapping: the service fee is
/// `max(dust + 1, round(rate × total))`, degenerating to zero whenever it
/// would push the vault output itself to or under dust. The reverse mapping
/// (from a chosen vaulted amount) has no exact inverse; see
/// [`RangeEstimator::estimate_service_fee`].
pub fn split_transaction_amount(
    total: Amount,
    service_fee_rate_bps: u32,
    service_script: &Script,
    vault_script: &Script,
) -> AmountSplit {
    if service_fee_rate_bps == 0 {
        return AmountSplit {
            vaulted: total,
            service_fee: Amount::ZERO,
        };
    }

    let floor = service_script.minimal_non_dust() + Amount::from_sat(1);
    let service_fee = round_bps(total, service_fee_rate_bps).max(floor);

    match total.checked_sub(service_fee) {
        Some(vaulted) if vaulted > vault_script.minimal_non_dust() => AmountSplit {
            vaulted,
            service_fee,
        },
        // Too small to carry a service output: the whole total is vaulted.
        _ => AmountSplit {
            vaulted: total,
            service_fee: Amount::ZERO,
        },
    }
}

/// Computes the feasible vault-amount range for a coin set.
pub struct RangeEstimator<'a> {
    selector: &'a dyn CoinSelector,
    /// Where panic transactions would send funds; prices the worst case.
    cold_script: ScriptBuf,
    /// Where the service fee would go.
    service_script: ScriptBuf,
    /// Script receiving vault-tx change.
    change_script: ScriptBuf,
}

impl<'a> RangeEstimator<'a> {
    pub fn new(
        selector: &'a dyn CoinSelector,
        cold_script: ScriptBuf,
        service_script: ScriptBuf,
        change_script: ScriptBuf,
    ) -> Self {
        Self {
            selector,
            cold_script,
            service_script,
            change_script,
        }
    }

    /// The vault output's shape is fixed (P2WPKH of a key that does not
    /// exist yet), so a placeholder script stands in for dust and weight.
    fn vault_script_template() -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&WPubkeyHash::all_zeros())
    }

    /// Largest vault the coins can fund at `fee_rate`.
    ///
    /// With a service fee the total depends circularly on itself (the fee is
    /// a share of the total being selected), so this runs two passes: drain
    /// with a minimal placeholder service output, derive the true total,
    /// split it, and re-run with the corrected service value. Output weights
    /// are identical in both passes, so the selection is stable.
    pub fn estimate_max_vault_amount(
        &self,
        coins: &UtxosData,
        fee_rate: f64,
        service_fee_rate_bps: u32,
    ) -> Result<VaultAmountEstimate, EstimateError> {
        let vault_template = Self::vault_script_template();

        if service_fee_rate_bps == 0 {
            let selection = self.drain(coins, fee_rate, None, &vault_template)?;
            let vaulted = selection.outputs.last().expect("drain output").value;
            return Ok(VaultAmountEstimate {
                vaulted,
                service_fee: Amount::ZERO,
                transaction_amount: vaulted,
                fee: selection.fee,
            });
        }

        // Pass one: placeholder service output, minimal value.
        let placeholder = self.service_script.minimal_non_dust() + Amount::from_sat(1);
        let first = self.drain(coins, fee_rate, Some(placeholder), &vault_template)?;
        let drained = first.outputs.last().expect("drain output").value;
        let total = drained + placeholder;

        let split =
            split_transaction_amount(total, service_fee_rate_bps, &self.service_script, &vault_template);
        if split.service_fee == Amount::ZERO {
            // The corrected split dropped the service output; re-price
            // without it rather than keep a stale placeholder weight.
            let selection = self.drain(coins, fee_rate, None, &vault_template)?;
            let vaulted = selection.outputs.last().expect("drain output").value;
            return Ok(VaultAmountEstimate {
                vaulted,
                service_fee: Amount::ZERO,
                transaction_amount: vaulted,
                fee: selection.fee,
            });
        }

        // Pass two: corrected service value, unchanged weights.
        let second = self.drain(coins, fee_rate, Some(split.service_fee), &vault_template)?;
        let vaulted = second.outputs.last().expect("drain output").value;
        debug_assert_eq!(vaulted + split.service_fee, total);

        Ok(VaultAmountEstimate {
            vaulted,
            service_fee: split.service_fee,
            transaction_amount: total,
            fee: second.fee,
        })
    }

    /// Smallest total that keeps at least `min_recoverable_ratio_bps` of the
    /// vaulted value after a worst-case trigger + panic at the ceiling rate.
    ///
    /// Searches downward from the known maximum with a bounded binary
    /// search. If no amount the coins can fund satisfies the guarantee, a
    /// conservative closed-form estimate is returned instead, priced as if
    /// one additional plain-key input were added later.
    pub fn estimate_min_recoverable_vault_amount(
        &self,
        coins: &UtxosData,
        fee_rate: f64,
        fee_rate_ceiling: f64,
        min_recoverable_ratio_bps: u32,
        lock_blocks: LockBlocks,
        service_fee_rate_bps: u32,
    ) -> Result<VaultAmountEstimate, EstimateError> {
        if min_recoverable_ratio_bps >= BPS_DENOMINATOR as u32 {
            return Err(EstimateError::InvalidParameter(format!(
                "recoverable ratio {} bps leaves no room for fees",
                min_recoverable_ratio_bps
            )));
        }

        let worst = worst_case_recovery_fees(fee_rate_ceiling, lock_blocks, self.cold_script.len());
        let required_vaulted = Amount::from_sat(ceil_div(
            worst.to_sat() as u128 * BPS_DENOMINATOR,
            BPS_DENOMINATOR - min_recoverable_ratio_bps as u128,
        ));

        let max = self.estimate_max_vault_amount(coins, fee_rate, service_fee_rate_bps)?;

        let recoverable = |total: Amount| -> Option<VaultAmountEstimate> {
            self.check_recoverable(coins, fee_rate, service_fee_rate_bps, required_vaulted, total)
        };

        let mut best = match recoverable(max.transaction_amount) {
            Some(estimate) => estimate,
            None => {
                log::debug!(
                    "no fundable amount is recoverable; falling back to the one-more-coin estimate"
                );
                return Ok(self.approximate_with_extra_input(
                    coins,
                    fee_rate,
                    service_fee_rate_bps,
                    required_vaulted,
                ));
            }
        };

        // Bounded search for the lowest total where the predicate holds.
        let vault_template = Self::vault_script_template();
        let mut lo = (vault_template.minimal_non_dust() + Amount::from_sat(1)).to_sat();
        let mut hi = best.transaction_amount.to_sat();
        for _ in 0..SEARCH_BUDGET {
            if lo >= hi {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            match recoverable(Amount::from_sat(mid)) {
                Some(estimate) => {
                    best = estimate;
                    hi = mid;
                }
                None => lo = mid + 1,
            }
        }

        Ok(best)
    }

    /// The feasibility-and-recoverability predicate for one candidate total.
    fn check_recoverable(
        &self,
        coins: &UtxosData,
        fee_rate: f64,
        service_fee_rate_bps: u32,
        required_vaulted: Amount,
        total: Amount,
    ) -> Option<VaultAmountEstimate> {
        let vault_template = Self::vault_script_template();
        let split =
            split_transaction_amount(total, service_fee_rate_bps, &self.service_script, &vault_template);
        if split.vaulted <= vault_template.minimal_non_dust() {
            return None;
        }

        let mut outputs = vec![TxOut {
            value: split.vaulted,
            script_pubkey: vault_template,
        }];
        if split.service_fee > Amount::ZERO {
            outputs.push(TxOut {
                value: split.service_fee,
                script_pubkey: self.service_script.clone(),
            });
        }

        let selection = self
            .selector
            .select(&SelectionRequest {
                candidates: coins.clone(),
                outputs,
                change_script: self.change_script.clone(),
                fee_rate,
                mode: SelectionMode::Fund,
            })
            .ok()?;

        if split.vaulted < required_vaulted {
            return None;
        }

        Some(VaultAmountEstimate {
            vaulted: split.vaulted,
            service_fee: split.service_fee,
            transaction_amount: total,
            fee: selection.fee,
        })
    }

    /// Conservative estimate when the current coins cannot reach the
    /// guarantee: assume one more plain-key coin will fund the difference.
    /// Non-optimal by design: it prices the extra input at full weight and
    /// approximates the service share from the vaulted amount.
    fn approximate_with_extra_input(
        &self,
        coins: &UtxosData,
        fee_rate: f64,
        service_fee_rate_bps: u32,
        required_vaulted: Amount,
    ) -> VaultAmountEstimate {
        let vault_template = Self::vault_script_template();

        let service_fee = if service_fee_rate_bps == 0 {
            Amount::ZERO
        } else {
            // service ≈ vaulted × rate / (1 - rate), then the usual floor.
            let approx = Amount::from_sat(
                (required_vaulted.to_sat() as u128 * service_fee_rate_bps as u128
                    / (BPS_DENOMINATOR - service_fee_rate_bps as u128)) as u64,
            );
            approx.max(self.service_script.minimal_non_dust() + Amount::from_sat(1))
        };

        let witnesses = vec![P2WPKH_WITNESS_SIZE; coins.len() + 1];
        let mut lens = vec![vault_template.len()];
        if service_fee > Amount::ZERO {
            lens.push(self.service_script.len());
        }
        lens.push(self.change_script.len());
        let fee = fee_for_vsize(fee_rate, estimate_vsize(&witnesses, &lens));

        VaultAmountEstimate {
            vaulted: required_vaulted,
            service_fee,
            transaction_amount: required_vaulted + service_fee,
            fee,
        }
    }

    /// Approximate the service fee for a user-chosen vaulted amount strictly
    /// inside the [min, max] envelope.
    ///
    /// The forward split maps totals, not vaulted amounts, and dust/rounding
    /// make it non-bijective, so this is an approximation by construction:
    /// `round(rate × vaulted)` clamped to the fees of the envelope itself.
    pub fn estimate_service_fee(
        &self,
        vaulted: Amount,
        min_estimate: &VaultAmountEstimate,
        max_estimate: &VaultAmountEstimate,
        service_fee_rate_bps: u32,
    ) -> Result<Amount, EstimateError> {
        if vaulted < min_estimate.vaulted || vaulted > max_estimate.vaulted {
            return Err(EstimateError::AmountOutOfRange {
                amount: vaulted,
                min: min_estimate.vaulted,
                max: max_estimate.vaulted,
            });
        }

        let smallest = min_estimate.service_fee.min(max_estimate.service_fee);
        let largest = min_estimate.service_fee.max(max_estimate.service_fee);
        Ok(round_bps(vaulted, service_fee_rate_bps).clamp(smallest, largest))
    }

    fn drain(
        &self,
        coins: &UtxosData,
        fee_rate: f64,
        service_value: Option<Amount>,
        drain_script: &ScriptBuf,
    ) -> Result<tripwire_core::select::Selection, EstimateError> {
        let outputs = service_value
            .map(|value| {
                vec![TxOut {
                    value,
                    script_pubkey: self.service_script.clone(),
                }]
            })
            .unwrap_or_default();

        self.selector
            .select(&SelectionRequest {
                candidates: coins.clone(),
                outputs,
                change_script: self.change_script.clone(),
                fee_rate,
                mode: SelectionMode::Drain {
                    drain_script: drain_script.clone(),
                },
            })
            .map_err(|e| match e {
                SelectError::Infeasible => EstimateError::Infeasible,
                SelectError::BadCandidate(msg) => EstimateError::InvalidParameter(msg),
            })
    }
}
