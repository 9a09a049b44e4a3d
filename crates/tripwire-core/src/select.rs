//! Coin-selection capability.
//!
//! The vault builder and the range estimator drive coin selection through the
//! [`CoinSelector`] trait; the optimizer behind it is replaceable. The
//! bundled [`LargestFirstSelector`] is deliberately simple: accumulate the
//! largest candidates until the targets and the fee are covered.
//!
//! Output-order contract: a selection keeps the requested outputs first, in
//! request order, and appends the change or drain output last.

use bitcoin::{Amount, ScriptBuf, TxOut};
use thiserror::Error;

use crate::fee::fee_for_vsize;
use crate::utxo::{CandidateUtxo, UtxosData};
use crate::weights::{estimate_vsize, P2WPKH_WITNESS_SIZE};

#[derive(Error, Debug)]
pub enum SelectError {
    /// No feasible input/output assignment exists. An expected business
    /// outcome (the wallet simply cannot fund this), not a fault.
    #[error("no feasible input/output assignment for the requested amounts")]
    Infeasible,

    #[error("candidate coin is malformed: {0}")]
    BadCandidate(String),
}

/// How the selection treats the candidate set.
#[derive(Debug, Clone)]
pub enum SelectionMode {
    /// Fund the fixed outputs exactly, returning change when it clears dust.
    Fund,
    /// Spend every candidate; the drain output absorbs whatever remains
    /// after the fixed outputs and the fee.
    Drain { drain_script: ScriptBuf },
}

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub candidates: UtxosData,
    /// Outputs the transaction must pay, change excluded.
    pub outputs: Vec<TxOut>,
    /// Script receiving change in [`SelectionMode::Fund`].
    pub change_script: ScriptBuf,
    /// Fee rate in sat/vB.
    pub fee_rate: f64,
    pub mode: SelectionMode,
}

/// A feasible input/output assignment.
#[derive(Debug, Clone)]
pub struct Selection {
    pub inputs: Vec<CandidateUtxo>,
    /// Requested outputs in order, then change/drain if any.
    pub outputs: Vec<TxOut>,
    pub fee: Amount,
    pub vsize: usize,
}

pub trait CoinSelector {
    fn select(&self, request: &SelectionRequest) -> Result<Selection, SelectError>;
}

/// Reference selector: sort candidates by value, largest first, and take
/// them until the targets and the fee are covered.
///
/// Candidate inputs are assumed P2WPKH-shaped for size estimation; a real
/// optimizer plugged in behind [`CoinSelector`] can do better.
#[derive(Debug, Clone, Default)]
pub struct LargestFirstSelector;

impl LargestFirstSelector {
    pub fn new() -> Self {
        Self
    }

    fn fund(&self, request: &SelectionRequest) -> Result<Selection, SelectError> {
        let target: Amount = request
            .outputs
            .iter()
            .fold(Amount::ZERO, |acc, o| acc + o.value);
        let mut fixed_lens: Vec<usize> = request
            .outputs
            .iter()
            .map(|o| o.script_pubkey.len())
            .collect();

        let mut sorted: Vec<CandidateUtxo> = request.candidates.0.clone();
        sorted.sort_by(|a, b| b.txout.value.cmp(&a.txout.value));

        let change_dust = request.change_script.minimal_non_dust();
        let mut selected: Vec<CandidateUtxo> = Vec::new();
        let mut total_in = Amount::ZERO;

        for candidate in sorted {
            total_in += candidate.txout.value;
            selected.push(candidate);
            let witnesses = vec![P2WPKH_WITNESS_SIZE; selected.len()];

            // Preferred: pay the targets and hand surplus back as change.
            fixed_lens.push(request.change_script.len());
            let vsize_with_change = estimate_vsize(&witnesses, &fixed_lens);
            fixed_lens.pop();
            let fee_with_change = fee_for_vsize(request.fee_rate, vsize_with_change);
            if let Some(change) = total_in.checked_sub(target + fee_with_change) {
                if change > change_dust {
                    let mut outputs = request.outputs.clone();
                    outputs.push(TxOut {
                        value: change,
                        script_pubkey: request.change_script.clone(),
                    });
                    return Ok(Selection {
                        inputs: selected,
                        outputs,
                        fee: fee_with_change,
                        vsize: vsize_with_change,
                    });
                }
            }

            // Otherwise a dust-sized surplus is surrendered to the miner.
            let vsize = estimate_vsize(&witnesses, &fixed_lens);
            let fee = fee_for_vsize(request.fee_rate, vsize);
            if total_in >= target + fee {
                return Ok(Selection {
                    inputs: selected,
                    outputs: request.outputs.clone(),
                    fee: total_in - target,
                    vsize,
                });
            }
        }

        Err(SelectError::Infeasible)
    }

    fn drain(
        &self,
        request: &SelectionRequest,
        drain_script: &ScriptBuf,
    ) -> Result<Selection, SelectError> {
        if request.candidates.is_empty() {
            return Err(SelectError::Infeasible);
        }

        let inputs = request.candidates.0.clone();
        let total_in = request.candidates.total_value();
        let fixed: Amount = request
            .outputs
            .iter()
            .fold(Amount::ZERO, |acc, o| acc + o.value);

        let witnesses = vec![P2WPKH_WITNESS_SIZE; inputs.len()];
        let mut lens: Vec<usize> = request
            .outputs
            .iter()
            .map(|o| o.script_pubkey.len())
            .collect();
        lens.push(drain_script.len());
        let vsize = estimate_vsize(&witnesses, &lens);
        let fee = fee_for_vsize(request.fee_rate, vsize);

        let drain_value = total_in
            .checked_sub(fixed + fee)
            .ok_or(SelectError::Infeasible)?;
        if drain_value <= drain_script.minimal_non_dust() {
            return Err(SelectError::Infeasible);
        }

        let mut outputs = request.outputs.clone();
        outputs.push(TxOut {
            value: drain_value,
            script_pubkey: drain_script.clone(),
        });

        Ok(Selection {
            inputs,
            outputs,
            fee,
            vsize,
        })
    }
}

impl CoinSelector for LargestFirstSelector {
    fn select(&self, request: &SelectionRequest) -> Result<Selection, SelectError> {
        match &request.mode {
            SelectionMode::Fund => self.fund(request),
            SelectionMode::Drain { drain_script } => self.drain(request, drain_script),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{OutPoint, Sequence, Transaction, TxIn, Witness};

    fn p2wpkh_like_script(tag: u8) -> ScriptBuf {
        // 22-byte v0 scripts, distinct per tag.
        ScriptBuf::from_bytes(
            [&[0x00, 0x14][..], &[tag; 20][..]].concat(),
        )
    }

    fn candidates(values: &[u64]) -> UtxosData {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: values
                .iter()
                .map(|v| TxOut {
                    value: Amount::from_sat(*v),
                    script_pubkey: p2wpkh_like_script(0xAA),
                })
                .collect(),
        };
        UtxosData::new(
            (0..values.len() as u32)
                .map(|i| CandidateUtxo::from_prev_tx(&tx, i).unwrap())
                .collect(),
        )
    }

    fn fund_request(values: &[u64], target: u64) -> SelectionRequest {
        SelectionRequest {
            candidates: candidates(values),
            outputs: vec![TxOut {
                value: Amount::from_sat(target),
                script_pubkey: p2wpkh_like_script(0xBB),
            }],
            change_script: p2wpkh_like_script(0xCC),
            fee_rate: 2.0,
            mode: SelectionMode::Fund,
        }
    }

    #[test]
    fn fund_returns_change() {
        let selection = LargestFirstSelector::new()
            .select(&fund_request(&[100_000, 5_000], 40_000))
            .unwrap();

        // The 100k coin alone covers target + fee.
        assert_eq!(selection.inputs.len(), 1);
        assert_eq!(selection.inputs[0].value(), Amount::from_sat(100_000));
        assert_eq!(selection.outputs.len(), 2);
        assert_eq!(selection.outputs[0].value, Amount::from_sat(40_000));

        let change = selection.outputs[1].value;
        assert_eq!(
            Amount::from_sat(100_000),
            Amount::from_sat(40_000) + change + selection.fee
        );
    }

    #[test]
    fn fund_accumulates_coins() {
        let selection = LargestFirstSelector::new()
            .select(&fund_request(&[30_000, 20_000, 10_000], 45_000))
            .unwrap();
        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.inputs[0].value(), Amount::from_sat(30_000));
        assert_eq!(selection.inputs[1].value(), Amount::from_sat(20_000));
    }

    #[test]
    fn fund_absorbs_dust_surplus_into_fee() {
        // 50_300 in, 50_000 target: surplus after fee is below dust, so it
        // all goes to the miner instead of creating a change output.
        let selection = LargestFirstSelector::new()
            .select(&fund_request(&[50_300], 50_000))
            .unwrap();
        assert_eq!(selection.outputs.len(), 1);
        assert_eq!(selection.fee, Amount::from_sat(300));
    }

    #[test]
    fn fund_infeasible_when_short() {
        let result = LargestFirstSelector::new().select(&fund_request(&[10_000], 50_000));
        assert!(matches!(result, Err(SelectError::Infeasible)));
    }

    #[test]
    fn drain_spends_everything() {
        let mut request = fund_request(&[60_000, 40_000], 0);
        request.outputs.clear();
        request.mode = SelectionMode::Drain {
            drain_script: p2wpkh_like_script(0xDD),
        };

        let selection = LargestFirstSelector::new().select(&request).unwrap();
        assert_eq!(selection.inputs.len(), 2);
        assert_eq!(selection.outputs.len(), 1);
        assert_eq!(
            selection.outputs[0].value + selection.fee,
            Amount::from_sat(100_000)
        );
    }

    #[test]
    fn drain_keeps_fixed_outputs_first() {
        let mut request = fund_request(&[60_000], 1_000);
        request.mode = SelectionMode::Drain {
            drain_script: p2wpkh_like_script(0xDD),
        };

        let selection = LargestFirstSelector::new().select(&request).unwrap();
        assert_eq!(selection.outputs.len(), 2);
        assert_eq!(selection.outputs[0].value, Amount::from_sat(1_000));
        assert_eq!(
            selection.outputs[1].value + selection.fee + Amount::from_sat(1_000),
            Amount::from_sat(60_000)
        );
    }

    #[test]
    fn drain_infeasible_without_candidates() {
        let mut request = fund_request(&[], 0);
        request.outputs.clear();
        request.mode = SelectionMode::Drain {
            drain_script: p2wpkh_like_script(0xDD),
        };
        assert!(matches!(
            LargestFirstSelector::new().select(&request),
            Err(SelectError::Infeasible)
        ));
    }

    #[test]
    fn drain_infeasible_when_drain_is_dust() {
        let mut request = fund_request(&[400], 0);
        request.outputs.clear();
        request.mode = SelectionMode::Drain {
            drain_script: p2wpkh_like_script(0xDD),
        };
        assert!(matches!(
            LargestFirstSelector::new().select(&request),
            Err(SelectError::Infeasible)
        ));
    }
}
