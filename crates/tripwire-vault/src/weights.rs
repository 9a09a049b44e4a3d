//! Trigger and panic transaction sizes.
//!
//! Both the builder (with the real compiled script) and the estimator (with
//! the predicted script length, before any key exists) price trigger and
//! panic transactions through the same formulas, so their fee math cannot
//! drift apart.

use bitcoin::Amount;
use tripwire_core::fee::fee_for_vsize;
use tripwire_core::weights::{estimate_vsize, P2WPKH_WITNESS_SIZE};

use crate::policy::{estimated_witness_script_len, LockBlocks};

/// Length of a v0 P2WSH output script (the trigger output).
pub const P2WSH_SCRIPT_LEN: usize = 34;

/// Serialized witness bytes of the panic path: item count, a 73-byte DER
/// signature (incl. sighash flag) with its push prefix, and the witness
/// script with its prefix.
pub fn panic_witness_size(witness_script_len: usize) -> usize {
    1 + 74 + 1 + witness_script_len
}

/// Virtual size of a trigger transaction: one P2WPKH input (the vault
/// output) paying one P2WSH output.
pub fn trigger_vsize() -> usize {
    estimate_vsize(&[P2WPKH_WITNESS_SIZE], &[P2WSH_SCRIPT_LEN])
}

/// Virtual size of a panic transaction: one P2WSH input (the trigger
/// output) paying the cold script.
pub fn panic_vsize(witness_script_len: usize, cold_script_len: usize) -> usize {
    estimate_vsize(&[panic_witness_size(witness_script_len)], &[cold_script_len])
}

/// Combined trigger + panic fee if both have to be broadcast at the ceiling
/// rate: the worst the recovery chain can cost the owner.
pub fn worst_case_recovery_fees(
    fee_rate_ceiling: f64,
    lock: LockBlocks,
    cold_script_len: usize,
) -> Amount {
    let trigger_fee = fee_for_vsize(fee_rate_ceiling, trigger_vsize());
    let panic_fee = fee_for_vsize(
        fee_rate_ceiling,
        panic_vsize(estimated_witness_script_len(lock), cold_script_len),
    );
    trigger_fee + panic_fee
}
