//! Trigger policy compilation.
//!
//! The trigger output carries `or(pk(panic), and(pk(unvault), older(N)))`:
//! the panic key wins immediately, the unvault key has to wait out the
//! relative timelock. That wait is the owner's window to notice coercion
//! and broadcast a panic. The policy is compiled exactly once per vault;
//! the compiled witness script, not the policy text, is what output
//! construction and panic-path signing share.
//!
//! For this policy shape the compiler deterministically produces
//! `or_d(pk(panic), and_v(v:pk(unvault), older(N)))`, whose script is
//!
//! ```text
//! <panic> CHECKSIG IFDUP NOTIF <unvault> CHECKSIGVERIFY <N> CSV ENDIF
//! ```
//!
//! with two witness stacks: `[sig, script]` for the panic path and
//! `[sig, <empty>, script]` (plus input sequence = N) for the unvault path.

use std::sync::Arc;

use bitcoin::{Address, Network, PublicKey, ScriptBuf, Sequence, Witness};
use miniscript::policy::Concrete;
use miniscript::{Descriptor, Miniscript, RelLockTime, Segwitv0};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("lock must be at least one block, got {0}")]
    InvalidLock(u32),

    #[error("miniscript error: {0}")]
    Miniscript(#[from] miniscript::Error),

    #[error("policy compilation failed: {0}")]
    Compilation(String),
}

/// Relative-timelock length in blocks (~10 min each) gating the unvault path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBlocks(u16);

impl LockBlocks {
    pub fn from_blocks(blocks: u16) -> Result<Self, PolicyError> {
        if blocks == 0 {
            return Err(PolicyError::InvalidLock(blocks as u32));
        }
        Ok(Self(blocks))
    }

    /// One day (~144 blocks), a common default for mobile duress setups.
    pub fn one_day() -> Self {
        Self(144)
    }

    pub fn blocks(self) -> u16 {
        self.0
    }

    /// Sequence value enforcing this lock via CSV on the unvault input.
    pub fn to_sequence(self) -> Sequence {
        Sequence::from_height(self.0)
    }
}

/// Compiled trigger policy for one vault.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    descriptor: Descriptor<PublicKey>,
    witness_script: ScriptBuf,
    lock: LockBlocks,
}

impl TriggerPolicy {
    /// Compile `or(pk(panic), and(pk(unvault), older(lock)))` to a wsh
    /// descriptor. Called once per vault; every trigger output and every
    /// panic signature reuses the result.
    pub fn compile(
        panic_key: PublicKey,
        unvault_key: PublicKey,
        lock: LockBlocks,
    ) -> Result<Self, PolicyError> {
        let policy = Concrete::Or(vec![
            (1, Arc::new(Concrete::Key(panic_key))),
            (
                1,
                Arc::new(Concrete::And(vec![
                    Arc::new(Concrete::Key(unvault_key)),
                    Arc::new(Concrete::Older(RelLockTime::from_height(lock.blocks()))),
                ])),
            ),
        ]);

        let ms: Miniscript<PublicKey, Segwitv0> = policy
            .compile()
            .map_err(|e| PolicyError::Compilation(e.to_string()))?;
        let descriptor = Descriptor::new_wsh(ms)?;
        let witness_script = descriptor.explicit_script()?;

        Ok(Self {
            descriptor,
            witness_script,
            lock,
        })
    }

    /// The wsh output script the trigger transaction pays to.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.descriptor.script_pubkey()
    }

    pub fn address(&self, network: Network) -> Result<Address, PolicyError> {
        Ok(self.descriptor.address(network)?)
    }

    pub fn descriptor_string(&self) -> String {
        self.descriptor.to_string()
    }

    /// The compiled inner script, shared by output construction and signing.
    pub fn witness_script(&self) -> &ScriptBuf {
        &self.witness_script
    }

    pub fn lock(&self) -> LockBlocks {
        self.lock
    }

    /// Witness for the immediate panic path: `[sig, witness_script]`.
    pub fn panic_witness(&self, signature: &bitcoin::ecdsa::Signature) -> Witness {
        Witness::from_slice(&[signature.to_vec(), self.witness_script.to_bytes()])
    }

    /// Witness for the delayed unvault path: `[sig, <empty>, witness_script]`.
    /// The spending input must also carry `lock.to_sequence()`.
    pub fn unvault_witness(&self, signature: &bitcoin::ecdsa::Signature) -> Witness {
        Witness::from_slice(&[
            signature.to_vec(),
            Vec::new(),
            self.witness_script.to_bytes(),
        ])
    }
}

/// Serialized length of the compiled witness script, computable before any
/// key exists: two 33-byte key pushes, five one-byte opcodes, and the
/// minimally-encoded lock push.
pub fn estimated_witness_script_len(lock: LockBlocks) -> usize {
    34 + 1 + 1 + 1 + 34 + 1 + script_int_len(lock.blocks()) + 1 + 1
}

/// Bytes a minimal script push of `value` occupies, push opcode included.
fn script_int_len(value: u16) -> usize {
    match value {
        1..=16 => 1,              // OP_1..OP_16
        17..=127 => 2,            // one data byte
        128..=32_767 => 3,        // two data bytes
        _ => 4,                   // three data bytes (sign bit forces a third)
    }
}
