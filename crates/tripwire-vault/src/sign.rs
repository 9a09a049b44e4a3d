//! Signer capability and sighash helpers.
//!
//! The builder signs the caller's coins through the injected [`Signer`];
//! the wallet's keys never pass through this crate. The vault and panic keys
//! are different: the builder generates them itself and signs with the
//! helpers below.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, CompressedPublicKey, Script, ScriptBuf, Transaction, TxOut, Witness};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignError {
    #[error("no key known for output script {0}")]
    UnknownScript(String),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error("signer backend failed: {0}")]
    Backend(String),
}

/// Produces a final witness for one input. Opaque to the core beyond
/// "yields a valid witness for this input".
pub trait Signer {
    fn sign_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prevout: &TxOut,
    ) -> Result<Witness, SignError>;
}

/// In-memory signer for wallets holding plain P2WPKH keys.
pub struct SoftwareSigner {
    secp: Secp256k1<All>,
    keys: HashMap<ScriptBuf, SecretKey>,
}

impl SoftwareSigner {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            keys: HashMap::new(),
        }
    }

    /// Register a key; coins paying its P2WPKH script become signable.
    pub fn add_key(&mut self, secret: SecretKey) {
        let pubkey = CompressedPublicKey(secret.public_key(&self.secp));
        let script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
        self.keys.insert(script, secret);
    }
}

impl Default for SoftwareSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl Signer for SoftwareSigner {
    fn sign_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prevout: &TxOut,
    ) -> Result<Witness, SignError> {
        let secret = self
            .keys
            .get(&prevout.script_pubkey)
            .ok_or_else(|| SignError::UnknownScript(prevout.script_pubkey.to_hex_string()))?;
        sign_p2wpkh(&self.secp, tx, input_index, prevout.value, secret)
    }
}

/// Sign a P2WPKH input and assemble its `[sig, pubkey]` witness.
pub fn sign_p2wpkh(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    value: Amount,
    secret: &SecretKey,
) -> Result<Witness, SignError> {
    let pubkey = CompressedPublicKey(secret.public_key(secp));
    let mut cache = SighashCache::new(tx);

    let sighash = cache
        .p2wpkh_signature_hash(
            input_index,
            &ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()),
            value,
            EcdsaSighashType::All,
        )
        .map_err(|e| SignError::Sighash(e.to_string()))?;

    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = bitcoin::ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, secret));

    Ok(Witness::from_slice(&[
        signature.to_vec(),
        pubkey.0.serialize().to_vec(),
    ]))
}

/// Sign a P2WSH input against its witness script; the caller assembles the
/// witness stack (the stack shape depends on the spending path).
pub fn sign_p2wsh(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: Amount,
    secret: &SecretKey,
) -> Result<bitcoin::ecdsa::Signature, SignError> {
    let mut cache = SighashCache::new(tx);

    let sighash = cache
        .p2wsh_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .map_err(|e| SignError::Sighash(e.to_string()))?;

    let msg = Message::from_digest(sighash.to_byte_array());
    Ok(bitcoin::ecdsa::Signature::sighash_all(
        secp.sign_ecdsa(&msg, secret),
    ))
}
