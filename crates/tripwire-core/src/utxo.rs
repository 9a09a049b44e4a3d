//! Candidate coins for vault funding.
//!
//! `UtxosData` is the slice of the caller's wallet that one vault may draw
//! from: an ordered list of spendable outputs together with the raw
//! transactions that created them. It is never mutated by the core, only
//! filtered and mapped.

use bitcoin::consensus::encode;
use bitcoin::{Amount, OutPoint, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtxoError {
    #[error("invalid transaction hex: {0}")]
    InvalidHex(String),

    #[error("output index {vout} out of range for transaction with {outputs} outputs")]
    VoutOutOfRange { vout: u32, outputs: usize },
}

/// One spendable output offered to coin selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateUtxo {
    /// Raw hex of the transaction that created this output.
    pub prev_tx_hex: String,
    /// Output index within that transaction.
    pub vout: u32,
    /// The spendable output itself.
    #[serde(with = "txout_serde")]
    pub txout: TxOut,
}

/// Serde helper for TxOut: satoshi value plus script hex.
mod txout_serde {
    use bitcoin::{Amount, ScriptBuf, TxOut};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct TxOutRepr {
        value: u64,
        script_pubkey: String,
    }

    pub fn serialize<S>(txout: &TxOut, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        TxOutRepr {
            value: txout.value.to_sat(),
            script_pubkey: txout.script_pubkey.to_hex_string(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TxOut, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = TxOutRepr::deserialize(deserializer)?;
        Ok(TxOut {
            value: Amount::from_sat(repr.value),
            script_pubkey: ScriptBuf::from_hex(&repr.script_pubkey)
                .map_err(serde::de::Error::custom)?,
        })
    }
}

impl CandidateUtxo {
    /// Build a candidate from a full previous transaction.
    pub fn from_prev_tx(prev_tx: &Transaction, vout: u32) -> Result<Self, UtxoError> {
        let txout = prev_tx
            .output
            .get(vout as usize)
            .ok_or(UtxoError::VoutOutOfRange {
                vout,
                outputs: prev_tx.output.len(),
            })?
            .clone();
        Ok(Self {
            prev_tx_hex: hex::encode(encode::serialize(prev_tx)),
            vout,
            txout,
        })
    }

    /// Decode the creating transaction from its stored hex.
    pub fn prev_tx(&self) -> Result<Transaction, UtxoError> {
        let bytes =
            hex::decode(&self.prev_tx_hex).map_err(|e| UtxoError::InvalidHex(e.to_string()))?;
        encode::deserialize(&bytes).map_err(|e| UtxoError::InvalidHex(e.to_string()))
    }

    /// The outpoint this candidate spends.
    pub fn outpoint(&self) -> Result<OutPoint, UtxoError> {
        Ok(OutPoint {
            txid: self.prev_tx()?.compute_txid(),
            vout: self.vout,
        })
    }

    pub fn value(&self) -> Amount {
        self.txout.value
    }
}

/// Ordered, immutable set of candidate coins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtxosData(pub Vec<CandidateUtxo>);

impl UtxosData {
    pub fn new(utxos: Vec<CandidateUtxo>) -> Self {
        Self(utxos)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandidateUtxo> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all candidate values.
    pub fn total_value(&self) -> Amount {
        self.0
            .iter()
            .fold(Amount::ZERO, |acc, u| acc + u.txout.value)
    }
}

impl From<Vec<CandidateUtxo>> for UtxosData {
    fn from(utxos: Vec<CandidateUtxo>) -> Self {
        Self(utxos)
    }
}
