//! Vault data model.
//!
//! A [`Vault`] is created exactly once by the builder and never mutated
//! afterwards; its [`VaultStatus`] starts empty at push time and only moves
//! forward as the tracker observes the chain. Both shapes round-trip
//! losslessly through serde; where they are stored is the caller's concern.

use std::collections::HashMap;
use std::str::FromStr;

use bitcoin::{Amount, PublicKey, Txid};
use serde::{Deserialize, Serialize};

/// Serde helper for Amount, as plain satoshis.
mod amount_serde {
    use bitcoin::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(amount.to_sat())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sats = u64::deserialize(deserializer)?;
        Ok(Amount::from_sat(sats))
    }
}

/// Serde helper for types with FromStr/Display string forms.
macro_rules! string_serde {
    ($mod_name:ident, $type:ty) => {
        mod $mod_name {
            use super::*;
            use serde::{Deserializer, Serializer};

            pub fn serialize<S>(value: &$type, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&value.to_string())
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<$type, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                <$type>::from_str(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(pubkey_serde, PublicKey);

/// Fee metadata for one produced transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxMeta {
    pub txid: Txid,
    #[serde(with = "amount_serde")]
    pub fee: Amount,
    /// Fee rate this variant was built for, sat/vB.
    pub fee_rate: f64,
}

/// One trigger variant and its panic ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerEntry {
    pub trigger_tx_hex: String,
    /// Panic variants spending this trigger, in sampled-rate order.
    pub panic_tx_hexes: Vec<String>,
}

/// A fully built vault: the pre-signed transaction tree plus everything
/// needed to watch and spend it. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub vault_id: String,
    /// First unused derivation index at creation time.
    pub vault_path: u32,
    /// Total transaction amount locked, service fee included.
    #[serde(with = "amount_serde")]
    pub amount: Amount,
    pub vault_address: String,
    pub trigger_address: String,
    pub cold_address: String,
    /// Highest fee rate a trigger/panic pair was pre-signed for, sat/vB.
    pub fee_rate_ceiling: f64,
    /// Relative-timelock length gating the unvault path, in blocks.
    pub lock_blocks: u16,
    pub vault_tx_hex: String,
    /// Every produced transaction keyed by raw hex, so any tx can be looked
    /// up by content alone.
    pub tx_map: HashMap<String, TxMeta>,
    /// Trigger variants in sampled-rate order (cheapest first), each with
    /// its panic ladder. Behaves as a content-keyed map via [`Vault::panics_for`].
    pub trigger_map: Vec<TriggerEntry>,
    /// Worst-case remaining value after an all-fees-maxed panic.
    #[serde(with = "amount_serde")]
    pub min_panic_balance: Amount,
    /// Key gating the delayed unvault path.
    #[serde(with = "pubkey_serde")]
    pub unvault_key: PublicKey,
    /// Compiled trigger policy, as a wsh descriptor string.
    pub trigger_descriptor: String,
    /// Unix seconds at creation.
    pub created_at: u64,
}

impl Vault {
    /// Panic hexes for a trigger, looked up by content.
    pub fn panics_for(&self, trigger_tx_hex: &str) -> Option<&[String]> {
        self.trigger_map
            .iter()
            .find(|e| e.trigger_tx_hex == trigger_tx_hex)
            .map(|e| e.panic_tx_hexes.as_slice())
    }

    /// Fee metadata for any produced transaction, looked up by content.
    pub fn meta_for(&self, tx_hex: &str) -> Option<&TxMeta> {
        self.tx_map.get(tx_hex)
    }

    /// The cheapest-rate trigger: the variant the owner broadcasts under
    /// normal fee conditions, and the one registered with a watchtower.
    pub fn default_trigger(&self) -> Option<&TriggerEntry> {
        self.trigger_map.first()
    }

    /// Structural invariants that hold for every vault the builder returns.
    /// A violation means the record was corrupted after creation.
    pub fn invariants_hold(&self) -> bool {
        !self.trigger_map.is_empty()
            && self.trigger_map.iter().all(|e| !e.panic_tx_hexes.is_empty())
            && self.tx_map.contains_key(&self.vault_tx_hex)
            && self.trigger_map.iter().all(|e| {
                self.tx_map.contains_key(&e.trigger_tx_hex)
                    && e.panic_tx_hexes.iter().all(|p| self.tx_map.contains_key(p))
            })
    }
}

/// Chain-observed progress of one vault, keyed by `vault_id`.
///
/// Heights of 0 mean "seen in mempool". The `*_push_time` fields are local
/// UX timestamps recorded by the caller at broadcast time; they are never
/// derived from chain state and must not be treated as ground truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VaultStatus {
    pub vault_id: String,

    pub trigger_tx_hex: Option<String>,
    pub trigger_tx_height: Option<u32>,

    pub panic_tx_hex: Option<String>,
    pub panic_tx_height: Option<u32>,

    pub spend_as_hot_tx_hex: Option<String>,
    pub spend_as_hot_tx_height: Option<u32>,

    pub vault_push_time: Option<u64>,
    pub trigger_push_time: Option<u64>,
    pub panic_push_time: Option<u64>,
}

impl VaultStatus {
    pub fn new(vault_id: impl Into<String>) -> Self {
        Self {
            vault_id: vault_id.into(),
            ..Default::default()
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger_tx_hex.is_some()
    }

    /// Panicked or hot-spent: nothing further can happen to this vault.
    pub fn is_terminal(&self) -> bool {
        self.panic_tx_hex.is_some() || self.spend_as_hot_tx_hex.is_some()
    }

    /// At most one terminal stage, and stages only exist on top of a trigger.
    pub fn invariants_hold(&self) -> bool {
        let both_terminal = self.panic_tx_hex.is_some() && self.spend_as_hot_tx_hex.is_some();
        let orphan_terminal =
            (self.panic_tx_hex.is_some() || self.spend_as_hot_tx_hex.is_some())
                && self.trigger_tx_hex.is_none();
        !both_terminal && !orphan_terminal
    }
}
