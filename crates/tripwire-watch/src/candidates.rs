//! Downstream feeds derived from tracked statuses.
//!
//! Two consumers poll the tracker's output: the wallet's spend flow, which
//! wants the vaults whose unvault path is open right now, and the
//! watchtower collaborator, which wants `{vault_id, trigger_txid, network}`
//! for every vault that has not been triggered yet. The registration HTTP
//! call itself is the collaborator's job; this module only filters.

use std::collections::{HashMap, HashSet};

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use tripwire_vault::{Vault, VaultStatus};

use crate::{remaining_blocks, RemainingBlocks};

/// A vault whose timelock path is spendable at the current tip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpendableTrigger {
    pub vault_id: String,
    /// The compiled trigger descriptor; the wallet derives the unvault
    /// spend from it.
    pub descriptor: String,
}

/// Vaults whose remaining-blocks count is exactly zero.
///
/// Panics on duplicate trigger descriptors across vaults: every vault gets
/// a fresh panic key, so a collision means key generation is broken: an
/// integrity violation, not a condition to paper over.
pub fn spendable_triggers(
    vaults: &[Vault],
    statuses: &HashMap<String, VaultStatus>,
    chain_tip: u32,
) -> Vec<SpendableTrigger> {
    let mut seen = HashSet::new();
    let mut spendable = Vec::new();

    for vault in vaults {
        let untracked = VaultStatus::new(&vault.vault_id);
        let status = statuses.get(&vault.vault_id).unwrap_or(&untracked);
        if remaining_blocks(vault, status, chain_tip) == RemainingBlocks::Blocks(0) {
            assert!(
                seen.insert(vault.trigger_descriptor.clone()),
                "duplicate trigger descriptor across vaults: panic-key collision"
            );
            spendable.push(SpendableTrigger {
                vault_id: vault.vault_id.clone(),
                descriptor: vault.trigger_descriptor.clone(),
            });
        }
    }

    spendable
}

/// One watchtower registration request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchtowerCandidate {
    pub vault_id: String,
    /// Txid of the cheapest-rate trigger, enough for the tower to recognize
    /// the vault; every variant pays the same script.
    pub trigger_txid: Txid,
    pub network_id: String,
}

/// Registration candidates: every vault with no trigger observed yet.
pub fn watchtower_candidates(
    vaults: &[Vault],
    statuses: &HashMap<String, VaultStatus>,
    network_id: &str,
) -> Vec<WatchtowerCandidate> {
    vaults
        .iter()
        .filter(|vault| {
            statuses
                .get(&vault.vault_id)
                .map_or(true, |status| !status.is_triggered())
        })
        .map(|vault| {
            let entry = vault
                .default_trigger()
                .expect("vault record without trigger entries");
            let meta = vault
                .meta_for(&entry.trigger_tx_hex)
                .expect("trigger transaction missing from tx map");
            WatchtowerCandidate {
                vault_id: vault.vault_id.clone(),
                trigger_txid: meta.txid,
                network_id: network_id.to_string(),
            }
        })
        .collect()
}

/// Shared fixtures for the watch tests: a really-built vault tree and an
/// in-memory chain.
#[cfg(test)]
pub(crate) mod tests_support {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::str::FromStr;

    use bitcoin::consensus::encode;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{
        Address, Amount, BlockHash, CompressedPublicKey, Network, PublicKey, Script, ScriptBuf,
        Transaction, Txid,
    };

    use tripwire_core::chain::{ChainError, ChainQuery, TxSummary};
    use tripwire_core::select::LargestFirstSelector;
    use tripwire_core::utxo::{CandidateUtxo, UtxosData};
    use tripwire_vault::registry::{AllocError, VaultIdAllocator};
    use tripwire_vault::{BuildRequest, LockBlocks, SoftwareSigner, Vault, VaultBuilder};

    pub const NETWORK: Network = Network::Signet;

    pub struct TestTree {
        pub vault: Vault,
        pub vault_tx: Transaction,
        /// Trigger variants in sampled-rate order.
        pub triggers: Vec<Transaction>,
        /// The first trigger's panic ladder.
        pub panics: Vec<Transaction>,
    }

    struct FixedAllocator(String);

    impl VaultIdAllocator for FixedAllocator {
        fn allocate(&self) -> Result<(String, u32), AllocError> {
            Ok((self.0.clone(), 0))
        }
    }

    fn test_key(tag: u8) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = tag;
        bytes[0] = 0x01;
        SecretKey::from_slice(&bytes).unwrap()
    }

    fn p2wpkh_address(secret: &SecretKey) -> Address {
        let secp = Secp256k1::new();
        Address::p2wpkh(&CompressedPublicKey(secret.public_key(&secp)), NETWORK)
    }

    fn decode(tx_hex: &str) -> Transaction {
        encode::deserialize(&hex::decode(tx_hex).unwrap()).unwrap()
    }

    pub fn built_vault() -> TestTree {
        built_vault_with_id("watch-vault")
    }

    pub fn built_vault_with_id(vault_id: &str) -> TestTree {
        let secp = Secp256k1::new();
        let wallet = test_key(1);
        let mut signer = SoftwareSigner::new();
        signer.add_key(wallet);

        let funding = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![bitcoin::TxOut {
                value: Amount::from_sat(150_000),
                script_pubkey: p2wpkh_address(&wallet).script_pubkey(),
            }],
        };
        let coins = UtxosData::new(vec![CandidateUtxo::from_prev_tx(&funding, 0).unwrap()]);

        let change_descriptor = miniscript::Descriptor::from_str(
            "wpkh(xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8/1/*)",
        )
        .unwrap();

        let request = BuildRequest {
            amount: Amount::from_sat(100_000),
            unvault_key: PublicKey::new(test_key(10).public_key(&secp)),
            samples: 3,
            fee_rate: 5.0,
            service_fee_rate: 0,
            fee_rate_ceiling: 50.0,
            cold_address: p2wpkh_address(&test_key(11)),
            change_descriptor,
            service_address: p2wpkh_address(&test_key(12)),
            lock_blocks: LockBlocks::from_blocks(144).unwrap(),
            coins,
        };

        let selector = LargestFirstSelector::new();
        let allocator = FixedAllocator(vault_id.to_string());
        let builder = VaultBuilder::new(NETWORK, &selector, &signer, &allocator);
        let vault = builder.build(&request, &mut |_| true).unwrap();

        let vault_tx = decode(&vault.vault_tx_hex);
        let triggers: Vec<Transaction> = vault
            .trigger_map
            .iter()
            .map(|e| decode(&e.trigger_tx_hex))
            .collect();
        let panics: Vec<Transaction> = vault.trigger_map[0]
            .panic_tx_hexes
            .iter()
            .map(|h| decode(h))
            .collect();

        TestTree {
            vault,
            vault_tx,
            triggers,
            panics,
        }
    }

    /// In-memory chain: transactions with heights, history by script scan.
    ///
    /// Uses interior mutability so tests can hold a tracker borrowing the
    /// chain immutably while mutating chain state underneath it.
    pub struct MockChain {
        tip: u32,
        txs: RefCell<HashMap<Txid, Transaction>>,
        heights: RefCell<HashMap<Txid, u32>>,
    }

    impl MockChain {
        pub fn new(tip: u32) -> Self {
            Self {
                tip,
                txs: RefCell::new(HashMap::new()),
                heights: RefCell::new(HashMap::new()),
            }
        }

        pub fn confirm(&self, tx: Transaction, height: u32) {
            let txid = tx.compute_txid();
            self.txs.borrow_mut().insert(txid, tx);
            self.heights.borrow_mut().insert(txid, height);
        }

        pub fn mempool(&self, tx: Transaction) {
            self.confirm(tx, 0);
        }

        pub fn promote(&self, txid: Txid, height: u32) {
            self.heights.borrow_mut().insert(txid, height);
        }

        pub fn forget(&self, txid: Txid) {
            self.txs.borrow_mut().remove(&txid);
            self.heights.borrow_mut().remove(&txid);
        }
    }

    impl ChainQuery for MockChain {
        fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
            self.txs
                .borrow()
                .get(txid)
                .cloned()
                .ok_or(ChainError::TxNotFound(*txid))
        }

        fn script_history(&self, script: &Script) -> Result<Vec<TxSummary>, ChainError> {
            let mut history = Vec::new();
            let txs = self.txs.borrow();
            let heights = self.heights.borrow();
            for (txid, tx) in txs.iter() {
                let funds = tx.output.iter().any(|o| o.script_pubkey.as_script() == script);
                let spends = tx.input.iter().any(|i| {
                    txs
                        .get(&i.previous_output.txid)
                        .and_then(|prev| prev.output.get(i.previous_output.vout as usize))
                        .map_or(false, |o| o.script_pubkey.as_script() == script)
                });
                if funds || spends {
                    history.push(TxSummary {
                        txid: *txid,
                        height: heights.get(txid).copied().unwrap_or(0),
                    });
                }
            }
            // Oldest first, mempool last, as Electrum servers report it.
            history.sort_by_key(|h| if h.height == 0 { u32::MAX } else { h.height });
            Ok(history)
        }

        fn tip_height(&self) -> Result<u32, ChainError> {
            Ok(self.tip)
        }

        fn block_hash(&self, height: u32) -> Result<Option<BlockHash>, ChainError> {
            Ok((height <= self.tip).then(BlockHash::all_zeros))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::built_vault_with_id;
    use super::*;

    fn status_with_remaining(vault: &Vault, tip: u32, remaining: u32) -> VaultStatus {
        let mut status = VaultStatus::new(&vault.vault_id);
        status.trigger_tx_hex = Some(vault.trigger_map[0].trigger_tx_hex.clone());
        // remaining = lock - (tip - height) - 1  ⇒  height for a target.
        let height = tip + remaining + 1 - vault.lock_blocks as u32;
        status.trigger_tx_height = Some(height);
        status
    }

    #[test]
    fn spendable_exactly_at_zero() {
        let tree = built_vault_with_id("vault-a");
        let vault = tree.vault;
        let tip = 1_000;

        let mut statuses = HashMap::new();
        statuses.insert(vault.vault_id.clone(), status_with_remaining(&vault, tip, 0));

        let spendable = spendable_triggers(std::slice::from_ref(&vault), &statuses, tip);
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].vault_id, "vault-a");
        assert_eq!(spendable[0].descriptor, vault.trigger_descriptor);
    }

    #[test]
    fn not_spendable_one_block_early() {
        let tree = built_vault_with_id("vault-a");
        let vault = tree.vault;
        let tip = 1_000;

        let mut statuses = HashMap::new();
        statuses.insert(vault.vault_id.clone(), status_with_remaining(&vault, tip, 1));

        assert!(spendable_triggers(std::slice::from_ref(&vault), &statuses, tip).is_empty());
    }

    #[test]
    fn untriggered_and_spent_vaults_are_not_spendable() {
        let tree = built_vault_with_id("vault-a");
        let vault = tree.vault;
        let tip = 1_000;

        // No status at all: not pushed.
        let statuses = HashMap::new();
        assert!(spendable_triggers(std::slice::from_ref(&vault), &statuses, tip).is_empty());

        // Terminal status: spent.
        let mut spent = status_with_remaining(&vault, tip, 0);
        spent.panic_tx_hex = Some(vault.trigger_map[0].panic_tx_hexes[0].clone());
        let mut statuses = HashMap::new();
        statuses.insert(vault.vault_id.clone(), spent);
        assert!(spendable_triggers(std::slice::from_ref(&vault), &statuses, tip).is_empty());
    }

    #[test]
    fn distinct_vaults_have_distinct_descriptors() {
        let a = built_vault_with_id("vault-a").vault;
        let b = built_vault_with_id("vault-b").vault;
        let tip = 1_000;

        let mut statuses = HashMap::new();
        statuses.insert(a.vault_id.clone(), status_with_remaining(&a, tip, 0));
        statuses.insert(b.vault_id.clone(), status_with_remaining(&b, tip, 0));

        let spendable = spendable_triggers(&[a, b], &statuses, tip);
        assert_eq!(spendable.len(), 2);
        assert_ne!(spendable[0].descriptor, spendable[1].descriptor);
    }

    #[test]
    #[should_panic(expected = "panic-key collision")]
    fn duplicate_descriptors_are_an_integrity_violation() {
        let a = built_vault_with_id("vault-a").vault;
        let mut b = a.clone();
        b.vault_id = "vault-b".into();
        let tip = 1_000;

        let mut statuses = HashMap::new();
        statuses.insert(a.vault_id.clone(), status_with_remaining(&a, tip, 0));
        statuses.insert(b.vault_id.clone(), status_with_remaining(&b, tip, 0));

        spendable_triggers(&[a, b], &statuses, tip);
    }

    #[test]
    fn watchtower_wants_untriggered_vaults() {
        let a = built_vault_with_id("vault-a").vault;
        let b = built_vault_with_id("vault-b").vault;

        let mut statuses = HashMap::new();
        // Vault a is already triggered; only b needs tower protection.
        statuses.insert(
            a.vault_id.clone(),
            status_with_remaining(&a, 1_000, 50),
        );

        let candidates = watchtower_candidates(&[a, b.clone()], &statuses, "signet");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].vault_id, "vault-b");
        assert_eq!(candidates[0].network_id, "signet");

        // The registered txid is the cheapest-rate trigger's.
        let expected = b
            .meta_for(&b.trigger_map[0].trigger_tx_hex)
            .unwrap()
            .txid;
        assert_eq!(candidates[0].trigger_txid, expected);
    }

    #[test]
    fn candidate_serde_shapes() {
        let b = built_vault_with_id("vault-b").vault;
        let candidates = watchtower_candidates(std::slice::from_ref(&b), &HashMap::new(), "bitcoin");

        let json = serde_json::to_string(&candidates).unwrap();
        let restored: Vec<WatchtowerCandidate> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, candidates);
    }
}
