//! Spending-transaction cache.
//!
//! "What spent this outpoint" is the tracker's only expensive question, so
//! answers are cached by the caller and injected per poll, as an explicit
//! object rather than hidden global state, which keeps its lifetime
//! testable. Entries that reached the irreversibility depth are permanent:
//! they short-circuit every later lookup and are never re-queried.

use std::collections::HashMap;

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

/// A cached answer: the transaction observed spending one outpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedSpend {
    pub tx_hex: String,
    pub txid: Txid,
    /// Confirmation height, 0 while in mempool.
    pub height: u32,
    /// Buried deep enough that a reorg will not unwind it. Permanent.
    pub irreversible: bool,
}

/// Append-only cache keyed by spent outpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendCache {
    /// Keyed by `txid:vout` strings so the cache serializes as a JSON map.
    entries: HashMap<String, CachedSpend>,
}

fn key(outpoint: &OutPoint) -> String {
    outpoint.to_string()
}

impl SpendCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&CachedSpend> {
        self.entries.get(&key(outpoint))
    }

    /// Record an observation. Irreversible entries are final: later inserts
    /// for the same outpoint are ignored.
    pub fn insert(&mut self, outpoint: OutPoint, spend: CachedSpend) {
        match self.entries.get(&key(&outpoint)) {
            Some(existing) if existing.irreversible => {}
            _ => {
                self.entries.insert(key(&outpoint), spend);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn outpoint() -> OutPoint {
        OutPoint::from_str("1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef:0")
            .unwrap()
    }

    fn spend(height: u32, irreversible: bool) -> CachedSpend {
        CachedSpend {
            tx_hex: "aa00".into(),
            txid: Txid::from_str(
                "abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
            )
            .unwrap(),
            height,
            irreversible,
        }
    }

    #[test]
    fn insert_and_get() {
        let mut cache = SpendCache::new();
        assert!(cache.is_empty());
        assert!(cache.get(&outpoint()).is_none());

        cache.insert(outpoint(), spend(0, false));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&outpoint()).unwrap().height, 0);
    }

    #[test]
    fn reversible_entries_can_update() {
        let mut cache = SpendCache::new();
        cache.insert(outpoint(), spend(0, false));
        // The mempool observation later confirms.
        cache.insert(outpoint(), spend(870_000, true));
        assert_eq!(cache.get(&outpoint()).unwrap().height, 870_000);
        assert!(cache.get(&outpoint()).unwrap().irreversible);
    }

    #[test]
    fn irreversible_entries_are_final() {
        let mut cache = SpendCache::new();
        cache.insert(outpoint(), spend(870_000, true));
        // A conflicting later insert must not replace the settled answer.
        cache.insert(outpoint(), spend(0, false));
        assert_eq!(cache.get(&outpoint()).unwrap().height, 870_000);
        assert!(cache.get(&outpoint()).unwrap().irreversible);
    }

    #[test]
    fn cache_serde_roundtrip() {
        let mut cache = SpendCache::new();
        cache.insert(outpoint(), spend(870_000, true));

        let json = serde_json::to_string(&cache).unwrap();
        let restored: SpendCache = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.get(&outpoint()), cache.get(&outpoint()));
    }
}
