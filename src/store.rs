//! The thread-safe in-memory key-value map and its per-key Paxos log.
//!
//! Two independent reader/writer locks, one for the data map and one for
//! the Paxos log, never held together.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::message::{LogSlot, Operation, RecoverySnapshot};

#[derive(Default)]
pub struct KeyValueStore {
    data: RwLock<HashMap<String, String>>,
    log: RwLock<HashMap<String, BTreeMap<u64, LogSlot>>>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().expect("data lock poisoned").get(key).cloned()
    }

    /// Returns whether an existing value was overwritten.
    pub fn set(&self, key: &str, value: String) -> bool {
        self.data
            .write()
            .expect("data lock poisoned")
            .insert(key.to_string(), value)
            .is_some()
    }

    /// Returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        self.data
            .write()
            .expect("data lock poisoned")
            .remove(key)
            .is_some()
    }

    pub fn data_snapshot(&self) -> HashMap<String, String> {
        self.data.read().expect("data lock poisoned").clone()
    }

    pub fn log_snapshot(&self) -> HashMap<String, BTreeMap<u64, LogSlot>> {
        self.log.read().expect("log lock poisoned").clone()
    }

    /// Returns a copy of the slot at (key, round), auto-creating an empty
    /// one if missing. Callers must treat a zero-valued slot as "absent".
    pub fn get_log(&self, key: &str, round: u64) -> LogSlot {
        {
            let log = self.log.read().expect("log lock poisoned");
            if let Some(slot) = log.get(key).and_then(|rounds| rounds.get(&round)) {
                return slot.clone();
            }
        }
        let mut log = self.log.write().expect("log lock poisoned");
        log.entry(key.to_string())
            .or_default()
            .entry(round)
            .or_default()
            .clone()
    }

    /// The highest round number present for `key`, or 0 if the key has no
    /// log at all.
    pub fn latest_round(&self, key: &str) -> u64 {
        self.log
            .read()
            .expect("log lock poisoned")
            .get(key)
            .and_then(|rounds| rounds.keys().next_back().copied())
            .unwrap_or(0)
    }

    /// Opens the next round for `key`: `latest_round + 1`.
    pub fn next_round(&self, key: &str) -> u64 {
        self.latest_round(key) + 1
    }

    /// Sets `promised_id` alone, used by the acceptor's Prepare handler.
    pub fn set_promised(&self, key: &str, round: u64, promised_id: u64) {
        let mut log = self.log.write().expect("log lock poisoned");
        let slot = log.entry(key.to_string()).or_default().entry(round).or_default();
        slot.promised_id = promised_id;
    }

    /// Sets the acceptance triple alone, used by the acceptor's Propose
    /// handler.
    pub fn set_accepted(&self, key: &str, round: u64, accepted_id: u64, op: Operation) {
        let mut log = self.log.write().expect("log lock poisoned");
        let slot = log.entry(key.to_string()).or_default().entry(round).or_default();
        slot.accepted_id = accepted_id;
        slot.accepted_op = op;
    }

    /// Sets the full tuple, used by Inform (`promised_id := max(existing,
    /// propose_id)`) and by recovery (overwrite slot-wise).
    pub fn set_full(&self, key: &str, round: u64, promised_id: u64, accepted_id: u64, op: Operation) {
        let mut log = self.log.write().expect("log lock poisoned");
        let slot = log.entry(key.to_string()).or_default().entry(round).or_default();
        slot.promised_id = promised_id;
        slot.accepted_id = accepted_id;
        slot.accepted_op = op;
    }

    /// Applies a learned decision at (key, round): `Set` writes the value,
    /// `Delete` removes it, `SetCoordinator` is handled by the caller (it
    /// mutates the peer registry, not this store), `NotSet` is a no-op.
    pub fn apply(&self, key: &str, op: &Operation) {
        match op {
            Operation::Set(value) => {
                self.set(key, value.clone());
            }
            Operation::Delete => {
                self.delete(key);
            }
            Operation::SetCoordinator(_) | Operation::NotSet => {}
        }
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            data: self.data_snapshot(),
            logs: self.log_snapshot(),
        }
    }

    /// Merges a recovery snapshot into local state slot-wise, overwriting
    /// any existing entry. Applying the same snapshot twice is a no-op the
    /// second time.
    pub fn apply_snapshot(&self, snapshot: &RecoverySnapshot) {
        {
            let mut data = self.data.write().expect("data lock poisoned");
            for (key, value) in &snapshot.data {
                data.insert(key.clone(), value.clone());
            }
        }
        {
            let mut log = self.log.write().expect("log lock poisoned");
            for (key, rounds) in &snapshot.logs {
                let local_rounds = log.entry(key.clone()).or_default();
                for (round, slot) in rounds {
                    local_rounds.insert(*round, slot.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete_round_trip() {
        let store = KeyValueStore::new();
        assert_eq!(store.get("apple"), None);
        assert!(!store.set("apple", "red".into()));
        assert_eq!(store.get("apple"), Some("red".into()));
        assert!(store.set("apple", "green".into()));
        assert!(store.delete("apple"));
        assert_eq!(store.get("apple"), None);
        assert!(!store.delete("apple"));
    }

    #[test]
    fn get_log_auto_creates_empty_slot() {
        let store = KeyValueStore::new();
        assert_eq!(store.latest_round("apple"), 0);
        let slot = store.get_log("apple", 1);
        assert_eq!(slot, LogSlot::default());
        assert_eq!(store.latest_round("apple"), 1);
    }

    #[test]
    fn next_round_is_monotonic_once_applied() {
        let store = KeyValueStore::new();
        assert_eq!(store.next_round("apple"), 1);
        store.set_full("apple", 1, 1, 1, Operation::Set("red".into()));
        assert_eq!(store.latest_round("apple"), 1);
        assert_eq!(store.next_round("apple"), 2);
    }

    #[test]
    fn apply_snapshot_is_idempotent() {
        let store = KeyValueStore::new();
        let mut snapshot = RecoverySnapshot::default();
        snapshot.data.insert("apple".into(), "red".into());
        let mut rounds = BTreeMap::new();
        rounds.insert(1, LogSlot { promised_id: 1, accepted_id: 1, accepted_op: Operation::Set("red".into()) });
        snapshot.logs.insert("apple".into(), rounds);

        store.apply_snapshot(&snapshot);
        let after_first = store.snapshot();
        store.apply_snapshot(&snapshot);
        let after_second = store.snapshot();

        assert_eq!(after_first.data, after_second.data);
        assert_eq!(after_first.logs, after_second.logs);
        assert_eq!(store.get("apple"), Some("red".into()));
    }
}
