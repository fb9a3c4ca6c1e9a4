//! The replica set and the currently believed coordinator.
//!
//! An immutable map from address to RPC client handle, plus a
//! separately-locked coordinator field. Locks are never held across an RPC.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::rpc::RpcClient;

pub struct PeerRegistry {
    /// Address -> RPC client handle. Set at construction, never mutated.
    stubs: HashMap<String, RpcClient>,
    /// Address of the currently believed coordinator, or empty.
    coordinator: RwLock<String>,
}

impl PeerRegistry {
    pub fn new(stubs: HashMap<String, RpcClient>) -> Self {
        PeerRegistry {
            stubs,
            coordinator: RwLock::new(String::new()),
        }
    }

    pub fn get_coordinator(&self) -> Option<String> {
        let c = self.coordinator.read().expect("coordinator lock poisoned");
        if c.is_empty() {
            None
        } else {
            Some(c.clone())
        }
    }

    /// Updated only through the learner path (a `SetCoordinator` decision
    /// being applied) or initial discovery.
    pub fn set_coordinator(&self, address: &str) {
        *self.coordinator.write().expect("coordinator lock poisoned") = address.to_string();
    }

    pub fn get_coordinator_stub(&self) -> Option<RpcClient> {
        let address = self.get_coordinator()?;
        self.get_stub(&address)
    }

    pub fn get_stub(&self, address: &str) -> Option<RpcClient> {
        self.stubs.get(address).cloned()
    }

    /// A snapshot mapping used for phase fan-out in `RunPaxos`.
    pub fn paxos_stubs(&self) -> HashMap<String, RpcClient> {
        self.stubs.clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.stubs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn stub(addr: &str) -> RpcClient {
        RpcClient::new(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn coordinator_starts_unset() {
        let mut stubs = HashMap::new();
        stubs.insert("127.0.0.1:9001".to_string(), stub("127.0.0.1:9001"));
        let registry = PeerRegistry::new(stubs);
        assert_eq!(registry.get_coordinator(), None);
        assert!(registry.get_coordinator_stub().is_none());
    }

    #[test]
    fn set_coordinator_is_visible_to_get_coordinator_stub() {
        let mut stubs = HashMap::new();
        stubs.insert("127.0.0.1:9001".to_string(), stub("127.0.0.1:9001"));
        let registry = PeerRegistry::new(stubs);
        registry.set_coordinator("127.0.0.1:9001");
        assert_eq!(registry.get_coordinator(), Some("127.0.0.1:9001".to_string()));
        assert!(registry.get_coordinator_stub().is_some());
    }
}
