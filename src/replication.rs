//! The Replication Service: the acceptor/learner state machine, the
//! coordinator's proposer role (`RunPaxos`), coordinator discovery and
//! election, and the recovery snapshot exchange.
//!
//! `Prepare`/`Propose` implement the acceptor, `Inform` the learner,
//! `run_paxos` the coordinator's three-phase round, and
//! `initialize`/`get_coordinator_rpc`/`elect_new_coordinator`/`get_recovery`
//! discovery, election, and recovery. Each mutating request type maps to its
//! Paxos operation through `MutatingRequest::to_operation` (message.rs)
//! instead of a per-request-type overload.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{FromEntropy, Rng, SeedableRng};

use crate::error::{Result, RpcStatus};
use crate::message::{
    Acceptance, MutatingRequest, Operation, ReplicationRequest, ReplicationResponse,
    COORDINATOR_KEY,
};
use crate::peer_registry::PeerRegistry;
use crate::rpc::RpcClient;
use crate::store::KeyValueStore;

/// Deadline for coordinator discovery and the liveness probe.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(1);
/// Deadline for every Prepare/Propose/Inform RPC in a Paxos round.
const PAXOS_DEADLINE: Duration = Duration::from_secs(5);

/// The coordinator always proposes with this id in a fresh round. Not
/// hardened against split-brain contention: see DESIGN.md.
const FIXED_PROPOSE_ID: u64 = 1;

pub struct ReplicationService {
    store: Arc<KeyValueStore>,
    registry: Arc<PeerRegistry>,
    my_paxos_address: String,
    fail_rate: f64,
    rng: Mutex<StdRng>,
}

impl ReplicationService {
    pub fn new(
        store: Arc<KeyValueStore>,
        registry: Arc<PeerRegistry>,
        my_paxos_address: String,
        fail_rate: f64,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        ReplicationService {
            store,
            registry,
            my_paxos_address,
            fail_rate,
            rng: Mutex::new(rng),
        }
    }

    /// Drives the simulated acceptor fault: a per-replica seeded PRNG
    /// rather than a shared process-global one, so tests are reproducible.
    fn random_fail(&self) -> bool {
        if self.fail_rate <= 0.0 {
            return false;
        }
        if self.fail_rate >= 1.0 {
            return true;
        }
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        rng.gen::<f64>() < self.fail_rate
    }

    /// The single entry point an RPC listener dispatches every
    /// `ReplicationRequest` variant through.
    pub fn dispatch(&self, request: ReplicationRequest) -> Result<ReplicationResponse> {
        match request {
            ReplicationRequest::GetValue { key } => self.get_value(&key),
            ReplicationRequest::PutPair { key, value } => self.put_pair(key, value),
            ReplicationRequest::DeletePair { key } => self.delete_pair(key),
            ReplicationRequest::ElectCoordinator { key, coordinator } => {
                self.elect_coordinator(key, coordinator)
            }
            ReplicationRequest::GetCoordinator => self.get_coordinator_rpc(),
            ReplicationRequest::Prepare {
                key,
                round,
                propose_id,
            } => self.prepare(&key, round, propose_id),
            ReplicationRequest::Propose {
                key,
                round,
                propose_id,
                op,
            } => self.propose(&key, round, propose_id, op),
            ReplicationRequest::Inform { key, acceptance } => self.inform(&key, acceptance),
            ReplicationRequest::Ping => Ok(ReplicationResponse::Empty),
            ReplicationRequest::Recover => Ok(ReplicationResponse::Recovered(self.store.snapshot())),
        }
    }

    // ---- client-facing operations, served on whichever replica is coordinator ----

    fn get_value(&self, key: &str) -> Result<ReplicationResponse> {
        if key == COORDINATOR_KEY {
            return Err(RpcStatus::Aborted("Illegal keyword".into()));
        }
        match self.store.get(key) {
            Some(value) => Ok(ReplicationResponse::Value { value }),
            None => Err(RpcStatus::NotFound(format!("key not found: {}", key))),
        }
    }

    fn put_pair(&self, key: String, value: String) -> Result<ReplicationResponse> {
        if key == COORDINATOR_KEY {
            return Err(RpcStatus::Aborted("Illegal keyword".into()));
        }
        self.run_paxos(&MutatingRequest::Put { key, value })?;
        Ok(ReplicationResponse::Empty)
    }

    fn delete_pair(&self, key: String) -> Result<ReplicationResponse> {
        if key == COORDINATOR_KEY {
            return Err(RpcStatus::Aborted("Illegal keyword".into()));
        }
        self.run_paxos(&MutatingRequest::Delete { key })?;
        Ok(ReplicationResponse::Empty)
    }

    fn elect_coordinator(&self, key: String, coordinator: String) -> Result<ReplicationResponse> {
        // The wire allows any key here; this replica does not special-case
        // a non-"coordinator" key, so it simply runs Paxos under whatever
        // key was given.
        self.run_paxos_for_key(&key, &MutatingRequest::ElectCoordinator { coordinator })?;
        Ok(ReplicationResponse::Empty)
    }

    fn get_coordinator_rpc(&self) -> Result<ReplicationResponse> {
        match self.registry.get_coordinator() {
            Some(coordinator) => Ok(ReplicationResponse::Coordinator { coordinator }),
            None => Err(RpcStatus::NotFound("coordinator not set".into())),
        }
    }

    // ---- acceptor role ----

    /// Phase 1. `propose_id <= promised_id` is rejected; otherwise the
    /// promise is recorded and any prior acceptance is piggy-backed.
    pub fn prepare(&self, key: &str, round: u64, propose_id: u64) -> Result<ReplicationResponse> {
        let slot = self.store.get_log(key, round);
        if propose_id <= slot.promised_id {
            return Err(RpcStatus::Aborted("proposal id too low".into()));
        }
        if key != COORDINATOR_KEY && self.random_fail() {
            return Err(RpcStatus::Aborted(format!(
                "acceptor random-failed on Prepare (fail_rate={})",
                self.fail_rate
            )));
        }
        self.store.set_promised(key, round, propose_id);
        let accepted = if slot.has_accepted() {
            Some((slot.accepted_id, slot.accepted_op))
        } else {
            None
        };
        Ok(ReplicationResponse::Promise {
            round,
            propose_id,
            accepted,
        })
    }

    /// Phase 2. `propose_id < promised_id` is rejected; the equal case is
    /// accepted (a previously promised proposer following through).
    pub fn propose(
        &self,
        key: &str,
        round: u64,
        propose_id: u64,
        op: Operation,
    ) -> Result<ReplicationResponse> {
        let slot = self.store.get_log(key, round);
        if propose_id < slot.promised_id {
            return Err(RpcStatus::Aborted("proposal id too low".into()));
        }
        if key != COORDINATOR_KEY && self.random_fail() {
            return Err(RpcStatus::Aborted(format!(
                "acceptor random-failed on Propose (fail_rate={})",
                self.fail_rate
            )));
        }
        self.store.set_accepted(key, round, propose_id, op.clone());
        Ok(ReplicationResponse::Accept {
            round,
            propose_id,
            op,
        })
    }

    /// Learner path. Always writes the full slot first, then refuses to
    /// apply a decision for a round that has already been superseded.
    pub fn inform(&self, key: &str, acceptance: Acceptance) -> Result<ReplicationResponse> {
        let existing_promised = self.store.get_log(key, acceptance.round).promised_id;
        let promised = existing_promised.max(acceptance.propose_id);
        self.store
            .set_full(key, acceptance.round, promised, acceptance.propose_id, acceptance.op.clone());

        if acceptance.round < self.store.latest_round(key) {
            return Err(RpcStatus::Aborted("overwritten".into()));
        }

        self.store.apply(key, &acceptance.op);
        if let Operation::SetCoordinator(address) = &acceptance.op {
            self.registry.set_coordinator(address);
        }
        Ok(ReplicationResponse::Empty)
    }

    // ---- coordinator role: RunPaxos ----

    fn run_paxos(&self, request: &MutatingRequest) -> Result<()> {
        self.run_paxos_for_key(request.key(), request)
    }

    fn run_paxos_for_key(&self, key: &str, request: &MutatingRequest) -> Result<()> {
        let stubs = self.registry.paxos_stubs();
        info!(
            "[{}] RunPaxos starting for key {} ({} known peers)",
            self.my_paxos_address,
            key,
            stubs.len()
        );

        let live = ping_all(&stubs);
        if live.is_empty() {
            return Err(RpcStatus::Aborted("can't connect to any peer".into()));
        }
        let num_peers = live.len();

        let round = self.store.next_round(key);
        let propose_id = FIXED_PROPOSE_ID;

        let promises = fan_out_prepare(&stubs, &live, key, round, propose_id);
        let num_promised = promises.len();
        if num_promised <= num_peers / 2 {
            warn!(
                "[{}] failed quorum [key={}, round={}]: {} of {} peers promised",
                self.my_paxos_address, key, round, num_promised, num_peers
            );
            return Err(RpcStatus::Aborted(format!(
                "failed quorum: {} of {} peers promised",
                num_promised, num_peers
            )));
        }
        info!(
            "[{}] reached quorum [key={}, round={}]: {} of {} peers promised",
            self.my_paxos_address, key, round, num_promised, num_peers
        );

        let carried = promises.into_iter().flatten().fold(
            None,
            |best: Option<(u64, Operation)>, (accepted_id, op)| match best {
                Some((best_id, _)) if best_id >= accepted_id => best,
                _ => Some((accepted_id, op)),
            },
        );
        let op = match carried {
            Some((_, op)) => op,
            None => request.to_operation(),
        };

        let num_accepted = fan_out_propose(&stubs, &live, key, round, propose_id, &op);
        if num_accepted <= num_peers / 2 {
            warn!(
                "[{}] failed consensus [key={}, round={}]: {} of {} peers accepted",
                self.my_paxos_address, key, round, num_accepted, num_peers
            );
            return Err(RpcStatus::Aborted(format!(
                "failed consensus: {} of {} peers accepted",
                num_accepted, num_peers
            )));
        }
        info!(
            "[{}] reached consensus [key={}, round={}]: {} of {} peers accepted",
            self.my_paxos_address, key, round, num_accepted, num_peers
        );

        let acceptance = Acceptance {
            round,
            propose_id,
            op,
        };
        fan_out_inform(&stubs, &live, key, &acceptance);

        Ok(())
    }

    // ---- coordinator discovery & election ----

    /// Runs once at startup: discover the coordinator, elect one if none
    /// is found, then pull a recovery snapshot.
    pub fn initialize(&self) -> Result<()> {
        if self.discover_coordinator().is_err() {
            self.elect_new_coordinator()?;
        }
        self.get_recovery()
    }

    fn discover_coordinator(&self) -> Result<()> {
        let stubs = self.registry.paxos_stubs();
        let handles: Vec<_> = stubs
            .iter()
            .map(|(address, client)| {
                let address = address.clone();
                let client = client.clone();
                thread::spawn(move || {
                    let result: Result<ReplicationResponse> =
                        client.call(&ReplicationRequest::GetCoordinator, DISCOVERY_DEADLINE);
                    (address, result)
                })
            })
            .collect();

        let mut reachable = HashSet::new();
        let mut distinct = HashSet::new();
        for handle in handles {
            if let Ok((address, result)) = handle.join() {
                match result {
                    Ok(ReplicationResponse::Coordinator { coordinator }) => {
                        reachable.insert(address);
                        distinct.insert(coordinator);
                    }
                    Ok(_) | Err(RpcStatus::NotFound(_)) => {
                        reachable.insert(address);
                    }
                    Err(_) => {}
                }
            }
        }

        if distinct.len() == 1 {
            let candidate = distinct.into_iter().next().expect("checked len == 1");
            if reachable.contains(&candidate) {
                self.registry.set_coordinator(&candidate);
                return Ok(());
            }
        }
        Err(RpcStatus::Aborted(
            "failed to discover a unique, reachable coordinator".into(),
        ))
    }

    /// Issues an `ElectCoordinator` RPC to self, flowing through the
    /// normal Paxos path.
    pub fn elect_new_coordinator(&self) -> Result<()> {
        info!(
            "[{}] electing self as coordinator via Paxos",
            self.my_paxos_address
        );
        let stub = self
            .registry
            .get_stub(&self.my_paxos_address)
            .ok_or_else(|| RpcStatus::Internal("no stub registered for self".into()))?;
        let request = ReplicationRequest::ElectCoordinator {
            key: COORDINATOR_KEY.to_string(),
            coordinator: self.my_paxos_address.clone(),
        };
        let _: ReplicationResponse = stub.call(&request, PAXOS_DEADLINE)?;
        Ok(())
    }

    fn get_recovery(&self) -> Result<()> {
        let stub = match self.registry.get_coordinator_stub() {
            Some(stub) => stub,
            None => return Err(RpcStatus::Aborted("coordinator is not set".into())),
        };
        let response: ReplicationResponse = stub.call(&ReplicationRequest::Recover, PAXOS_DEADLINE)?;
        match response {
            ReplicationResponse::Recovered(snapshot) => {
                self.store.apply_snapshot(&snapshot);
                Ok(())
            }
            _ => Err(RpcStatus::Internal("unexpected response to Recover".into())),
        }
    }
}

/// Pings every peer with a short deadline; returns the addresses that
/// responded.
fn ping_all(stubs: &HashMap<String, RpcClient>) -> Vec<String> {
    let handles: Vec<_> = stubs
        .iter()
        .map(|(address, client)| {
            let address = address.clone();
            let client = client.clone();
            thread::spawn(move || {
                let result: Result<ReplicationResponse> =
                    client.call(&ReplicationRequest::Ping, DISCOVERY_DEADLINE);
                (address, result.is_ok())
            })
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|handle| handle.join().ok())
        .filter(|(_, alive)| *alive)
        .map(|(address, _)| address)
        .collect()
}

fn fan_out_prepare(
    stubs: &HashMap<String, RpcClient>,
    live: &[String],
    key: &str,
    round: u64,
    propose_id: u64,
) -> Vec<Option<(u64, Operation)>> {
    let handles: Vec<_> = live
        .iter()
        .filter_map(|address| stubs.get(address).cloned())
        .map(|client| {
            let key = key.to_string();
            thread::spawn(move || {
                let request = ReplicationRequest::Prepare {
                    key,
                    round,
                    propose_id,
                };
                let result: Result<ReplicationResponse> = client.call(&request, PAXOS_DEADLINE);
                result
            })
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|handle| handle.join().ok())
        .filter_map(|result| match result {
            Ok(ReplicationResponse::Promise { accepted, .. }) => Some(accepted),
            _ => None,
        })
        .collect()
}

fn fan_out_propose(
    stubs: &HashMap<String, RpcClient>,
    live: &[String],
    key: &str,
    round: u64,
    propose_id: u64,
    op: &Operation,
) -> usize {
    let handles: Vec<_> = live
        .iter()
        .filter_map(|address| stubs.get(address).cloned())
        .map(|client| {
            let key = key.to_string();
            let op = op.clone();
            thread::spawn(move || {
                let request = ReplicationRequest::Propose {
                    key,
                    round,
                    propose_id,
                    op,
                };
                let result: Result<ReplicationResponse> = client.call(&request, PAXOS_DEADLINE);
                result.is_ok()
            })
        })
        .collect();

    handles
        .into_iter()
        .filter_map(|handle| handle.join().ok())
        .filter(|accepted| *accepted)
        .count()
}

/// Individual Inform failures are tolerated: the decision is already
/// durable by majority-acceptance.
fn fan_out_inform(
    stubs: &HashMap<String, RpcClient>,
    live: &[String],
    key: &str,
    acceptance: &Acceptance,
) {
    let handles: Vec<_> = live
        .iter()
        .filter_map(|address| stubs.get(address).cloned())
        .map(|client| {
            let key = key.to_string();
            let acceptance = acceptance.clone();
            thread::spawn(move || {
                let request = ReplicationRequest::Inform { key, acceptance };
                let _: Result<ReplicationResponse> = client.call(&request, PAXOS_DEADLINE);
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(fail_rate: f64, seed: u64) -> ReplicationService {
        let store = Arc::new(KeyValueStore::new());
        let registry = Arc::new(PeerRegistry::new(HashMap::new()));
        ReplicationService::new(store, registry, "127.0.0.1:9001".into(), fail_rate, Some(seed))
    }

    #[test]
    fn prepare_rejects_propose_id_at_or_below_promised() {
        let svc = service(0.0, 1);
        svc.prepare("apple", 1, 5).unwrap();
        assert!(svc.prepare("apple", 1, 5).is_err());
        assert!(svc.prepare("apple", 1, 3).is_err());
        assert!(svc.prepare("apple", 1, 6).is_ok());
    }

    #[test]
    fn prepare_piggybacks_prior_acceptance() {
        let svc = service(0.0, 1);
        svc.prepare("apple", 1, 1).unwrap();
        svc.propose("apple", 1, 1, Operation::Set("red".into())).unwrap();
        let response = svc.prepare("apple", 1, 2).unwrap();
        match response {
            ReplicationResponse::Promise { accepted, .. } => {
                assert_eq!(accepted, Some((1, Operation::Set("red".into()))));
            }
            _ => panic!("expected a Promise"),
        }
    }

    #[test]
    fn propose_accepts_equal_to_promised_id() {
        let svc = service(0.0, 1);
        svc.prepare("apple", 1, 4).unwrap();
        assert!(svc.propose("apple", 1, 4, Operation::Set("red".into())).is_ok());
        assert!(svc.propose("apple", 1, 3, Operation::Set("green".into())).is_err());
    }

    #[test]
    fn inform_applies_set_and_advances_latest_round() {
        let svc = service(0.0, 1);
        svc.inform(
            "apple",
            Acceptance {
                round: 1,
                propose_id: 1,
                op: Operation::Set("red".into()),
            },
        )
        .unwrap();
        assert_eq!(svc.store.get("apple"), Some("red".into()));
        assert_eq!(svc.store.latest_round("apple"), 1);
    }

    #[test]
    fn inform_rejects_a_stale_round() {
        let svc = service(0.0, 1);
        svc.inform(
            "apple",
            Acceptance {
                round: 2,
                propose_id: 1,
                op: Operation::Set("green".into()),
            },
        )
        .unwrap();
        let result = svc.inform(
            "apple",
            Acceptance {
                round: 1,
                propose_id: 1,
                op: Operation::Set("red".into()),
            },
        );
        assert!(matches!(result, Err(RpcStatus::Aborted(_))));
        assert_eq!(svc.store.get("apple"), Some("green".into()));
    }

    #[test]
    fn inform_set_coordinator_updates_registry_not_the_store() {
        let svc = service(0.0, 1);
        svc.inform(
            COORDINATOR_KEY,
            Acceptance {
                round: 1,
                propose_id: 1,
                op: Operation::SetCoordinator("127.0.0.1:9002".into()),
            },
        )
        .unwrap();
        assert_eq!(svc.registry.get_coordinator(), Some("127.0.0.1:9002".into()));
        assert_eq!(svc.store.get(COORDINATOR_KEY), None);
    }

    #[test]
    fn get_value_rejects_the_reserved_key() {
        let svc = service(0.0, 1);
        assert!(matches!(
            svc.get_value(COORDINATOR_KEY),
            Err(RpcStatus::Aborted(_))
        ));
    }

    #[test]
    fn fail_rate_one_always_rejects_non_coordinator_keys() {
        let svc = service(1.0, 1);
        assert!(svc.prepare("apple", 1, 1).is_err());
        let coordinator_result = svc.prepare(COORDINATOR_KEY, 1, 1);
        assert!(coordinator_result.is_ok());
    }

    #[test]
    fn fail_rate_zero_never_rejects() {
        let svc = service(0.0, 1);
        for round in 1..=20 {
            assert!(svc.prepare("apple", round, 1).is_ok());
        }
    }
}
