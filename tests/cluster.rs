//! Multi-replica scenario tests, run as real `Replica` processes (threads
//! within this test binary, each with its own loopback TCP listeners).
//!
//! Covers single-replica put/get/delete, three-replica consensus under
//! one acceptor fault, a stale Inform being rejected, recovery snapshot
//! exchange for a replica that starts cold against an already-running
//! coordinator, and the illegal reserved key.

use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use kvpaxos::configurations::ReplicaConfig;
use kvpaxos::error::RpcStatus;
use kvpaxos::message::{Acceptance, FrontEndRequest, FrontEndResponse, Operation};
use kvpaxos::replica::Replica;
use kvpaxos::rpc::RpcClient;

const CALL_DEADLINE: Duration = Duration::from_secs(5);

/// Binds an ephemeral loopback port, reads back its address, and releases
/// it for the replica to rebind. A small, accepted race (another process
/// could grab the port first); fine for a single-threaded local test run.
fn free_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind an ephemeral port");
    listener.local_addr().expect("failed to read local_addr")
}

struct Cluster {
    front_ends: Vec<SocketAddr>,
    replicas: Vec<Replica>,
}

impl Cluster {
    /// Spins up `n` replicas against their own full peer set and runs
    /// `initialize()` on each before returning.
    fn start(n: usize, fail_rates: &[f64]) -> Self {
        let front_ends: Vec<SocketAddr> = (0..n).map(|_| free_address()).collect();
        let paxos_addrs: Vec<SocketAddr> = (0..n).map(|_| free_address()).collect();
        let replicas = spawn_replicas(&front_ends, &paxos_addrs, &paxos_addrs, fail_rates, 100);

        replicas[0].initialize().expect("first replica initializes");
        for replica in &replicas[1..] {
            let _ = replica.initialize();
        }

        Cluster { front_ends, replicas }
    }

    /// Starts `live_n` replicas immediately, but reserves one more
    /// address in the very same fixed peer set for a replica that
    /// starts cold later (see `ColdSlot::bring_up`). Every replica --
    /// including the ones running now -- is constructed with the full
    /// `live_n + 1`-address peer set from the start: the replica set is
    /// fixed at startup, and a replica that hasn't dialed in yet is not
    /// the same thing as the set growing.
    fn start_with_reserved_slot(live_n: usize, live_fail_rates: &[f64]) -> (Self, ColdSlot) {
        let total = live_n + 1;
        let front_ends: Vec<SocketAddr> = (0..total).map(|_| free_address()).collect();
        let paxos_addrs: Vec<SocketAddr> = (0..total).map(|_| free_address()).collect();

        let replicas = spawn_replicas(
            &front_ends[..live_n],
            &paxos_addrs[..live_n],
            &paxos_addrs,
            live_fail_rates,
            100,
        );
        replicas[0].initialize().expect("first replica initializes");
        for replica in &replicas[1..] {
            let _ = replica.initialize();
        }

        let cluster = Cluster {
            front_ends: front_ends[..live_n].to_vec(),
            replicas,
        };
        let cold_slot = ColdSlot {
            front_end: front_ends[live_n],
            paxos: paxos_addrs[live_n],
            peer_set: paxos_addrs,
        };
        (cluster, cold_slot)
    }

    fn client(&self, i: usize) -> RpcClient {
        RpcClient::new(self.front_ends[i])
    }

    fn latest_round(&self, i: usize, key: &str) -> u64 {
        self.replicas[i].store().latest_round(key)
    }
}

/// An address already named in a cluster's fixed peer set for a replica
/// that hasn't started yet.
struct ColdSlot {
    front_end: SocketAddr,
    paxos: SocketAddr,
    peer_set: Vec<SocketAddr>,
}

impl ColdSlot {
    /// Starts the replica occupying this slot and runs its own
    /// `initialize()`, discovering the already-elected coordinator and
    /// pulling a recovery snapshot from it.
    fn bring_up(self, fail_rate: f64, seed: u64) -> (Replica, RpcClient) {
        let replicas = spawn_replicas(&[self.front_end], &[self.paxos], &self.peer_set, &[fail_rate], seed);
        let replica = replicas
            .into_iter()
            .next()
            .expect("spawn_replicas returns exactly one replica for one address");
        replica.initialize().expect("cold replica initializes");
        let stub = RpcClient::new(self.front_end);
        (replica, stub)
    }
}

/// Binds and starts serving `front_ends.len()` replicas, each pointed at
/// `peer_set` as its full replica list, then gives the accept loops a
/// moment to come up before anyone dials in.
fn spawn_replicas(
    front_ends: &[SocketAddr],
    paxos_addrs: &[SocketAddr],
    peer_set: &[SocketAddr],
    fail_rates: &[f64],
    seed_base: u64,
) -> Vec<Replica> {
    let replica_list = peer_set
        .iter()
        .map(|a| format!("replica:{}", a))
        .collect::<Vec<_>>()
        .join(" ");

    let mut handles = Vec::new();
    for i in 0..front_ends.len() {
        let record = format!(
            "my_addr:{} my_paxos:{} fail_rate:{} {}",
            front_ends[i],
            paxos_addrs[i],
            fail_rates.get(i).copied().unwrap_or(0.0),
            replica_list
        );
        let config = ReplicaConfig::parse(&record).expect("valid test configuration");
        let seed = seed_base + i as u64;
        handles.push(thread::spawn(move || {
            let replica = Replica::new(config, Some(seed));
            replica.serve().expect("failed to bind replica listeners");
            replica
        }));
    }
    let replicas: Vec<Replica> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    thread::sleep(Duration::from_millis(50));
    replicas
}

fn put(stub: &RpcClient, key: &str, value: &str) {
    let response: Result<FrontEndResponse, RpcStatus> = stub.call(
        &FrontEndRequest::Put {
            key: key.to_string(),
            value: value.to_string(),
        },
        CALL_DEADLINE,
    );
    response.expect("put should succeed");
}

fn get(stub: &RpcClient, key: &str) -> Option<String> {
    let response: Result<FrontEndResponse, RpcStatus> =
        stub.call(&FrontEndRequest::Get { key: key.to_string() }, CALL_DEADLINE);
    match response {
        Ok(FrontEndResponse::Value { value }) => Some(value),
        Err(RpcStatus::NotFound(_)) => None,
        other => panic!("unexpected response: {:?}", other),
    }
}

#[test]
fn single_replica_put_get_delete() {
    let cluster = Cluster::start(1, &[0.0]);
    let stub = cluster.client(0);

    assert_eq!(get(&stub, "apple"), None);
    put(&stub, "apple", "red");
    assert_eq!(get(&stub, "apple"), Some("red".to_string()));

    let response: Result<FrontEndResponse, RpcStatus> =
        stub.call(&FrontEndRequest::Delete { key: "apple".to_string() }, CALL_DEADLINE);
    response.expect("delete should succeed");
    assert_eq!(get(&stub, "apple"), None);
}

#[test]
fn three_replicas_reach_consensus_with_one_acceptor_at_fault() {
    // One of the three replicas always rejects Prepare/Propose; the other
    // two still form a majority.
    let cluster = Cluster::start(3, &[0.0, 0.0, 1.0]);
    let stub = cluster.client(0);

    put(&stub, "apple", "red");
    assert_eq!(get(&stub, "apple"), Some("red".to_string()));

    // Every replica's front-end forwards to the same coordinator, so a
    // read through any of them observes the same value.
    let stub_b = cluster.client(1);
    assert_eq!(get(&stub_b, "apple"), Some("red".to_string()));
}

#[test]
fn illegal_key_is_rejected() {
    let cluster = Cluster::start(1, &[0.0]);
    let stub = cluster.client(0);

    let response: Result<FrontEndResponse, RpcStatus> = stub.call(
        &FrontEndRequest::Get {
            key: "coordinator".to_string(),
        },
        CALL_DEADLINE,
    );
    assert!(matches!(response, Err(RpcStatus::Aborted(_))));
}

#[test]
fn recovery_snapshot_catches_up_a_replica_that_starts_cold() {
    let (cluster, cold_slot) = Cluster::start_with_reserved_slot(2, &[0.0, 0.0]);
    let stub = cluster.client(0);
    put(&stub, "apple", "red");
    put(&stub, "banana", "yellow");

    let (cold_replica, joined) = cold_slot.bring_up(0.0, 200);
    assert_eq!(get(&joined, "apple"), Some("red".to_string()));
    assert_eq!(get(&joined, "banana"), Some("yellow".to_string()));

    // The recovering replica's log is caught up to the coordinator's,
    // not just its current data values.
    assert_eq!(
        cold_replica.store().latest_round("apple"),
        cluster.latest_round(0, "apple")
    );
    assert_eq!(
        cold_replica.store().latest_round("banana"),
        cluster.latest_round(0, "banana")
    );
}

#[test]
fn stale_inform_is_rejected_without_disturbing_the_newer_value() {
    use kvpaxos::message::ReplicationRequest;
    use kvpaxos::peer_registry::PeerRegistry;
    use kvpaxos::replication::ReplicationService;
    use kvpaxos::store::KeyValueStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    let store = Arc::new(KeyValueStore::new());
    let registry = Arc::new(PeerRegistry::new(HashMap::new()));
    let service = ReplicationService::new(
        store.clone(),
        registry,
        "127.0.0.1:1".to_string(),
        0.0,
        Some(1),
    );

    service
        .dispatch(ReplicationRequest::Inform {
            key: "apple".to_string(),
            acceptance: Acceptance {
                round: 5,
                propose_id: 1,
                op: Operation::Set("green".to_string()),
            },
        })
        .expect("newer round is applied");

    let stale = service.dispatch(ReplicationRequest::Inform {
        key: "apple".to_string(),
        acceptance: Acceptance {
            round: 2,
            propose_id: 1,
            op: Operation::Set("red".to_string()),
        },
    });
    assert!(matches!(stale, Err(RpcStatus::Aborted(_))));
    assert_eq!(store.get("apple"), Some("green".to_string()));
}
