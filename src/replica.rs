//! Wires a single replica's store, peer registry, replication service, and
//! front-end together, and starts both of its RPC listeners.
//!
//! Grounded in `server-main.cpp`'s startup sequence: build the stubs map,
//! construct the service objects over it, bind both listening sockets,
//! serve, then run `Initialize()` before accepting client traffic.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use log::info;

use crate::configurations::ReplicaConfig;
use crate::error::Result;
use crate::front_end::KvFrontEnd;
use crate::message::{FrontEndRequest, ReplicationRequest};
use crate::peer_registry::PeerRegistry;
use crate::replication::ReplicationService;
use crate::rpc::{self, RpcClient};
use crate::store::KeyValueStore;

pub struct Replica {
    config: ReplicaConfig,
    store: Arc<KeyValueStore>,
    registry: Arc<PeerRegistry>,
    replication: Arc<ReplicationService>,
    front_end: Arc<KvFrontEnd>,
}

impl Replica {
    pub fn new(config: ReplicaConfig, seed: Option<u64>) -> Self {
        let mut stubs = HashMap::new();
        for replica in &config.replicas {
            let address = replica.to_string();
            stubs.insert(address, RpcClient::new(*replica));
        }
        let my_paxos_address = config.my_paxos.to_string();
        stubs
            .entry(my_paxos_address.clone())
            .or_insert_with(|| RpcClient::new(config.my_paxos));

        let store = Arc::new(KeyValueStore::new());
        let registry = Arc::new(PeerRegistry::new(stubs));
        let replication = Arc::new(ReplicationService::new(
            store.clone(),
            registry.clone(),
            my_paxos_address,
            config.fail_rate,
            seed,
        ));
        let front_end = Arc::new(KvFrontEnd::new(registry.clone(), replication.clone()));

        Replica {
            config,
            store,
            registry,
            replication,
            front_end,
        }
    }

    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Binds both listening sockets and spawns a serving thread for each.
    /// Returns immediately; the serving threads run for the process's
    /// lifetime.
    pub fn serve(&self) -> std::io::Result<()> {
        let front_end_listener = TcpListener::bind(self.config.my_addr)?;
        let paxos_listener = TcpListener::bind(self.config.my_paxos)?;

        info!(
            "replica listening for clients on {} and for peers on {}",
            self.config.my_addr, self.config.my_paxos
        );

        let front_end = self.front_end.clone();
        thread::spawn(move || {
            rpc::serve::<FrontEndRequest, _, _>(front_end_listener, move |request| {
                front_end.dispatch(request)
            });
        });

        let replication = self.replication.clone();
        thread::spawn(move || {
            rpc::serve::<ReplicationRequest, _, _>(paxos_listener, move |request| {
                replication.dispatch(request)
            });
        });

        Ok(())
    }

    /// Discovers (or elects) the coordinator and pulls a recovery
    /// snapshot. Callers should run this only after `serve()`, since
    /// `initialize()` may issue RPCs to itself.
    pub fn initialize(&self) -> Result<()> {
        self.replication.initialize()
    }
}
