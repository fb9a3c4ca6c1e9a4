//! The wire data model: the `Operation` a Paxos round decides on, the
//! per-(key, round) log slot acceptors keep, and the request/response
//! envelopes carried by the KV Front-End and the Replication Service.
//!
//! This plays the role the old `Message<T>` enum played in the UDP-based
//! predecessor of this crate, but the payload is now fixed to the
//! key-value domain instead of being generic over an arbitrary `T`: every
//! replica agrees on `Operation`s, not on arbitrary application values.

use std::collections::{BTreeMap, HashMap};

/// The reserved key naming the consensus variable that stores the elected
/// coordinator's address. Illegal as a client key.
pub const COORDINATOR_KEY: &str = "coordinator";

/// The operation a Paxos round ultimately decides on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Operation {
    /// Sentinel used only inside empty log slots.
    NotSet,
    Set(String),
    Delete,
    SetCoordinator(String),
}

impl Default for Operation {
    fn default() -> Self {
        Operation::NotSet
    }
}

/// Per (key, round) Paxos log slot.
///
/// `accepted_type`/`accepted_value` are folded into a single
/// `accepted_op` field: an `Operation::Set`/`SetCoordinator` variant already
/// carries its value, so a parallel `accepted_value` field would just be a
/// second place for the two to disagree.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct LogSlot {
    /// Highest proposal id this acceptor has promised not to accept below.
    /// 0 means "none".
    pub promised_id: u64,
    /// Proposal id of the highest proposal this acceptor has accepted in
    /// this slot. 0 means "none".
    pub accepted_id: u64,
    pub accepted_op: Operation,
}

impl LogSlot {
    pub fn has_accepted(&self) -> bool {
        self.accepted_id > 0
    }
}

/// The `(round, propose_id, operation)` triple an acceptor echoes back on
/// Propose and that the coordinator later carries into Inform.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub round: u64,
    pub propose_id: u64,
    pub op: Operation,
}

/// A client mutation translated into its Paxos operation: a tagged variant
/// with its own `to_operation` method in place of a per-request-type
/// overloaded setter.
#[derive(Debug, Clone)]
pub enum MutatingRequest {
    Put { key: String, value: String },
    Delete { key: String },
    ElectCoordinator { coordinator: String },
}

impl MutatingRequest {
    pub fn key(&self) -> &str {
        match self {
            MutatingRequest::Put { key, .. } => key,
            MutatingRequest::Delete { key, .. } => key,
            MutatingRequest::ElectCoordinator { .. } => COORDINATOR_KEY,
        }
    }

    pub fn to_operation(&self) -> Operation {
        match self {
            MutatingRequest::Put { value, .. } => Operation::Set(value.clone()),
            MutatingRequest::Delete { .. } => Operation::Delete,
            MutatingRequest::ElectCoordinator { coordinator } => {
                Operation::SetCoordinator(coordinator.clone())
            }
        }
    }
}

/// Requests accepted by the KV Front-End listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum FrontEndRequest {
    Get { key: String },
    Put { key: String, value: String },
    Delete { key: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum FrontEndResponse {
    Value { value: String },
    Empty,
}

/// Requests accepted by the Replication Service listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ReplicationRequest {
    GetValue { key: String },
    PutPair { key: String, value: String },
    DeletePair { key: String },
    ElectCoordinator { key: String, coordinator: String },
    GetCoordinator,
    Prepare { key: String, round: u64, propose_id: u64 },
    Propose { key: String, round: u64, propose_id: u64, op: Operation },
    Inform { key: String, acceptance: Acceptance },
    Ping,
    Recover,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ReplicationResponse {
    Value { value: String },
    Empty,
    Coordinator { coordinator: String },
    Promise {
        round: u64,
        propose_id: u64,
        accepted: Option<(u64, Operation)>,
    },
    Accept {
        round: u64,
        propose_id: u64,
        op: Operation,
    },
    Recovered(RecoverySnapshot),
}

/// The full state transferred to a replica catching up.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RecoverySnapshot {
    pub data: HashMap<String, String>,
    pub logs: HashMap<String, BTreeMap<u64, LogSlot>>,
}
