//! The KV Front-End: the listener clients actually talk to. Forwards every
//! request to whichever replica is currently believed to be the
//! coordinator, with a single election-and-retry on a transient failure.
//!
//! `Get`/`Put`/`Delete` all forward to the coordinator stub and, on
//! `DEADLINE_EXCEEDED`/`UNAVAILABLE`, elect a new coordinator and retry once
//! before giving up with `INTERNAL`.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::error::{Result, RpcStatus};
use crate::message::{FrontEndRequest, FrontEndResponse, ReplicationRequest, ReplicationResponse};
use crate::peer_registry::PeerRegistry;
use crate::replication::ReplicationService;

/// Deadline applied to the forwarded replication RPC on both the first
/// attempt and the retry.
const FORWARD_DEADLINE: Duration = Duration::from_secs(5);

pub struct KvFrontEnd {
    registry: Arc<PeerRegistry>,
    replication: Arc<ReplicationService>,
}

impl KvFrontEnd {
    pub fn new(registry: Arc<PeerRegistry>, replication: Arc<ReplicationService>) -> Self {
        KvFrontEnd {
            registry,
            replication,
        }
    }

    pub fn dispatch(&self, request: FrontEndRequest) -> Result<FrontEndResponse> {
        match request {
            FrontEndRequest::Get { key } => {
                let response = self.forward_with_retry(ReplicationRequest::GetValue { key })?;
                match response {
                    ReplicationResponse::Value { value } => Ok(FrontEndResponse::Value { value }),
                    _ => Err(RpcStatus::Internal("unexpected response to GetValue".into())),
                }
            }
            FrontEndRequest::Put { key, value } => {
                self.forward_with_retry(ReplicationRequest::PutPair { key, value })?;
                Ok(FrontEndResponse::Empty)
            }
            FrontEndRequest::Delete { key } => {
                self.forward_with_retry(ReplicationRequest::DeletePair { key })?;
                Ok(FrontEndResponse::Empty)
            }
        }
    }

    /// Forwards to the coordinator. No coordinator known at all is an
    /// immediate `ABORTED` -- this does not itself trigger an election. On
    /// `DEADLINE_EXCEEDED`/`UNAVAILABLE` from the forwarded call, triggers an
    /// election and retries exactly once; any further failure (including a
    /// second transient one) surfaces as `INTERNAL`.
    fn forward_with_retry(&self, request: ReplicationRequest) -> Result<ReplicationResponse> {
        let coordinator_address = self
            .registry
            .get_coordinator()
            .ok_or_else(|| RpcStatus::Aborted("Coordinator is not set".into()))?;

        let stub = self
            .registry
            .get_stub(&coordinator_address)
            .ok_or_else(|| RpcStatus::Aborted("Coordinator is not set".into()))?;

        match stub.call(&request, FORWARD_DEADLINE) {
            Ok(response) => Ok(response),
            Err(e) if e.is_retryable_via_election() => {
                warn!("coordinator {} unreachable ({}), electing a new one", coordinator_address, e);
                self.elect_and_forward_once(request)
            }
            Err(e) => Err(e),
        }
    }

    fn elect_and_forward_once(&self, request: ReplicationRequest) -> Result<ReplicationResponse> {
        self.replication
            .elect_new_coordinator()
            .map_err(|e| RpcStatus::Internal(format!("election failed: {}", e)))?;

        let coordinator_address = self
            .registry
            .get_coordinator()
            .ok_or_else(|| RpcStatus::Internal("no coordinator after election".into()))?;
        let stub = self
            .registry
            .get_stub(&coordinator_address)
            .ok_or_else(|| RpcStatus::Internal("no stub for elected coordinator".into()))?;

        stub.call(&request, FORWARD_DEADLINE)
            .map_err(|e| RpcStatus::Internal(format!("retry after election failed: {}", e)))
    }
}
