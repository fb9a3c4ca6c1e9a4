//! The error taxonomy shared by every RPC boundary in this crate: the KV
//! Front-End, the Replication Service, and the synchronous transport that
//! carries both.

use thiserror::Error;

/// Mirrors the status codes a `grpc::Status` would carry in the original
/// service (CANCELLED, NOT_FOUND, ABORTED, DEADLINE_EXCEEDED, UNAVAILABLE,
/// INTERNAL), each keeping the reason string callers are expected to log or
/// surface to the client.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcStatus {
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RpcStatus>;

impl RpcStatus {
    /// The front-end and the coordinator's election path both need to tell
    /// a transient peer failure apart from a definite rejection, so that
    /// only the former triggers an election-and-retry.
    pub fn is_retryable_via_election(&self) -> bool {
        matches!(self, RpcStatus::DeadlineExceeded | RpcStatus::Unavailable(_))
    }
}
