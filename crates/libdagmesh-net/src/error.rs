//! Network error types

use libdagmesh_core::MeshError;
use thiserror::Error;

/// Errors raised by nodes, the transport and the scenario dispatcher
#[derive(Error, Debug)]
pub enum NetError {
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// No route to the peer
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Request to {peer} timed out after {ms}ms")]
    RequestTimeout { peer: String, ms: u64 },

    /// Peer answered with an error this side has no variant for
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("Node is shut down")]
    Shutdown,

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// A scenario expectation did not hold
    #[error("Expectation failed: {0}")]
    Expectation(String),
}

impl NetError {
    /// Rebuild an error reported by a peer
    pub fn from_remote(code: &str, message: String) -> Self {
        match code {
            "not_found" => MeshError::NotFound(message).into(),
            "invalid_args" => MeshError::InvalidArgs(message).into(),
            "transaction_conflict" => MeshError::TransactionConflict(message).into(),
            "topology_conflict" => MeshError::TopologyConflict(message).into(),
            "unauthorized" => MeshError::Unauthorized(message).into(),
            _ => NetError::Remote {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Stable code, shared with `MeshError::error_code`
    pub fn error_code(&self) -> &str {
        match self {
            NetError::Mesh(e) => e.error_code(),
            NetError::Unreachable(_) => "unreachable",
            NetError::RequestTimeout { .. } => "timeout",
            NetError::Remote { code, .. } => code,
            NetError::Shutdown => "shutdown",
            NetError::UnexpectedResponse(_) => "protocol_error",
            NetError::UnknownNode(_) => "not_found",
            NetError::Expectation(_) => "expectation_failed",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, NetError::Mesh(e) if e.is_retryable())
    }

    /// Exit code for the scenario runner
    pub fn exit_code(&self) -> i32 {
        match self {
            NetError::Mesh(e) => e.exit_code(),
            NetError::UnknownNode(_) => 3,
            NetError::RequestTimeout { .. } => 6,
            NetError::Expectation(_) => 8,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_codes_map_back() {
        let err = NetError::from_remote("topology_conflict", "opposite edge".into());
        assert!(matches!(err, NetError::Mesh(MeshError::TopologyConflict(_))));
        assert_eq!(err.error_code(), "topology_conflict");

        let err = NetError::from_remote("db_busy", "locked".into());
        assert_eq!(err.error_code(), "db_busy");
    }

    #[test]
    fn test_conflict_detection() {
        assert!(NetError::from(MeshError::TransactionConflict("x".into())).is_conflict());
        assert!(!NetError::Shutdown.is_conflict());
    }
}
