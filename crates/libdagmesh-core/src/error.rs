use std::fmt;

use thiserror::Error;

/// A (node, document) pair whose actual heads differ from the expected heads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub node: String,
    pub doc: String,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} expected [{}] actual [{}]",
            self.node,
            self.doc,
            self.expected.join(","),
            self.actual.join(",")
        )
    }
}

fn describe_divergence(diverging: &[Divergence]) -> String {
    if diverging.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = diverging.iter().map(|d| d.to_string()).collect();
    format!("; diverging: {}", parts.join("; "))
}

/// Main error type for dagmesh operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("document {doc} is incomplete: missing commit {missing}")]
    Incomplete { doc: String, missing: String },

    #[error("commit {cid} rejected: missing parents {}", .missing.join(","))]
    MissingParents { cid: String, missing: Vec<String> },

    #[error("transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("topology conflict: {0}")]
    TopologyConflict(String),

    #[error("timed out waiting for {what}{}", describe_divergence(.diverging))]
    Timeout {
        what: String,
        diverging: Vec<Divergence>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    #[error("signing error: {0}")]
    Signing(#[from] crate::signing::SigningError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Stable code for wire errors and JSON output
    pub fn error_code(&self) -> &'static str {
        match self {
            MeshError::InvalidArgs(_) => "invalid_args",
            MeshError::NotFound(_) => "not_found",
            MeshError::AlreadyExists(_) => "already_exists",
            MeshError::Incomplete { .. } => "incomplete",
            MeshError::MissingParents { .. } => "missing_parents",
            MeshError::TransactionConflict(_) => "transaction_conflict",
            MeshError::TopologyConflict(_) => "topology_conflict",
            MeshError::Timeout { .. } => "timeout",
            MeshError::Unauthorized(_) => "unauthorized",
            MeshError::DbBusy(_) => "db_busy",
            MeshError::Crypto(_) => "crypto_error",
            MeshError::Cbor(_) => "internal_error",
            MeshError::Io(_) => "io_error",
            MeshError::Sled(_) => "db_error",
            MeshError::Json(_) => "internal_error",
            MeshError::TomlParse(_) => "invalid_args",
            MeshError::TomlSerialize(_) => "internal_error",
            MeshError::IdParse(_) => "invalid_args",
            MeshError::Signing(_) => "unauthorized",
            MeshError::Internal(_) => "internal_error",
        }
    }

    /// Exit code for the scenario runner
    pub fn exit_code(&self) -> i32 {
        match self {
            MeshError::InvalidArgs(_) | MeshError::IdParse(_) | MeshError::TomlParse(_) => 2,
            MeshError::NotFound(_) => 3,
            MeshError::TransactionConflict(_) | MeshError::TopologyConflict(_) => 4,
            MeshError::DbBusy(_) | MeshError::Io(_) | MeshError::Sled(_) => 5,
            MeshError::Timeout { .. } => 6,
            MeshError::Unauthorized(_) | MeshError::Signing(_) => 7,
            _ => 1,
        }
    }

    /// Whether a bounded retry of the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::TransactionConflict(_))
    }

    /// Whether fetching from a peer may resolve the error
    pub fn is_recoverable_by_fetch(&self) -> bool {
        matches!(
            self,
            MeshError::NotFound(_) | MeshError::Incomplete { .. } | MeshError::MissingParents { .. }
        )
    }
}

impl From<sled::transaction::TransactionError<MeshError>> for MeshError {
    fn from(e: sled::transaction::TransactionError<MeshError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(inner) => MeshError::Sled(inner),
        }
    }
}
