use libdagmesh_core::MeshError;
use libdagmesh_net::NetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("{0}")]
    Net(#[from] NetError),

    #[error("invalid scenario {path}: {message}")]
    Scenario { path: String, message: String },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<MeshError> for SimError {
    fn from(e: MeshError) -> Self {
        SimError::Net(NetError::Mesh(e))
    }
}

impl SimError {
    pub fn error_code(&self) -> &str {
        match self {
            SimError::Net(e) => e.error_code(),
            SimError::Scenario { .. } => "invalid_scenario",
            SimError::Read { .. } => "io_error",
            SimError::Json(_) => "internal_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Net(e) => e.exit_code(),
            SimError::Scenario { .. } => 2,
            SimError::Read { .. } => 5,
            SimError::Json(_) => 1,
        }
    }

    /// Diverging (node, document) pairs when the run timed out waiting for sync
    pub fn divergence(&self) -> Option<serde_json::Value> {
        match self {
            SimError::Net(NetError::Mesh(MeshError::Timeout { diverging, .. }))
                if !diverging.is_empty() =>
            {
                let pairs: Vec<serde_json::Value> = diverging
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "node": d.node,
                            "doc": d.doc,
                            "expected": d.expected,
                            "actual": d.actual,
                        })
                    })
                    .collect();
                Some(serde_json::Value::Array(pairs))
            }
            _ => None,
        }
    }
}
