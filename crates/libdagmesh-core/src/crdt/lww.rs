use super::Crdt;
use crate::error::MeshError;
use crate::types::commit::{FieldDelta, Value};
use crate::types::ids::Cid;

/// Last-writer-wins register.
///
/// The winning write is the one with the greatest `(priority, cid)`; priority
/// is the version height, so later versions win and concurrent versions at the
/// same height are ordered by their content id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LwwRegister {
    winner: Option<Entry>,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    priority: u64,
    cid: Cid,
    value: Value,
}

impl LwwRegister {
    /// `(priority, cid)` of the current winner
    pub fn version(&self) -> Option<(u64, Cid)> {
        self.winner.as_ref().map(|e| (e.priority, e.cid))
    }
}

impl Crdt for LwwRegister {
    fn merge(&self, cid: &Cid, priority: u64, delta: &FieldDelta) -> Result<Self, MeshError> {
        let value = match delta {
            FieldDelta::Lww { value } => value,
            FieldDelta::Counter { .. } => {
                return Err(MeshError::InvalidArgs(
                    "counter delta applied to lww register".to_string(),
                ))
            }
        };

        let newer = match &self.winner {
            Some(current) => (priority, cid) > (current.priority, &current.cid),
            None => true,
        };
        if !newer {
            return Ok(self.clone());
        }
        Ok(Self {
            winner: Some(Entry {
                priority,
                cid: *cid,
                value: value.clone(),
            }),
        })
    }

    fn value(&self) -> Value {
        self.winner
            .as_ref()
            .map(|e| e.value.clone())
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(value: &str) -> FieldDelta {
        FieldDelta::Lww { value: Value::from(value) }
    }

    #[test]
    fn test_higher_priority_wins() {
        let r = LwwRegister::default()
            .merge(&[9; 32], 1, &set("John"))
            .unwrap()
            .merge(&[1; 32], 2, &set("Fred"))
            .unwrap();
        assert_eq!(r.value(), Value::from("Fred"));
        assert_eq!(r.version(), Some((2, [1; 32])));
    }

    #[test]
    fn test_cid_breaks_ties() {
        let r1 = LwwRegister::default()
            .merge(&[1; 32], 2, &set("a"))
            .unwrap()
            .merge(&[2; 32], 2, &set("b"))
            .unwrap();
        let r2 = LwwRegister::default()
            .merge(&[2; 32], 2, &set("b"))
            .unwrap()
            .merge(&[1; 32], 2, &set("a"))
            .unwrap();
        assert_eq!(r1.value(), Value::from("b"));
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_empty_register_is_null() {
        assert_eq!(LwwRegister::default().value(), Value::Null);
    }

    #[test]
    fn test_counter_delta_rejected() {
        let delta = FieldDelta::Counter { value: Value::Int(1), nonce: 1 };
        assert!(LwwRegister::default().merge(&[0; 32], 1, &delta).is_err());
    }
}
