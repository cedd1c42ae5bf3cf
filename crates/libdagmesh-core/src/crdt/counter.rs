use std::collections::BTreeMap;

use super::Crdt;
use crate::error::MeshError;
use crate::types::commit::{CrdtKind, FieldDelta, Value};
use crate::types::ids::Cid;

/// Increment/decrement counter.
///
/// Deltas are keyed by the CID of the commit that carried them, so a commit
/// delivered twice is counted once. Integer sums wrap on overflow; float sums
/// are taken in CID order so the result does not depend on delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
    kind: CrdtKind,
    applied: BTreeMap<Cid, Value>,
}

impl Counter {
    pub fn new(kind: CrdtKind) -> Self {
        Self {
            kind,
            applied: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> CrdtKind {
        self.kind
    }

    /// Number of distinct deltas folded in
    pub fn applied(&self) -> usize {
        self.applied.len()
    }
}

impl Crdt for Counter {
    fn merge(&self, cid: &Cid, _priority: u64, delta: &FieldDelta) -> Result<Self, MeshError> {
        let value = match delta {
            FieldDelta::Counter { value, .. } => value,
            FieldDelta::Lww { .. } => {
                return Err(MeshError::InvalidArgs(
                    "lww delta applied to counter".to_string(),
                ))
            }
        };
        if !matches!(value, Value::Int(_) | Value::Float(_)) {
            return Err(MeshError::InvalidArgs(format!(
                "counter delta must be int or float, got {}",
                value.type_name()
            )));
        }
        if self.kind == CrdtKind::PCounter && value.is_negative() {
            return Err(MeshError::InvalidArgs(
                "p_counter does not accept negative deltas".to_string(),
            ));
        }
        if self.applied.contains_key(cid) {
            return Ok(self.clone());
        }

        let mut next = self.clone();
        next.applied.insert(*cid, value.clone());
        Ok(next)
    }

    fn value(&self) -> Value {
        let has_float = self.applied.values().any(|v| matches!(v, Value::Float(_)));
        if has_float {
            let sum = self.applied.values().fold(0.0f64, |acc, v| match v {
                Value::Int(i) => acc + *i as f64,
                Value::Float(f) => acc + f,
                _ => acc,
            });
            Value::Float(sum)
        } else {
            let sum = self.applied.values().fold(0i64, |acc, v| match v {
                Value::Int(i) => acc.wrapping_add(*i),
                _ => acc,
            });
            Value::Int(sum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inc(v: i64) -> FieldDelta {
        FieldDelta::Counter { value: Value::Int(v), nonce: 1 }
    }

    #[test]
    fn test_duplicate_cid_counted_once() {
        let c = Counter::new(CrdtKind::PnCounter)
            .merge(&[1; 32], 1, &inc(5))
            .unwrap()
            .merge(&[1; 32], 1, &inc(5))
            .unwrap();
        assert_eq!(c.value(), Value::Int(5));
        assert_eq!(c.applied(), 1);
    }

    #[test]
    fn test_pn_counter_accepts_decrements() {
        let c = Counter::new(CrdtKind::PnCounter)
            .merge(&[1; 32], 1, &inc(5))
            .unwrap()
            .merge(&[2; 32], 2, &inc(-8))
            .unwrap();
        assert_eq!(c.value(), Value::Int(-3));
    }

    #[test]
    fn test_p_counter_rejects_decrements() {
        let err = Counter::new(CrdtKind::PCounter)
            .merge(&[1; 32], 1, &inc(-1))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidArgs(_)));
    }

    #[test]
    fn test_integer_overflow_wraps() {
        let c = Counter::new(CrdtKind::PCounter)
            .merge(&[1; 32], 1, &inc(i64::MAX))
            .unwrap()
            .merge(&[2; 32], 2, &inc(1))
            .unwrap();
        assert_eq!(c.value(), Value::Int(i64::MIN));
    }

    #[test]
    fn test_float_sum_independent_of_order() {
        let d = |f: f64| FieldDelta::Counter { value: Value::Float(f), nonce: 1 };
        let a = Counter::new(CrdtKind::PnCounter)
            .merge(&[1; 32], 1, &d(0.1))
            .unwrap()
            .merge(&[2; 32], 1, &d(0.2))
            .unwrap()
            .merge(&[3; 32], 1, &d(0.3))
            .unwrap();
        let b = Counter::new(CrdtKind::PnCounter)
            .merge(&[3; 32], 1, &d(0.3))
            .unwrap()
            .merge(&[1; 32], 1, &d(0.1))
            .unwrap()
            .merge(&[2; 32], 1, &d(0.2))
            .unwrap();
        assert_eq!(a.value(), b.value());
    }

    #[test]
    fn test_text_delta_rejected() {
        let delta = FieldDelta::Counter { value: Value::from("ten"), nonce: 1 };
        assert!(Counter::new(CrdtKind::PnCounter).merge(&[1; 32], 1, &delta).is_err());
    }

    #[test]
    fn test_empty_counter_is_zero() {
        assert_eq!(Counter::new(CrdtKind::PnCounter).value(), Value::Int(0));
    }
}
