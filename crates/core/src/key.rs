//! Composite keys for coalescing result batches.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResultBatch;

pub const KEY_SEPARATOR: &str = "/";

/// Deterministic identity of a [`ResultBatch`]: policy, namespace, result
/// count and the ordered resource keys. The empty key is reserved as the
/// "not a key" sentinel and is never produced by [`build_key`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// 64-bit FNV-1a of the key bytes (shard selection, record names).
    pub fn fingerprint(&self) -> u64 { fnv1a64(self.0.as_bytes()) }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for CompositeKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for CompositeKey {
    fn from(s: String) -> Self { Self(s) }
}

/// Results are taken in caller order; nothing is sorted here.
pub fn build_key(batch: &ResultBatch) -> CompositeKey {
    let mut parts: Vec<String> = Vec::with_capacity(3 + batch.results.len());
    parts.push(batch.policy_name.clone());
    parts.push(batch.namespace.clone());
    parts.push(batch.results.len().to_string());
    parts.extend(batch.results.iter().map(|r| r.resource.key()));
    CompositeKey(parts.join(KEY_SEPARATOR))
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EvaluationResult, ResourceSpec, RuleStatus, ViolatedRule};

    fn result(name: &str, status: RuleStatus) -> EvaluationResult {
        EvaluationResult {
            resource: ResourceSpec { kind: "Pod".into(), namespace: "ns1".into(), name: name.into(), ..Default::default() },
            rules: smallvec::smallvec![ViolatedRule { name: "check".into(), status, ..Default::default() }],
        }
    }

    fn batch(policy: &str, ns: &str, results: Vec<EvaluationResult>) -> ResultBatch {
        ResultBatch { policy_name: policy.into(), namespace: ns.into(), results }
    }

    #[test]
    fn key_layout() {
        let b = batch("p1", "ns1", vec![result("a", RuleStatus::Pass), result("b", RuleStatus::Pass)]);
        assert_eq!(build_key(&b).as_str(), "p1/ns1/2/Pod/ns1/a/Pod/ns1/b");
    }

    #[test]
    fn rule_outcomes_do_not_affect_key() {
        let a = batch("p1", "ns1", vec![result("a", RuleStatus::Pass)]);
        let b = batch("p1", "ns1", vec![result("a", RuleStatus::Fail)]);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn result_order_is_significant() {
        let a = batch("p1", "ns1", vec![result("a", RuleStatus::Pass), result("b", RuleStatus::Pass)]);
        let b = batch("p1", "ns1", vec![result("b", RuleStatus::Pass), result("a", RuleStatus::Pass)]);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn empty_batches_get_distinct_non_empty_keys() {
        let ns = batch("p1", "ns1", vec![]);
        let cluster = batch("p1", "", vec![]);
        let other = batch("p2", "ns1", vec![]);
        assert!(!ns.key().is_empty());
        assert_eq!(cluster.key().as_str(), "p1//0");
        assert_ne!(ns.key(), cluster.key());
        assert_ne!(ns.key(), other.key());
        assert!(CompositeKey::default().is_empty());
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        let k = CompositeKey::from("p1/ns1/0");
        assert_eq!(k.fingerprint(), CompositeKey::from("p1/ns1/0".to_string()).fingerprint());
    }
}
