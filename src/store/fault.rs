//! Injectable fault policy for the in-memory store.
//!
//! A policy is an ordered list of rules. Each rule pairs a predicate over the
//! operation and key with the [`FaultKind`] to force. The first matching rule
//! wins and the operation fails without touching any state.

use std::fmt;
use std::sync::Arc;

use crate::error::{FaultKind, StoreError, StoreOp};

type Predicate = Arc<dyn Fn(StoreOp, &str) -> bool + Send + Sync>;

/// One forced outcome.
#[derive(Clone)]
pub struct FaultRule {
    predicate: Predicate,
    kind: FaultKind,
}

impl FaultRule {
    pub fn new<F>(predicate: F, kind: FaultKind) -> Self
    where
        F: Fn(StoreOp, &str) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            kind,
        }
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    fn matches(&self, op: StoreOp, key: &str) -> bool {
        (self.predicate)(op, key)
    }
}

impl fmt::Debug for FaultRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultRule")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Ordered table of forced outcomes. Empty by default.
#[derive(Debug, Clone, Default)]
pub struct FaultPolicy {
    rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule with an arbitrary predicate.
    pub fn fail_when<F>(mut self, predicate: F, kind: FaultKind) -> Self
    where
        F: Fn(StoreOp, &str) -> bool + Send + Sync + 'static,
    {
        self.rules.push(FaultRule::new(predicate, kind));
        self
    }

    /// Fails every call of `op`, whatever the key.
    pub fn fail_op(self, op: StoreOp, kind: FaultKind) -> Self {
        self.fail_when(move |candidate, _| candidate == op, kind)
    }

    /// Fails every operation on exactly `key`.
    pub fn fail_key(self, key: impl Into<String>, kind: FaultKind) -> Self {
        let key = key.into();
        self.fail_when(move |_, candidate| candidate == key, kind)
    }

    /// Fails `op` on exactly `key`.
    pub fn fail_op_on_key(self, op: StoreOp, key: impl Into<String>, kind: FaultKind) -> Self {
        let key = key.into();
        self.fail_when(
            move |candidate_op, candidate_key| candidate_op == op && candidate_key == key,
            kind,
        )
    }

    /// Rebuilds the marker-substring convention as ordinary rules:
    /// writes on keys containing `fail-set`, reads on `fail-get`, deletes on
    /// `fail-del`, and any operation on `fail-sto`.
    pub fn marker_substrings() -> Self {
        Self::new()
            .fail_when(
                |op, key| op.is_write() && key.contains("fail-set"),
                FaultKind::SetFailure,
            )
            .fail_when(
                |op, key| op.is_read() && key.contains("fail-get"),
                FaultKind::GetFailure,
            )
            .fail_when(
                |op, key| op.is_delete() && key.contains("fail-del"),
                FaultKind::DeleteFailure,
            )
            .fail_when(|_, key| key.contains("fail-sto"), FaultKind::GenericFailure)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the forced error for `op` on `key`, if any rule matches.
    pub fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        match self.rules.iter().find(|rule| rule.matches(op, key)) {
            Some(rule) => Err(StoreError::Fault {
                kind: rule.kind,
                op,
                key: key.to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy_allows_everything() {
        let policy = FaultPolicy::new();
        assert!(policy.is_empty());
        assert!(policy.check(StoreOp::Set, "fail-set").is_ok());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = FaultPolicy::new()
            .fail_key("k", FaultKind::GetFailure)
            .fail_op(StoreOp::Get, FaultKind::GenericFailure);

        let err = policy.check(StoreOp::Get, "k").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Fault {
                kind: FaultKind::GetFailure,
                ..
            }
        ));

        let err = policy.check(StoreOp::Get, "other").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Fault {
                kind: FaultKind::GenericFailure,
                ..
            }
        ));
        assert!(policy.check(StoreOp::Set, "other").is_ok());
    }

    #[test]
    fn test_marker_substrings_scope_by_operation_class() {
        let policy = FaultPolicy::marker_substrings();

        assert!(policy.check(StoreOp::Set, "user:fail-set:1").is_err());
        assert!(policy.check(StoreOp::Get, "user:fail-set:1").is_ok());

        assert!(policy.check(StoreOp::Get, "user:fail-get").is_err());
        assert!(policy.check(StoreOp::Delete, "user:fail-del").is_err());
        assert!(policy.check(StoreOp::Exists, "x-fail-sto").is_err());
        assert!(policy.check(StoreOp::Set, "plain").is_ok());
    }

    #[test]
    fn test_op_on_key() {
        let policy =
            FaultPolicy::new().fail_op_on_key(StoreOp::ListPush, "data", FaultKind::SetFailure);
        assert!(policy.check(StoreOp::ListPush, "data").is_err());
        assert!(policy.check(StoreOp::ListPush, "control").is_ok());
        assert!(policy.check(StoreOp::ListPop, "data").is_ok());
    }
}
