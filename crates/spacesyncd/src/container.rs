//! Diff container
//!
//! Owns the reconciliation engine for one space and negotiates with a
//! remote peer whether it can participate in the scheme at all before any
//! range comparison runs. The engine is internally synchronized, so the
//! single local writer (head updates) and concurrent per-peer sync
//! readers interleave safely; a local `set` is visible to the next
//! `diff` on the same container.

use crate::diff::{Diff, DiffError, RemoteDiff};
use spacesync_core::types::*;
use std::sync::Arc;

/// Wraps the engine with capability negotiation.
pub struct DiffContainer {
    diff: Arc<Diff>,
}

impl Default for DiffContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffContainer {
    pub fn new() -> Self {
        Self {
            diff: Arc::new(Diff::new()),
        }
    }

    /// Ask the remote for its reconciliation scheme. Supported iff it
    /// matches ours; the engine handle is returned either way so the
    /// caller can log state without re-locking.
    pub async fn diff_type_check(
        &self,
        remote: &dyn RemoteDiff,
    ) -> Result<(bool, Arc<Diff>), DiffError> {
        let remote_type = remote.diff_type().await?;
        Ok((remote_type == self.diff.diff_type(), self.diff.clone()))
    }

    /// Upsert one element.
    pub fn set(&self, element: Element) {
        self.diff.set(element);
    }

    /// Drop one element.
    pub fn remove(&self, id: &ObjectId) {
        self.diff.remove(id);
    }

    /// The current engine instance.
    pub fn precalculated_diff(&self) -> Arc<Diff> {
        self.diff.clone()
    }

    /// The current aggregate digest.
    pub fn hash(&self) -> Bytes32 {
        self.diff.hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FullSetRemote;

    #[async_trait]
    impl RemoteDiff for FullSetRemote {
        async fn diff_type(&self) -> Result<DiffType, DiffError> {
            Ok(DiffType::FullSet)
        }

        async fn ranges(&self, _ranges: &[DiffRange]) -> Result<Vec<RangeResult>, DiffError> {
            Err(DiffError::Unexpected("legacy remote".into()))
        }
    }

    #[tokio::test]
    async fn test_type_check_accepts_matching_scheme() {
        let container = DiffContainer::new();
        let remote = Diff::new();

        let (supported, engine) = container.diff_type_check(&remote).await.unwrap();
        assert!(supported);
        assert_eq!(engine.diff_type(), DiffType::RangeHash);
    }

    #[tokio::test]
    async fn test_type_check_rejects_legacy_scheme() {
        let container = DiffContainer::new();

        let (supported, _) = container.diff_type_check(&FullSetRemote).await.unwrap();
        assert!(!supported);
    }

    #[tokio::test]
    async fn test_local_set_visible_to_next_diff() {
        let container = DiffContainer::new();
        let remote = Diff::new();

        let element = Element {
            id: ObjectId([1; 32]),
            head: "h1".into(),
        };
        container.set(element.clone());

        let engine = container.precalculated_diff();
        let (_, _, removed) = engine.diff(&remote).await.unwrap();
        assert_eq!(removed, vec![element.id]);
        assert_eq!(container.hash(), engine.hash());
    }
}
