use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

use super::{ExecutionStore, NodeQuery, NodeUpdate, Sort, StoreError, StoreResult, UpdateAck};
use crate::execution::types::NodeExecution;

#[derive(Debug, Default)]
struct Collection {
    next_seq: u64,
    by_seq: BTreeMap<u64, NodeExecution>,
    seq_by_id: HashMap<String, u64>,
}

impl Collection {
    fn matching(&self, query: &NodeQuery) -> Vec<NodeExecution> {
        let mut found: Vec<NodeExecution> = self
            .by_seq
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        if query.sort == Sort::CreatedAtDesc {
            // stable sort keeps insertion order among equal timestamps
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        found
    }

    fn push(&mut self, mut record: NodeExecution) -> NodeExecution {
        record.version = Some(0);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_by_id.insert(record.id.clone(), seq);
        self.by_seq.insert(seq, record.clone());
        record
    }
}

/// Process-local store; every write happens under one write lock, which
/// makes `find_and_modify` atomic.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    inner: RwLock<Collection>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|c| c.by_seq.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert(&self, record: NodeExecution) -> StoreResult<NodeExecution> {
        let mut collection = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        if collection.seq_by_id.contains_key(&record.id) {
            return Err(StoreError::DuplicateKey { id: record.id });
        }
        Ok(collection.push(record))
    }

    async fn insert_many(&self, records: Vec<NodeExecution>) -> StoreResult<Vec<NodeExecution>> {
        let mut collection = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let mut seen = std::collections::HashSet::new();
        for record in &records {
            if collection.seq_by_id.contains_key(&record.id) || !seen.insert(record.id.as_str()) {
                return Err(StoreError::DuplicateKey {
                    id: record.id.clone(),
                });
            }
        }
        Ok(records.into_iter().map(|r| collection.push(r)).collect())
    }

    async fn replace(&self, mut record: NodeExecution) -> StoreResult<Option<NodeExecution>> {
        let mut collection = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let Some(seq) = collection.seq_by_id.get(&record.id).copied() else {
            return Ok(None);
        };
        let Some(current) = collection.by_seq.get_mut(&seq) else {
            return Ok(None);
        };
        if current.version != record.version {
            debug!(
                node_execution_id = %record.id,
                stored_version = ?current.version,
                given_version = ?record.version,
                "Replace rejected on version mismatch"
            );
            return Ok(None);
        }
        record.created_at = current.created_at;
        record.last_updated_at = Utc::now();
        record.version = Some(current.version.map_or(0, |v| v + 1));
        *current = record.clone();
        Ok(Some(record))
    }

    async fn get(&self, id: &str) -> StoreResult<Option<NodeExecution>> {
        let collection = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(collection
            .seq_by_id
            .get(id)
            .and_then(|seq| collection.by_seq.get(seq))
            .cloned())
    }

    async fn find(&self, query: &NodeQuery) -> StoreResult<Vec<NodeExecution>> {
        let collection = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(collection.matching(query))
    }

    async fn count(&self, query: &NodeQuery) -> StoreResult<u64> {
        let collection = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(collection
            .by_seq
            .values()
            .filter(|record| query.matches(record))
            .count() as u64)
    }

    async fn find_and_modify(
        &self,
        filter: &NodeQuery,
        update: &NodeUpdate,
    ) -> StoreResult<Option<NodeExecution>> {
        let mut collection = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let target = match &filter.id {
            Some(id) => collection.seq_by_id.get(id).copied(),
            None => collection
                .by_seq
                .iter()
                .find(|(_, record)| filter.matches(record))
                .map(|(seq, _)| *seq),
        };
        let Some(record) = target.and_then(|seq| collection.by_seq.get_mut(&seq)) else {
            return Ok(None);
        };
        if !filter.matches(record) {
            return Ok(None);
        }
        update.apply(record, Utc::now());
        Ok(Some(record.clone()))
    }

    async fn update_many(&self, filter: &NodeQuery, update: &NodeUpdate) -> StoreResult<UpdateAck> {
        let mut collection = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();
        let mut matched = 0;
        for record in collection.by_seq.values_mut() {
            if filter.matches(record) {
                update.apply(record, now);
                matched += 1;
            }
        }
        Ok(UpdateAck::acknowledged(matched, matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::status::Status;
    use crate::execution::types::{Ambiance, StepCategory, StepType};
    use std::sync::Arc;

    fn node(id: &str, status: Status) -> NodeExecution {
        NodeExecution::new(
            Ambiance::new("plan-1"),
            "plan-node",
            id,
            StepType::new("DUMMY", StepCategory::Step),
        )
        .with_id(id)
        .with_status(status)
    }

    #[tokio::test]
    async fn test_insert_assigns_version_and_rejects_duplicates() {
        let store = InMemoryExecutionStore::new();
        let saved = store.insert(node("a", Status::Queued)).await.unwrap();
        assert_eq!(saved.version, Some(0));

        let err = store.insert(node("a", Status::Queued)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let store = InMemoryExecutionStore::new();
        store.insert(node("b", Status::Queued)).await.unwrap();

        let result = store
            .insert_many(vec![node("a", Status::Queued), node("b", Status::Queued)])
            .await;
        assert!(result.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_find_and_modify_respects_precondition() {
        let store = InMemoryExecutionStore::new();
        store.insert(node("a", Status::Success)).await.unwrap();

        let filter = NodeQuery::by_id("a").status_in(&[Status::Running]);
        let update = NodeUpdate::new().with_status(Status::Discontinuing);
        let result = store.find_and_modify(&filter, &update).await.unwrap();
        assert!(result.is_none());

        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Success);
        assert_eq!(stored.version, Some(0));
    }

    #[tokio::test]
    async fn test_replace_detects_stale_version() {
        let store = InMemoryExecutionStore::new();
        let saved = store.insert(node("a", Status::Queued)).await.unwrap();

        let fresh = store.replace(saved.clone()).await.unwrap();
        assert_eq!(fresh.unwrap().version, Some(1));

        // second writer still holds version 0
        let stale = store.replace(saved).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_newest_first_ordering() {
        let store = InMemoryExecutionStore::new();
        let mut older = node("old", Status::Running);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        store.insert(older).await.unwrap();
        store.insert(node("new", Status::Running)).await.unwrap();

        let natural = store.find(&NodeQuery::for_plan("plan-1")).await.unwrap();
        assert_eq!(natural[0].id, "old");

        let newest = store
            .find(&NodeQuery::for_plan("plan-1").newest_first())
            .await
            .unwrap();
        assert_eq!(newest[0].id, "new");
    }

    #[tokio::test]
    async fn test_concurrent_find_and_modify_has_single_winner() {
        let store = Arc::new(InMemoryExecutionStore::new());
        store.insert(node("a", Status::Running)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let filter = NodeQuery::by_id("a")
                    .status_in(Status::Discontinuing.allowed_predecessors());
                let update = NodeUpdate::new().with_status(Status::Discontinuing);
                store.find_and_modify(&filter, &update).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let stored = store.get("a").await.unwrap().unwrap();
        assert_eq!(stored.version, Some(1));
    }
}
