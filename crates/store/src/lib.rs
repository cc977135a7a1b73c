//! liveset store: the record store interface consumed by result-set
//! controllers, plus `MemoryStore`, an in-RAM reference implementation.

#![forbid(unsafe_code)]

use liveset_core::{QueryDescriptor, Record, RecordId, Value};
use serde::Serialize;
use smallvec::SmallVec;

mod memory;

pub use memory::{EntitySchema, MemoryStore, WriteBatch};

/// Field names touched by an update.
pub type ChangedFields = SmallVec<[String; 4]>;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("unknown field `{field}` on entity `{entity}`")]
    UnknownField { entity: String, field: String },
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
    #[error("query rejected: {0}")]
    Rejected(String),
}

/// Post-write version of an updated record and the fields that changed.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub record: Record,
    pub changed: ChangedFields,
}

/// One committed write, as delivered to subscribers.
///
/// Deleted records carry their last version so scope checks can still
/// evaluate them.
#[derive(Debug, Clone, Default)]
pub struct StoreChange {
    pub inserted: Vec<Record>,
    pub updated: Vec<RecordUpdate>,
    pub deleted: Vec<Record>,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool { self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty() }
    pub fn len(&self) -> usize { self.inserted.len() + self.updated.len() + self.deleted.len() }
}

/// Number of matching records for one group value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCount {
    pub value: Value,
    pub count: usize,
}

pub type ChangeCallback = Box<dyn Fn(&StoreChange) + Send + Sync>;

/// Handle for a store subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self { Self { cancel: Some(Box::new(cancel)) } }

    /// A handle with nothing to release, for stores that never notify.
    pub fn detached() -> Self { Self { cancel: None } }

    pub fn cancel(mut self) { self.release() }

    fn release(&mut self) {
        if let Some(f) = self.cancel.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.release() }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.cancel.is_some()).finish()
    }
}

/// Source of records for result-set controllers.
///
/// `execute` returns records matching the query's entity and predicate,
/// ordered by its sort keys and windowed by offset/limit.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn execute(&self, query: &QueryDescriptor) -> Result<Vec<Record>, StoreError>;

    /// Per-group counts over the unwindowed result, in group order. `None`
    /// when `group_key` cannot be counted store-side (derived or transient
    /// fields); callers then tally in memory.
    async fn grouped_count(&self, _query: &QueryDescriptor, _group_key: &str) -> Result<Option<Vec<GroupCount>>, StoreError> {
        Ok(None)
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription;
}

#[async_trait::async_trait]
impl<S: RecordStore + ?Sized> RecordStore for std::sync::Arc<S> {
    async fn execute(&self, query: &QueryDescriptor) -> Result<Vec<Record>, StoreError> { (**self).execute(query).await }

    async fn grouped_count(&self, query: &QueryDescriptor, group_key: &str) -> Result<Option<Vec<GroupCount>>, StoreError> {
        (**self).grouped_count(query, group_key).await
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription { (**self).subscribe(on_change) }
}
