//! In-RAM record store with entity schemas and batched, coalesced writes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use liveset_core::{QueryDescriptor, Record, RecordId, Value};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{ChangeCallback, ChangedFields, GroupCount, RecordStore, RecordUpdate, StoreChange, StoreError, Subscription};

/// Declared fields of an entity. Transient fields can be stored, filtered and
/// sorted on, but the store will not count groups over them.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    fields: Vec<String>,
    transient: Vec<String>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), fields: Vec::new(), transient: Vec::new() } }

    pub fn field(mut self, name: impl Into<String>) -> Self { self.fields.push(name.into()); self }

    pub fn fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn transient(mut self, name: impl Into<String>) -> Self { self.transient.push(name.into()); self }

    pub fn name(&self) -> &str { &self.name }
    pub fn has_field(&self, field: &str) -> bool { self.is_queryable(field) || self.transient.iter().any(|f| f == field) }
    pub fn is_queryable(&self, field: &str) -> bool { self.fields.iter().any(|f| f == field) }

    fn check(&self, field: &str) -> Result<(), StoreError> {
        if self.has_field(field) {
            Ok(())
        } else {
            Err(StoreError::UnknownField { entity: self.name.clone(), field: field.to_string() })
        }
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Insert { entity: String, values: BTreeMap<String, Value> },
    Update { changes: BTreeMap<String, Value> },
    Delete,
}

/// Pending writes keyed by record id, FIFO by first touch.
#[derive(Debug, Default)]
struct WriteSet {
    map: FxHashMap<RecordId, PendingOp>,
    order: VecDeque<RecordId>,
}

impl WriteSet {
    fn get(&self, id: RecordId) -> Option<&PendingOp> { self.map.get(&id) }

    fn push(&mut self, id: RecordId, op: PendingOp) {
        let merged = match (self.map.remove(&id), op) {
            (None, op) => {
                self.order.push_back(id);
                Some(op)
            }
            (Some(PendingOp::Insert { entity, mut values }), PendingOp::Update { changes }) => {
                values.extend(changes);
                Some(PendingOp::Insert { entity, values })
            }
            (Some(PendingOp::Insert { .. }), PendingOp::Delete) => None,
            (Some(PendingOp::Update { mut changes }), PendingOp::Update { changes: more }) => {
                changes.extend(more);
                Some(PendingOp::Update { changes })
            }
            (Some(PendingOp::Update { .. }), PendingOp::Delete) => Some(PendingOp::Delete),
            (Some(prev), _) => Some(prev),
        };
        match merged {
            Some(op) => {
                self.map.insert(id, op);
            }
            None => self.order.retain(|x| *x != id),
        }
    }

    fn drain(&mut self) -> Vec<(RecordId, PendingOp)> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(op) = self.map.remove(&id) {
                out.push((id, op));
            }
        }
        out
    }
}

#[derive(Default)]
struct StoreState {
    schemas: FxHashMap<String, EntitySchema>,
    records: FxHashMap<RecordId, Record>,
}

type Subscribers = Mutex<Vec<(u64, Arc<ChangeCallback>)>>;

/// Reference `RecordStore` kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    subscribers: Arc<Subscribers>,
    next_record: AtomicU64,
    next_subscriber: AtomicU64,
    queries: AtomicU64,
    fail_next: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn register(&self, schema: EntitySchema) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.schemas.insert(schema.name.clone(), schema);
    }

    pub fn with_schema(self, schema: EntitySchema) -> Self {
        self.register(schema);
        self
    }

    pub fn batch(&self) -> WriteBatch<'_> { WriteBatch { store: self, pending: WriteSet::default() } }

    /// Inserts one record in its own batch.
    pub fn insert<I, K>(&self, entity: &str, values: I) -> Result<RecordId, StoreError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut b = self.batch();
        let id = b.insert(entity, values)?;
        b.commit()?;
        Ok(id)
    }

    pub fn update<I, K>(&self, id: RecordId, changes: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut b = self.batch();
        b.update(id, changes)?;
        b.commit().map(|_| ())
    }

    pub fn delete(&self, id: RecordId) -> Result<(), StoreError> {
        let mut b = self.batch();
        b.delete(id)?;
        b.commit().map(|_| ())
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).records.get(&id).cloned()
    }

    pub fn len(&self) -> usize { self.state.read().unwrap_or_else(PoisonError::into_inner).records.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of `execute`/`grouped_count` calls served so far.
    pub fn executed_queries(&self) -> u64 { self.queries.load(AtomicOrdering::Relaxed) }

    pub fn subscriber_count(&self) -> usize { self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Makes the next query fail with `StoreError::Rejected(reason)`.
    pub fn set_fail_next(&self, reason: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    fn begin_query(&self) -> Result<(), StoreError> {
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);
        counter!("liveset_store_queries_total", 1);
        match self.fail_next.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(reason) => Err(StoreError::Rejected(reason)),
            None => Ok(()),
        }
    }

    fn validate(state: &StoreState, query: &QueryDescriptor) -> Result<(), StoreError> {
        let schema = state
            .schemas
            .get(query.entity())
            .ok_or_else(|| StoreError::UnknownEntity(query.entity().to_string()))?;
        for field in query.predicate().fields() {
            schema.check(field)?;
        }
        for field in query.sort_fields() {
            schema.check(field)?;
        }
        if let Some(group) = query.group_key() {
            schema.check(group)?;
        }
        Ok(())
    }

    fn matching(state: &StoreState, query: &QueryDescriptor) -> Vec<Record> {
        let mut out: Vec<Record> = state.records.values().filter(|r| query.admits(r)).cloned().collect();
        out.sort_by(|a, b| query.compare(a, b));
        out
    }

    fn run_query(&self, query: &QueryDescriptor) -> Result<Vec<Record>, StoreError> {
        self.begin_query()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Self::validate(&state, query)?;
        let sorted = Self::matching(&state, query);
        let total = sorted.len();
        let take = if query.limit() > 0 { query.limit() } else { usize::MAX };
        let out: Vec<Record> = sorted.into_iter().skip(query.offset()).take(take).collect();
        debug!(entity = %query.entity(), matched = total, returned = out.len(), "store: execute");
        Ok(out)
    }

    fn run_grouped_count(&self, query: &QueryDescriptor, group_key: &str) -> Result<Option<Vec<GroupCount>>, StoreError> {
        self.begin_query()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Self::validate(&state, query)?;
        let schema = state
            .schemas
            .get(query.entity())
            .ok_or_else(|| StoreError::UnknownEntity(query.entity().to_string()))?;
        schema.check(group_key)?;
        if !schema.is_queryable(group_key) {
            trace!(entity = %query.entity(), group_key, "store: group key not countable store-side");
            return Ok(None);
        }
        // Aggregate like a GROUP BY, then order the groups by the leading sort key.
        let mode = query.group_mode();
        let mut groups: Vec<GroupCount> = Vec::new();
        for record in Self::matching(&state, query) {
            let value = record.get(group_key);
            match groups.iter_mut().find(|g| g.value.equivalent(value, mode)) {
                Some(g) => g.count += 1,
                None => groups.push(GroupCount { value: value.clone(), count: 1 }),
            }
        }
        let ascending = query.sort_keys().first().map(|k| k.ascending).unwrap_or(true);
        groups.sort_by(|a, b| {
            let ord = a.value.compare(&b.value, mode);
            if ascending { ord } else { ord.reverse() }
        });
        Ok(Some(groups))
    }

    fn notify(&self, change: &StoreChange) {
        let subs: Vec<Arc<ChangeCallback>> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in subs {
            cb(change);
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryStore {
    async fn execute(&self, query: &QueryDescriptor) -> Result<Vec<Record>, StoreError> { self.run_query(query) }

    async fn grouped_count(&self, query: &QueryDescriptor, group_key: &str) -> Result<Option<Vec<GroupCount>>, StoreError> {
        self.run_grouped_count(query, group_key)
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, AtomicOrdering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(on_change)));
        let weak = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subs) = weak.upgrade() {
                subs.lock().unwrap_or_else(PoisonError::into_inner).retain(|(i, _)| *i != id);
            }
        })
    }
}

/// Writes staged against a `MemoryStore`, applied atomically by `commit`.
///
/// Several writes to the same record coalesce: insert+update is an insert,
/// insert+delete cancels out, update+delete is a delete.
pub struct WriteBatch<'a> {
    store: &'a MemoryStore,
    pending: WriteSet,
}

impl<'a> WriteBatch<'a> {
    pub fn insert<I, K>(&mut self, entity: &str, values: I) -> Result<RecordId, StoreError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let values: BTreeMap<String, Value> = values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        {
            let state = self.store.state.read().unwrap_or_else(PoisonError::into_inner);
            let schema = state.schemas.get(entity).ok_or_else(|| StoreError::UnknownEntity(entity.to_string()))?;
            for field in values.keys() {
                schema.check(field)?;
            }
        }
        let id = RecordId(self.store.next_record.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        self.pending.push(id, PendingOp::Insert { entity: entity.to_string(), values });
        Ok(id)
    }

    pub fn update<I, K>(&mut self, id: RecordId, changes: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let changes: BTreeMap<String, Value> = changes.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let entity = self.live_entity(id)?;
        {
            let state = self.store.state.read().unwrap_or_else(PoisonError::into_inner);
            let schema = state.schemas.get(&entity).ok_or_else(|| StoreError::UnknownEntity(entity.clone()))?;
            for field in changes.keys() {
                schema.check(field)?;
            }
        }
        self.pending.push(id, PendingOp::Update { changes });
        Ok(())
    }

    pub fn delete(&mut self, id: RecordId) -> Result<(), StoreError> {
        self.live_entity(id)?;
        self.pending.push(id, PendingOp::Delete);
        Ok(())
    }

    /// Entity of a record that exists (stored or staged) and is not staged for deletion.
    fn live_entity(&self, id: RecordId) -> Result<String, StoreError> {
        match self.pending.get(id) {
            Some(PendingOp::Delete) => Err(StoreError::UnknownRecord(id)),
            Some(PendingOp::Insert { entity, .. }) => Ok(entity.clone()),
            Some(PendingOp::Update { .. }) | None => self
                .store
                .get(id)
                .map(|r| r.entity().to_string())
                .ok_or(StoreError::UnknownRecord(id)),
        }
    }

    /// Applies staged writes and notifies subscribers once. Updates that
    /// leave every value unchanged are dropped.
    ///
    /// All or nothing: if a staged update or delete targets a record removed
    /// since it was staged, nothing is applied and nobody is notified.
    pub fn commit(mut self) -> Result<StoreChange, StoreError> {
        let ops = self.pending.drain();
        let mut change = StoreChange::default();
        {
            let mut state = self.store.state.write().unwrap_or_else(PoisonError::into_inner);
            if let Some((id, _)) =
                ops.iter().find(|(id, op)| !matches!(op, PendingOp::Insert { .. }) && !state.records.contains_key(id))
            {
                return Err(StoreError::UnknownRecord(*id));
            }
            for (id, op) in ops {
                match op {
                    PendingOp::Insert { entity, values } => {
                        let record = Record::new(id, entity, values);
                        state.records.insert(id, record.clone());
                        change.inserted.push(record);
                    }
                    PendingOp::Update { changes } => {
                        let current = state.records.get(&id).cloned().ok_or(StoreError::UnknownRecord(id))?;
                        let changed: ChangedFields =
                            changes.iter().filter(|(k, v)| current.get(k) != *v).map(|(k, _)| k.clone()).collect();
                        if changed.is_empty() {
                            continue;
                        }
                        let record = current.with_values(changes);
                        state.records.insert(id, record.clone());
                        change.updated.push(RecordUpdate { record, changed });
                    }
                    PendingOp::Delete => {
                        let record = state.records.remove(&id).ok_or(StoreError::UnknownRecord(id))?;
                        change.deleted.push(record);
                    }
                }
            }
        }
        debug!(
            inserted = change.inserted.len(),
            updated = change.updated.len(),
            deleted = change.deleted.len(),
            "store: commit"
        );
        if !change.is_empty() {
            self.store.notify(&change);
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(n: u64) -> RecordId { RecordId(n) }

    fn vals(pairs: &[(&str, i64)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::Int(*v))).collect()
    }

    #[test]
    fn write_set_coalesces_per_record() {
        let mut ws = WriteSet::default();
        ws.push(rid(1), PendingOp::Insert { entity: "E".into(), values: vals(&[("a", 1)]) });
        ws.push(rid(2), PendingOp::Update { changes: vals(&[("a", 2)]) });
        ws.push(rid(1), PendingOp::Update { changes: vals(&[("a", 3)]) });
        ws.push(rid(3), PendingOp::Insert { entity: "E".into(), values: vals(&[]) });
        ws.push(rid(3), PendingOp::Delete);
        ws.push(rid(2), PendingOp::Delete);

        let drained = ws.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0, rid(1));
        assert!(matches!(&drained[0].1, PendingOp::Insert { values, .. } if values.get("a") == Some(&Value::Int(3))));
        assert_eq!(drained[1].0, rid(2));
        assert!(matches!(drained[1].1, PendingOp::Delete));
    }

    #[test]
    fn schema_distinguishes_transient_fields() {
        let s = EntitySchema::new("Person").fields(["name", "age"]).transient("initial");
        assert!(s.is_queryable("age"));
        assert!(!s.is_queryable("initial"));
        assert!(s.has_field("initial"));
        assert!(s.check("nope").is_err());
    }
}
