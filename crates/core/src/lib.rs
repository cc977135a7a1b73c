//! liveset core types: records, values, snapshots and change events.
//!
//! Everything here is a plain value. Snapshots are immutable once built and
//! are shared through `Arc`; nothing in this crate performs I/O.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

pub mod query;

pub use query::{
    CompareMode, ConfigurationError, Pattern, Predicate, PredicateMerge, QueryBuilder, QueryDescriptor, SortKey,
    SortMerge,
};

/// Stable record identity, unique within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// Scalar field value with a total order across variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Time(_) => 4,
        }
    }

    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Total order: Null < Bool < numbers < Text < Time. Ints and floats
    /// compare numerically; `mode` only affects text.
    pub fn compare(&self, other: &Value, mode: CompareMode) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => mode.compare_text(a, b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Equivalence under `mode`, used for predicate equality and grouping.
    pub fn equivalent(&self, other: &Value, mode: CompareMode) -> bool {
        self.compare(other, mode) == Ordering::Equal
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Time(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::Text(v.to_string()) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::Text(v) } }
impl From<DateTime<Utc>> for Value { fn from(v: DateTime<Utc>) -> Self { Value::Time(v) } }

static NULL: Value = Value::Null;

#[derive(Debug)]
struct RecordBody {
    entity: String,
    values: BTreeMap<String, Value>,
}

/// A stored record. Cheap to clone; equality and hashing use the id only.
#[derive(Clone)]
pub struct Record {
    id: RecordId,
    body: Arc<RecordBody>,
}

impl Record {
    pub fn new(id: RecordId, entity: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self { id, body: Arc::new(RecordBody { entity: entity.into(), values }) }
    }

    pub fn id(&self) -> RecordId { self.id }
    pub fn entity(&self) -> &str { &self.body.entity }
    pub fn values(&self) -> &BTreeMap<String, Value> { &self.body.values }

    /// Field value, `Null` when the field is absent.
    pub fn get(&self, field: &str) -> &Value { self.body.values.get(field).unwrap_or(&NULL) }

    /// New version of this record with `changes` applied; identity is kept.
    pub fn with_values<I, K>(&self, changes: I) -> Record
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut values = self.body.values.clone();
        for (k, v) in changes {
            values.insert(k.into(), v);
        }
        Record::new(self.id, self.body.entity.clone(), values)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}
impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) { self.id.hash(state) }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("entity", &self.body.entity)
            .field("values", &self.body.values)
            .finish()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Record", 3)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("entity", &self.body.entity)?;
        s.serialize_field("values", &self.body.values)?;
        s.end()
    }
}

/// Location of a record inside a snapshot: section index plus offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexPath {
    pub section: usize,
    pub item: usize,
}

impl IndexPath {
    pub fn new(section: usize, item: usize) -> Self { Self { section, item } }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "({}, {})", self.section, self.item) }
}

/// A named, contiguous range of a snapshot's flat record list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub index_title: String,
    pub offset: usize,
    pub len: usize,
}

impl Section {
    pub fn range(&self) -> Range<usize> { self.offset..self.offset + self.len }
    pub fn number_of_records(&self) -> usize { self.len }
}

/// Immutable, sectioned result of one query execution.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: Vec<Record>,
    sections: Vec<Section>,
    positions: FxHashMap<RecordId, usize>,
    query_key: String,
}

impl Snapshot {
    pub fn new(records: Vec<Record>, sections: Vec<Section>, query_key: impl Into<String>) -> Self {
        let positions = records.iter().enumerate().map(|(i, r)| (r.id(), i)).collect();
        Self { records, sections, positions, query_key: query_key.into() }
    }

    pub fn empty(query_key: impl Into<String>) -> Self { Self::new(Vec::new(), Vec::new(), query_key) }

    pub fn records(&self) -> &[Record] { &self.records }
    pub fn sections(&self) -> &[Section] { &self.sections }
    pub fn query_key(&self) -> &str { &self.query_key }
    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn contains(&self, id: RecordId) -> bool { self.positions.contains_key(&id) }
    pub fn position(&self, id: RecordId) -> Option<usize> { self.positions.get(&id).copied() }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ { self.records.iter().map(Record::id) }

    /// Index path of a flat position, `None` when no section covers it.
    pub fn index_path_at(&self, flat: usize) -> Option<IndexPath> {
        // Sections are sorted by offset; find the last one starting at or before `flat`.
        let idx = self.sections.partition_point(|s| s.offset <= flat);
        let section = idx.checked_sub(1)?;
        let s = &self.sections[section];
        s.range().contains(&flat).then(|| IndexPath::new(section, flat - s.offset))
    }

    pub fn index_path(&self, id: RecordId) -> Option<IndexPath> { self.index_path_at(self.position(id)?) }

    pub fn record_at(&self, path: IndexPath) -> Option<&Record> {
        let s = self.sections.get(path.section)?;
        if path.item >= s.len {
            return None;
        }
        self.records.get(s.offset + path.item)
    }

    pub fn section_records(&self, section: usize) -> Option<&[Record]> {
        let s = self.sections.get(section)?;
        self.records.get(s.range())
    }

    pub fn section_named(&self, name: &str) -> Option<(usize, &Section)> {
        self.sections.iter().enumerate().find(|(_, s)| s.name == name)
    }
}

/// One row- or section-level change, produced by the differ.
///
/// Deletions carry old-snapshot paths, insertions and updates new-snapshot
/// paths; moves carry both.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    SectionInsert { section: Section, index: usize },
    SectionDelete { section: Section, index: usize },
    Insert { record: Record, at: IndexPath },
    Delete { record: Record, at: IndexPath },
    Update { record: Record, at: IndexPath },
    Move { record: Record, from: IndexPath, to: IndexPath },
}

impl ChangeEvent {
    pub fn record(&self) -> Option<&Record> {
        match self {
            ChangeEvent::Insert { record, .. }
            | ChangeEvent::Delete { record, .. }
            | ChangeEvent::Update { record, .. }
            | ChangeEvent::Move { record, .. } => Some(record),
            ChangeEvent::SectionInsert { .. } | ChangeEvent::SectionDelete { .. } => None,
        }
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, ChangeEvent::Insert { .. } | ChangeEvent::Delete { .. })
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeEvent::SectionInsert { section, index } => write!(f, "+section {index} {:?}", section.name),
            ChangeEvent::SectionDelete { section, index } => write!(f, "-section {index} {:?}", section.name),
            ChangeEvent::Insert { record, at } => write!(f, "+ {} at {at}", record.id()),
            ChangeEvent::Delete { record, at } => write!(f, "- {} at {at}", record.id()),
            ChangeEvent::Update { record, at } => write!(f, "~ {} at {at}", record.id()),
            ChangeEvent::Move { record, from, to } => write!(f, "> {} {from} -> {to}", record.id()),
        }
    }
}
