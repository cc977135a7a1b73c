//! Query descriptors: entity, predicate, ordering, grouping and window.
//!
//! A `QueryDescriptor` is validated once, when it is built, and never changes
//! afterwards. Deriving a new descriptor from an old one goes through the
//! builder (or `with_predicate` / `with_sort_keys`) and is validated again.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Record, Value};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("query entity must not be empty")]
    EmptyEntity,
    #[error("group key `{0}` requires at least one sort key")]
    GroupKeyWithoutSortKeys(String),
    #[error("group key `{group}` must match the leading sort key `{leading}`")]
    GroupKeyNotLeading { group: String, leading: String },
    #[error("sort field `{0}` appears more than once")]
    DuplicateSortField(String),
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// How text values compare for ordering and equivalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompareMode {
    #[default]
    Default,
    CaseInsensitive,
}

impl CompareMode {
    pub fn compare_text(self, a: &str, b: &str) -> Ordering {
        match self {
            CompareMode::Default => a.cmp(b),
            CompareMode::CaseInsensitive => {
                a.chars().flat_map(char::to_lowercase).cmp(b.chars().flat_map(char::to_lowercase))
            }
        }
    }

    fn fold(self, s: &str) -> String {
        match self {
            CompareMode::Default => s.to_string(),
            CompareMode::CaseInsensitive => s.to_lowercase(),
        }
    }
}

fn default_ascending() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
    #[serde(default)]
    pub mode: CompareMode,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), ascending: true, mode: CompareMode::Default } }
    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), ascending: false, mode: CompareMode::Default } }
    pub fn case_insensitive(mut self) -> Self { self.mode = CompareMode::CaseInsensitive; self }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let ord = a.get(&self.field).compare(b.get(&self.field), self.mode);
        if self.ascending { ord } else { ord.reverse() }
    }
}

/// Compiled regular expression; serializes as its source text.
#[derive(Clone)]
pub struct Pattern(regex::Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, ConfigurationError> {
        regex::Regex::new(pattern).map(Pattern).map_err(|e| ConfigurationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn as_str(&self) -> &str { self.0.as_str() }
    pub fn is_match(&self, text: &str) -> bool { self.0.is_match(text) }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool { self.as_str() == other.as_str() }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Pattern({:?})", self.as_str()) }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> { serializer.serialize_str(self.as_str()) }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pattern::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Filter expression evaluated against a single record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    #[default]
    True,
    False,
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Lt { field: String, value: Value },
    Le { field: String, value: Value },
    Gt { field: String, value: Value },
    Ge { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    IsNull { field: String },
    Contains { field: String, needle: String, #[serde(default)] mode: CompareMode },
    BeginsWith { field: String, prefix: String, #[serde(default)] mode: CompareMode },
    Matches { field: String, pattern: Pattern },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { inner: Box<Predicate> },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Eq { field: field.into(), value: value.into() } }
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Ne { field: field.into(), value: value.into() } }
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Lt { field: field.into(), value: value.into() } }
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Le { field: field.into(), value: value.into() } }
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Gt { field: field.into(), value: value.into() } }
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self { Predicate::Ge { field: field.into(), value: value.into() } }
    pub fn is_null(field: impl Into<String>) -> Self { Predicate::IsNull { field: field.into() } }

    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::In { field: field.into(), values: values.into_iter().map(Into::into).collect() }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>, mode: CompareMode) -> Self {
        Predicate::Contains { field: field.into(), needle: needle.into(), mode }
    }

    pub fn begins_with(field: impl Into<String>, prefix: impl Into<String>, mode: CompareMode) -> Self {
        Predicate::BeginsWith { field: field.into(), prefix: prefix.into(), mode }
    }

    pub fn matches(field: impl Into<String>, pattern: &str) -> Result<Self, ConfigurationError> {
        Ok(Predicate::Matches { field: field.into(), pattern: Pattern::new(pattern)? })
    }

    /// AND-composition. `True` is the identity and nested ANDs are flattened.
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::True, p) | (p, Predicate::True) => p,
            (Predicate::And { mut all }, Predicate::And { all: rest }) => { all.extend(rest); Predicate::And { all } }
            (Predicate::And { mut all }, p) => { all.push(p); Predicate::And { all } }
            (p, Predicate::And { all }) => {
                let mut out = Vec::with_capacity(all.len() + 1);
                out.push(p);
                out.extend(all);
                Predicate::And { all: out }
            }
            (a, b) => Predicate::And { all: vec![a, b] },
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::Or { mut any }, p) => { any.push(p); Predicate::Or { any } }
            (a, b) => Predicate::Or { any: vec![a, b] },
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate { Predicate::Not { inner: Box::new(self) } }

    /// Field names referenced anywhere in the expression.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::True | Predicate::False => {}
            Predicate::Eq { field, .. }
            | Predicate::Ne { field, .. }
            | Predicate::Lt { field, .. }
            | Predicate::Le { field, .. }
            | Predicate::Gt { field, .. }
            | Predicate::Ge { field, .. }
            | Predicate::In { field, .. }
            | Predicate::IsNull { field }
            | Predicate::Contains { field, .. }
            | Predicate::BeginsWith { field, .. }
            | Predicate::Matches { field, .. } => out.push(field),
            Predicate::And { all } => all.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Or { any } => any.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Not { inner } => inner.collect_fields(out),
        }
    }

    /// Ordered comparisons never match a `Null` on either side.
    pub fn evaluate(&self, record: &Record) -> bool {
        let ordered = |field: &str, value: &Value, ok: fn(Ordering) -> bool| {
            let v = record.get(field);
            !v.is_null() && !value.is_null() && ok(v.compare(value, CompareMode::Default))
        };
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Eq { field, value } => record.get(field).equivalent(value, CompareMode::Default),
            Predicate::Ne { field, value } => !record.get(field).equivalent(value, CompareMode::Default),
            Predicate::Lt { field, value } => ordered(field.as_str(), value, Ordering::is_lt),
            Predicate::Le { field, value } => ordered(field.as_str(), value, Ordering::is_le),
            Predicate::Gt { field, value } => ordered(field.as_str(), value, Ordering::is_gt),
            Predicate::Ge { field, value } => ordered(field.as_str(), value, Ordering::is_ge),
            Predicate::In { field, values } => {
                let v = record.get(field);
                values.iter().any(|x| v.equivalent(x, CompareMode::Default))
            }
            Predicate::IsNull { field } => record.get(field).is_null(),
            Predicate::Contains { field, needle, mode } => record
                .get(field)
                .as_text()
                .map(|s| mode.fold(s).contains(&mode.fold(needle)))
                .unwrap_or(false),
            Predicate::BeginsWith { field, prefix, mode } => record
                .get(field)
                .as_text()
                .map(|s| mode.fold(s).starts_with(&mode.fold(prefix)))
                .unwrap_or(false),
            Predicate::Matches { field, pattern } => record.get(field).as_text().map(|s| pattern.is_match(s)).unwrap_or(false),
            Predicate::And { all } => all.iter().all(|p| p.evaluate(record)),
            Predicate::Or { any } => any.iter().any(|p| p.evaluate(record)),
            Predicate::Not { inner } => !inner.evaluate(record),
        }
    }
}

/// How a new predicate combines with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateMerge {
    And,
    Replace,
}

/// How new sort keys combine with the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMerge {
    Append,
    Replace,
}

/// Immutable query: entity scope, filter, ordering, optional grouping and window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueryFields")]
pub struct QueryDescriptor {
    entity: String,
    predicate: Predicate,
    sort_keys: Vec<SortKey>,
    group_key: Option<String>,
    offset: usize,
    limit: usize,
}

#[derive(Deserialize)]
struct QueryFields {
    entity: String,
    #[serde(default)]
    predicate: Predicate,
    #[serde(default)]
    sort_keys: Vec<SortKey>,
    #[serde(default)]
    group_key: Option<String>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

impl TryFrom<QueryFields> for QueryDescriptor {
    type Error = ConfigurationError;

    fn try_from(s: QueryFields) -> Result<Self, Self::Error> {
        QueryBuilder { entity: s.entity, predicate: s.predicate, sort_keys: s.sort_keys, group_key: s.group_key, offset: s.offset, limit: s.limit }
            .build()
    }
}

impl QueryDescriptor {
    pub fn builder(entity: impl Into<String>) -> QueryBuilder {
        QueryBuilder {
            entity: entity.into(),
            predicate: Predicate::True,
            sort_keys: Vec::new(),
            group_key: None,
            offset: 0,
            limit: 0,
        }
    }

    pub fn to_builder(&self) -> QueryBuilder {
        QueryBuilder {
            entity: self.entity.clone(),
            predicate: self.predicate.clone(),
            sort_keys: self.sort_keys.clone(),
            group_key: self.group_key.clone(),
            offset: self.offset,
            limit: self.limit,
        }
    }

    pub fn entity(&self) -> &str { &self.entity }
    pub fn predicate(&self) -> &Predicate { &self.predicate }
    pub fn sort_keys(&self) -> &[SortKey] { &self.sort_keys }
    pub fn group_key(&self) -> Option<&str> { self.group_key.as_deref() }
    pub fn offset(&self) -> usize { self.offset }
    pub fn limit(&self) -> usize { self.limit }

    pub fn is_windowed(&self) -> bool { self.offset > 0 || self.limit > 0 }

    /// Same query without offset/limit.
    pub fn unwindowed(&self) -> QueryDescriptor {
        let mut q = self.clone();
        q.offset = 0;
        q.limit = 0;
        q
    }

    pub fn sort_fields(&self) -> impl Iterator<Item = &str> + '_ { self.sort_keys.iter().map(|k| k.field.as_str()) }

    /// Compare mode used for group equivalence (the leading sort key's).
    pub fn group_mode(&self) -> CompareMode { self.sort_keys.first().map(|k| k.mode).unwrap_or_default() }

    /// Whether `record` is inside this query's entity and predicate scope.
    pub fn admits(&self, record: &Record) -> bool { record.entity() == self.entity && self.predicate.evaluate(record) }

    /// Ordering by sort keys with record id as the final tie-break.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.sort_keys
            .iter()
            .map(|k| k.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.id().cmp(&b.id()))
    }

    /// Deterministic serialization, stable for equal descriptors.
    pub fn cache_key(&self) -> String { serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}")) }

    pub fn with_predicate(&self, predicate: Predicate, merge: PredicateMerge) -> Result<QueryDescriptor, ConfigurationError> {
        let b = self.to_builder();
        match merge {
            PredicateMerge::And => b.filter(predicate),
            PredicateMerge::Replace => b.reset_filter(predicate),
        }
        .build()
    }

    pub fn with_sort_keys(&self, keys: Vec<SortKey>, merge: SortMerge) -> Result<QueryDescriptor, ConfigurationError> {
        let mut b = self.to_builder();
        match merge {
            SortMerge::Replace => b.sort_keys = keys,
            SortMerge::Append => {
                for k in keys {
                    if !b.sort_keys.iter().any(|x| x.field == k.field) {
                        b.sort_keys.push(k);
                    }
                }
            }
        }
        b.build()
    }
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    entity: String,
    predicate: Predicate,
    sort_keys: Vec<SortKey>,
    group_key: Option<String>,
    offset: usize,
    limit: usize,
}

impl QueryBuilder {
    /// AND-composes with whatever predicate is already present.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::take(&mut self.predicate).and(predicate);
        self
    }

    pub fn reset_filter(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn sort_by(mut self, key: SortKey) -> Self {
        self.sort_keys.push(key);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_key = Some(field.into());
        self
    }

    pub fn skip(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn take(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn build(self) -> Result<QueryDescriptor, ConfigurationError> {
        if self.entity.trim().is_empty() {
            return Err(ConfigurationError::EmptyEntity);
        }
        for (i, k) in self.sort_keys.iter().enumerate() {
            if self.sort_keys[..i].iter().any(|x| x.field == k.field) {
                return Err(ConfigurationError::DuplicateSortField(k.field.clone()));
            }
        }
        if let Some(group) = &self.group_key {
            match self.sort_keys.first() {
                None => return Err(ConfigurationError::GroupKeyWithoutSortKeys(group.clone())),
                Some(first) if &first.field != group => {
                    return Err(ConfigurationError::GroupKeyNotLeading { group: group.clone(), leading: first.field.clone() })
                }
                Some(_) => {}
            }
        }
        Ok(QueryDescriptor {
            entity: self.entity,
            predicate: self.predicate,
            sort_keys: self.sort_keys,
            group_key: self.group_key,
            offset: self.offset,
            limit: self.limit,
        })
    }
}
