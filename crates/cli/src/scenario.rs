//! Scenario files: entity schemas, seed records, one query and a script of
//! writes and refreshes to replay against a `MemoryStore`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use liveset_controller::Refresh;
use liveset_core::{Predicate, PredicateMerge, QueryDescriptor, RecordId, SortKey, SortMerge, Value};
use liveset_store::{EntitySchema, MemoryStore, StoreChange};
use serde::Deserialize;

/// Plain JSON field values. Strings in RFC 3339 form are read as timestamps.
pub type Values = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub entities: Vec<EntityDef>,
    #[serde(default)]
    pub seed: Vec<Seed>,
    pub query: QueryDescriptor,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
pub struct EntityDef {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub transient: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Seed {
    pub entity: String,
    #[serde(default)]
    pub values: Values,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Insert(Seed),
    Update { id: RecordId, values: Values },
    Delete { id: RecordId },
    Refresh(RefreshDef),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Insert(_) => "insert",
            Step::Update { .. } => "update",
            Step::Delete { .. } => "delete",
            Step::Refresh(_) => "refresh",
        }
    }

    /// Applies a write step as one store batch. Refresh steps return `None`.
    pub fn apply(&self, store: &MemoryStore) -> Result<Option<StoreChange>> {
        let mut batch = store.batch();
        match self {
            Step::Insert(seed) => {
                batch.insert(&seed.entity, convert_values(&seed.values)?)?;
            }
            Step::Update { id, values } => batch.update(*id, convert_values(values)?)?,
            Step::Delete { id } => batch.delete(*id)?,
            Step::Refresh(_) => return Ok(None),
        }
        Ok(Some(batch.commit()?))
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateMergeDef {
    #[default]
    And,
    Replace,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMergeDef {
    Append,
    #[default]
    Replace,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RefreshDef {
    pub predicate: Option<Predicate>,
    pub merge: PredicateMergeDef,
    pub sort_keys: Option<Vec<SortKey>>,
    pub sort_merge: SortMergeDef,
    pub reset: bool,
}

impl RefreshDef {
    pub fn to_refresh(&self) -> Refresh {
        if self.reset {
            return Refresh::reset();
        }
        let mut r = Refresh::current();
        if let Some(p) = &self.predicate {
            let merge = match self.merge {
                PredicateMergeDef::And => PredicateMerge::And,
                PredicateMergeDef::Replace => PredicateMerge::Replace,
            };
            r = r.with_predicate(p.clone(), merge);
        }
        if let Some(keys) = &self.sort_keys {
            let merge = match self.sort_merge {
                SortMergeDef::Append => SortMerge::Append,
                SortMergeDef::Replace => SortMerge::Replace,
            };
            r = r.with_sort_keys(keys.clone(), merge);
        }
        r
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> { Ok(serde_json::from_str(raw)?) }

    /// Store with every entity registered and the seed records committed in one batch.
    pub fn build_store(&self) -> Result<MemoryStore> {
        let store = MemoryStore::new();
        for e in &self.entities {
            let mut schema = EntitySchema::new(&e.name).fields(e.fields.iter().cloned());
            for t in &e.transient {
                schema = schema.transient(t.clone());
            }
            store.register(schema);
        }
        if !self.seed.is_empty() {
            let mut batch = store.batch();
            for s in &self.seed {
                batch.insert(&s.entity, convert_values(&s.values)?)?;
            }
            batch.commit()?;
        }
        Ok(store)
    }
}

pub fn convert_values(values: &Values) -> Result<Vec<(String, Value)>> {
    values.iter().map(|(k, v)| Ok((k.clone(), convert(v).with_context(|| format!("field {k}"))?))).collect()
}

pub fn convert(v: &serde_json::Value) -> Result<Value> {
    Ok(match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(t) => Value::Time(t.with_timezone(&Utc)),
            Err(_) => Value::Text(s.clone()),
        },
        other => bail!("unsupported value {other}"),
    })
}
