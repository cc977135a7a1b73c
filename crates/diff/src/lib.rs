//! liveset snapshot differ.
//!
//! Classifies every touched record by identity into exactly one of
//! delete / insert / move / update and emits the events in snapshot order:
//! section deletes, section inserts, row deletes (old paths), row inserts
//! (new paths), then moves and updates (only for batches without any row
//! insert or delete).

#![forbid(unsafe_code)]

use std::fmt;

use liveset_core::{ChangeEvent, IndexPath, Record, RecordId, Snapshot};
use liveset_store::ChangedFields;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

/// What is known about the fields an update touched.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChanges {
    Known(ChangedFields),
    /// Full recompute; decided by comparing the two record versions.
    Unknown,
}

/// Record identities affected by one store write (or by a full recompute).
#[derive(Debug, Clone, Default)]
pub struct TouchedSet {
    pub inserted: FxHashSet<RecordId>,
    pub updated: FxHashMap<RecordId, FieldChanges>,
    pub deleted: FxHashSet<RecordId>,
}

impl TouchedSet {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty() }
    pub fn len(&self) -> usize { self.inserted.len() + self.updated.len() + self.deleted.len() }

    /// Touched sets for a full recompute: everything that left, entered, or stayed.
    pub fn everything(old: &Snapshot, new: &Snapshot) -> Self {
        let mut t = TouchedSet::new();
        for id in old.ids() {
            if new.contains(id) {
                t.updated.insert(id, FieldChanges::Unknown);
            } else {
                t.deleted.insert(id);
            }
        }
        t.inserted.extend(new.ids().filter(|id| !old.contains(*id)));
        t
    }

    /// Keeps only inserts that are new to the result and deletes that left it.
    pub fn narrow(&mut self, old: &Snapshot, new: &Snapshot) {
        self.inserted.retain(|id| new.contains(*id) && !old.contains(*id));
        self.deleted.retain(|id| old.contains(*id) && !new.contains(*id));
    }

    /// Adds untouched records pushed into or out of a windowed result.
    pub fn include_window_shift(&mut self, old: &Snapshot, new: &Snapshot) -> usize {
        let before = self.inserted.len() + self.deleted.len();
        let updated = &self.updated;
        self.deleted.extend(old.ids().filter(|id| !new.contains(*id) && !updated.contains_key(id)));
        self.inserted.extend(new.ids().filter(|id| !old.contains(*id) && !updated.contains_key(id)));
        self.inserted.len() + self.deleted.len() - before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Old,
    New,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Old => "old",
            Side::New => "new",
        })
    }
}

/// A touched record that could not be resolved. Its event is skipped.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("record {id} missing from the {side} snapshot")]
    Missing { id: RecordId, side: Side },
    #[error("record {id} at {side} position {position} is not covered by any section")]
    Uncovered { id: RecordId, side: Side, position: usize },
}

#[derive(Debug, Clone, Default)]
pub struct DiffOutcome {
    pub events: Vec<ChangeEvent>,
    pub consistency: Vec<ConsistencyError>,
}

impl DiffOutcome {
    pub fn is_empty(&self) -> bool { self.events.is_empty() }
}

struct Resolver<'a> {
    snap: &'a Snapshot,
    side: Side,
}

impl Resolver<'_> {
    fn path(&self, id: RecordId, position: usize, errors: &mut Vec<ConsistencyError>) -> Option<IndexPath> {
        let path = self.snap.index_path_at(position);
        if path.is_none() {
            errors.push(ConsistencyError::Uncovered { id, side: self.side, position });
        }
        path
    }

    fn record(&self, position: usize) -> Option<&Record> { self.snap.records().get(position) }
}

enum Kind {
    Move,
    Update,
}

/// Move or update for a record present in both snapshots; `None` when a full
/// recompute finds it unchanged and in place.
fn classify(changes: &FieldChanges, sort_fields: &[&str], old: (&Resolver<'_>, usize), new: (&Resolver<'_>, usize)) -> Option<Kind> {
    let (o, from) = old;
    let (n, to) = new;
    match changes {
        FieldChanges::Known(fields) => {
            let touches_sort = fields.iter().any(|f| sort_fields.iter().any(|s| *s == f.as_str()));
            Some(if touches_sort { Kind::Move } else { Kind::Update })
        }
        FieldChanges::Unknown => {
            let (a, b) = (o.record(from)?, n.record(to)?);
            if from != to || o.snap.index_path_at(from) != n.snap.index_path_at(to) {
                return Some(Kind::Move);
            }
            if sort_fields.iter().any(|f| a.get(f) != b.get(f)) {
                Some(Kind::Move)
            } else if a.values() != b.values() {
                Some(Kind::Update)
            } else {
                None
            }
        }
    }
}

/// Diffs `old` against `new` for the records in `touched`.
///
/// `sort_fields` are the sort fields of the query behind `new`; an update
/// touching one of them is a move.
pub fn diff(old: &Snapshot, new: &Snapshot, touched: &TouchedSet, sort_fields: &[&str]) -> DiffOutcome {
    let mut out = DiffOutcome::default();
    let errors = &mut out.consistency;
    let o = Resolver { snap: old, side: Side::Old };
    let n = Resolver { snap: new, side: Side::New };

    let old_names: FxHashSet<&str> = old.sections().iter().map(|s| s.name.as_str()).collect();
    let new_names: FxHashSet<&str> = new.sections().iter().map(|s| s.name.as_str()).collect();
    for (index, s) in old.sections().iter().enumerate() {
        if !new_names.contains(s.name.as_str()) {
            out.events.push(ChangeEvent::SectionDelete { section: s.clone(), index });
        }
    }
    for (index, s) in new.sections().iter().enumerate() {
        if !old_names.contains(s.name.as_str()) {
            out.events.push(ChangeEvent::SectionInsert { section: s.clone(), index });
        }
    }

    // Flat positions per bucket; maps dedupe ids reclassified from updates.
    let mut deleted: FxHashMap<RecordId, usize> = FxHashMap::default();
    let mut inserted: FxHashMap<RecordId, usize> = FxHashMap::default();
    let mut moved: Vec<(usize, usize)> = Vec::new();
    let mut updated: Vec<usize> = Vec::new();

    for &id in &touched.deleted {
        match old.position(id) {
            Some(p) => {
                deleted.insert(id, p);
            }
            None => errors.push(ConsistencyError::Missing { id, side: Side::Old }),
        }
    }
    for &id in &touched.inserted {
        match new.position(id) {
            Some(p) => {
                inserted.insert(id, p);
            }
            None => errors.push(ConsistencyError::Missing { id, side: Side::New }),
        }
    }
    for (&id, changes) in &touched.updated {
        match (old.position(id), new.position(id)) {
            (None, None) => debug!(%id, "diff: updated record outside both snapshots"),
            (Some(p), None) => {
                deleted.insert(id, p);
            }
            (None, Some(p)) => {
                inserted.insert(id, p);
            }
            (Some(from), Some(to)) => match classify(changes, sort_fields, (&o, from), (&n, to)) {
                Some(Kind::Move) => moved.push((from, to)),
                Some(Kind::Update) => updated.push(to),
                None => {}
            },
        }
    }

    let mut deleted: Vec<(usize, RecordId)> = deleted.into_iter().map(|(id, p)| (p, id)).collect();
    deleted.sort_unstable();
    for (p, id) in deleted.iter().copied() {
        if let (Some(at), Some(record)) = (o.path(id, p, errors), o.record(p)) {
            out.events.push(ChangeEvent::Delete { record: record.clone(), at });
        }
    }
    let mut inserted: Vec<(usize, RecordId)> = inserted.into_iter().map(|(id, p)| (p, id)).collect();
    inserted.sort_unstable();
    for (p, id) in inserted.iter().copied() {
        if let (Some(at), Some(record)) = (n.path(id, p, errors), n.record(p)) {
            out.events.push(ChangeEvent::Insert { record: record.clone(), at });
        }
    }

    if deleted.is_empty() && inserted.is_empty() {
        moved.sort_unstable_by_key(|&(_, to)| to);
        for (from, to) in moved {
            let Some(record) = n.record(to) else { continue };
            let id = record.id();
            if let (Some(from_path), Some(to_path)) = (o.path(id, from, errors), n.path(id, to, errors)) {
                out.events.push(ChangeEvent::Move { record: record.clone(), from: from_path, to: to_path });
            }
        }
        updated.sort_unstable();
        for to in updated {
            let Some(record) = n.record(to) else { continue };
            if let Some(at) = n.path(record.id(), to, errors) {
                out.events.push(ChangeEvent::Update { record: record.clone(), at });
            }
        }
    } else if !moved.is_empty() || !updated.is_empty() {
        debug!(moved = moved.len(), updated = updated.len(), "diff: row moves and updates suppressed by structural changes");
    }

    for e in &out.consistency {
        warn!(error = %e, "diff: consistency");
        counter!("liveset_consistency_errors_total", 1);
    }
    out
}
