//! liveset section index: partitions an ordered record list into named,
//! contiguous sections and applies the offset/limit window over the
//! per-group counts.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use liveset_core::{CompareMode, QueryDescriptor, Record, Section, Snapshot};
use liveset_store::{GroupCount, RecordStore, StoreError};
use tracing::{debug, warn};

/// Maps a section name to its index title.
pub type IndexTitleFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Upper-cased first character of `name`, `""` for an empty name.
pub fn default_index_title(name: &str) -> String {
    name.chars().next().map(|c| c.to_uppercase().collect()).unwrap_or_default()
}

/// Counts consecutive runs of equivalent group values in an ordered list.
/// Each group is named after the first value of its run.
pub fn tally(records: &[Record], group_key: &str, mode: CompareMode) -> Vec<GroupCount> {
    let mut out: Vec<GroupCount> = Vec::new();
    for r in records {
        let v = r.get(group_key);
        match out.last_mut() {
            Some(g) if g.value.equivalent(v, mode) => g.count += 1,
            _ => out.push(GroupCount { value: v.clone(), count: 1 }),
        }
    }
    out
}

/// Builds the sections for `available` windowed records.
///
/// `counts` covers the unwindowed result; without it the whole list is one
/// section named `""`. Sections never extend past `available`.
pub fn build_sections(
    available: usize,
    query: &QueryDescriptor,
    counts: Option<&[GroupCount]>,
    index_title: &dyn Fn(&str) -> String,
) -> Vec<Section> {
    let Some(counts) = counts else {
        if available == 0 {
            return Vec::new();
        }
        return vec![Section { name: String::new(), index_title: String::new(), offset: 0, len: available }];
    };
    let mut skip = query.offset();
    let mut remaining = if query.limit() > 0 { query.limit().min(available) } else { available };
    let mut flat = 0usize;
    let mut out = Vec::new();
    for g in counts {
        if remaining == 0 {
            break;
        }
        if skip >= g.count {
            skip -= g.count;
            continue;
        }
        let len = (g.count - skip).min(remaining);
        skip = 0;
        if len == 0 {
            continue;
        }
        remaining -= len;
        let name = g.value.to_string();
        let title = index_title(&name);
        out.push(Section { name, index_title: title, offset: flat, len });
        flat += len;
    }
    if flat != available {
        warn!(available, sectioned = flat, "section: group counts disagree with fetched records");
    }
    out
}

pub fn section_index_titles(sections: &[Section]) -> Vec<String> {
    sections.iter().map(|s| s.index_title.clone()).collect()
}

/// Section index for an index-title tap: the position in the titles list.
pub fn section_for_section_index_title(_title: &str, index: usize) -> usize { index }

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoverageError {
    #[error("section {section} is empty")]
    EmptySection { section: usize },
    #[error("section {section} starts at {offset}, expected {expected}")]
    Gap { section: usize, offset: usize, expected: usize },
    #[error("sections cover {covered} of {len} records")]
    Incomplete { covered: usize, len: usize },
    #[error("sections {first} and {second} are both named {name:?}")]
    DuplicateName { name: String, first: usize, second: usize },
}

/// Checks that sections are non-empty, contiguous from 0, uniquely named, and
/// cover every record exactly once. Sections are matched by name across
/// snapshots, so distinct groups rendering to the same name (`Null` and `""`,
/// `1` and `"1"`) are reported here.
pub fn verify_coverage(snapshot: &Snapshot) -> Result<(), CoverageError> {
    let sections = snapshot.sections();
    let mut expected = 0usize;
    for (i, s) in sections.iter().enumerate() {
        if s.len == 0 {
            return Err(CoverageError::EmptySection { section: i });
        }
        if let Some(first) = sections[..i].iter().position(|p| p.name == s.name) {
            return Err(CoverageError::DuplicateName { name: s.name.clone(), first, second: i });
        }
        if s.offset != expected {
            return Err(CoverageError::Gap { section: i, offset: s.offset, expected });
        }
        expected += s.len;
    }
    if expected != snapshot.len() {
        return Err(CoverageError::Incomplete { covered: expected, len: snapshot.len() });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStrategy {
    /// Store-side grouped count.
    Store,
    /// In-memory run-length tally over the unwindowed result.
    Tally,
}

/// Runs a query against a store and returns the sectioned snapshot.
#[derive(Clone)]
pub struct SectionIndex {
    index_title: IndexTitleFn,
}

impl Default for SectionIndex {
    fn default() -> Self { Self { index_title: Arc::new(default_index_title) } }
}

impl fmt::Debug for SectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("SectionIndex").finish_non_exhaustive() }
}

impl SectionIndex {
    pub fn new() -> Self { Self::default() }

    pub fn with_index_title(index_title: IndexTitleFn) -> Self { Self { index_title } }

    pub fn index_title(&self, name: &str) -> String { (self.index_title)(name) }

    pub async fn materialize<S>(&self, store: &S, query: &QueryDescriptor) -> Result<Snapshot, StoreError>
    where
        S: RecordStore + ?Sized,
    {
        let key = query.cache_key();
        let Some(group) = query.group_key() else {
            let records = store.execute(query).await?;
            let sections = build_sections(records.len(), query, None, &*self.index_title);
            return Ok(Snapshot::new(records, sections, key));
        };
        let (records, counts, strategy) = match store.grouped_count(query, group).await? {
            Some(counts) => (store.execute(query).await?, counts, CountStrategy::Store),
            None => {
                let all = store.execute(&query.unwindowed()).await?;
                let counts = tally(&all, group, query.group_mode());
                let take = if query.limit() > 0 { query.limit() } else { usize::MAX };
                let records: Vec<Record> = all.into_iter().skip(query.offset()).take(take).collect();
                (records, counts, CountStrategy::Tally)
            }
        };
        let sections = build_sections(records.len(), query, Some(counts.as_slice()), &*self.index_title);
        debug!(group_key = group, ?strategy, groups = counts.len(), sections = sections.len(), records = records.len(), "section: materialized");
        Ok(Snapshot::new(records, sections, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveset_core::{RecordId, SortKey, Value};
    use std::collections::BTreeMap;

    fn rec(id: u64, cat: &str) -> Record {
        let mut v = BTreeMap::new();
        v.insert("cat".to_string(), Value::from(cat));
        Record::new(RecordId(id), "Item", v)
    }

    fn grouped(offset: usize, limit: usize) -> QueryDescriptor {
        QueryDescriptor::builder("Item").sort_by(SortKey::asc("cat")).group_by("cat").skip(offset).take(limit).build().unwrap()
    }

    fn gc(v: &str, n: usize) -> GroupCount { GroupCount { value: Value::from(v), count: n } }

    #[test]
    fn default_title_is_uppercased_first_char() {
        assert_eq!(default_index_title("apple"), "A");
        assert_eq!(default_index_title("ßig"), "SS");
        assert_eq!(default_index_title(""), "");
    }

    #[test]
    fn groups_runs_in_order() {
        let records = vec![rec(1, "a"), rec(2, "a"), rec(3, "b")];
        let counts = tally(&records, "cat", CompareMode::Default);
        assert_eq!(counts, vec![gc("a", 2), gc("b", 1)]);
        let sections = build_sections(3, &grouped(0, 0), Some(counts.as_slice()), &default_index_title);
        assert_eq!(sections.len(), 2);
        assert_eq!((sections[0].name.as_str(), sections[0].offset, sections[0].len), ("a", 0, 2));
        assert_eq!((sections[1].name.as_str(), sections[1].offset, sections[1].len), ("b", 2, 1));
        assert_eq!(section_index_titles(&sections), vec!["A", "B"]);
        assert_eq!(section_for_section_index_title("B", 1), 1);
    }

    #[test]
    fn tally_uses_compare_mode() {
        let records = vec![rec(1, "Ann"), rec(2, "ann"), rec(3, "Bob")];
        let ci = tally(&records, "cat", CompareMode::CaseInsensitive);
        assert_eq!(ci, vec![gc("Ann", 2), gc("Bob", 1)]);
        assert_eq!(tally(&records, "cat", CompareMode::Default).len(), 3);
    }

    #[test]
    fn window_skips_and_truncates_groups() {
        let counts = [gc("a", 3), gc("b", 3), gc("c", 4)];
        let sections = build_sections(4, &grouped(3, 4), Some(&counts[..]), &default_index_title);
        let shape: Vec<_> = sections.iter().map(|s| (s.name.as_str(), s.offset, s.len)).collect();
        assert_eq!(shape, vec![("b", 0, 3), ("c", 3, 1)]);

        let sections = build_sections(6, &grouped(4, 0), Some(&counts[..]), &default_index_title);
        let shape: Vec<_> = sections.iter().map(|s| (s.name.as_str(), s.offset, s.len)).collect();
        assert_eq!(shape, vec![("b", 0, 2), ("c", 2, 4)]);
    }

    #[test]
    fn ungrouped_is_one_unnamed_section_or_none() {
        let q = QueryDescriptor::builder("Item").build().unwrap();
        let sections = build_sections(3, &q, None, &default_index_title);
        assert_eq!(sections, vec![Section { name: String::new(), index_title: String::new(), offset: 0, len: 3 }]);
        assert!(build_sections(0, &q, None, &default_index_title).is_empty());
        assert!(build_sections(0, &grouped(0, 0), Some(&[][..]), &default_index_title).is_empty());
    }

    #[test]
    fn null_group_renders_empty_name() {
        let counts = [GroupCount { value: Value::Null, count: 1 }, gc("x", 1)];
        let sections = build_sections(2, &grouped(0, 0), Some(&counts[..]), &default_index_title);
        assert_eq!(sections[0].name, "");
        assert_eq!(sections[0].index_title, "");
        assert_eq!(sections[1].index_title, "X");
    }

    #[test]
    fn coverage_violations_are_reported() {
        let records = vec![rec(1, "a"), rec(2, "b")];
        let gap = vec![Section { name: "a".into(), index_title: "A".into(), offset: 1, len: 1 }];
        assert!(matches!(verify_coverage(&Snapshot::new(records.clone(), gap, "k")), Err(CoverageError::Gap { .. })));
        let short = vec![Section { name: "a".into(), index_title: "A".into(), offset: 0, len: 1 }];
        assert_eq!(
            verify_coverage(&Snapshot::new(records.clone(), short, "k")),
            Err(CoverageError::Incomplete { covered: 1, len: 2 })
        );
        let empty = vec![Section { name: "a".into(), index_title: "A".into(), offset: 0, len: 0 }];
        assert!(matches!(verify_coverage(&Snapshot::new(records, empty, "k")), Err(CoverageError::EmptySection { .. })));
        assert!(verify_coverage(&Snapshot::empty("k")).is_ok());
    }

    #[test]
    fn colliding_group_names_are_reported() {
        let mut blank = BTreeMap::new();
        blank.insert("cat".to_string(), Value::from(""));
        let records = vec![Record::new(RecordId(1), "Item", BTreeMap::new()), Record::new(RecordId(2), "Item", blank)];
        let counts = [GroupCount { value: Value::Null, count: 1 }, gc("", 1)];
        let sections = build_sections(2, &grouped(0, 0), Some(&counts[..]), &default_index_title);
        assert_eq!(
            verify_coverage(&Snapshot::new(records, sections, "k")),
            Err(CoverageError::DuplicateName { name: String::new(), first: 0, second: 1 })
        );
    }
}
