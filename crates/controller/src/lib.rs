//! liveset result-set controller.
//!
//! Owns the current snapshot of one query, follows store notifications and
//! publishes ordered change events to observers. Mutating operations are
//! serialized through an async gate; notifications go through an unbounded
//! queue drained by a single driver task, so they are applied in emission
//! order. Readers load the current snapshot without locking.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use liveset_core::{
    ChangeEvent, ConfigurationError, IndexPath, Predicate, PredicateMerge, QueryDescriptor, Record, Section, SortKey,
    SortMerge, Snapshot,
};
use liveset_diff::{diff, DiffOutcome, FieldChanges, TouchedSet};
use liveset_section::{section_for_section_index_title, section_index_titles, verify_coverage, IndexTitleFn, SectionIndex};
use liveset_store::{RecordStore, StoreChange, StoreError, Subscription};
use metrics::{counter, gauge, histogram};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod observer;

pub use observer::{ChangeObserver, FnObserver, ObserverHandle};
use observer::ObserverList;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("configuration: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("query execution: {0}")]
    QueryExecution(#[from] StoreError),
    #[error("results read before perform_fetch")]
    NotFetched,
    #[error("controller used after dispose")]
    UseAfterDispose,
    #[error("index path {0} out of range")]
    IndexPathOutOfRange(IndexPath),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Unfetched,
    Fetched,
    Refreshing,
    Disposed,
}

#[derive(Clone, Default)]
pub struct ControllerOptions {
    /// Section index titles; defaults to the upper-cased first character.
    pub index_title: Option<IndexTitleFn>,
    /// Check section coverage after every recompute (always on in debug builds).
    pub verify_sections: bool,
}

impl fmt::Debug for ControllerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerOptions")
            .field("index_title", &self.index_title.is_some())
            .field("verify_sections", &self.verify_sections)
            .finish()
    }
}

/// How `refresh` derives the next descriptor. Predicates and sort keys merge
/// with the descriptor the controller was created with, not the current one.
#[derive(Debug, Clone, Default)]
pub struct Refresh {
    predicate: Option<(Predicate, PredicateMerge)>,
    sort_keys: Option<(Vec<SortKey>, SortMerge)>,
    reset: bool,
}

impl Refresh {
    /// Re-run the current descriptor.
    pub fn current() -> Self { Self::default() }
    pub fn predicate(predicate: Predicate, merge: PredicateMerge) -> Self { Self::default().with_predicate(predicate, merge) }
    pub fn sort_keys(keys: Vec<SortKey>, merge: SortMerge) -> Self { Self::default().with_sort_keys(keys, merge) }
    /// Back to the initial predicate and sort keys.
    pub fn reset() -> Self { Self { reset: true, ..Self::default() } }

    pub fn with_predicate(mut self, predicate: Predicate, merge: PredicateMerge) -> Self {
        self.predicate = Some((predicate, merge));
        self
    }

    pub fn with_sort_keys(mut self, keys: Vec<SortKey>, merge: SortMerge) -> Self {
        self.sort_keys = Some((keys, merge));
        self
    }

    fn derive(&self, initial: &QueryDescriptor, current: &QueryDescriptor) -> Result<QueryDescriptor, ConfigurationError> {
        if self.reset {
            return Ok(initial.clone());
        }
        let mut next = current.clone();
        if let Some((p, merge)) = &self.predicate {
            let p = match merge {
                PredicateMerge::And => initial.predicate().clone().and(p.clone()),
                PredicateMerge::Replace => p.clone(),
            };
            next = next.with_predicate(p, PredicateMerge::Replace)?;
        }
        if let Some((keys, merge)) = &self.sort_keys {
            let keys = match merge {
                SortMerge::Append => initial.with_sort_keys(keys.clone(), SortMerge::Append)?.sort_keys().to_vec(),
                SortMerge::Replace => keys.clone(),
            };
            next = next.with_sort_keys(keys, SortMerge::Replace)?;
        }
        Ok(next)
    }
}

/// Touched sets for the part of `change` that can affect `current` under `query`.
///
/// A windowed result also shifts when a record ranked before the window is
/// deleted or leaves the predicate, so those count as well. Updates carry only
/// the post-write version, so every in-scope-entity update is kept there.
fn relevant_changes(change: &StoreChange, query: &QueryDescriptor, current: &Snapshot) -> TouchedSet {
    let mut t = TouchedSet::new();
    let entity = query.entity();
    let windowed = query.is_windowed();
    for r in change.inserted.iter().filter(|r| r.entity() == entity) {
        if query.admits(r) {
            t.inserted.insert(r.id());
        }
    }
    for r in change.deleted.iter().filter(|r| r.entity() == entity) {
        if current.contains(r.id()) || (windowed && query.admits(r)) {
            t.deleted.insert(r.id());
        }
    }
    for u in change.updated.iter().filter(|u| u.record.entity() == entity) {
        if windowed || current.contains(u.record.id()) || query.admits(&u.record) {
            t.updated.insert(u.record.id(), FieldChanges::Known(u.changed.clone()));
        }
    }
    t
}

struct Inner<S> {
    store: Arc<S>,
    initial: QueryDescriptor,
    query: Mutex<QueryDescriptor>,
    snapshot: ArcSwapOption<Snapshot>,
    state: Mutex<ControllerState>,
    observers: Arc<ObserverList>,
    gate: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    epoch: watch::Sender<u64>,
    subscription: Mutex<Option<Subscription>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    sections: SectionIndex,
    verify_sections: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

impl<S: RecordStore + 'static> Inner<S> {
    fn state(&self) -> ControllerState { *lock(&self.state) }
    fn query(&self) -> QueryDescriptor { lock(&self.query).clone() }

    fn ensure_live(&self) -> ControllerResult<()> {
        match self.state() {
            ControllerState::Disposed => Err(ControllerError::UseAfterDispose),
            _ => Ok(()),
        }
    }

    /// Sets `next` unless the controller was disposed meanwhile.
    fn transition(&self, next: ControllerState) -> ControllerResult<()> {
        let mut state = lock(&self.state);
        if *state == ControllerState::Disposed {
            return Err(ControllerError::UseAfterDispose);
        }
        *state = next;
        Ok(())
    }

    fn loaded(&self) -> ControllerResult<Arc<Snapshot>> {
        self.ensure_live()?;
        self.snapshot.load_full().ok_or(ControllerError::NotFetched)
    }

    fn bump_epoch(&self) { self.epoch.send_modify(|e| *e += 1) }

    /// Runs the query unless the controller is disposed first; `None` means
    /// the result was discarded.
    async fn materialize(&self, query: &QueryDescriptor) -> Result<Option<Snapshot>, StoreError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => Ok(None),
            res = self.sections.materialize(&*self.store, query) => res.map(Some),
        }
    }

    fn install(&self, snap: Snapshot) -> Arc<Snapshot> {
        if self.verify_sections || cfg!(debug_assertions) {
            if let Err(e) = verify_coverage(&snap) {
                warn!(error = %e, "controller: section coverage");
                counter!("liveset_consistency_errors_total", 1);
            }
        }
        gauge!("liveset_snapshot_records", snap.len() as f64);
        let snap = Arc::new(snap);
        self.snapshot.store(Some(Arc::clone(&snap)));
        snap
    }

    fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.current();
        for o in &observers {
            o.will_change_content();
        }
        for e in events {
            for o in &observers {
                o.on_event(e);
            }
        }
        for o in &observers {
            o.did_change_content();
        }
    }

    fn diff(&self, old: &Snapshot, new: &Snapshot, touched: &TouchedSet, query: &QueryDescriptor) -> DiffOutcome {
        let fields: Vec<&str> = query.sort_fields().collect();
        diff(old, new, touched, &fields)
    }

    fn ensure_subscribed(self: &Arc<Self>) {
        let mut sub = lock(&self.subscription);
        if sub.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel::<StoreChange>();
        *sub = Some(self.store.subscribe(Box::new(move |change: &StoreChange| {
            let _ = tx.send(change.clone());
        })));
        let task = tokio::spawn(drive(Arc::downgrade(self), rx, self.shutdown.subscribe()));
        *lock(&self.driver) = Some(task);
        debug!(entity = %self.initial.entity(), "controller: subscribed");
    }

    async fn fetch_locked(&self, query: &QueryDescriptor) -> ControllerResult<()> {
        let t0 = Instant::now();
        let snap = self.materialize(query).await?.ok_or(ControllerError::UseAfterDispose)?;
        self.ensure_live()?;
        let snap = self.install(snap);
        self.transition(ControllerState::Fetched)?;
        info!(records = snap.len(), sections = snap.sections().len(), took_ms = %t0.elapsed().as_millis(), "controller: fetch ok");
        Ok(())
    }

    async fn on_change(&self, change: StoreChange) {
        let _gate = self.gate.lock().await;
        if self.state() != ControllerState::Fetched {
            self.bump_epoch();
            return;
        }
        let Some(current) = self.snapshot.load_full() else {
            self.bump_epoch();
            return;
        };
        let query = self.query();
        let mut touched = relevant_changes(&change, &query, &current);
        if touched.is_empty() {
            counter!("liveset_notifications_ignored_total", 1);
            debug!(changes = change.len(), "controller: notification ignored");
            self.bump_epoch();
            return;
        }
        let t0 = Instant::now();
        let next = match self.materialize(&query).await {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "controller: re-query failed; keeping snapshot");
                self.bump_epoch();
                return;
            }
        };
        if self.state() == ControllerState::Disposed {
            return;
        }
        touched.narrow(&current, &next);
        if query.is_windowed() {
            let shifted = touched.include_window_shift(&current, &next);
            if shifted > 0 {
                debug!(shifted, "controller: records shifted through the window");
            }
        }
        let outcome = self.diff(&current, &next, &touched, &query);
        let next = self.install(next);
        self.publish(&outcome.events);
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("liveset_recompute_ms", ms);
        info!(
            touched = touched.len(),
            events = outcome.events.len(),
            consistency_errors = outcome.consistency.len(),
            records = next.len(),
            took_ms = %t0.elapsed().as_millis(),
            "controller: recompute"
        );
        self.bump_epoch();
    }

    fn dispose(&self) -> ControllerResult<()> {
        {
            let mut state = lock(&self.state);
            if *state == ControllerState::Disposed {
                return Err(ControllerError::UseAfterDispose);
            }
            *state = ControllerState::Disposed;
        }
        self.shutdown.send_replace(true);
        if let Some(sub) = lock(&self.subscription).take() {
            sub.cancel();
        }
        if let Some(task) = lock(&self.driver).take() {
            task.abort();
        }
        self.observers.clear();
        info!(entity = %self.initial.entity(), "controller: disposed");
        Ok(())
    }
}

async fn drive<S: RecordStore + 'static>(
    inner: Weak<Inner<S>>,
    mut rx: mpsc::UnboundedReceiver<StoreChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let change = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            maybe = rx.recv() => match maybe {
                Some(change) => change,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.on_change(change).await;
    }
    debug!("controller: driver stopped");
}

/// Live, sectioned view over one query against a `RecordStore`.
///
/// Dropping the controller disposes it.
pub struct ResultSetController<S: RecordStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: RecordStore + 'static> ResultSetController<S> {
    pub fn new(store: Arc<S>, query: QueryDescriptor) -> Self { Self::with_options(store, query, ControllerOptions::default()) }

    pub fn with_options(store: Arc<S>, query: QueryDescriptor, options: ControllerOptions) -> Self {
        let sections = match options.index_title {
            Some(f) => SectionIndex::with_index_title(f),
            None => SectionIndex::new(),
        };
        let (shutdown, _) = watch::channel(false);
        let (epoch, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                store,
                initial: query.clone(),
                query: Mutex::new(query),
                snapshot: ArcSwapOption::empty(),
                state: Mutex::new(ControllerState::Unfetched),
                observers: Arc::new(ObserverList::default()),
                gate: tokio::sync::Mutex::new(()),
                shutdown,
                epoch,
                subscription: Mutex::new(None),
                driver: Mutex::new(None),
                sections,
                verify_sections: options.verify_sections,
            }),
        }
    }

    pub fn state(&self) -> ControllerState { self.inner.state() }
    pub fn query(&self) -> QueryDescriptor { self.inner.query() }

    /// Runs the query and installs the result. Emits no events.
    pub async fn perform_fetch(&self) -> ControllerResult<()> {
        self.inner.ensure_live()?;
        let _gate = self.inner.gate.lock().await;
        self.inner.ensure_live()?;
        self.inner.ensure_subscribed();
        let query = self.inner.query();
        self.inner.fetch_locked(&query).await.map_err(|e| {
            warn!(error = %e, "controller: fetch failed");
            e
        })
    }

    /// Rebuilds the descriptor and diffs the full result against the current snapshot.
    pub async fn refresh(&self, refresh: Refresh) -> ControllerResult<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let _gate = inner.gate.lock().await;
        inner.ensure_live()?;
        let previous = inner.query();
        let next = refresh.derive(&inner.initial, &previous)?;
        if next == previous {
            debug!(query = %next.cache_key(), "controller: refresh with unchanged descriptor");
        }
        *lock(&inner.query) = next.clone();

        let Some(old) = inner.snapshot.load_full() else {
            inner.ensure_subscribed();
            return inner.fetch_locked(&next).await.map_err(|e| {
                *lock(&inner.query) = previous;
                e
            });
        };
        inner.transition(ControllerState::Refreshing)?;
        let t0 = Instant::now();
        let new = match inner.materialize(&next).await {
            Ok(Some(new)) => new,
            Ok(None) => return Err(ControllerError::UseAfterDispose),
            Err(e) => {
                warn!(error = %e, "controller: refresh failed; descriptor restored");
                *lock(&inner.query) = previous;
                inner.transition(ControllerState::Fetched)?;
                return Err(e.into());
            }
        };
        inner.ensure_live()?;
        let touched = TouchedSet::everything(&old, &new);
        let outcome = inner.diff(&old, &new, &touched, &next);
        let new = inner.install(new);
        inner.transition(ControllerState::Fetched)?;
        inner.publish(&outcome.events);
        info!(events = outcome.events.len(), records = new.len(), took_ms = %t0.elapsed().as_millis(), "controller: refresh ok");
        Ok(())
    }

    /// AND-composes `predicate` with the initial predicate.
    pub async fn filter(&self, predicate: Predicate) -> ControllerResult<()> {
        self.refresh(Refresh::predicate(predicate, PredicateMerge::And)).await
    }

    /// Back to the initial predicate.
    pub async fn reset_filter(&self) -> ControllerResult<()> {
        self.refresh(Refresh::predicate(Predicate::True, PredicateMerge::And)).await
    }

    pub async fn refresh_sort_keys(&self, keys: Vec<SortKey>, merge: SortMerge) -> ControllerResult<()> {
        self.refresh(Refresh::sort_keys(keys, merge)).await
    }

    pub async fn reset(&self) -> ControllerResult<()> { self.refresh(Refresh::reset()).await }

    /// Stops notifications, discards any in-flight recompute and drops observers.
    pub fn dispose(&self) -> ControllerResult<()> { self.inner.dispose() }

    pub fn register_observer(&self, observer: Arc<dyn ChangeObserver>) -> ControllerResult<ObserverHandle> {
        self.inner.ensure_live()?;
        Ok(self.inner.observers.register(observer))
    }

    /// Receiver of the count of processed store notifications.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.inner.epoch.subscribe() }

    pub fn snapshot(&self) -> ControllerResult<Arc<Snapshot>> { self.inner.loaded() }

    pub fn sections(&self) -> ControllerResult<Vec<Section>> { Ok(self.inner.loaded()?.sections().to_vec()) }

    pub fn fetched_records(&self) -> ControllerResult<Vec<Record>> { Ok(self.inner.loaded()?.records().to_vec()) }

    pub fn record(&self, at: IndexPath) -> ControllerResult<Record> {
        self.inner.loaded()?.record_at(at).cloned().ok_or(ControllerError::IndexPathOutOfRange(at))
    }

    pub fn index_path(&self, record: &Record) -> ControllerResult<Option<IndexPath>> {
        Ok(self.inner.loaded()?.index_path(record.id()))
    }

    pub fn section_index_titles(&self) -> ControllerResult<Vec<String>> {
        Ok(section_index_titles(self.inner.loaded()?.sections()))
    }

    pub fn section_for_section_index_title(&self, title: &str, index: usize) -> ControllerResult<usize> {
        self.inner.loaded()?;
        Ok(section_for_section_index_title(title, index))
    }
}

impl<S: RecordStore + 'static> Drop for ResultSetController<S> {
    fn drop(&mut self) {
        if self.inner.state() != ControllerState::Disposed {
            let _ = self.inner.dispose();
        }
    }
}

impl<S: RecordStore + 'static> fmt::Debug for ResultSetController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultSetController")
            .field("state", &self.inner.state())
            .field("query", &self.inner.query().cache_key())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}
