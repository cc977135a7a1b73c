//! Typed change observers and their registration handles.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use liveset_core::{ChangeEvent, IndexPath, Record, Section};

/// Receives one batch of changes at a time, bracketed by
/// `will_change_content` / `did_change_content`. Every method defaults to a no-op.
pub trait ChangeObserver: Send + Sync {
    fn will_change_content(&self) {}
    fn did_change_content(&self) {}
    fn did_insert_section(&self, _section: &Section, _index: usize) {}
    fn did_delete_section(&self, _section: &Section, _index: usize) {}
    fn did_insert_record(&self, _record: &Record, _at: IndexPath) {}
    fn did_delete_record(&self, _record: &Record, _at: IndexPath) {}
    fn did_update_record(&self, _record: &Record, _at: IndexPath) {}
    fn did_move_record(&self, _record: &Record, _from: IndexPath, _to: IndexPath) {}

    fn on_event(&self, event: &ChangeEvent) {
        match event {
            ChangeEvent::SectionInsert { section, index } => self.did_insert_section(section, *index),
            ChangeEvent::SectionDelete { section, index } => self.did_delete_section(section, *index),
            ChangeEvent::Insert { record, at } => self.did_insert_record(record, *at),
            ChangeEvent::Delete { record, at } => self.did_delete_record(record, *at),
            ChangeEvent::Update { record, at } => self.did_update_record(record, *at),
            ChangeEvent::Move { record, from, to } => self.did_move_record(record, *from, *to),
        }
    }
}

/// Observer backed by a closure over each event.
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self { Self(f) }
}

impl<F> ChangeObserver for FnObserver<F>
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_event(&self, event: &ChangeEvent) { (self.0)(event) }
}

type Entry = (u64, Arc<dyn ChangeObserver>);

#[derive(Default)]
pub(crate) struct ObserverList {
    entries: Mutex<Vec<Entry>>,
    next: AtomicU64,
}

impl ObserverList {
    pub(crate) fn register(self: &Arc<Self>, observer: Arc<dyn ChangeObserver>) -> ObserverHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, observer));
        ObserverHandle { list: Arc::downgrade(self), id }
    }

    /// Observers in registration order.
    pub(crate) fn current(&self) -> Vec<Arc<dyn ChangeObserver>> { self.lock().iter().map(|(_, o)| Arc::clone(o)).collect() }

    pub(crate) fn len(&self) -> usize { self.lock().len() }
    pub(crate) fn clear(&self) { self.lock().clear() }

    fn remove(&self, id: u64) { self.lock().retain(|(i, _)| *i != id) }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> { self.entries.lock().unwrap_or_else(PoisonError::into_inner) }
}

/// Registration of one observer. Dropping it stops delivery.
#[must_use = "dropping the handle unregisters the observer"]
pub struct ObserverHandle {
    list: Weak<ObserverList>,
    id: u64,
}

impl ObserverHandle {
    pub fn unregister(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.remove(self.id);
        }
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.debug_struct("ObserverHandle").field("id", &self.id).finish() }
}
