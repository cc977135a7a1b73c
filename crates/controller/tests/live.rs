#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveset_controller::{
    ChangeObserver, ControllerError, ControllerState, FnObserver, ObserverHandle, Refresh, ResultSetController,
};
use liveset_core::{
    ChangeEvent, IndexPath, Predicate, PredicateMerge, QueryDescriptor, Record, RecordId, SortKey, SortMerge, Value,
};
use liveset_store::{
    ChangeCallback, EntitySchema, GroupCount, MemoryStore, RecordStore, StoreError, Subscription,
};
use tokio::sync::{watch, Notify};

fn people() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_schema(EntitySchema::new("Person").fields(["name", "age", "cat", "note"]))
            .with_schema(EntitySchema::new("Pet").fields(["name"])),
    )
}

fn add(s: &MemoryStore, name: &str, age: i64, cat: &str) -> RecordId {
    s.insert("Person", [("name", Value::from(name)), ("age", Value::Int(age)), ("cat", Value::from(cat))]).unwrap()
}

fn by_age() -> QueryDescriptor { QueryDescriptor::builder("Person").sort_by(SortKey::asc("age")).build().unwrap() }

fn by_cat() -> QueryDescriptor {
    QueryDescriptor::builder("Person").sort_by(SortKey::asc("cat")).sort_by(SortKey::asc("age")).group_by("cat").build().unwrap()
}

/// Records every callback as a line of text.
#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn take(&self) -> Vec<String> { std::mem::take(&mut *self.0.lock().unwrap()) }
}

impl ChangeObserver for Log {
    fn will_change_content(&self) { self.0.lock().unwrap().push("will".into()) }
    fn did_change_content(&self) { self.0.lock().unwrap().push("did".into()) }
    fn on_event(&self, event: &ChangeEvent) { self.0.lock().unwrap().push(event.to_string()) }
}

fn observe<S: RecordStore + 'static>(ctl: &ResultSetController<S>) -> (Arc<Log>, ObserverHandle) {
    let log = Arc::new(Log::default());
    let handle = ctl.register_observer(log.clone()).unwrap();
    (log, handle)
}

async fn settle(rx: &mut watch::Receiver<u64>, epoch: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow() < epoch {
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("controller did not settle");
}

fn ids<S: RecordStore + 'static>(ctl: &ResultSetController<S>) -> Vec<RecordId> {
    ctl.fetched_records().unwrap().iter().map(Record::id).collect()
}

#[tokio::test]
async fn fetch_builds_sections_and_serves_reads() {
    let store = people();
    let a1 = add(&store, "Ann", 30, "a");
    let a2 = add(&store, "Al", 20, "a");
    let b1 = add(&store, "Bo", 25, "b");
    let ctl = ResultSetController::new(store.clone(), by_cat());
    assert!(matches!(ctl.sections(), Err(ControllerError::NotFetched)));
    assert_eq!(ctl.state(), ControllerState::Unfetched);

    ctl.perform_fetch().await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Fetched);
    let sections = ctl.sections().unwrap();
    let shape: Vec<_> = sections.iter().map(|s| (s.name.as_str(), s.len)).collect();
    assert_eq!(shape, vec![("a", 2), ("b", 1)]);
    assert_eq!(ids(&ctl), vec![a2, a1, b1]);
    assert_eq!(ctl.section_index_titles().unwrap(), vec!["A", "B"]);
    assert_eq!(ctl.section_for_section_index_title("B", 1).unwrap(), 1);

    let bo = ctl.record(IndexPath::new(1, 0)).unwrap();
    assert_eq!(bo.id(), b1);
    assert_eq!(ctl.index_path(&bo).unwrap(), Some(IndexPath::new(1, 0)));
    assert!(matches!(ctl.record(IndexPath::new(1, 1)), Err(ControllerError::IndexPathOutOfRange(_))));
}

#[tokio::test]
async fn second_fetch_is_identical_and_silent() {
    let store = people();
    add(&store, "Ann", 30, "a");
    add(&store, "Bo", 25, "b");
    let ctl = ResultSetController::new(store.clone(), by_cat());
    let (log, _h) = observe(&ctl);
    ctl.perform_fetch().await.unwrap();
    let first = ctl.snapshot().unwrap();
    ctl.perform_fetch().await.unwrap();
    let second = ctl.snapshot().unwrap();
    assert_eq!(first.sections(), second.sections());
    assert_eq!(first.ids().collect::<Vec<_>>(), second.ids().collect::<Vec<_>>());
    assert_eq!(first.query_key(), second.query_key());
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn empty_result_has_no_sections() {
    let store = people();
    let ctl = ResultSetController::new(store, by_cat());
    ctl.perform_fetch().await.unwrap();
    assert!(ctl.sections().unwrap().is_empty());
    assert!(ctl.fetched_records().unwrap().is_empty());
}

#[tokio::test]
async fn sort_key_change_is_reported_as_move() {
    let store = people();
    let a = add(&store, "A", 20, "x");
    add(&store, "B", 30, "x");
    let ctl = ResultSetController::new(store.clone(), by_age());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    store.update(a, [("age", Value::Int(40))]).unwrap();
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will", "> #1 (0, 0) -> (0, 1)", "did"]);
    assert_eq!(ctl.record(IndexPath::new(0, 1)).unwrap().get("age"), &Value::Int(40));
}

#[tokio::test]
async fn non_sort_change_is_reported_as_update() {
    let store = people();
    add(&store, "A", 20, "x");
    let b = add(&store, "B", 30, "x");
    let ctl = ResultSetController::new(store.clone(), by_age());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    store.update(b, [("note", Value::from("hi"))]).unwrap();
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will", "~ #2 at (0, 1)", "did"]);
}

#[tokio::test]
async fn insert_suppresses_unrelated_update() {
    let store = people();
    let a = add(&store, "A", 20, "x");
    add(&store, "B", 30, "x");
    let ctl = ResultSetController::new(store.clone(), by_age());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    let mut batch = store.batch();
    let c = batch.insert("Person", [("name", Value::from("C")), ("age", Value::Int(25))]).unwrap();
    batch.update(a, [("note", Value::from("x"))]).unwrap();
    batch.commit().unwrap();
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will".to_string(), format!("+ {c} at (0, 1)"), "did".to_string()]);
}

#[tokio::test]
async fn new_group_inserts_a_section() {
    let store = people();
    add(&store, "A", 20, "a");
    let ctl = ResultSetController::new(store.clone(), by_cat());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    let b = add(&store, "B", 30, "b");
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will".to_string(), "+section 1 \"b\"".to_string(), format!("+ {b} at (1, 0)"), "did".to_string()]);

    store.delete(b).unwrap();
    settle(&mut epoch, 2).await;
    assert_eq!(log.take(), vec!["will".to_string(), "-section 1 \"b\"".to_string(), format!("- {b} at (1, 0)"), "did".to_string()]);
}

#[tokio::test]
async fn irrelevant_writes_are_ignored_without_querying() {
    let store = people();
    add(&store, "A", 20, "x");
    let q = by_age().with_predicate(Predicate::ge("age", 18), PredicateMerge::And).unwrap();
    let ctl = ResultSetController::new(store.clone(), q);
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();
    let queries = store.executed_queries();

    store.insert("Pet", [("name", Value::from("Rex"))]).unwrap();
    let kid = add(&store, "Kid", 5, "x");
    store.update(kid, [("age", Value::Int(6))]).unwrap();
    store.delete(kid).unwrap();
    settle(&mut epoch, 4).await;

    assert!(log.take().is_empty());
    assert_eq!(store.executed_queries(), queries);
}

#[tokio::test]
async fn queued_notifications_apply_in_order() {
    let store = people();
    let ctl = ResultSetController::new(store.clone(), by_age());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();
    let queries = store.executed_queries();

    // All four writes land before the driver runs; each re-query sees the latest store.
    let a = add(&store, "A", 10, "x");
    let b = add(&store, "B", 20, "x");
    store.update(a, [("note", Value::from("n"))]).unwrap();
    store.delete(b).unwrap();
    settle(&mut epoch, 4).await;

    assert_eq!(
        log.take(),
        vec![
            "will".to_string(),
            format!("+ {a} at (0, 0)"),
            "did".to_string(),
            "will".to_string(),
            format!("~ {a} at (0, 0)"),
            "did".to_string(),
        ]
    );
    assert_eq!(store.executed_queries() - queries, 3);
    assert_eq!(ids(&ctl), vec![a]);
}

#[tokio::test]
async fn window_shift_is_reported() {
    let store = people();
    let a = add(&store, "A", 10, "x");
    let b = add(&store, "B", 20, "x");
    add(&store, "C", 30, "x");
    let q = by_age().to_builder().take(2).build().unwrap();
    let ctl = ResultSetController::new(store.clone(), q);
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();
    assert_eq!(ids(&ctl), vec![a, b]);

    let z = add(&store, "Z", 1, "x");
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will".to_string(), format!("- {b} at (0, 1)"), format!("+ {z} at (0, 0)"), "did".to_string()]);
    assert_eq!(ids(&ctl), vec![z, a]);
}

#[tokio::test]
async fn offset_window_follows_writes_ranked_before_it() {
    let store = people();
    let a = add(&store, "A", 10, "x");
    let b = add(&store, "B", 20, "x");
    let c = add(&store, "C", 30, "x");
    let d = add(&store, "D", 40, "x");
    let q = by_age().to_builder().skip(1).take(2).build().unwrap();
    let ctl = ResultSetController::new(store.clone(), q.clone());
    let (log, _h) = observe(&ctl);
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();
    assert_eq!(ids(&ctl), vec![b, c]);

    store.delete(a).unwrap();
    settle(&mut epoch, 1).await;
    assert_eq!(log.take(), vec!["will".to_string(), format!("- {b} at (0, 0)"), format!("+ {d} at (0, 1)"), "did".to_string()]);
    let truth: Vec<RecordId> = store.execute(&q).await.unwrap().iter().map(Record::id).collect();
    assert_eq!(ids(&ctl), truth);

    store.update(b, [("age", Value::Int(100))]).unwrap();
    settle(&mut epoch, 2).await;
    assert_eq!(log.take(), vec!["will".to_string(), format!("- {c} at (0, 0)"), format!("+ {b} at (0, 1)"), "did".to_string()]);
    let truth: Vec<RecordId> = store.execute(&q).await.unwrap().iter().map(Record::id).collect();
    assert_eq!(ids(&ctl), truth);
    assert_eq!(ids(&ctl), vec![d, b]);
}

#[tokio::test]
async fn query_failure_leaves_state_unchanged() {
    let store = people();
    add(&store, "A", 10, "x");
    let ctl = ResultSetController::new(store.clone(), by_age());
    store.set_fail_next("offline");
    assert!(matches!(ctl.perform_fetch().await, Err(ControllerError::QueryExecution(StoreError::Rejected(_)))));
    assert_eq!(ctl.state(), ControllerState::Unfetched);
    assert!(matches!(ctl.sections(), Err(ControllerError::NotFetched)));

    ctl.perform_fetch().await.unwrap();
    let before = ctl.query();
    store.set_fail_next("offline");
    let err = ctl.filter(Predicate::lt("age", 5)).await.unwrap_err();
    assert!(matches!(err, ControllerError::QueryExecution(_)));
    assert_eq!(ctl.query(), before);
    assert_eq!(ctl.state(), ControllerState::Fetched);
    assert_eq!(ctl.fetched_records().unwrap().len(), 1);
}

#[tokio::test]
async fn refresh_composes_with_initial_predicate() {
    let store = people();
    let young = add(&store, "Y", 20, "x");
    let old = add(&store, "O", 50, "x");
    add(&store, "K", 10, "x");
    let q = by_age().with_predicate(Predicate::ge("age", 18), PredicateMerge::And).unwrap();
    let ctl = ResultSetController::new(store.clone(), q.clone());
    let (log, _h) = observe(&ctl);
    ctl.perform_fetch().await.unwrap();
    assert_eq!(ids(&ctl), vec![young, old]);

    ctl.filter(Predicate::lt("age", 40)).await.unwrap();
    assert_eq!(ids(&ctl), vec![young]);
    assert_eq!(ctl.query().predicate(), &Predicate::ge("age", 18).and(Predicate::lt("age", 40)));
    assert_eq!(log.take(), vec!["will".to_string(), format!("- {old} at (0, 1)"), "did".to_string()]);

    ctl.filter(Predicate::gt("age", 30)).await.unwrap();
    assert_eq!(ids(&ctl), vec![old]);
    log.take();

    ctl.reset_filter().await.unwrap();
    assert_eq!(ids(&ctl), vec![young, old]);
    assert_eq!(ctl.query(), q);
    log.take();

    ctl.refresh_sort_keys(vec![SortKey::desc("age")], SortMerge::Replace).await.unwrap();
    assert_eq!(ids(&ctl), vec![old, young]);
    assert_eq!(
        log.take(),
        vec!["will".to_string(), format!("> {old} (0, 1) -> (0, 0)"), format!("> {young} (0, 0) -> (0, 1)"), "did".to_string()]
    );

    ctl.reset().await.unwrap();
    assert_eq!(ctl.query(), q);
    assert_eq!(ids(&ctl), vec![young, old]);
}

#[tokio::test]
async fn invalid_refresh_is_a_configuration_error() {
    let store = people();
    let ctl = ResultSetController::new(store, by_cat());
    ctl.perform_fetch().await.unwrap();
    let err = ctl.refresh(Refresh::sort_keys(vec![SortKey::asc("age")], SortMerge::Replace)).await.unwrap_err();
    assert!(matches!(err, ControllerError::Configuration(_)));
    assert_eq!(ctl.query(), by_cat());
}

#[tokio::test]
async fn refresh_before_fetch_acts_as_fetch() {
    let store = people();
    add(&store, "A", 10, "x");
    let ctl = ResultSetController::new(store, by_age());
    let (log, _h) = observe(&ctl);
    ctl.refresh(Refresh::current()).await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Fetched);
    assert_eq!(ctl.fetched_records().unwrap().len(), 1);
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn dispose_rejects_further_use() {
    let store = people();
    let ctl = ResultSetController::new(store.clone(), by_age());
    ctl.perform_fetch().await.unwrap();
    assert_eq!(store.subscriber_count(), 1);
    ctl.dispose().unwrap();
    assert_eq!(ctl.state(), ControllerState::Disposed);
    assert_eq!(store.subscriber_count(), 0);
    assert!(matches!(ctl.dispose(), Err(ControllerError::UseAfterDispose)));
    assert!(matches!(ctl.perform_fetch().await, Err(ControllerError::UseAfterDispose)));
    assert!(matches!(ctl.sections(), Err(ControllerError::UseAfterDispose)));
    assert!(matches!(ctl.refresh(Refresh::current()).await, Err(ControllerError::UseAfterDispose)));
    assert!(ctl.register_observer(Arc::new(FnObserver::new(|_: &ChangeEvent| {}))).is_err());
}

#[tokio::test]
async fn dropping_controller_unsubscribes() {
    let store = people();
    {
        let ctl = ResultSetController::new(store.clone(), by_age());
        ctl.perform_fetch().await.unwrap();
        assert_eq!(store.subscriber_count(), 1);
    }
    assert_eq!(store.subscriber_count(), 0);
}

#[tokio::test]
async fn observers_run_in_order_until_released() {
    let store = people();
    let ctl = ResultSetController::new(store.clone(), by_age());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (s1, s2) = (seen.clone(), seen.clone());
    let h1 = ctl.register_observer(Arc::new(FnObserver::new(move |_: &ChangeEvent| s1.lock().unwrap().push(1)))).unwrap();
    let _h2 = ctl.register_observer(Arc::new(FnObserver::new(move |_: &ChangeEvent| s2.lock().unwrap().push(2)))).unwrap();
    let mut epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    add(&store, "A", 1, "x");
    settle(&mut epoch, 1).await;
    drop(h1);
    add(&store, "B", 2, "x");
    settle(&mut epoch, 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 2]);
}

/// Store whose queries can be held open until the test releases them.
struct GatedStore {
    inner: MemoryStore,
    hold: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl RecordStore for GatedStore {
    async fn execute(&self, query: &QueryDescriptor) -> Result<Vec<Record>, StoreError> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.execute(query).await
    }

    async fn grouped_count(&self, query: &QueryDescriptor, group_key: &str) -> Result<Option<Vec<GroupCount>>, StoreError> {
        self.inner.grouped_count(query, group_key).await
    }

    fn subscribe(&self, on_change: ChangeCallback) -> Subscription { self.inner.subscribe(on_change) }
}

#[tokio::test]
async fn dispose_discards_in_flight_recompute() {
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new().with_schema(EntitySchema::new("Person").fields(["name", "age"])),
        hold: AtomicBool::new(false),
        entered: Notify::new(),
        release: Notify::new(),
    });
    store.inner.insert("Person", [("age", Value::Int(1))]).unwrap();
    let ctl = ResultSetController::new(store.clone(), by_age());
    let (log, _h) = observe(&ctl);
    let epoch = ctl.subscribe_epoch();
    ctl.perform_fetch().await.unwrap();

    store.hold.store(true, Ordering::SeqCst);
    store.inner.insert("Person", [("age", Value::Int(2))]).unwrap();
    tokio::time::timeout(Duration::from_secs(5), store.entered.notified()).await.expect("recompute never started");

    ctl.dispose().unwrap();
    store.release.notify_waiters();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(log.take().is_empty());
    assert_eq!(*epoch.borrow(), 0);
    assert_eq!(ctl.state(), ControllerState::Disposed);
}
