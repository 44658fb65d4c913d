//! End-to-end behaviour of the mutation controller, the mirror and the
//! query surface.

use bridge::{
    BatchState, BridgeError, ControllerConfig, ExportScope, FlowSpaceEvent, FlowSpaceRuntime,
    FlowSpaceStore, MemoryStore, StoreError,
};
use flowspace::{
    Dpid, EntryId, ErrorKind, FieldMatch, FlowEntry, FlowMap, FlowMatch, FlowSpaceChange,
    FlowSpaceRecord, FlowSpaceUpdate, HeaderFields, MatchField, NewFlowSpaceEntry, Permission,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ================================================================================================
// HELPERS
// ================================================================================================

fn start(store: Arc<dyn FlowSpaceStore>) -> FlowSpaceRuntime {
    FlowSpaceRuntime::start(store, &ControllerConfig::default()).unwrap()
}

fn names(result: &[(Arc<FlowEntry>, flowspace::SliceActions)]) -> Vec<String> {
    result.iter().map(|(e, _)| e.name().to_string()).collect()
}

/// Store that rejects inserts for chosen names.
#[derive(Default)]
struct RejectingStore {
    inner: MemoryStore,
    rejected: Mutex<HashSet<String>>,
}

impl RejectingStore {
    fn reject(&self, name: &str) {
        self.rejected.lock().insert(name.to_string());
    }
}

impl FlowSpaceStore for RejectingStore {
    fn load(&self) -> Result<Vec<FlowSpaceRecord>, StoreError> {
        self.inner.load()
    }

    fn insert(&self, record: &FlowSpaceRecord) -> Result<(), StoreError> {
        if self.rejected.lock().contains(&record.name) {
            return Err(StoreError::Duplicate(format!("name={} is quarantined", record.name)));
        }
        self.inner.insert(record)
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
}

/// Store whose inserts panic once armed.
#[derive(Default)]
struct PanickingStore {
    inner: MemoryStore,
    armed: Mutex<bool>,
}

impl FlowSpaceStore for PanickingStore {
    fn load(&self) -> Result<Vec<FlowSpaceRecord>, StoreError> {
        self.inner.load()
    }

    fn insert(&self, record: &FlowSpaceRecord) -> Result<(), StoreError> {
        if *self.armed.lock() {
            panic!("storage backend crashed");
        }
        self.inner.insert(record)
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        self.inner.delete(id)
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<FlowSpaceEvent>) -> FlowSpaceEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification timed out")
        .expect("listener channel closed")
}

// ================================================================================================
// SCENARIOS
// ================================================================================================

#[tokio::test]
async fn test_priority_update_reorders_matches() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();

    let outcome = api
        .submit(vec![NewFlowSpaceEntry::new("A")
            .with_dpid(1u64)
            .with_priority(10)
            .with_slice_action("tenant1", 7u32)
            .into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_committed());

    let result = api.query_match(Dpid::new(1), &HeaderFields::new());
    assert_eq!(names(&result), vec!["A"]);
    assert_eq!(result[0].1.permission("tenant1"), Some(Permission::from_bits(7)));

    let outcome = api
        .submit(vec![
            FlowSpaceUpdate::new("A").with_priority(5).into(),
            NewFlowSpaceEntry::new("B").with_dpid(1u64).with_priority(10).into(),
        ])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec!["A", "B"]);

    let result = api.query_match(Dpid::new(1), &HeaderFields::new());
    assert_eq!(names(&result), vec!["B", "A"]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ghost_update_rejected_before_enqueue() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();
    api.submit(vec![NewFlowSpaceEntry::new("A").with_priority(1).into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    let before = api.export(&ExportScope::All);

    let err = api
        .submit(vec![FlowSpaceUpdate::new("ghost").with_priority(3).into()])
        .await
        .unwrap_err();
    assert_eq!(err.flowspace_kind(), Some(ErrorKind::NotFound));

    assert_eq!(api.export(&ExportScope::All), before);
    assert_eq!(api.len(), 1);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mirror_add_failure_leaves_window_and_batch_continues() {
    let store = Arc::new(RejectingStore::default());
    for (id, name) in [(1, "first"), (2, "second")] {
        let entry = FlowEntry::builder().id(id).name(name).dpid(Dpid::new(1)).priority(5).build().unwrap();
        store.insert(&FlowSpaceRecord::from_entry(&entry)).unwrap();
    }
    let runtime = start(store.clone());
    let api = runtime.api();

    let (tx, mut rx) = mpsc::unbounded_channel();
    api.subscribe(move |event: &FlowSpaceEvent| {
        let _ = tx.send(event.clone());
    })
    .unwrap();

    store.reject("first");
    let outcome = api
        .submit(vec![
            FlowSpaceUpdate::new("first").with_priority(50).into(),
            FlowSpaceUpdate::new("second").with_priority(40).into(),
        ])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.state, BatchState::Committed);
    assert_eq!(outcome.applied, vec!["second"]);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].name, "first");
    assert_eq!(outcome.skipped[0].error.kind(), ErrorKind::ConfigError);

    let event = next_event(&mut rx).await;
    assert_eq!(event.generation, 1);
    assert_eq!(event.snapshot.len(), 1);
    assert_eq!(event.snapshot.find_by_name("second").unwrap().priority(), 40);

    assert_eq!(api.find_by_id(1).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(api.export(&ExportScope::All).len(), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_batches_notify_in_order() {
    const BATCHES: u64 = 16;
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();

    let (tx, mut rx) = mpsc::unbounded_channel();
    api.subscribe(move |event: &FlowSpaceEvent| {
        let _ = tx.send(event.clone());
    })
    .unwrap();

    let mut tasks = Vec::new();
    for i in 0..BATCHES {
        let api = api.clone();
        tasks.push(tokio::spawn(async move {
            let change = NewFlowSpaceEntry::new(format!("entry-{}", i)).with_priority(i as u32);
            api.submit(vec![change.into()]).await.unwrap().wait().await.unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    outcomes.sort_by_key(|o| o.generation);

    for (expected, outcome) in (1..=BATCHES).zip(&outcomes) {
        let event = next_event(&mut rx).await;
        assert_eq!(event.generation, expected);
        assert_eq!(Some(event.generation), outcome.generation);
        assert_eq!(event.batch_id, outcome.batch_id);
        assert_eq!(event.snapshot.len() as u64, expected);
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panic_fails_batch_without_notification() {
    let store = Arc::new(PanickingStore::default());
    let runtime = start(store.clone());
    let api = runtime.api();

    let (tx, mut rx) = mpsc::unbounded_channel();
    api.subscribe(move |event: &FlowSpaceEvent| {
        let _ = tx.send(event.generation);
    })
    .unwrap();

    *store.armed.lock() = true;
    let outcome = api
        .submit(vec![NewFlowSpaceEntry::new("doomed").into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.state, BatchState::Failed);
    assert!(outcome.fault.unwrap().contains("storage backend crashed"));
    assert_eq!(outcome.generation, None);

    // The controller keeps serving later batches.
    *store.armed.lock() = false;
    let outcome = api
        .submit(vec![NewFlowSpaceEntry::new("survivor").into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_committed());
    assert_eq!(outcome.generation, Some(1));

    let generation = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
    assert_eq!(generation, Some(1));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_export_reimport_preserves_classification() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();

    let web = FlowMatch::any()
        .with(MatchField::TpDst, FieldMatch::Exact(80))
        .unwrap()
        .with(MatchField::NwSrc, FieldMatch::parse(MatchField::NwSrc, "10.0.0.0/8").unwrap())
        .unwrap();
    api.submit(vec![
        NewFlowSpaceEntry::new("web")
            .with_dpid(1u64)
            .with_priority(20)
            .with_match(web)
            .with_queues(vec![1, 3])
            .with_forced_queue(Some(3))
            .with_slice_action("tenant2", 6u32)
            .into(),
        NewFlowSpaceEntry::new("default").with_priority(1).with_slice_action("tenant1", 7u32).into(),
        NewFlowSpaceEntry::new("dp2").with_dpid(2u64).with_priority(20).into(),
    ])
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

    let records = api.export(&ExportScope::All);
    let text = flowspace::records_to_json(&records);
    let reimported = FlowMap::from_entries(
        flowspace::parse_records(&text)
            .unwrap()
            .iter()
            .map(|r| r.to_entry().unwrap()),
    )
    .unwrap();

    let headers = [
        HeaderFields::new(),
        HeaderFields::new().with(MatchField::TpDst, 80),
        HeaderFields::new()
            .with(MatchField::TpDst, 80)
            .with(MatchField::NwSrc, 0x0a01_0203),
        HeaderFields::new()
            .with(MatchField::TpDst, 80)
            .with(MatchField::NwSrc, 0xc0a8_0001),
    ];
    for dpid in [Dpid::new(1), Dpid::new(2), Dpid::new(3)] {
        for header in &headers {
            let original: Vec<FlowEntry> = api.matches(dpid, header).map(|e| (*e).clone()).collect();
            let again: Vec<FlowEntry> = reimported.matches(dpid, header).map(|e| (*e).clone()).collect();
            assert_eq!(original, again);
        }
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_and_tenant_export() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();
    api.submit(vec![
        NewFlowSpaceEntry::new("shared")
            .with_slice_action("tenant1", 7u32)
            .with_slice_action("tenant2", 2u32)
            .into(),
        NewFlowSpaceEntry::new("private").with_slice_action("tenant1", 7u32).into(),
    ])
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();

    let tenant2 = api.list(&ExportScope::Slice("tenant2".to_string()));
    assert_eq!(tenant2.len(), 1);
    assert_eq!(tenant2[0].name, "shared");
    assert_eq!(tenant2[0].slice_action.len(), 1);
    assert_eq!(tenant2[0].slice_action[0].slice_name, "tenant2");

    let outcome = api
        .submit(vec![FlowSpaceChange::remove("shared")])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec!["shared"]);
    assert!(api.export(&ExportScope::Slice("tenant2".to_string())).is_empty());
    assert_eq!(api.find_by_name("shared").unwrap_err().kind(), ErrorKind::NotFound);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_committed_queues_are_deduplicated() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();
    api.submit(vec![NewFlowSpaceEntry::new("q").with_queues(vec![5, 5, 2]).into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(api.find_by_name("q").unwrap().queue_ids(), &[5, 2]);
    assert_eq!(api.export(&ExportScope::All)[0].queues, vec![5, 2]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_add_rejected_before_enqueue() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();
    api.submit(vec![NewFlowSpaceEntry::new("A").into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let err = api.submit(vec![NewFlowSpaceEntry::new("A").into()]).await.unwrap_err();
    assert_eq!(err.flowspace_kind(), Some(ErrorKind::ConfigError));
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_then_rejects() {
    let runtime = start(Arc::new(MemoryStore::new()));
    let api = runtime.api();

    let handles = vec![
        api.submit(vec![NewFlowSpaceEntry::new("a").into()]).await.unwrap(),
        api.submit(vec![NewFlowSpaceEntry::new("b").into()]).await.unwrap(),
    ];
    runtime.shutdown().await.unwrap();

    for handle in handles {
        assert!(handle.wait().await.unwrap().is_committed());
    }
    assert_eq!(api.len(), 2);

    let err = api.submit(vec![NewFlowSpaceEntry::new("c").into()]).await.unwrap_err();
    assert!(matches!(err, BridgeError::ControllerStopped));
}

#[tokio::test]
async fn test_restart_reloads_persisted_flowspace() {
    let store = Arc::new(MemoryStore::new());
    let runtime = start(store.clone());
    let api = runtime.api();
    api.submit(vec![
        NewFlowSpaceEntry::new("a").with_priority(3).into(),
        NewFlowSpaceEntry::new("b").with_priority(9).into(),
    ])
    .await
    .unwrap()
    .wait()
    .await
    .unwrap();
    let exported = api.export(&ExportScope::All);
    runtime.shutdown().await.unwrap();

    let restarted = start(store);
    let api = restarted.api();
    assert_eq!(api.export(&ExportScope::All), exported);

    let outcome = api
        .submit(vec![NewFlowSpaceEntry::new("c").into()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_committed());
    let ids: HashSet<EntryId> = api.snapshot().iter().map(|e| e.id()).collect();
    assert_eq!(ids.len(), 3);

    restarted.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blocked_subscriber_does_not_stall_commits() {
    const BATCHES: u64 = 6;
    let config = ControllerConfig {
        listener_queue_capacity: 1,
        ..ControllerConfig::default()
    };
    let runtime = FlowSpaceRuntime::start(Arc::new(MemoryStore::new()), &config).unwrap();
    let api = runtime.api();

    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock();
    let slow_gate = Arc::clone(&gate);
    api.subscribe(move |_event: &FlowSpaceEvent| {
        let _pass = slow_gate.lock();
    })
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    api.subscribe(move |event: &FlowSpaceEvent| {
        let _ = tx.send(event.clone());
    })
    .unwrap();

    for generation in 1..=BATCHES {
        let handle = api
            .submit(vec![NewFlowSpaceEntry::new(format!("entry-{}", generation)).into()])
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("batch stalled behind a blocked subscriber")
            .unwrap();
        assert_eq!(outcome.generation, Some(generation));
        assert_eq!(next_event(&mut rx).await.generation, generation);
    }

    drop(held);
    runtime.shutdown().await.unwrap();
}
