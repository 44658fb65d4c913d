//! # FlowSpace API
//!
//! [`FlowSpaceRuntime`] owns the lifecycle (start, drain, stop) of the
//! mutation controller. [`FlowSpaceApi`] is the cheap, clonable handle every
//! collaborator receives: it submits batches, answers classification queries
//! from flow map snapshots and exports the mirror.
//!
//! Submission validates and resolves a batch before it is queued. A batch
//! that fails validation is returned to the caller and touches no state.

use crate::api_types::FlowSpaceListing;
use crate::config::ControllerConfig;
use crate::controller::{Batch, ControllerCall, MutationHandle, MutationWorker, ResolvedChange};
use crate::error::{BridgeError, BridgeResult};
use crate::mirror::{ConsistencyMirror, ExportScope, FlowSpaceListener, SubscriptionId};
use crate::store::FlowSpaceStore;
use flowspace::{
    Dpid, EntryId, FlowEntry, FlowMap, FlowMapReader, FlowMatch, FlowSnapshot, FlowSpaceChange,
    FlowSpaceError, FlowSpaceRecord, HeaderFields, Matches, Permission, SliceActions,
};
use log::{error, info};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;

// ================================================================================================
// API HANDLE
// ================================================================================================

#[derive(Clone)]
pub struct FlowSpaceApi {
    call_tx: mpsc::Sender<ControllerCall>,
    reader: FlowMapReader,
    mirror: Arc<ConsistencyMirror>,
    next_id: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl FlowSpaceApi {
    // ============================================================================================
    // SUBMISSION
    // ============================================================================================

    /// Queues a batch, waiting for queue space if necessary.
    pub async fn submit(&self, changes: Vec<FlowSpaceChange>) -> BridgeResult<MutationHandle> {
        let (batch, handle) = self.prepare(changes)?;
        self.call_tx
            .send(ControllerCall::Batch(batch))
            .await
            .map_err(|_| BridgeError::ControllerStopped)?;
        Ok(handle)
    }

    /// Queues a batch without waiting; fails with `QueueFull` when the
    /// controller is backed up.
    pub fn try_submit(&self, changes: Vec<FlowSpaceChange>) -> BridgeResult<MutationHandle> {
        let (batch, handle) = self.prepare(changes)?;
        self.call_tx
            .try_send(ControllerCall::Batch(batch))
            .map_err(|e| match e {
                TrySendError::Full(_) => BridgeError::QueueFull,
                TrySendError::Closed(_) => BridgeError::ControllerStopped,
            })?;
        Ok(handle)
    }

    /// Blocking variant of [`submit`](Self::submit) for callers outside an
    /// async context.
    pub fn submit_blocking(&self, changes: Vec<FlowSpaceChange>) -> BridgeResult<MutationHandle> {
        let (batch, handle) = self.prepare(changes)?;
        self.call_tx
            .blocking_send(ControllerCall::Batch(batch))
            .map_err(|_| BridgeError::ControllerStopped)?;
        Ok(handle)
    }

    fn prepare(&self, changes: Vec<FlowSpaceChange>) -> BridgeResult<(Batch, MutationHandle)> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BridgeError::ControllerStopped);
        }
        let resolved = self.resolve(changes)?;
        Ok(Batch::new(resolved))
    }

    /// Resolves every change against the current snapshot.
    ///
    /// Updates and removes must name an existing entry (`NotFound`). Adds
    /// must not collide with an existing name unless an earlier remove in
    /// the same batch frees it (`ConfigError`); they get their id here.
    fn resolve(&self, changes: Vec<FlowSpaceChange>) -> Result<Vec<ResolvedChange>, FlowSpaceError> {
        if changes.is_empty() {
            return Err(FlowSpaceError::config("a mutation batch needs at least one change"));
        }

        let snapshot = self.reader.snapshot();
        let mut added: HashSet<String> = HashSet::new();
        let mut removed: HashSet<String> = HashSet::new();
        let mut resolved = Vec::with_capacity(changes.len());

        for change in changes {
            let item = match change {
                FlowSpaceChange::Update(update) => {
                    let id = self.resolve_existing(&snapshot, &added, &removed, &update.name)?;
                    ResolvedChange::Update { id, update }
                }
                FlowSpaceChange::Remove { name } => {
                    let id = self.resolve_existing(&snapshot, &added, &removed, &name)?;
                    removed.insert(name.clone());
                    ResolvedChange::Remove { id, name }
                }
                FlowSpaceChange::Add(new_entry) => {
                    let name = new_entry.name().to_string();
                    let taken = (snapshot.contains_name(&name) && !removed.contains(&name))
                        || added.contains(&name);
                    if taken {
                        return Err(FlowSpaceError::config(format!(
                            "an entry named '{}' already exists",
                            name
                        )));
                    }
                    let entry = new_entry.build(self.allocate_id())?;
                    removed.remove(&name);
                    added.insert(name);
                    ResolvedChange::Add { entry }
                }
            };
            resolved.push(item);
        }
        Ok(resolved)
    }

    /// Batch-local adds and removes shadow the snapshot.
    fn resolve_existing(
        &self,
        snapshot: &FlowSnapshot,
        added: &HashSet<String>,
        removed: &HashSet<String>,
        name: &str,
    ) -> Result<EntryId, FlowSpaceError> {
        if added.contains(name) {
            return Err(FlowSpaceError::config(format!(
                "entry '{}' is created in the same batch; change it in a later batch",
                name
            )));
        }
        if removed.contains(name) {
            return Err(FlowSpaceError::not_found(format!(
                "name={} (removed earlier in the batch)",
                name
            )));
        }
        snapshot
            .find_by_name(name)
            .map(|entry| entry.id())
            .map_err(|_| FlowSpaceError::not_found(format!("name={}", name)))
    }

    fn allocate_id(&self) -> EntryId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    // ============================================================================================
    // QUERIES
    // ============================================================================================

    /// Entries claiming `header` on `dpid`, each with the slice permissions
    /// it grants, in classification order.
    pub fn query_match(&self, dpid: Dpid, header: &HeaderFields) -> Vec<(Arc<FlowEntry>, SliceActions)> {
        self.reader
            .matches(dpid, header)
            .map(|entry| {
                let actions = entry.slice_actions().clone();
                (entry, actions)
            })
            .collect()
    }

    /// Lazy form of [`query_match`](Self::query_match).
    pub fn matches(&self, dpid: Dpid, header: &HeaderFields) -> Matches {
        self.reader.matches(dpid, header)
    }

    pub fn slice_permission(&self, dpid: Dpid, header: &HeaderFields, slice: &str) -> Option<Permission> {
        self.reader.slice_permission(dpid, header, slice)
    }

    pub fn intersect(&self, dpid: Dpid, pattern: &FlowMatch) -> Vec<Arc<FlowEntry>> {
        self.reader.intersect(dpid, pattern)
    }

    pub fn find_by_name(&self, name: &str) -> Result<Arc<FlowEntry>, FlowSpaceError> {
        self.reader.find_by_name(name)
    }

    pub fn find_by_id(&self, id: EntryId) -> Result<Arc<FlowEntry>, FlowSpaceError> {
        self.reader.find_by_id(id)
    }

    pub fn snapshot(&self) -> Arc<FlowSnapshot> {
        self.reader.snapshot()
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    // ============================================================================================
    // EXPORT AND NOTIFICATION
    // ============================================================================================

    pub fn export(&self, scope: &ExportScope) -> Vec<FlowSpaceRecord> {
        self.mirror.export(scope)
    }

    /// Export projected into the list view.
    pub fn list(&self, scope: &ExportScope) -> Vec<FlowSpaceListing> {
        self.export(scope).iter().map(FlowSpaceListing::from_record).collect()
    }

    pub fn subscribe<L: FlowSpaceListener>(&self, listener: L) -> BridgeResult<SubscriptionId> {
        Ok(self.mirror.subscribe(Box::new(listener))?)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.mirror.unsubscribe(id)
    }
}

// ================================================================================================
// RUNTIME
// ================================================================================================

/// Owns the controller worker.
pub struct FlowSpaceRuntime {
    api: FlowSpaceApi,
    worker: Option<JoinHandle<()>>,
}

impl FlowSpaceRuntime {
    /// Loads the persisted FlowSpace from `store`, builds the flow map and
    /// the mirror, and starts the controller worker.
    pub fn start(store: Arc<dyn FlowSpaceStore>, config: &ControllerConfig) -> BridgeResult<Self> {
        if config.queue_capacity == 0 {
            return Err(BridgeError::Config("controller.queue_capacity must be positive".into()));
        }

        let records = store.load()?;
        let entries = records
            .iter()
            .map(FlowSpaceRecord::to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        let map = FlowMap::from_entries(entries)?;
        let snapshot = map.snapshot();
        let next_id = snapshot.max_id().map_or(1, |max| max + 1);

        let mirror = Arc::new(ConsistencyMirror::new(
            store,
            &snapshot,
            config.listener_queue_capacity,
        ));
        let reader = map.reader();
        let (call_tx, call_rx) = mpsc::channel(config.queue_capacity);
        let worker = MutationWorker::new(map, Arc::clone(&mirror), call_rx)
            .spawn()?;

        info!("FlowSpace runtime started: {} entries, next id {}", snapshot.len(), next_id);

        Ok(FlowSpaceRuntime {
            api: FlowSpaceApi {
                call_tx,
                reader,
                mirror,
                next_id: Arc::new(AtomicU64::new(next_id)),
                stopped: Arc::new(AtomicBool::new(false)),
            },
            worker: Some(worker),
        })
    }

    pub fn api(&self) -> FlowSpaceApi {
        self.api.clone()
    }

    /// Runs every batch queued so far, stops the worker and flushes
    /// subscriber queues. Later submissions fail with `ControllerStopped`.
    pub async fn shutdown(mut self) -> BridgeResult<()> {
        self.api.stopped.store(true, Ordering::Release);
        let (rtn, rtn_rx) = oneshot::channel();
        if self.api.call_tx.send(ControllerCall::Shutdown { rtn }).await.is_ok() {
            let _ = rtn_rx.await;
        }

        let worker = self.worker.take();
        let mirror = Arc::clone(&self.api.mirror);
        tokio::task::spawn_blocking(move || {
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    error!("FlowSpace controller thread panicked");
                }
            }
            mirror.close();
        })
        .await?;

        info!("FlowSpace runtime stopped");
        Ok(())
    }

    /// Blocking variant of [`shutdown`](Self::shutdown).
    pub fn shutdown_blocking(mut self) {
        self.api.stopped.store(true, Ordering::Release);
        let (rtn, rtn_rx) = oneshot::channel();
        if self.api.call_tx.blocking_send(ControllerCall::Shutdown { rtn }).is_ok() {
            let _ = rtn_rx.blocking_recv();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("FlowSpace controller thread panicked");
            }
        }
        self.api.mirror.close();
        info!("FlowSpace runtime stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use flowspace::{ErrorKind, FlowSpaceUpdate, NewFlowSpaceEntry};

    fn runtime_with(records: Vec<FlowSpaceRecord>) -> FlowSpaceRuntime {
        let store = Arc::new(MemoryStore::with_records(records).unwrap());
        FlowSpaceRuntime::start(store, &ControllerConfig::default()).unwrap()
    }

    fn record(id: EntryId, name: &str) -> FlowSpaceRecord {
        FlowSpaceRecord::from_entry(&FlowEntry::builder().id(id).name(name).build().unwrap())
    }

    #[test]
    fn test_ids_continue_after_persisted_max() {
        let runtime = runtime_with(vec![record(4, "a"), record(9, "b")]);
        let api = runtime.api();
        let resolved = api
            .resolve(vec![FlowSpaceChange::Add(NewFlowSpaceEntry::new("c"))])
            .unwrap();
        match &resolved[0] {
            ResolvedChange::Add { entry } => assert_eq!(entry.id(), 10),
            other => panic!("unexpected resolution {:?}", other),
        }
        runtime.shutdown_blocking();
    }

    #[test]
    fn test_resolution_errors() {
        let runtime = runtime_with(vec![record(1, "a")]);
        let api = runtime.api();

        let err = api.resolve(vec![FlowSpaceUpdate::new("ghost").into()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = api.resolve(vec![NewFlowSpaceEntry::new("a").into()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        let err = api.resolve(vec![]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        // Freed by a remove earlier in the same batch
        let ok = api.resolve(vec![FlowSpaceChange::remove("a"), NewFlowSpaceEntry::new("a").into()]);
        assert!(ok.is_ok());
        runtime.shutdown_blocking();
    }

    #[test]
    fn test_batch_local_changes_shadow_snapshot() {
        let runtime = runtime_with(vec![record(1, "a")]);
        let api = runtime.api();

        let err = api
            .resolve(vec![
                FlowSpaceChange::remove("a"),
                NewFlowSpaceEntry::new("a").with_priority(2).into(),
                FlowSpaceUpdate::new("a").with_priority(9).into(),
            ])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);

        let err = api
            .resolve(vec![FlowSpaceChange::remove("a"), FlowSpaceUpdate::new("a").with_priority(9).into()])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = api
            .resolve(vec![FlowSpaceChange::remove("a"), FlowSpaceChange::remove("a")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Nothing was queued, so the entry is untouched
        assert_eq!(api.find_by_name("a").unwrap().id(), 1);
        runtime.shutdown_blocking();
    }
}
