//! # Mutation Controller
//!
//! Single writer for the FlowSpace. Batches arrive on a bounded queue and are
//! executed one at a time, in FIFO order, on a dedicated worker thread that
//! exclusively owns the [`FlowMap`] write handle and drives the
//! [`ConsistencyMirror`] mutations.
//!
//! ## Per-entry protocol
//! For an update of entry `e` inside a running batch:
//! 1. remove `e` by id from the flow map (`NotFound` skips this entry)
//! 2. remove `e`'s id from the mirror (no-op if absent)
//! 3. add the patched entry to the mirror (`ConfigError` skips this entry;
//!    the flow map stays without it until a later batch re-adds it)
//! 4. add the patched entry back to the flow map
//!
//! Adds run steps 3 and 4, removes run steps 1 and 2. Skipped entries are
//! logged and reported in the [`MutationOutcome`]; the batch still commits
//! and notifies. A failure in step 4 or a panic anywhere is a fault: the
//! batch is `Failed`, nothing is notified and partially applied entries are
//! left as they are.

use crate::mirror::{ConsistencyMirror, FlowSpaceEvent};
use chrono::{DateTime, Utc};
use flowspace::{EntryId, FlowEntry, FlowMap, FlowSpaceError, FlowSpaceUpdate};
use log::{debug, error, info, warn};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::BridgeError;

// ================================================================================================
// BATCH IDENTITY AND STATE
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a batch: `Queued → Running → Committed | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Queued,
    Running,
    Committed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Committed | BatchState::Failed)
    }
}

/// An entry change that was dropped while its batch ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    pub name: String,
    pub error: FlowSpaceError,
}

/// Final report of one batch.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub batch_id: BatchId,
    pub state: BatchState,
    /// Names of entries whose change was applied, in batch order
    pub applied: Vec<String>,
    pub skipped: Vec<SkippedChange>,
    /// Generation this batch committed as; `None` when it failed
    pub generation: Option<u64>,
    pub committed_at: Option<DateTime<Utc>>,
    /// Description of the fault that failed the batch
    pub fault: Option<String>,
}

impl MutationOutcome {
    pub fn is_committed(&self) -> bool {
        self.state == BatchState::Committed
    }
}

/// Caller's view of a submitted batch. Dropping it does not cancel the
/// batch.
#[derive(Debug)]
pub struct MutationHandle {
    batch_id: BatchId,
    state: watch::Receiver<BatchState>,
    outcome: oneshot::Receiver<MutationOutcome>,
}

impl MutationHandle {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn state(&self) -> BatchState {
        *self.state.borrow()
    }

    /// Waits for the batch to finish.
    pub async fn wait(self) -> Result<MutationOutcome, BridgeError> {
        self.outcome.await.map_err(|_| BridgeError::ControllerStopped)
    }

    /// Blocking variant of [`wait`](Self::wait). Must not be called from
    /// within an async context.
    pub fn wait_blocking(self) -> Result<MutationOutcome, BridgeError> {
        self.outcome
            .blocking_recv()
            .map_err(|_| BridgeError::ControllerStopped)
    }
}

// ================================================================================================
// QUEUE PROTOCOL
// ================================================================================================

/// A change whose target has been resolved to an id at submission.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedChange {
    Update { id: EntryId, update: FlowSpaceUpdate },
    Add { entry: FlowEntry },
    Remove { id: EntryId, name: String },
}

impl ResolvedChange {
    fn name(&self) -> &str {
        match self {
            ResolvedChange::Update { update, .. } => &update.name,
            ResolvedChange::Add { entry } => entry.name(),
            ResolvedChange::Remove { name, .. } => name,
        }
    }
}

pub(crate) struct Batch {
    batch_id: BatchId,
    changes: Vec<ResolvedChange>,
    state_tx: watch::Sender<BatchState>,
    rtn: oneshot::Sender<MutationOutcome>,
}

impl Batch {
    /// Packages `changes` and returns the caller's handle for it.
    pub(crate) fn new(changes: Vec<ResolvedChange>) -> (Batch, MutationHandle) {
        let batch_id = BatchId::new();
        let (state_tx, state_rx) = watch::channel(BatchState::Queued);
        let (rtn, rtn_rx) = oneshot::channel();
        let batch = Batch {
            batch_id,
            changes,
            state_tx,
            rtn,
        };
        let handle = MutationHandle {
            batch_id,
            state: state_rx,
            outcome: rtn_rx,
        };
        (batch, handle)
    }
}

pub(crate) enum ControllerCall {
    Batch(Batch),
    /// Run everything already queued, then stop
    Shutdown { rtn: oneshot::Sender<()> },
}

// ================================================================================================
// WORKER
// ================================================================================================

/// Result of executing a batch's changes up to commit.
struct BatchReport {
    applied: Vec<String>,
    skipped: Vec<SkippedChange>,
}

pub(crate) struct MutationWorker {
    map: FlowMap,
    mirror: Arc<ConsistencyMirror>,
    generation: u64,
    call_rx: mpsc::Receiver<ControllerCall>,
}

impl MutationWorker {
    pub(crate) fn new(
        map: FlowMap,
        mirror: Arc<ConsistencyMirror>,
        call_rx: mpsc::Receiver<ControllerCall>,
    ) -> Self {
        MutationWorker {
            map,
            mirror,
            generation: 0,
            call_rx,
        }
    }

    /// Starts the worker on its own OS thread.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("flowspace-controller".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        info!("FlowSpace controller started with {} entries", self.map.len());
        while let Some(call) = self.call_rx.blocking_recv() {
            match call {
                ControllerCall::Batch(batch) => self.execute(batch),
                ControllerCall::Shutdown { rtn } => {
                    self.call_rx.close();
                    while let Some(call) = self.call_rx.blocking_recv() {
                        match call {
                            ControllerCall::Batch(batch) => self.execute(batch),
                            ControllerCall::Shutdown { rtn } => {
                                let _ = rtn.send(());
                            }
                        }
                    }
                    info!("FlowSpace controller drained at generation {}", self.generation);
                    let _ = rtn.send(());
                    return;
                }
            }
        }
        info!("FlowSpace controller queue closed at generation {}", self.generation);
    }

    fn execute(&mut self, batch: Batch) {
        let Batch {
            batch_id,
            changes,
            state_tx,
            rtn,
        } = batch;
        let _ = state_tx.send(BatchState::Running);
        debug!("Running batch {} with {} changes", batch_id, changes.len());

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.apply_changes(&changes)));

        let outcome = match result {
            Ok(Ok(report)) => {
                self.generation += 1;
                let committed_at = Utc::now();
                let event = FlowSpaceEvent {
                    batch_id,
                    generation: self.generation,
                    committed_at,
                    snapshot: self.map.snapshot(),
                };
                self.mirror.notify(&event);
                info!(
                    "Committed batch {} as generation {}: {} applied, {} skipped",
                    batch_id,
                    self.generation,
                    report.applied.len(),
                    report.skipped.len()
                );
                MutationOutcome {
                    batch_id,
                    state: BatchState::Committed,
                    applied: report.applied,
                    skipped: report.skipped,
                    generation: Some(self.generation),
                    committed_at: Some(committed_at),
                    fault: None,
                }
            }
            Ok(Err(fault)) => self.failed(batch_id, fault),
            Err(payload) => self.failed(batch_id, format!("panic: {}", panic_message(payload.as_ref()))),
        };

        let _ = state_tx.send(outcome.state);
        let _ = rtn.send(outcome);
    }

    fn failed(&self, batch_id: BatchId, fault: String) -> MutationOutcome {
        error!("Batch {} failed: {}", batch_id, fault);
        MutationOutcome {
            batch_id,
            state: BatchState::Failed,
            applied: Vec::new(),
            skipped: Vec::new(),
            generation: None,
            committed_at: None,
            fault: Some(fault),
        }
    }

    /// Runs every change in order. Handled errors skip one change; an `Err`
    /// return is a fault that fails the whole batch.
    fn apply_changes(&mut self, changes: &[ResolvedChange]) -> Result<BatchReport, String> {
        let mut report = BatchReport {
            applied: Vec::with_capacity(changes.len()),
            skipped: Vec::new(),
        };

        for change in changes {
            let step = match change {
                ResolvedChange::Update { id, update } => self.apply_update(*id, update)?,
                ResolvedChange::Add { entry } => self.apply_add(entry.clone())?,
                ResolvedChange::Remove { id, .. } => self.apply_remove(*id),
            };
            match step {
                Ok(()) => report.applied.push(change.name().to_string()),
                Err(error) => {
                    warn!("Skipping flowspace change for '{}': {}", change.name(), error);
                    report.skipped.push(SkippedChange {
                        name: change.name().to_string(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    fn apply_update(
        &mut self,
        id: EntryId,
        update: &FlowSpaceUpdate,
    ) -> Result<Result<(), FlowSpaceError>, String> {
        let current = match self.map.remove(id) {
            Ok(entry) => entry,
            Err(e) => return Ok(Err(e)),
        };
        self.mirror.apply_remove(id);
        self.install(update.apply(&current))
    }

    fn apply_add(&mut self, entry: FlowEntry) -> Result<Result<(), FlowSpaceError>, String> {
        self.install(entry)
    }

    fn apply_remove(&mut self, id: EntryId) -> Result<(), FlowSpaceError> {
        self.map.remove(id)?;
        self.mirror.apply_remove(id);
        Ok(())
    }

    /// Steps 3 and 4.
    fn install(&mut self, entry: FlowEntry) -> Result<Result<(), FlowSpaceError>, String> {
        let entry = Arc::new(entry);
        if let Err(e) = self.mirror.apply_add(&entry) {
            return Ok(Err(e));
        }
        let name = entry.name().to_string();
        self.map
            .add(FlowEntry::clone(&entry))
            .map(|_| Ok(()))
            .map_err(|e| format!("flow map rejected '{}' after the mirror accepted it: {}", name, e))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
