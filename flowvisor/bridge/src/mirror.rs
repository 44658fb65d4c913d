//! # Consistency Mirror
//!
//! Second materialization of the FlowSpace. It backs persistence (every
//! change is written to the [`FlowSpaceStore`] before the in-memory copy
//! moves), serves read-only exports, and fans committed changes out to
//! subscribers.
//!
//! Only the mutation controller calls the `apply_*` and `notify` methods.
//!
//! ## Delivery
//! Each subscriber owns a bounded queue drained by its own thread. `notify`
//! only enqueues, so a slow or failing subscriber never stalls the
//! controller; when a subscriber's queue is full the event is dropped for
//! that subscriber alone.

use crate::controller::BatchId;
use crate::store::FlowSpaceStore;
use chrono::{DateTime, Utc};
use flowspace::{EntryId, FlowEntry, FlowSnapshot, FlowSpaceError, FlowSpaceRecord};
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TrySendError};

// ================================================================================================
// EVENTS AND SUBSCRIBERS
// ================================================================================================

/// Change notification sent once per committed batch.
#[derive(Debug, Clone)]
pub struct FlowSpaceEvent {
    pub batch_id: BatchId,
    /// Count of committed batches, starting at 1
    pub generation: u64,
    pub committed_at: DateTime<Utc>,
    /// The full FlowSpace as committed by this batch
    pub snapshot: Arc<FlowSnapshot>,
}

/// Receiver of change notifications.
///
/// Runs on the subscriber's delivery thread. An `Err` is logged; it never
/// affects the committed batch.
pub trait FlowSpaceListener: Send + 'static {
    fn on_change(&mut self, event: &FlowSpaceEvent) -> Result<(), String>;
}

impl<F> FlowSpaceListener for F
where
    F: FnMut(&FlowSpaceEvent) + Send + 'static,
{
    fn on_change(&mut self, event: &FlowSpaceEvent) -> Result<(), String> {
        self(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<FlowSpaceEvent>,
    worker: JoinHandle<()>,
}

fn spawn_delivery(
    id: SubscriptionId,
    capacity: usize,
    mut listener: Box<dyn FlowSpaceListener>,
) -> std::io::Result<Subscriber> {
    let (tx, mut rx) = mpsc::channel::<FlowSpaceEvent>(capacity);
    let worker = thread::Builder::new()
        .name(format!("flowspace-{}", id))
        .spawn(move || {
            while let Some(event) = rx.blocking_recv() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener.on_change(&event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        "Subscriber {} failed to process generation {}: {}",
                        id, event.generation, e
                    ),
                    Err(_) => error!(
                        "Subscriber {} panicked while processing generation {}",
                        id, event.generation
                    ),
                }
            }
            debug!("Subscriber {} delivery thread exiting", id);
        })?;
    Ok(Subscriber { id, tx, worker })
}

// ================================================================================================
// EXPORT SCOPE
// ================================================================================================

/// Which entries an export covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    /// Administrator view: every entry in full detail
    All,
    /// Administrator view without the per-slice grants
    Summary,
    /// Tenant view: entries granting the slice a permission, showing only
    /// that slice's grant
    Slice(String),
}

// ================================================================================================
// MIRROR
// ================================================================================================

#[derive(Debug, Default)]
struct MirrorState {
    entries: BTreeMap<EntryId, Arc<FlowEntry>>,
    names: HashMap<String, EntryId>,
}

pub struct ConsistencyMirror {
    state: RwLock<MirrorState>,
    store: Arc<dyn FlowSpaceStore>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    listener_queue_capacity: usize,
}

impl ConsistencyMirror {
    /// Mirror seeded with `snapshot`, which must already be persisted in
    /// `store`.
    pub fn new(
        store: Arc<dyn FlowSpaceStore>,
        snapshot: &FlowSnapshot,
        listener_queue_capacity: usize,
    ) -> Self {
        let mut state = MirrorState::default();
        for entry in snapshot.iter() {
            state.names.insert(entry.name().to_string(), entry.id());
            state.entries.insert(entry.id(), Arc::clone(entry));
        }
        ConsistencyMirror {
            state: RwLock::new(state),
            store,
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            listener_queue_capacity: listener_queue_capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.state.read().entries.contains_key(&id)
    }

    // ============================================================================================
    // MUTATION (controller only)
    // ============================================================================================

    /// Adds `entry`. Fails with `ConfigError` if its id or name is taken or
    /// the store rejects it; nothing changes in that case.
    pub fn apply_add(&self, entry: &Arc<FlowEntry>) -> Result<(), FlowSpaceError> {
        {
            let state = self.state.read();
            if state.entries.contains_key(&entry.id()) {
                return Err(FlowSpaceError::config(format!(
                    "mirror already holds id {}",
                    entry.id()
                )));
            }
            if state.names.contains_key(entry.name()) {
                return Err(FlowSpaceError::config(format!(
                    "mirror already holds an entry named '{}'",
                    entry.name()
                )));
            }
        }

        self.store
            .insert(&FlowSpaceRecord::from_entry(entry))
            .map_err(|e| FlowSpaceError::config(format!("persisting '{}' failed: {}", entry.name(), e)))?;

        let mut state = self.state.write();
        state.names.insert(entry.name().to_string(), entry.id());
        state.entries.insert(entry.id(), Arc::clone(entry));
        Ok(())
    }

    /// Removes `id`. Absent ids are a no-op. Returns whether an entry was
    /// removed.
    pub fn apply_remove(&self, id: EntryId) -> bool {
        if let Err(e) = self.store.delete(id) {
            error!("Failed to delete flowspace entry {} from store: {}", id, e);
        }
        let mut state = self.state.write();
        match state.entries.remove(&id) {
            Some(entry) => {
                state.names.remove(entry.name());
                true
            }
            None => false,
        }
    }

    /// Hands `event` to every subscriber's queue.
    pub fn notify(&self, event: &FlowSpaceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Subscriber {} queue full, dropping generation {}",
                    sub.id, event.generation
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Subscriber {} delivery thread is gone, removing it", sub.id);
                false
            }
        });
    }

    // ============================================================================================
    // SUBSCRIPTIONS
    // ============================================================================================

    pub fn subscribe(&self, listener: Box<dyn FlowSpaceListener>) -> std::io::Result<SubscriptionId> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscriber = spawn_delivery(id, self.listener_queue_capacity, listener)?;
        self.subscribers.lock().push(subscriber);
        debug!("Registered flowspace subscriber {}", id);
        Ok(id)
    }

    /// Stops delivery to `id`. Events already queued for it are still
    /// delivered. Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        before != subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Closes every subscription and waits for queued events to be
    /// delivered.
    pub fn close(&self) {
        let subscribers: Vec<Subscriber> = std::mem::take(&mut *self.subscribers.lock());
        for Subscriber { id, tx, worker } in subscribers {
            drop(tx);
            if worker.join().is_err() {
                error!("Subscriber {} delivery thread panicked", id);
            }
        }
    }

    // ============================================================================================
    // EXPORT
    // ============================================================================================

    /// One record per entry in scope, priority descending then id
    /// ascending.
    pub fn export(&self, scope: &ExportScope) -> Vec<FlowSpaceRecord> {
        let state = self.state.read();
        let mut records: Vec<FlowSpaceRecord> = match scope {
            ExportScope::All => state
                .entries
                .values()
                .map(|e| FlowSpaceRecord::from_entry(e))
                .collect(),
            ExportScope::Summary => state
                .entries
                .values()
                .map(|e| {
                    let mut record = FlowSpaceRecord::from_entry(e);
                    record.actions = flowspace::SliceActions::default();
                    record
                })
                .collect(),
            ExportScope::Slice(slice) => state
                .entries
                .values()
                .filter_map(|e| {
                    let permission = e.permission_for(slice)?;
                    let mut record = FlowSpaceRecord::from_entry(e);
                    record.actions = flowspace::SliceActions::from_pairs([(slice.clone(), permission)]);
                    Some(record)
                })
                .collect(),
        };
        records.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        records
    }
}
