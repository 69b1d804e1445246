//! Resource notification service.
//!
//! Holds the latest snapshot of every resource and fans each applied update
//! out to any number of concurrent watchers. Every watcher gets its own
//! queue, seeded with the current snapshot of every known resource at
//! registration, so a late subscriber is never without a baseline.
//!
//! Lagging-consumer policy: per-consumer unbounded queues. Producers are
//! never blocked and no transition is dropped; slack is bounded only by the
//! run's lifetime. Watchers whose receiving side has gone away are pruned
//! on the next delivery attempt.

use crate::types::{ResourceName, ResourceSnapshot};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One delivered transition: the resource plus the snapshot that was applied.
#[derive(Clone, Debug)]
pub struct ResourceUpdate {
    pub resource: ResourceName,
    pub snapshot: ResourceSnapshot,
}

struct Watcher {
    id: Uuid,
    tx: mpsc::UnboundedSender<ResourceUpdate>,
}

#[derive(Default)]
struct NotifyState {
    snapshots: BTreeMap<ResourceName, ResourceSnapshot>,
    watchers: Vec<Watcher>,
    shutdown: bool,
}

/// The only frequently mutated shared structure in the core. All mutation
/// goes through [`publish_update`](ResourceNotificationService::publish_update);
/// one lock serializes updates, so every watcher observes a single
/// resource's transitions in the exact order they were applied.
pub struct ResourceNotificationService {
    state: Arc<Mutex<NotifyState>>,
}

impl ResourceNotificationService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NotifyState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, NotifyState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `mutate` to the resource's current snapshot and deliver the
    /// result to every active watcher. A resource not yet known is created
    /// with an empty snapshot first — not an error.
    pub fn publish_update(
        &self,
        resource: &str,
        mutate: impl FnOnce(ResourceSnapshot) -> ResourceSnapshot,
    ) {
        let mut state = self.state();
        let current = state
            .snapshots
            .get(resource)
            .cloned()
            .unwrap_or_else(ResourceSnapshot::empty);
        let next = mutate(current);
        state.snapshots.insert(resource.to_string(), next.clone());

        tracing::debug!(resource, state = %next.state, "resource snapshot updated");

        let update = ResourceUpdate {
            resource: resource.to_string(),
            snapshot: next,
        };
        state.watchers.retain(|w| w.tx.send(update.clone()).is_ok());
    }

    /// Latest snapshot of `resource`, if it has ever been updated.
    pub fn get_snapshot(&self, resource: &str) -> Option<ResourceSnapshot> {
        self.state().snapshots.get(resource).cloned()
    }

    /// Open an independent watch stream. The stream first delivers the
    /// current snapshot of every known resource (catch-up burst), then every
    /// subsequent transition in applied order, until `cancellation` fires,
    /// the service shuts down, or the watch is dropped.
    pub fn watch(&self, cancellation: CancellationToken) -> ResourceWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::now_v7();
        {
            let mut state = self.state();
            for (resource, snapshot) in &state.snapshots {
                let _ = tx.send(ResourceUpdate {
                    resource: resource.clone(),
                    snapshot: snapshot.clone(),
                });
            }
            if !state.shutdown {
                state.watchers.push(Watcher { id, tx });
            }
        }
        ResourceWatch {
            id,
            rx,
            cancellation,
            state: Arc::clone(&self.state),
        }
    }

    /// Close every watcher's queue. Each watcher drains what was already
    /// delivered, then ends.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.shutdown = true;
        state.watchers.clear();
    }
}

impl Default for ResourceNotificationService {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-consumer live feed of snapshot updates. Dropping it unregisters
/// the consumer immediately.
pub struct ResourceWatch {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<ResourceUpdate>,
    cancellation: CancellationToken,
    state: Arc<Mutex<NotifyState>>,
}

impl ResourceWatch {
    /// Next update, or `None` once cancelled or shut down.
    pub async fn next(&mut self) -> Option<ResourceUpdate> {
        tokio::select! {
            _ = self.cancellation.cancelled() => None,
            update = self.rx.recv() => update,
        }
    }
}

impl Drop for ResourceWatch {
    fn drop(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.watchers.retain(|w| w.id != self.id);
    }
}
