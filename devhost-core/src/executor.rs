//! The executor seam.
//!
//! The execution backend that actually starts and stops workloads lives
//! outside the core; it reports lifecycle signals into [`ExecutorEvents`]
//! and the orchestrator reacts. The core never issues commands back through
//! this channel.

use crate::eventing::DispatchOutcome;
use crate::types::{ResourceKind, ResourceName};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Lifecycle signals emitted by the executor.
#[derive(Clone, Debug)]
pub enum ExecutorEvent {
    /// Fired once, after the model and graph are finalized and before any
    /// resource-specific startup event.
    ResourcesPrepared,
    ResourceStarting {
        resource: ResourceName,
        kind: ResourceKind,
    },
    ResourceStopped {
        resource: ResourceName,
        failed: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutorEventKind {
    ResourcesPrepared,
    ResourceStarting,
    ResourceStopped,
}

impl ExecutorEvent {
    pub fn kind(&self) -> ExecutorEventKind {
        match self {
            ExecutorEvent::ResourcesPrepared => ExecutorEventKind::ResourcesPrepared,
            ExecutorEvent::ResourceStarting { .. } => ExecutorEventKind::ResourceStarting,
            ExecutorEvent::ResourceStopped { .. } => ExecutorEventKind::ResourceStopped,
        }
    }
}

#[async_trait]
pub trait ExecutorHandler: Send + Sync {
    async fn handle(&self, event: ExecutorEvent, cancellation: CancellationToken) -> Result<()>;
}

type Registrations = HashMap<ExecutorEventKind, Vec<(uuid::Uuid, Arc<dyn ExecutorHandler>)>>;

/// Registration/dispatch point for executor signals. The orchestrator
/// subscribes at construction; executor adapters (and tests) publish.
pub struct ExecutorEvents {
    registry: Mutex<Registrations>,
}

impl ExecutorEvents {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registrations> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self, kind: ExecutorEventKind, handler: Arc<dyn ExecutorHandler>) {
        self.registry()
            .entry(kind)
            .or_default()
            .push((uuid::Uuid::now_v7(), handler));
    }

    /// Deliver `event` to every handler registered for its kind, in
    /// registration order, awaiting each. Failures are isolated and logged.
    pub async fn publish(
        &self,
        event: ExecutorEvent,
        cancellation: CancellationToken,
    ) -> DispatchOutcome {
        let pending: Vec<(uuid::Uuid, Arc<dyn ExecutorHandler>)> = self
            .registry()
            .get(&event.kind())
            .map(|handlers| handlers.to_vec())
            .unwrap_or_default();

        let mut outcome = DispatchOutcome::default();
        for (id, handler) in pending {
            match handler.handle(event.clone(), cancellation.clone()).await {
                Ok(()) => outcome.delivered += 1,
                Err(error) => {
                    tracing::error!(event = ?event, subscription = %id, %error, "executor event handler failed");
                    outcome.failures.push(crate::eventing::HandlerFailure {
                        subscription: id,
                        error,
                    });
                }
            }
        }
        outcome
    }
}

impl Default for ExecutorEvents {
    fn default() -> Self {
        Self::new()
    }
}
