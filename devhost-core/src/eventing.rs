//! Typed publish/subscribe over [`AppEvent`]s.
//!
//! Dispatch is two-pass: subscribers scoped to the event's resource run
//! first, in registration order, then global subscribers for the kind.
//! `publish` returns only after every handler has completed, so a caller
//! awaiting it is guaranteed all observable side effects of the event have
//! already happened. Handler failures are isolated and reported; they never
//! abort the rest of the dispatch.

use crate::events::{AppEvent, EventKind};
use crate::types::ResourceName;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub type SubscriptionId = Uuid;

/// Boxed future returned by closure-based handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A subscriber on the bus. Implement directly for stateful handlers, or
/// register a closure through [`EventBus::subscribe_fn`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: AppEvent) -> Result<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(AppEvent) -> HandlerFuture + Send + Sync,
{
    async fn handle(&self, event: AppEvent) -> Result<()> {
        (self.f)(event).await
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Registry {
    global: HashMap<EventKind, Vec<Subscription>>,
    scoped: HashMap<(EventKind, ResourceName), Vec<Subscription>>,
}

/// One handler failure during a dispatch.
#[derive(Debug)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub error: anyhow::Error,
}

/// What a `publish` call accomplished. Failures are already logged when the
/// outcome is returned; they are surfaced here so callers that want
/// aggregate-failure semantics can still see them.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The subscriber registry. Created with the orchestrator, torn down with
/// it — never a free-floating static table.
pub struct EventBus {
    registry: Mutex<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A poisoned registry still holds consistent data; recover it.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a handler for `kind`, optionally scoped to one resource.
    /// Safe to call from within another handler's execution: registration
    /// never corrupts an in-flight dispatch (which iterates its own copy of
    /// the list), though the new subscriber may miss that dispatch.
    pub fn subscribe(
        &self,
        kind: EventKind,
        resource: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = Uuid::now_v7();
        let subscription = Subscription { id, handler };
        let mut registry = self.registry();
        match resource {
            Some(name) => registry
                .scoped
                .entry((kind, name.to_string()))
                .or_default()
                .push(subscription),
            None => registry.global.entry(kind).or_default().push(subscription),
        }
        id
    }

    /// Closure form of [`subscribe`](Self::subscribe).
    pub fn subscribe_fn<F>(
        &self,
        kind: EventKind,
        resource: Option<&str>,
        f: F,
    ) -> SubscriptionId
    where
        F: Fn(AppEvent) -> HandlerFuture + Send + Sync + 'static,
    {
        self.subscribe(kind, resource, Arc::new(FnHandler { f }))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let mut removed = false;
        for subs in registry.global.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        for subs in registry.scoped.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        removed
    }

    /// Deliver `event` to every matching subscriber and wait for each
    /// handler to finish. Resource-scoped subscribers run before global
    /// ones; within each pass, registration order.
    pub async fn publish(&self, event: AppEvent) -> DispatchOutcome {
        let pending: Vec<Subscription> = {
            let registry = self.registry();
            let mut pending = Vec::new();
            if let Some(resource) = &event.resource {
                if let Some(subs) = registry.scoped.get(&(event.kind, resource.clone())) {
                    pending.extend(subs.iter().cloned());
                }
            }
            if let Some(subs) = registry.global.get(&event.kind) {
                pending.extend(subs.iter().cloned());
            }
            pending
        };

        tracing::debug!(event = ?event.desc(), subscribers = pending.len(), "dispatching event");

        let mut outcome = DispatchOutcome::default();
        for subscription in pending {
            match subscription.handler.handle(event.clone()).await {
                Ok(()) => outcome.delivered += 1,
                Err(error) => {
                    tracing::error!(
                        event = ?event.desc(),
                        subscription = %subscription.id,
                        %error,
                        "event handler failed"
                    );
                    outcome.failures.push(HandlerFailure {
                        subscription: subscription.id,
                        error,
                    });
                }
            }
        }
        outcome
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
