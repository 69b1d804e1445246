//! Lifecycle events crossing the orchestration boundary.

use crate::eventing::EventBus;
use crate::notify::ResourceNotificationService;
use crate::types::ResourceName;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The event types the core publishes and subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// Fired once, after the dependency graph is finalized and before any
    /// resource-specific startup event. Global.
    ResourcesPrepared,
    /// A resource is being started by the executor. Resource-scoped.
    ResourceStarting,
    /// Imperative startup-time customization hook. Resource-scoped, carries
    /// service handles for the subscribers.
    InitializeResource,
    /// The resource's connection data can now be resolved. Resource-scoped.
    ConnectionStringAvailable,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ResourcesPrepared => "resources-prepared",
            EventKind::ResourceStarting => "resource-starting",
            EventKind::InitializeResource => "initialize-resource",
            EventKind::ConnectionStringAvailable => "connection-string-available",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handles passed to `InitializeResource` subscribers so startup-time
/// customization can record state and publish follow-up events without
/// holding references of its own.
#[derive(Clone)]
pub struct InitServices {
    pub notifications: Arc<ResourceNotificationService>,
    pub eventing: Arc<EventBus>,
    /// `tracing` target for the resource's startup logs.
    pub log_target: String,
}

impl std::fmt::Debug for InitServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitServices")
            .field("log_target", &self.log_target)
            .finish_non_exhaustive()
    }
}

/// An immutable record of something that happened, scoped globally or to one
/// resource, carrying the cancellation signal handlers must observe.
#[derive(Clone, Debug)]
pub struct AppEvent {
    pub kind: EventKind,
    /// `None` = global scope.
    pub resource: Option<ResourceName>,
    pub cancellation: CancellationToken,
    /// Only present on `InitializeResource`.
    pub services: Option<InitServices>,
}

impl AppEvent {
    pub fn global(kind: EventKind, cancellation: CancellationToken) -> Self {
        Self {
            kind,
            resource: None,
            cancellation,
            services: None,
        }
    }

    pub fn scoped(
        kind: EventKind,
        resource: impl Into<ResourceName>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            kind,
            resource: Some(resource.into()),
            cancellation,
            services: None,
        }
    }

    pub fn with_services(mut self, services: InitServices) -> Self {
        self.services = Some(services);
        self
    }

    pub fn desc(&self) -> EventDesc {
        EventDesc {
            kind: self.kind.as_str(),
            resource: self.resource.clone(),
        }
    }
}

/// Serializable description of an event for the log stream.
#[derive(Clone, Debug, Serialize)]
pub struct EventDesc {
    pub kind: &'static str,
    pub resource: Option<ResourceName>,
}
