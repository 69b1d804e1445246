//! devhost-core — dev-time orchestration engine over a declared resource graph.
//!
//! The core validates relationships between declared resources, drives each
//! resource through its lifecycle in dependency order, derives parent
//! linkage and connection strings, and broadcasts every state change to any
//! number of concurrent observers as an ordered stream.
//!
//! The pieces, leaves first:
//! - [`types`] — the immutable resource model and snapshot types
//! - [`graph`] — parent resolution, cycle detection, topological order
//! - [`events`] / [`eventing`] — typed global + resource-scoped pub/sub
//! - [`expr`] — lazy connection-string expressions with redirection
//! - [`notify`] — snapshot store with fan-out watch streams
//! - [`executor`] — the seam the execution backend reports into
//! - [`orchestrator`] — the driver wiring all of the above together
//!
//! Physical process/container management, the builder API, and persistence
//! all live outside this crate; the core only reacts to executor signals
//! and emits events and snapshots.

pub mod events;
pub mod eventing;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod notify;
pub mod orchestrator;
pub mod types;

pub use events::{AppEvent, EventKind, InitServices};
pub use eventing::{
    DispatchOutcome, EventBus, EventHandler, HandlerFailure, HandlerFuture, SubscriptionId,
};
pub use executor::{ExecutorEvent, ExecutorEventKind, ExecutorEvents, ExecutorHandler};
pub use expr::{ConnectionStringExpr, ConnectionStringResolver, ExprSegment, ResolveError};
pub use graph::{effective_parent, DependencyGraph, GraphError};
pub use notify::{ResourceNotificationService, ResourceUpdate, ResourceWatch};
pub use orchestrator::Orchestrator;
pub use types::{
    AppModel, ModelError, Resource, ResourceAnnotation, ResourceKind, ResourceName,
    ResourceProperty, ResourceSnapshot, ResourceState, Timestamp, PROP_CONNECTION_STRING,
    PROP_PARENT_NAME,
};
