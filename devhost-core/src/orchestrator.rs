//! The orchestration driver.
//!
//! Consumes executor lifecycle signals, records snapshots through the
//! notification service, publishes structured events on the bus in
//! dependency order, and triggers connection-string resolution when the
//! relevant events fire. The dependency graph is built here, eagerly — a
//! cyclic model means there is no orchestrator to construct.

use crate::eventing::{EventBus, EventHandler};
use crate::events::{AppEvent, EventKind, InitServices};
use crate::executor::{ExecutorEvent, ExecutorEventKind, ExecutorEvents, ExecutorHandler};
use crate::expr::{ConnectionStringResolver, ResolveError};
use crate::graph::{DependencyGraph, GraphError};
use crate::notify::ResourceNotificationService;
use crate::types::{AppModel, ResourceState, PROP_CONNECTION_STRING, PROP_PARENT_NAME};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

struct OrchestratorInner {
    model: Arc<AppModel>,
    graph: DependencyGraph,
    eventing: Arc<EventBus>,
    notifications: Arc<ResourceNotificationService>,
    resolver: ConnectionStringResolver,
}

impl Orchestrator {
    /// Build the dependency graph and wire the orchestrator onto the
    /// executor seam and the event bus. Fails on a cyclic or invalid graph
    /// before any subscription is made or any event can be published.
    pub fn new(
        model: Arc<AppModel>,
        executor_events: &ExecutorEvents,
        eventing: Arc<EventBus>,
        notifications: Arc<ResourceNotificationService>,
    ) -> Result<Self, GraphError> {
        let graph = DependencyGraph::build(&model)?;
        let resolver = ConnectionStringResolver::new(Arc::clone(&model));

        let inner = Arc::new(OrchestratorInner {
            model,
            graph,
            eventing,
            notifications,
            resolver,
        });

        executor_events.subscribe(
            ExecutorEventKind::ResourcesPrepared,
            Arc::new(ExecutorSeam {
                inner: Arc::clone(&inner),
            }),
        );
        executor_events.subscribe(
            ExecutorEventKind::ResourceStarting,
            Arc::new(ExecutorSeam {
                inner: Arc::clone(&inner),
            }),
        );
        executor_events.subscribe(
            ExecutorEventKind::ResourceStopped,
            Arc::new(ExecutorSeam {
                inner: Arc::clone(&inner),
            }),
        );

        // Resolution reacts to availability wherever it is published from —
        // propagation here, or an external publisher on the bus.
        inner.eventing.subscribe(
            EventKind::ConnectionStringAvailable,
            None,
            Arc::new(ConnectionStringAvailable {
                inner: Arc::clone(&inner),
            }),
        );

        Ok(Self { inner })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn resolver(&self) -> &ConnectionStringResolver {
        &self.inner.resolver
    }
}

/// Routes executor lifecycle signals into the driver.
struct ExecutorSeam {
    inner: Arc<OrchestratorInner>,
}

#[async_trait]
impl ExecutorHandler for ExecutorSeam {
    async fn handle(&self, event: ExecutorEvent, cancellation: CancellationToken) -> Result<()> {
        match event {
            ExecutorEvent::ResourcesPrepared => {
                self.inner.on_resources_prepared(&cancellation).await
            }
            ExecutorEvent::ResourceStarting { resource, kind } => {
                tracing::info!(%resource, %kind, "resource starting");
                self.inner.on_resource_starting(&resource, &cancellation).await
            }
            ExecutorEvent::ResourceStopped { resource, failed } => {
                self.inner.on_resource_stopped(&resource, failed).await
            }
        }
    }
}

/// Global bus subscription: record the resolved value on the snapshot
/// whenever a resource's connection data is announced available.
struct ConnectionStringAvailable {
    inner: Arc<OrchestratorInner>,
}

#[async_trait]
impl EventHandler for ConnectionStringAvailable {
    async fn handle(&self, event: AppEvent) -> Result<()> {
        let Some(resource) = &event.resource else {
            return Ok(());
        };
        if event.cancellation.is_cancelled() {
            return Ok(());
        }
        self.inner.resolver.mark_available(resource);
        match self.inner.resolver.resolve(resource) {
            Ok(value) => {
                self.inner.notifications.publish_update(resource, |s| {
                    s.with_property(PROP_CONNECTION_STRING, Value::String(value), true)
                });
            }
            Err(ResolveError::NotAvailable(upstream)) => {
                tracing::debug!(%resource, %upstream, "connection string not yet available");
            }
            Err(error) => {
                tracing::warn!(%resource, %error, "connection string resolution failed");
            }
        }
        Ok(())
    }
}

impl OrchestratorInner {
    /// The resources-prepared milestone: one pass over the whole graph in
    /// topological order, so a child's recorded parent id is always
    /// already resolved and stable.
    async fn on_resources_prepared(&self, cancellation: &CancellationToken) -> Result<()> {
        for name in self.graph.topological() {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            let parent = self.graph.parent_of(name).cloned();
            self.notifications.publish_update(name, move |snapshot| {
                let snapshot = snapshot.with_state(ResourceState::Pending);
                match parent {
                    Some(parent) => {
                        snapshot.with_property(PROP_PARENT_NAME, Value::String(parent), false)
                    }
                    None => snapshot,
                }
            });
        }
        self.eventing
            .publish(AppEvent::global(
                EventKind::ResourcesPrepared,
                cancellation.clone(),
            ))
            .await;
        Ok(())
    }

    async fn on_resource_starting(
        &self,
        resource: &str,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        self.notifications
            .publish_update(resource, |s| s.with_state(ResourceState::Starting));

        self.eventing
            .publish(AppEvent::scoped(
                EventKind::ResourceStarting,
                resource,
                cancellation.clone(),
            ))
            .await;

        // Startup-time customization runs to completion before the start is
        // acknowledged; handler chains may suspend on further events.
        let services = InitServices {
            notifications: Arc::clone(&self.notifications),
            eventing: Arc::clone(&self.eventing),
            log_target: format!("devhost::resource::{resource}"),
        };
        let initialize = AppEvent::scoped(
            EventKind::InitializeResource,
            resource,
            cancellation.clone(),
        )
        .with_services(services);
        let outcome = self.eventing.publish(initialize).await;
        if !outcome.all_succeeded() {
            tracing::warn!(
                resource,
                failures = outcome.failures.len(),
                "initialize-resource handlers reported failures"
            );
        }

        self.notifications
            .publish_update(resource, |s| s.with_state(ResourceState::Running));

        let has_connection_string = self
            .model
            .get(resource)
            .is_some_and(|r| r.has_connection_string());
        if has_connection_string {
            self.publish_connection_available(resource, cancellation)
                .await;
        }
        Ok(())
    }

    /// Announce availability for `resource`, then — in the same triggering
    /// pass, parents before descendants — for every descendant whose
    /// expression transitively depends on the now-available value.
    async fn publish_connection_available(&self, resource: &str, cancellation: &CancellationToken) {
        self.resolver.mark_available(resource);
        self.eventing
            .publish(AppEvent::scoped(
                EventKind::ConnectionStringAvailable,
                resource,
                cancellation.clone(),
            ))
            .await;

        for descendant in self.graph.descendants_of(resource) {
            if cancellation.is_cancelled() {
                return;
            }
            let Some(declared) = self.model.get(&descendant) else {
                continue;
            };
            if !declared.has_connection_string() {
                continue;
            }
            if !self.resolver.depends_on(&descendant, resource) {
                continue;
            }
            self.resolver.mark_available(&descendant);
            self.eventing
                .publish(AppEvent::scoped(
                    EventKind::ConnectionStringAvailable,
                    &descendant,
                    cancellation.clone(),
                ))
                .await;
        }
    }

    async fn on_resource_stopped(&self, resource: &str, failed: bool) -> Result<()> {
        let state = if failed {
            ResourceState::Failed
        } else {
            ResourceState::Finished
        };
        tracing::info!(resource, %state, "resource stopped");
        self.notifications
            .publish_update(resource, move |s| s.with_state(state));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ConnectionStringExpr;
    use crate::types::{Resource, ResourceKind};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct Harness {
        executor: ExecutorEvents,
        eventing: Arc<EventBus>,
        notifications: Arc<ResourceNotificationService>,
        orchestrator: Orchestrator,
    }

    fn make_harness(resources: Vec<Resource>) -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let model = Arc::new(AppModel::new(resources).unwrap());
        let executor = ExecutorEvents::new();
        let eventing = Arc::new(EventBus::new());
        let notifications = Arc::new(ResourceNotificationService::new());
        let orchestrator = Orchestrator::new(
            Arc::clone(&model),
            &executor,
            Arc::clone(&eventing),
            Arc::clone(&notifications),
        )
        .unwrap();
        Harness {
            executor,
            eventing,
            notifications,
            orchestrator,
        }
    }

    async fn prepare(harness: &Harness) {
        harness
            .executor
            .publish(ExecutorEvent::ResourcesPrepared, CancellationToken::new())
            .await;
    }

    async fn start(harness: &Harness, resource: &str) {
        harness
            .executor
            .publish(
                ExecutorEvent::ResourceStarting {
                    resource: resource.to_string(),
                    kind: ResourceKind::Container,
                },
                CancellationToken::new(),
            )
            .await;
    }

    #[tokio::test]
    async fn test_parent_property_recorded_after_prepared() {
        let harness = make_harness(vec![
            Resource::container("database"),
            Resource::container("child").with_parent("database"),
        ]);

        // Not visible before the milestone
        assert!(harness.notifications.get_snapshot("child").is_none());

        prepare(&harness).await;

        let snapshot = harness.notifications.get_snapshot("child").unwrap();
        assert_eq!(
            snapshot.property(PROP_PARENT_NAME).unwrap().value,
            json!("database")
        );
        // The parent itself records no parent-name
        let parent = harness.notifications.get_snapshot("database").unwrap();
        assert!(parent.property(PROP_PARENT_NAME).is_none());
    }

    #[tokio::test]
    async fn test_parent_annotation_recorded_after_prepared() {
        let harness = make_harness(vec![
            Resource::container("parent"),
            Resource::container("child").with_parent_relationship("parent"),
            Resource::container("child2").with_parent_relationship("parent"),
            Resource::container("nested-child").with_parent_relationship("child"),
        ]);
        prepare(&harness).await;

        let property = |name: &str| {
            harness
                .notifications
                .get_snapshot(name)
                .unwrap()
                .property(PROP_PARENT_NAME)
                .map(|p| p.value.clone())
        };
        assert_eq!(property("child"), Some(json!("parent")));
        assert_eq!(property("child2"), Some(json!("parent")));
        // Nested child is parented on its immediate parent
        assert_eq!(property("nested-child"), Some(json!("child")));
    }

    #[tokio::test]
    async fn test_last_parent_relationship_wins() {
        let harness = make_harness(vec![
            Resource::container("firstParent"),
            Resource::container("secondParent"),
            Resource::container("child")
                .with_parent_relationship("firstParent")
                .with_parent_relationship("secondParent"),
        ]);
        prepare(&harness).await;

        let snapshot = harness.notifications.get_snapshot("child").unwrap();
        assert_eq!(
            snapshot.property(PROP_PARENT_NAME).unwrap().value,
            json!("secondParent")
        );
    }

    #[tokio::test]
    async fn test_circular_dependency_fails_construction() {
        let model = Arc::new(
            AppModel::new(vec![
                Resource::container("container1").with_parent_relationship("container2"),
                Resource::container("container2").with_parent_relationship("container3"),
                Resource::container("container3").with_parent_relationship("container1"),
            ])
            .unwrap(),
        );
        let executor = ExecutorEvents::new();
        let eventing = Arc::new(EventBus::new());
        let notifications = Arc::new(ResourceNotificationService::new());

        let err = Orchestrator::new(model, &executor, eventing, notifications).unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
        // Construction failed before anything was wired to the seam
        let outcome = executor
            .publish(ExecutorEvent::ResourcesPrepared, CancellationToken::new())
            .await;
        assert_eq!(outcome.delivered, 0);
    }

    #[tokio::test]
    async fn test_initialize_resource_published_on_starting() {
        let harness = make_harness(vec![Resource::container("resource")]);
        prepare(&harness).await;

        let seen: Arc<StdMutex<Option<AppEvent>>> = Arc::new(StdMutex::new(None));
        let seen_handler = Arc::clone(&seen);
        harness.eventing.subscribe_fn(
            EventKind::InitializeResource,
            Some("resource"),
            move |event| {
                let seen = Arc::clone(&seen_handler);
                Box::pin(async move {
                    *seen.lock().unwrap() = Some(event);
                    Ok(())
                })
            },
        );

        start(&harness, "resource").await;

        // Publish awaited the handler, so the event is already recorded
        let event = seen.lock().unwrap().take().unwrap();
        assert_eq!(event.kind, EventKind::InitializeResource);
        assert_eq!(event.resource.as_deref(), Some("resource"));
        let services = event.services.expect("carries service handles");
        assert_eq!(services.log_target, "devhost::resource::resource");

        // And the startup was acknowledged afterwards
        let snapshot = harness.notifications.get_snapshot("resource").unwrap();
        assert_eq!(snapshot.state, ResourceState::Running);
    }

    #[tokio::test]
    async fn test_grandchild_connection_strings_unblocked_by_parent_start() {
        let harness = make_harness(vec![
            Resource::service("parent")
                .with_connection_string(ConnectionStringExpr::literal("Server=localhost:8000")),
            Resource::service("child")
                .with_parent("parent")
                .with_connection_string(
                    ConnectionStringExpr::default()
                        .then_ref("parent")
                        .then_literal(";")
                        .then_key_value("Namespace", "ns"),
                ),
            Resource::service("grand-child")
                .with_parent("child")
                .with_connection_string(
                    ConnectionStringExpr::default()
                        .then_ref("child")
                        .then_literal(";")
                        .then_key_value("Database", "db"),
                ),
        ]);
        prepare(&harness).await;

        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        for name in ["parent", "child", "grand-child"] {
            let seen_handler = Arc::clone(&seen);
            harness.eventing.subscribe_fn(
                EventKind::ConnectionStringAvailable,
                Some(name),
                move |event| {
                    let seen = Arc::clone(&seen_handler);
                    Box::pin(async move {
                        seen.lock().unwrap().push(event.resource.unwrap());
                        Ok(())
                    })
                },
            );
        }

        // One starting event on the root unblocks the whole dependent chain
        start(&harness, "parent").await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "parent".to_string(),
                "child".to_string(),
                "grand-child".to_string()
            ]
        );

        let resolver = harness.orchestrator.resolver();
        assert_eq!(resolver.resolve("parent").unwrap(), "Server=localhost:8000");
        assert_eq!(
            resolver.resolve("child").unwrap(),
            "Server=localhost:8000;Namespace=ns"
        );
        assert_eq!(
            resolver.resolve("grand-child").unwrap(),
            "Server=localhost:8000;Namespace=ns;Database=db"
        );

        // Each snapshot carries its resolved value, flagged sensitive
        let connection = |name: &str| {
            harness
                .notifications
                .get_snapshot(name)
                .unwrap()
                .property(PROP_CONNECTION_STRING)
                .cloned()
                .unwrap()
        };
        assert_eq!(
            connection("grand-child").value,
            json!("Server=localhost:8000;Namespace=ns;Database=db")
        );
        assert!(connection("grand-child").sensitive);
    }

    #[tokio::test]
    async fn test_unrelated_sibling_not_unblocked() {
        let harness = make_harness(vec![
            Resource::service("parent")
                .with_connection_string(ConnectionStringExpr::literal("Server=p")),
            Resource::service("loner")
                .with_parent("parent")
                .with_connection_string(ConnectionStringExpr::literal("Server=l")),
        ]);
        prepare(&harness).await;

        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_handler = Arc::clone(&seen);
        harness.eventing.subscribe_fn(
            EventKind::ConnectionStringAvailable,
            None,
            move |event| {
                let seen = Arc::clone(&seen_handler);
                Box::pin(async move {
                    seen.lock().unwrap().push(event.resource.unwrap());
                    Ok(())
                })
            },
        );

        start(&harness, "parent").await;

        // The child's expression does not reference the parent, so parent
        // availability does not announce it
        assert_eq!(*seen.lock().unwrap(), vec!["parent".to_string()]);
    }

    #[tokio::test]
    async fn test_external_availability_event_updates_snapshot() {
        let harness = make_harness(vec![Resource::service("test-resource")
            .with_connection_string(ConnectionStringExpr::literal(
                "Server=localhost:5432;Database=testdb",
            ))]);
        prepare(&harness).await;

        let cancellation = CancellationToken::new();
        let mut watch = harness.notifications.watch(cancellation.clone());

        // Published by an external party straight onto the bus
        harness
            .eventing
            .publish(AppEvent::scoped(
                EventKind::ConnectionStringAvailable,
                "test-resource",
                cancellation.clone(),
            ))
            .await;

        let mut connection = None;
        while let Some(update) = watch.next().await {
            if update.resource == "test-resource" {
                if let Some(property) = update.snapshot.property(PROP_CONNECTION_STRING) {
                    connection = Some(property.clone());
                    break;
                }
            }
        }
        let connection = connection.unwrap();
        assert_eq!(connection.value, json!("Server=localhost:5432;Database=testdb"));
        assert!(connection.sensitive);
    }

    #[tokio::test]
    async fn test_redirected_resource_uses_target_expression() {
        let harness = make_harness(vec![
            Resource::service("primary")
                .with_connection_string(ConnectionStringExpr::literal("Server=primary")),
            Resource::service("alias").with_connection_string_redirect("primary"),
        ]);
        prepare(&harness).await;
        start(&harness, "alias").await;

        let snapshot = harness.notifications.get_snapshot("alias").unwrap();
        assert_eq!(
            snapshot.property(PROP_CONNECTION_STRING).unwrap().value,
            json!("Server=primary")
        );
    }

    #[tokio::test]
    async fn test_stopped_records_terminal_state() {
        let harness = make_harness(vec![Resource::container("worker")]);
        prepare(&harness).await;
        start(&harness, "worker").await;

        harness
            .executor
            .publish(
                ExecutorEvent::ResourceStopped {
                    resource: "worker".to_string(),
                    failed: false,
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            harness.notifications.get_snapshot("worker").unwrap().state,
            ResourceState::Finished
        );

        harness
            .executor
            .publish(
                ExecutorEvent::ResourceStopped {
                    resource: "worker".to_string(),
                    failed: true,
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            harness.notifications.get_snapshot("worker").unwrap().state,
            ResourceState::Failed
        );
    }

    #[tokio::test]
    async fn test_watch_observes_full_lifecycle_in_order() {
        let harness = make_harness(vec![Resource::container("app")]);
        let cancellation = CancellationToken::new();
        let mut watch = harness.notifications.watch(cancellation.clone());

        prepare(&harness).await;
        start(&harness, "app").await;

        let mut states = Vec::new();
        for _ in 0..3 {
            states.push(watch.next().await.unwrap().snapshot.state);
        }
        assert_eq!(
            states,
            vec![
                ResourceState::Pending,
                ResourceState::Starting,
                ResourceState::Running
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_prepared_pass_records_nothing() {
        let harness = make_harness(vec![Resource::container("app")]);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        harness
            .executor
            .publish(ExecutorEvent::ResourcesPrepared, cancellation)
            .await;

        assert!(harness.notifications.get_snapshot("app").is_none());
    }
}
