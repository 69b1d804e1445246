use crate::expr::ConnectionStringExpr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

// ─── Scalar aliases ───────────────────────────────────────────

/// Resource identifier — unique within a run.
pub type ResourceName = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

pub(crate) fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ─── Known snapshot property names ────────────────────────────

/// Effective parent of the resource, recorded at the resources-prepared pass.
pub const PROP_PARENT_NAME: &str = "parent-name";

/// Resolved connection string. Sensitive by default.
pub const PROP_CONNECTION_STRING: &str = "connection-string";

// ─── Resource model ───────────────────────────────────────────

/// What kind of workload a resource represents. Carried by starting events
/// for observability only — the core never starts anything itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Container,
    Executable,
    /// External dependency (database, queue, third-party API).
    Service,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Container => write!(f, "container"),
            ResourceKind::Executable => write!(f, "executable"),
            ResourceKind::Service => write!(f, "service"),
        }
    }
}

/// Typed metadata attached by the builder. Declaration order is preserved;
/// lookups by kind take the last match (last-write-wins, never a merge).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAnnotation {
    ParentRelationship { parent: ResourceName },
    ConnectionStringRedirect { target: ResourceName },
}

/// A declared unit of the application topology.
///
/// Capabilities are declared at construction: `parent` is the direct
/// has-a-parent capability (always wins over annotations), and
/// `connection_string` is the lazily evaluated has-a-connection-string
/// capability. Mutable runtime state lives in the notification service,
/// never on the resource itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    pub name: ResourceName,
    pub kind: ResourceKind,
    pub annotations: Vec<ResourceAnnotation>,
    pub parent: Option<ResourceName>,
    pub connection_string: Option<ConnectionStringExpr>,
}

impl Resource {
    fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            annotations: Vec::new(),
            parent: None,
            connection_string: None,
        }
    }

    pub fn container(name: impl Into<String>) -> Self {
        Self::new(name, ResourceKind::Container)
    }

    pub fn executable(name: impl Into<String>) -> Self {
        Self::new(name, ResourceKind::Executable)
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(name, ResourceKind::Service)
    }

    /// Direct parent capability. Takes precedence over any
    /// `ParentRelationship` annotation.
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declare a parent relationship annotation. May be called repeatedly;
    /// the last declaration wins.
    pub fn with_parent_relationship(mut self, parent: impl Into<String>) -> Self {
        self.annotations.push(ResourceAnnotation::ParentRelationship {
            parent: parent.into(),
        });
        self
    }

    pub fn with_connection_string(mut self, expr: ConnectionStringExpr) -> Self {
        self.connection_string = Some(expr);
        self
    }

    /// Redirect this resource's connection string to another resource's
    /// expression. The last redirect declared wins.
    pub fn with_connection_string_redirect(mut self, target: impl Into<String>) -> Self {
        self.annotations
            .push(ResourceAnnotation::ConnectionStringRedirect {
                target: target.into(),
            });
        self
    }

    /// Last `ParentRelationship` annotation, if any.
    pub fn last_parent_relationship(&self) -> Option<&ResourceName> {
        self.annotations.iter().rev().find_map(|a| match a {
            ResourceAnnotation::ParentRelationship { parent } => Some(parent),
            _ => None,
        })
    }

    /// Last `ConnectionStringRedirect` annotation, if any.
    pub fn last_redirect(&self) -> Option<&ResourceName> {
        self.annotations.iter().rev().find_map(|a| match a {
            ResourceAnnotation::ConnectionStringRedirect { target } => Some(target),
            _ => None,
        })
    }

    /// True when the resource exposes a connection string, either through its
    /// own expression or through a redirect to another resource's.
    pub fn has_connection_string(&self) -> bool {
        self.connection_string.is_some() || self.last_redirect().is_some()
    }
}

// ─── Application model ────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("duplicate resource name `{0}`")]
    DuplicateResource(ResourceName),
}

/// The finalized, immutable resource set. Built once by the (external)
/// builder, read-only for the rest of the run.
#[derive(Clone, Debug)]
pub struct AppModel {
    resources: Vec<Resource>,
    index: HashMap<ResourceName, usize>,
}

impl AppModel {
    pub fn new(resources: Vec<Resource>) -> Result<Self, ModelError> {
        let mut index = HashMap::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            if index.insert(resource.name.clone(), i).is_some() {
                return Err(ModelError::DuplicateResource(resource.name.clone()));
            }
        }
        Ok(Self { resources, index })
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.index.get(name).map(|&i| &self.resources[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

// ─── Resource lifecycle state ─────────────────────────────────

/// Per-resource lifecycle: `Pending → Starting → Running → (Finished | Failed)`.
/// Transitions are driven exclusively by executor-sourced events plus the
/// resources-prepared milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceState {
    Pending,
    Starting,
    Running,
    Finished,
    Failed,
}

impl ResourceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Finished | ResourceState::Failed)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceState::Pending => "Pending",
            ResourceState::Starting => "Starting",
            ResourceState::Running => "Running",
            ResourceState::Finished => "Finished",
            ResourceState::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

// ─── Snapshots ────────────────────────────────────────────────

/// A named observable property. `sensitive` is a presentation flag only —
/// it does not affect routing or equality, just whether UIs should mask it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceProperty {
    pub name: String,
    pub value: Value,
    pub sensitive: bool,
}

/// Immutable point-in-time copy of a resource's observable state. Every
/// update produces a new snapshot; a delivered snapshot is never mutated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub state: ResourceState,
    pub properties: Vec<ResourceProperty>,
    pub created_at: Timestamp,
}

impl ResourceSnapshot {
    pub fn empty() -> Self {
        Self {
            state: ResourceState::Pending,
            properties: Vec::new(),
            created_at: now_ms(),
        }
    }

    pub fn with_state(mut self, state: ResourceState) -> Self {
        self.state = state;
        self.created_at = now_ms();
        self
    }

    /// Set a property, replacing an existing one of the same name in place
    /// so property order stays stable across updates.
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: Value,
        sensitive: bool,
    ) -> Self {
        let name = name.into();
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(existing) => {
                existing.value = value;
                existing.sensitive = sensitive;
            }
            None => self.properties.push(ResourceProperty {
                name,
                value,
                sensitive,
            }),
        }
        self.created_at = now_ms();
        self
    }

    pub fn property(&self, name: &str) -> Option<&ResourceProperty> {
        self.properties.iter().find(|p| p.name == name)
    }
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
