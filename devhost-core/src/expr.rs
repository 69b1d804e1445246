//! Connection-string expressions and their resolver.
//!
//! An expression is an explicit segment tree evaluated on demand, never at
//! declaration time. A segment may reference another resource's resolved
//! value, and a resource may redirect its whole expression to another
//! resource's via an annotation. Values are computed on first access after
//! their availability signal, then cached.

use crate::types::{AppModel, ResourceName};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

// ─── Expression tree ──────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprSegment {
    /// Verbatim text.
    Literal(String),
    /// The referenced resource's resolved connection value.
    ResourceRef(ResourceName),
    /// Rendered as `key=value`.
    KeyValue { key: String, value: String },
}

/// A lazily evaluated, composable description of how to produce a
/// resource's connection value. Segments are interpolated in declared
/// order, never reordered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStringExpr {
    pub segments: Vec<ExprSegment>,
}

impl ConnectionStringExpr {
    pub fn new(segments: Vec<ExprSegment>) -> Self {
        Self { segments }
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![ExprSegment::Literal(text.into())],
        }
    }

    pub fn then_literal(mut self, text: impl Into<String>) -> Self {
        self.segments.push(ExprSegment::Literal(text.into()));
        self
    }

    pub fn then_ref(mut self, resource: impl Into<String>) -> Self {
        self.segments.push(ExprSegment::ResourceRef(resource.into()));
        self
    }

    pub fn then_key_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.segments.push(ExprSegment::KeyValue {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Resources referenced directly by this expression.
    pub fn references(&self) -> impl Iterator<Item = &ResourceName> {
        self.segments.iter().filter_map(|s| match s {
            ExprSegment::ResourceRef(name) => Some(name),
            _ => None,
        })
    }
}

// ─── Resolution ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ResolveError {
    /// A referenced upstream value has not been signalled available yet.
    /// "Not yet", not a configuration error.
    #[error("connection string for `{0}` is not yet available")]
    NotAvailable(ResourceName),
    #[error("resource `{0}` does not expose a connection string")]
    NoConnectionString(ResourceName),
    #[error("unknown resource `{0}` referenced from a connection string")]
    UnknownResource(ResourceName),
    #[error("circular connection string reference through `{0}`")]
    Cycle(ResourceName),
}

#[derive(Default)]
struct ResolverState {
    /// Resources whose connection data has been signalled available.
    available: HashSet<ResourceName>,
    /// Resolved values, computed on first access.
    cache: HashMap<ResourceName, String>,
}

/// Pull-based evaluator over the immutable model. Availability is flipped
/// by the orchestrator as lifecycle events fire; everything else here is
/// pure derived data plus the value cache.
pub struct ConnectionStringResolver {
    model: Arc<AppModel>,
    state: RwLock<ResolverState>,
}

impl ConnectionStringResolver {
    pub fn new(model: Arc<AppModel>) -> Self {
        Self {
            model,
            state: RwLock::new(ResolverState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ResolverState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ResolverState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `name`'s connection data is now available for
    /// referencing resources to consume.
    pub fn mark_available(&self, name: &str) {
        self.write().available.insert(name.to_string());
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.read().available.contains(name)
    }

    /// Resolve `name`'s connection string.
    ///
    /// Follows redirect annotations to the terminal expression, then
    /// evaluates segments in declared order. A reference to a resource that
    /// is neither cached nor marked available fails with
    /// [`ResolveError::NotAvailable`] — never a partial value.
    pub fn resolve(&self, name: &str) -> Result<String, ResolveError> {
        let mut in_progress = Vec::new();
        self.resolve_inner(name, &mut in_progress)
    }

    fn resolve_inner(
        &self,
        name: &str,
        in_progress: &mut Vec<ResourceName>,
    ) -> Result<String, ResolveError> {
        if let Some(value) = self.read().cache.get(name) {
            return Ok(value.clone());
        }
        if in_progress.iter().any(|n| n == name) {
            return Err(ResolveError::Cycle(name.to_string()));
        }
        in_progress.push(name.to_string());
        let result = self.resolve_uncached(name, in_progress);
        in_progress.pop();

        if let Ok(value) = &result {
            self.write().cache.insert(name.to_string(), value.clone());
        }
        result
    }

    fn resolve_uncached(
        &self,
        name: &str,
        in_progress: &mut Vec<ResourceName>,
    ) -> Result<String, ResolveError> {
        let resource = self
            .model
            .get(name)
            .ok_or_else(|| ResolveError::UnknownResource(name.to_string()))?;

        // A redirect substitutes the target's whole expression, transitively.
        if let Some(target) = resource.last_redirect() {
            return self.resolve_inner(target, in_progress);
        }

        let expr = resource
            .connection_string
            .as_ref()
            .ok_or_else(|| ResolveError::NoConnectionString(name.to_string()))?;

        let mut out = String::new();
        for segment in &expr.segments {
            match segment {
                ExprSegment::Literal(text) => out.push_str(text),
                ExprSegment::KeyValue { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                ExprSegment::ResourceRef(target) => {
                    let gated = {
                        let state = self.read();
                        !state.available.contains(target.as_str())
                            && !state.cache.contains_key(target.as_str())
                    };
                    if gated {
                        return Err(ResolveError::NotAvailable(target.clone()));
                    }
                    out.push_str(&self.resolve_inner(target, in_progress)?);
                }
            }
        }
        Ok(out)
    }

    /// True when `name`'s (redirect-resolved) expression transitively
    /// references `target`. Used by availability propagation to pick which
    /// descendants a newly available value unblocks.
    pub fn depends_on(&self, name: &str, target: &str) -> bool {
        let mut visited = HashSet::new();
        self.depends_on_inner(name, target, &mut visited)
    }

    fn depends_on_inner(
        &self,
        name: &str,
        target: &str,
        visited: &mut HashSet<ResourceName>,
    ) -> bool {
        if !visited.insert(name.to_string()) {
            return false;
        }
        let Some(resource) = self.model.get(name) else {
            return false;
        };
        if let Some(redirect) = resource.last_redirect() {
            return redirect == target || self.depends_on_inner(redirect, target, visited);
        }
        let Some(expr) = resource.connection_string.as_ref() else {
            return false;
        };
        expr.references()
            .any(|r| r == target || self.depends_on_inner(r, target, visited))
    }
}
