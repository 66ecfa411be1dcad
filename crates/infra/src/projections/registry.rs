//! Explicit projection registry handed to the engine at construction.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stocklens_events::Projection;

use super::engine::EngineError;
use super::view::{ManagedView, ViewCell};

/// When a view is brought up to date relative to a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Caught up in the same logical step as the commit, before the producer is answered.
    Synchronous,
    /// Caught up by a dedicated worker woken by commit notices.
    #[default]
    Asynchronous,
}

/// The set of views an engine manages, in registration order.
#[derive(Default)]
pub struct ProjectionRegistry {
    views: Vec<Arc<dyn ManagedView>>,
    names: HashSet<String>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register with the default (asynchronous) refresh mode.
    pub fn register<P: Projection>(&mut self, projection: P) -> Result<&mut Self, EngineError> {
        self.register_with_mode(projection, RefreshMode::default())
    }

    pub fn register_with_mode<P: Projection>(
        &mut self,
        projection: P,
        mode: RefreshMode,
    ) -> Result<&mut Self, EngineError> {
        let name = projection.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(EngineError::DuplicateView(name));
        }
        self.views.push(Arc::new(ViewCell::new(projection, mode)));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.views.iter().map(|v| v.name())
    }

    pub(crate) fn into_views(self) -> Vec<Arc<dyn ManagedView>> {
        self.views
    }
}

impl core::fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.views.iter().map(|v| (v.name(), v.mode())))
            .finish()
    }
}
