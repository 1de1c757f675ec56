//! Change routing from objects to the views that care.
//!
//! Views are indexed by the properties their context routes (predicate
//! properties plus order-key properties). A named property change reaches
//! only the views indexed under it; generic and state changes reach all.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use objectstore_core::Change;

use crate::view::ContextView;

#[derive(Debug, Default)]
pub struct ViewRoutes {
    views: HashMap<u64, Weak<ContextView>>,
    by_property: HashMap<String, Vec<u64>>,
}

impl ViewRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, view: &Arc<ContextView>) {
        let id = view.context().id();
        for property in view.context().routed_properties() {
            let ids = self.by_property.entry(property.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.views.insert(id, Arc::downgrade(view));
    }

    /// The live view of a context.
    pub fn get(&self, context_id: u64) -> Option<Arc<ContextView>> {
        self.views.get(&context_id).and_then(Weak::upgrade)
    }

    pub fn all(&self) -> Vec<Arc<ContextView>> {
        self.views.values().filter_map(Weak::upgrade).collect()
    }

    /// Views a change must reach.
    pub fn for_change(&self, change: &Change) -> Vec<Arc<ContextView>> {
        match change {
            Change::Property(property) => self
                .by_property
                .get(property.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|id| self.get(*id))
                .collect(),
            Change::Any | Change::State { .. } => self.all(),
        }
    }

    /// Forget dropped views. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.views.len();
        self.views.retain(|_, view| view.strong_count() > 0);
        let views = &self.views;
        self.by_property.retain(|_, ids| {
            ids.retain(|id| views.contains_key(id));
            !ids.is_empty()
        });
        before - self.views.len()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}
