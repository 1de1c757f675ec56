//! Weakly held identity map of one mapped table.
//!
//! At most one live object exists per key. The map holds objects weakly;
//! views and callers keep them alive. The cache subscribes to every object
//! it tracks and routes change notifications to the views whose contexts
//! depend on the changed property.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use objectstore_core::{
    Change, ChangeListener, EntityRef, Error, Fillable, ForeignResolver, LoadBehavior,
    MappedObjectKeys, ObjectId, ObjectState, Result, ResultSet, Row, TableMapping, object_id,
};
use objectstore_query::QueryContext;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::fill::{FillCommit, Filled};
use crate::routing::ViewRoutes;
use crate::view::{ContextView, PredicateErrors};

/// Default number of inserts between sweeps of dead entries.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 256;

#[derive(Default)]
struct Entries {
    by_key: HashMap<MappedObjectKeys, Weak<dyn Fillable>>,
    keys_by_id: HashMap<ObjectId, MappedObjectKeys>,
    inserts_since_prune: usize,
}

impl Entries {
    fn live(&self, keys: &MappedObjectKeys) -> Option<EntityRef> {
        self.by_key.get(keys).and_then(Weak::upgrade)
    }

    fn insert(&mut self, keys: MappedObjectKeys, object: &EntityRef) {
        self.keys_by_id.insert(object_id(object), keys.clone());
        self.by_key.insert(keys, Arc::downgrade(object));
        self.inserts_since_prune += 1;
    }

    fn prune(&mut self) -> usize {
        let before = self.by_key.len();
        self.by_key.retain(|_, object| object.strong_count() > 0);
        let by_key = &self.by_key;
        self.keys_by_id.retain(|_, keys| by_key.contains_key(keys));
        self.inserts_since_prune = 0;
        before - self.by_key.len()
    }
}

/// Identity map and view registry of one table.
pub struct WeakCache {
    mapping: Arc<TableMapping>,
    this: Weak<WeakCache>,
    resolver: Weak<dyn ForeignResolver>,
    entries: Mutex<Entries>,
    routes: RwLock<ViewRoutes>,
    creating: Mutex<()>,
    retained: Mutex<Vec<Arc<ContextView>>>,
    suppressed: Mutex<HashSet<ObjectId>>,
    errors: Arc<PredicateErrors>,
    prune_threshold: usize,
}

impl WeakCache {
    pub fn new(
        mapping: &Arc<TableMapping>,
        resolver: Weak<dyn ForeignResolver>,
        prune_threshold: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            mapping: Arc::clone(mapping),
            this: this.clone(),
            resolver,
            entries: Mutex::new(Entries::default()),
            routes: RwLock::new(ViewRoutes::new()),
            creating: Mutex::new(()),
            retained: Mutex::new(Vec::new()),
            suppressed: Mutex::new(HashSet::new()),
            errors: Arc::new(PredicateErrors::new()),
            prune_threshold: prune_threshold.max(1),
        })
    }

    pub fn mapping(&self) -> &Arc<TableMapping> {
        &self.mapping
    }

    fn listener(&self) -> Weak<dyn ChangeListener> {
        self.this.clone()
    }

    /// The live object for `keys`.
    pub fn get(&self, keys: &MappedObjectKeys) -> Option<EntityRef> {
        self.entries.lock().live(keys)
    }

    /// Every live tracked object.
    pub fn objects(&self) -> Vec<EntityRef> {
        self.entries
            .lock()
            .by_key
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of tracked entries, including ones not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wire(&self, object: &EntityRef) {
        object.subscribe(self.listener());
        object.bind(self.resolver.clone());
    }

    fn track(&self, keys: MappedObjectKeys, object: &EntityRef) {
        let mut entries = self.entries.lock();
        entries.insert(keys, object);
        if entries.inserts_since_prune >= self.prune_threshold {
            let removed = entries.prune();
            if removed > 0 {
                trace!(table = self.mapping.table(), removed, "pruned dead identity entries");
            }
        }
    }

    /// Register a freshly created object under its placeholder key and
    /// route it to every view.
    pub fn add_new(&self, object: &EntityRef) -> Result<()> {
        if object.mapping().table() != self.mapping.table() {
            return Err(Error::mapping(
                self.mapping.table(),
                format!("cannot add a '{}' object", object.mapping().table()),
            ));
        }
        if object.state() != ObjectState::Created {
            return Err(Error::state(format!(
                "only new objects can be added, this one is {}",
                object.state()
            )));
        }
        self.wire(object);
        self.track(object.keys(), object);
        debug!(table = self.mapping.table(), keys = %object.keys(), "added new object");
        self.route(object, &Change::Any)
    }

    /// Wire an object built from `row`. When another object already owns
    /// its key, that object is refilled and returned instead.
    pub(crate) fn attach_filled(&self, object: EntityRef, row: &Row) -> Result<EntityRef> {
        let keys = self.mapping.keys_from_row(row)?;
        let existing = {
            let mut entries = self.entries.lock();
            match entries.live(&keys) {
                Some(existing) => Some(existing),
                None => {
                    entries.insert(keys.clone(), &object);
                    None
                }
            }
        };
        if let Some(existing) = existing {
            warn!(table = self.mapping.table(), keys = %keys, "identity conflict; reusing the tracked object");
            existing.fill(row)?;
            return Ok(existing);
        }
        self.wire(&object);
        Ok(object)
    }

    /// Scan a result set: live objects are refilled, missing ones built
    /// from the mapping factory. Nothing is visible until the returned
    /// [`FillCommit`] is committed.
    pub fn fill(
        self: &Arc<Self>,
        rows: &ResultSet,
        context: Option<&Arc<QueryContext>>,
    ) -> Result<FillCommit> {
        let mut commit = FillCommit::new(self, context);
        let mut seen: HashMap<MappedObjectKeys, usize> = HashMap::new();
        for row in &rows.rows {
            let keys = self.mapping.keys_from_row(row)?;
            if let Some(&at) = seen.get(&keys) {
                commit.entry(at).fill(row)?;
                continue;
            }
            let entry = match self.get(&keys) {
                Some(existing) => {
                    existing.fill(row)?;
                    Filled::Existing(existing)
                }
                None => {
                    let object = self.mapping.create();
                    object.fill(row)?;
                    Filled::Created(object, row.clone())
                }
            };
            seen.insert(keys, commit.push(entry));
        }
        debug!(table = self.mapping.table(), rows = rows.len(), objects = seen.len(), "filled result set");
        Ok(commit)
    }

    /// The view of `context`, created and initialized on first use.
    pub fn view(&self, context: &Arc<QueryContext>) -> Result<Arc<ContextView>> {
        if let Some(view) = self.routes.read().get(context.id()) {
            return Ok(view);
        }
        let _creating = self.creating.lock();
        if let Some(view) = self.routes.read().get(context.id()) {
            return Ok(view);
        }
        let view = ContextView::new(context, &self.errors);
        {
            let mut routes = self.routes.write();
            routes.prune();
            routes.insert(&view);
        }
        view.init(self.objects())?;
        if context.is_whole_table() && self.mapping.load_behavior() == LoadBehavior::EagerRetain {
            self.retained.lock().push(Arc::clone(&view));
        }
        debug!(table = self.mapping.table(), context = context.id(), "created view");
        Ok(view)
    }

    /// The existing view of a context.
    pub fn existing_view(&self, context_id: u64) -> Option<Arc<ContextView>> {
        self.routes.read().get(context_id)
    }

    pub fn views(&self) -> Vec<Arc<ContextView>> {
        self.routes.read().all()
    }

    pub(crate) fn suppress(&self, ids: &[ObjectId]) {
        self.suppressed.lock().extend(ids.iter().copied());
    }

    pub(crate) fn unsuppress(&self, ids: &[ObjectId]) {
        let mut suppressed = self.suppressed.lock();
        for id in ids {
            suppressed.remove(id);
        }
    }

    /// Sweep dead identity entries and dropped views.
    pub fn prune(&self) -> usize {
        let objects = self.entries.lock().prune();
        let views = self.routes.write().prune();
        objects + views
    }

    fn route(&self, object: &EntityRef, change: &Change) -> Result<()> {
        let views = self.routes.read().for_change(change);
        let mut first_error = None;
        for view in views {
            if let Err(e) = view.recheck(object) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // Placeholder keys give way to real ones once the row exists.
    fn rekey(&self, object: &EntityRef) {
        let keys = object.keys();
        let id = object_id(object);
        let mut entries = self.entries.lock();
        let Some(old) = entries.keys_by_id.get(&id).cloned() else {
            return;
        };
        if old == keys {
            return;
        }
        if let Some(other) = entries.live(&keys) {
            if object_id(&other) != id {
                warn!(table = self.mapping.table(), keys = %keys, "saved object replaces a tracked object with the same key");
            }
        }
        entries.by_key.remove(&old);
        entries.insert(keys.clone(), object);
        trace!(table = self.mapping.table(), from = %old, to = %keys, "re-keyed object");
    }

    fn forget(&self, object: &EntityRef) {
        let id = object_id(object);
        let mut entries = self.entries.lock();
        if let Some(keys) = entries.keys_by_id.remove(&id) {
            let owned = entries
                .by_key
                .get(&keys)
                .is_some_and(|w| w.as_ptr().cast::<()>() as usize == id);
            if owned {
                entries.by_key.remove(&keys);
            }
        }
    }
}

impl ChangeListener for WeakCache {
    fn object_changed(&self, object: &EntityRef, change: &Change) -> Result<()> {
        if let Change::State { from, to } = change {
            if *to == ObjectState::NotAttached {
                self.forget(object);
            } else if *from == ObjectState::Created {
                self.rekey(object);
            }
        }
        if self.suppressed.lock().contains(&object_id(object)) {
            return Ok(());
        }
        self.route(object, change)
    }
}

impl fmt::Debug for WeakCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCache")
            .field("table", &self.mapping.table())
            .field("entries", &self.len())
            .field("views", &self.routes.read().len())
            .finish()
    }
}
