//! Materialized, self-updating views of one query context.
//!
//! A view keeps two lists: live members (match the predicate, not deleted),
//! kept sorted by the context's order items, and deleted members (match the
//! predicate, marked for delete). Every routed change notification calls
//! [`ContextView::recheck`], which moves the object between the lists and
//! raises [`CollectionChange`] events for observers.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use objectstore_core::{EntityRef, ObjectId, ObjectState, Result, object_id};
use objectstore_query::QueryContext;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

/// Membership change of a view's live list.
#[derive(Debug, Clone)]
pub enum CollectionChange {
    Added { index: usize, object: EntityRef },
    Removed { index: usize, object: EntityRef },
    /// The list changed wholesale; re-read it.
    Reset,
}

/// Observer of a view's live list.
pub type CollectionObserver = Arc<dyn Fn(&CollectionChange) -> Result<()> + Send + Sync>;

/// Predicate failures seen by one cache: the first is logged and counts as
/// "no match", later ones are returned.
#[derive(Debug, Default)]
pub struct PredicateErrors {
    logged: AtomicBool,
}

impl PredicateErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, context: &QueryContext, object: &EntityRef) -> Result<bool> {
        match context.matches(object) {
            Ok(matches) => Ok(matches),
            Err(e) if !self.logged.swap(true, Ordering::AcqRel) => {
                error!(
                    context = context.id(),
                    query = %context.query(),
                    error = %e,
                    "predicate evaluation failed; treating object as not matching"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Default)]
struct Members {
    live: Vec<EntityRef>,
    deleted: Vec<EntityRef>,
    ids: HashSet<ObjectId>,
    /// Expected position of the next ordered insert
    next_index: usize,
}

enum Slot {
    Live,
    Deleted,
    Absent,
}

fn position(list: &[EntityRef], id: ObjectId) -> Option<usize> {
    list.iter().position(|o| object_id(o) == id)
}

/// The materialized collection of one [`QueryContext`].
pub struct ContextView {
    context: Arc<QueryContext>,
    errors: Arc<PredicateErrors>,
    members: Mutex<Members>,
    observers: Mutex<Vec<(u64, CollectionObserver)>>,
    next_observer: AtomicU64,
}

impl ContextView {
    pub fn new(context: &Arc<QueryContext>, errors: &Arc<PredicateErrors>) -> Arc<Self> {
        Arc::new(Self {
            context: Arc::clone(context),
            errors: Arc::clone(errors),
            members: Mutex::new(Members::default()),
            observers: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
        })
    }

    pub fn context(&self) -> &Arc<QueryContext> {
        &self.context
    }

    /// Rebuild both lists from `objects`, sorting live members fully.
    pub fn init(&self, objects: impl IntoIterator<Item = EntityRef>) -> Result<()> {
        let mut live = Vec::new();
        let mut deleted = Vec::new();
        for object in objects {
            match object.state() {
                ObjectState::NotAttached => continue,
                state => {
                    if !self.errors.evaluate(&self.context, &object)? {
                        continue;
                    }
                    if state == ObjectState::Deleted {
                        deleted.push(object);
                    } else {
                        live.push(object);
                    }
                }
            }
        }
        if !self.context.order().is_empty() {
            live.sort_by(|a, b| self.context.compare(a, b));
        }
        {
            let mut members = self.members.lock();
            members.ids = live.iter().chain(&deleted).map(object_id).collect();
            members.next_index = live.len();
            members.live = live;
            members.deleted = deleted;
        }
        debug!(context = self.context.id(), len = self.len(), "view initialized");
        self.dispatch(vec![CollectionChange::Reset]);
        Ok(())
    }

    /// Re-evaluate one object's membership and position.
    pub fn recheck(&self, object: &EntityRef) -> Result<()> {
        let id = object_id(object);
        let (state, events) = loop {
            let state = object.state();
            let target = match state {
                ObjectState::NotAttached => Slot::Absent,
                _ if !self.errors.evaluate(&self.context, object)? => Slot::Absent,
                ObjectState::Deleted => Slot::Deleted,
                _ => Slot::Live,
            };

            let mut m = self.members.lock();
            // Another thread moved the object on while the predicate ran.
            if object.state() != state {
                continue;
            }
            let mut events = Vec::new();
            let tracked = m.ids.contains(&id);
            let live_at = if tracked { position(&m.live, id) } else { None };
            let deleted_at = if tracked { position(&m.deleted, id) } else { None };
            match target {
                Slot::Live => {
                    if let Some(i) = deleted_at {
                        m.deleted.remove(i);
                    }
                    match live_at {
                        Some(i) if self.in_order(&m.live, i) => {}
                        Some(i) => {
                            let removed = m.live.remove(i);
                            events.push(CollectionChange::Removed {
                                index: i,
                                object: removed,
                            });
                            let at = self.insert(&mut m, object);
                            events.push(CollectionChange::Added {
                                index: at,
                                object: Arc::clone(object),
                            });
                        }
                        None => {
                            let at = self.insert(&mut m, object);
                            events.push(CollectionChange::Added {
                                index: at,
                                object: Arc::clone(object),
                            });
                        }
                    }
                    m.ids.insert(id);
                }
                Slot::Deleted => {
                    if let Some(i) = live_at {
                        let removed = m.live.remove(i);
                        events.push(CollectionChange::Removed {
                            index: i,
                            object: removed,
                        });
                    }
                    if deleted_at.is_none() {
                        m.deleted.push(Arc::clone(object));
                    }
                    m.ids.insert(id);
                }
                Slot::Absent => {
                    if let Some(i) = live_at {
                        let removed = m.live.remove(i);
                        events.push(CollectionChange::Removed {
                            index: i,
                            object: removed,
                        });
                    }
                    if let Some(i) = deleted_at {
                        m.deleted.remove(i);
                    }
                    m.ids.remove(&id);
                }
            }
            break (state, events);
        };
        if !events.is_empty() {
            trace!(context = self.context.id(), ?state, events = events.len(), "view membership changed");
        }
        self.dispatch(events);
        Ok(())
    }

    fn in_order(&self, live: &[EntityRef], i: usize) -> bool {
        if self.context.order().is_empty() {
            return true;
        }
        let after_prev = i == 0 || self.context.compare(&live[i - 1], &live[i]).is_le();
        let before_next = i + 1 >= live.len() || self.context.compare(&live[i], &live[i + 1]).is_le();
        after_prev && before_next
    }

    /// Insert after every member that does not sort after `object`. The
    /// expected next index is tried before a binary search.
    fn insert(&self, m: &mut Members, object: &EntityRef) -> usize {
        let len = m.live.len();
        let at = if self.context.order().is_empty() {
            len
        } else {
            let hint = m.next_index.min(len);
            let fits_before = hint == 0 || !self.context.compare(&m.live[hint - 1], object).is_gt();
            let fits_after = hint == len || self.context.compare(&m.live[hint], object).is_gt();
            if fits_before && fits_after {
                hint
            } else {
                m.live
                    .partition_point(|member| !self.context.compare(member, object).is_gt())
            }
        };
        m.live.insert(at, Arc::clone(object));
        m.next_index = at + 1;
        at
    }

    /// Live members in order.
    pub fn items(&self) -> Vec<EntityRef> {
        self.members.lock().live.clone()
    }

    /// Members marked for delete.
    pub fn deleted(&self) -> Vec<EntityRef> {
        self.members.lock().deleted.clone()
    }

    /// Live and deleted members.
    pub fn members(&self) -> Vec<EntityRef> {
        let m = self.members.lock();
        m.live.iter().chain(&m.deleted).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is `object` a live member?
    pub fn contains(&self, object: &EntityRef) -> bool {
        let id = object_id(object);
        let m = self.members.lock();
        m.ids.contains(&id) && position(&m.live, id).is_some()
    }

    /// Register an observer; returns its id for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe<F>(&self, observer: F) -> u64
    where
        F: Fn(&CollectionChange) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(i, _)| *i != id);
        observers.len() != before
    }

    // A failing observer turns the rest of the batch into one Reset.
    fn dispatch(&self, events: Vec<CollectionChange>) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<CollectionObserver> =
            self.observers.lock().iter().map(|(_, o)| Arc::clone(o)).collect();
        for event in &events {
            for observer in &observers {
                if let Err(e) = observer(event) {
                    warn!(
                        context = self.context.id(),
                        error = %e,
                        "collection observer failed; broadcasting reset"
                    );
                    for fallback in &observers {
                        let _ = fallback(&CollectionChange::Reset);
                    }
                    return;
                }
            }
        }
    }
}

impl Drop for ContextView {
    fn drop(&mut self) {
        // A context only counts as loaded while its view pins the members.
        self.context.clear_loaded();
    }
}

impl fmt::Debug for ContextView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.members.lock();
        f.debug_struct("ContextView")
            .field("context", &self.context.id())
            .field("live", &m.live.len())
            .field("deleted", &m.deleted.len())
            .finish()
    }
}
