//! Deferred application of a scanned result set.
//!
//! [`WeakCache::fill`](crate::WeakCache::fill) only stages row values.
//! [`FillCommit::commit`] then applies everything in phases: new objects are
//! wired into the identity map, staged values are committed with
//! notifications suppressed, the filled objects are routed into the
//! originating view and rechecked against every other view, and a whole-table
//! reload detaches tracked objects the database no longer returned.
//! Dropping an uncommitted `FillCommit` discards the staged values.

use std::collections::HashSet;
use std::sync::Arc;

use objectstore_core::{EntityRef, ObjectId, ObjectState, Result, Row, object_id};
use objectstore_query::QueryContext;
use tracing::{debug, instrument};

use crate::identity_map::WeakCache;

pub(crate) enum Filled {
    Existing(EntityRef),
    Created(EntityRef, Row),
}

impl Filled {
    fn object(&self) -> &EntityRef {
        match self {
            Filled::Existing(object) | Filled::Created(object, _) => object,
        }
    }
}

/// Staged result of one fill, applied by [`commit`](Self::commit).
pub struct FillCommit {
    cache: Arc<WeakCache>,
    context: Option<Arc<QueryContext>>,
    entries: Vec<Filled>,
}

impl FillCommit {
    pub(crate) fn new(cache: &Arc<WeakCache>, context: Option<&Arc<QueryContext>>) -> Self {
        Self {
            cache: Arc::clone(cache),
            context: context.cloned(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: Filled) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub(crate) fn entry(&self, index: usize) -> &EntityRef {
        self.entries[index].object()
    }

    /// Number of distinct objects filled.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply the fill. Returns the filled objects in row order.
    #[instrument(level = "debug", skip(self), fields(table = self.cache.mapping().table()))]
    pub fn commit(mut self) -> Result<Vec<EntityRef>> {
        let entries = std::mem::take(&mut self.entries);
        let cache = Arc::clone(&self.cache);
        let context = self.context.take();

        let mut objects = Vec::with_capacity(entries.len());
        let mut failure = None;
        for entry in entries {
            if failure.is_some() {
                entry.object().rollback();
                continue;
            }
            match entry {
                Filled::Existing(object) => objects.push(object),
                Filled::Created(object, row) => match cache.attach_filled(Arc::clone(&object), &row) {
                    Ok(wired) => objects.push(wired),
                    Err(e) => {
                        object.rollback();
                        failure = Some(e);
                    }
                },
            }
        }
        if let Some(e) = failure {
            for object in &objects {
                object.rollback();
            }
            return Err(e);
        }

        let ids: Vec<ObjectId> = objects.iter().map(object_id).collect();
        cache.suppress(&ids);
        let committed = objects.iter().try_for_each(|object| object.commit(false));
        cache.unsuppress(&ids);
        if let Err(e) = committed {
            for object in &objects {
                object.rollback();
            }
            return Err(e);
        }

        let mut first_error = None;
        let origin = context.as_ref().and_then(|c| cache.existing_view(c.id()));
        if let Some(view) = &origin {
            for object in &objects {
                if let Err(e) = view.recheck(object) {
                    first_error.get_or_insert(e);
                }
            }
        }
        for view in cache.views() {
            if origin.as_ref().is_some_and(|o| Arc::ptr_eq(o, &view)) {
                continue;
            }
            for object in &objects {
                if let Err(e) = view.recheck(object) {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(context) = &context {
            if context.is_whole_table() {
                let seen: HashSet<ObjectId> = ids.iter().copied().collect();
                let mut detached = 0;
                for object in cache.objects() {
                    if seen.contains(&object_id(&object)) {
                        continue;
                    }
                    if matches!(object.state(), ObjectState::Created | ObjectState::NotAttached) {
                        continue;
                    }
                    if let Err(e) = object.deattach() {
                        first_error.get_or_insert(e);
                    }
                    detached += 1;
                }
                if detached > 0 {
                    debug!(detached, "full reload detached vanished rows");
                }
            }
            if origin.is_some() {
                context.mark_loaded();
            }
        }

        first_error.map_or(Ok(objects), Err)
    }
}

impl Drop for FillCommit {
    fn drop(&mut self) {
        for entry in &self.entries {
            entry.object().rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{NoResolver, users};
    use objectstore_core::{Change, ChangeListener, Error, ResultSet, Value};
    use objectstore_query::{ContextRegistry, Expr, QueryExpr};

    fn rows(data: &[(i64, &str, i64)]) -> ResultSet {
        ResultSet::from_rows(
            vec!["id".into(), "name".into(), "age".into()],
            data.iter()
                .map(|(id, name, age)| vec![Value::BigInt(*id), Value::from(*name), Value::BigInt(*age)])
                .collect(),
        )
    }

    #[test]
    fn fills_are_invisible_until_commit() {
        let resolver = NoResolver::shared();
        let cache = WeakCache::new(&users(), NoResolver::weak(&resolver), 16);
        let first = cache.fill(&rows(&[(1, "ann", 30)]), None).unwrap().commit().unwrap();
        assert_eq!(first[0].get("name").unwrap(), Value::from("ann"));

        let staged = cache.fill(&rows(&[(1, "anna", 31)]), None).unwrap();
        assert_eq!(first[0].get("name").unwrap(), Value::from("ann"));
        drop(staged);
        assert_eq!(first[0].get("name").unwrap(), Value::from("ann"));

        let again = cache.fill(&rows(&[(1, "anna", 31)]), None).unwrap().commit().unwrap();
        assert!(Arc::ptr_eq(&first[0], &again[0]));
        assert_eq!(first[0].get("name").unwrap(), Value::from("anna"));
        assert_eq!(first[0].state(), ObjectState::Original);
    }

    #[test]
    fn whole_table_reload_detaches_missing_rows() {
        let resolver = NoResolver::shared();
        let mapping = users();
        let cache = WeakCache::new(&mapping, NoResolver::weak(&resolver), 16);
        let contexts = ContextRegistry::new();
        let all = contexts.analyse(&QueryExpr::table(&mapping)).unwrap();
        let adults = contexts
            .analyse(&QueryExpr::table(&mapping).filter(Expr::field("age").ge(18)))
            .unwrap();
        let all_view = cache.view(&all).unwrap();
        let adult_view = cache.view(&adults).unwrap();

        let loaded = cache
            .fill(&rows(&[(1, "ann", 30), (2, "bob", 12), (3, "cy", 40)]), Some(&all))
            .unwrap()
            .commit()
            .unwrap();
        assert!(all.is_loaded());
        assert_eq!(all_view.len(), 3);
        assert_eq!(adult_view.len(), 2);

        cache
            .fill(&rows(&[(1, "ann", 30), (2, "bob", 12)]), Some(&all))
            .unwrap()
            .commit()
            .unwrap();
        assert_eq!(loaded[2].state(), ObjectState::NotAttached);
        assert_eq!(all_view.len(), 2);
        assert_eq!(adult_view.len(), 1);
        assert!(cache.get(&loaded[2].keys()).is_none());
    }

    struct FailOnDetach;

    impl ChangeListener for FailOnDetach {
        fn object_changed(&self, _object: &EntityRef, change: &Change) -> Result<()> {
            match change {
                Change::State {
                    to: ObjectState::NotAttached,
                    ..
                } => Err(Error::Custom("listener refused".into())),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn a_failing_detach_does_not_stop_the_others() {
        let resolver = NoResolver::shared();
        let mapping = users();
        let cache = WeakCache::new(&mapping, NoResolver::weak(&resolver), 16);
        let contexts = ContextRegistry::new();
        let all = contexts.analyse(&QueryExpr::table(&mapping)).unwrap();
        let all_view = cache.view(&all).unwrap();
        let loaded = cache
            .fill(&rows(&[(1, "ann", 30), (2, "bob", 12), (3, "cy", 40)]), Some(&all))
            .unwrap()
            .commit()
            .unwrap();

        let listener: Arc<dyn ChangeListener> = Arc::new(FailOnDetach);
        loaded[1].subscribe(Arc::downgrade(&listener));
        loaded[2].subscribe(Arc::downgrade(&listener));
        all.clear_loaded();

        let err = cache
            .fill(&rows(&[(1, "ann", 30)]), Some(&all))
            .unwrap()
            .commit()
            .unwrap_err();
        assert!(matches!(err, Error::Custom(_)));
        assert_eq!(loaded[1].state(), ObjectState::NotAttached);
        assert_eq!(loaded[2].state(), ObjectState::NotAttached);
        assert_eq!(all_view.len(), 1);
        assert!(all.is_loaded());
    }
}
