//! The queryable surface over one table.
//!
//! A [`Query`] is an operator chain bound to its analyzed context and the
//! context's materialized view. The handle keeps both alive; the cache
//! holds them weakly, so dropping every handle of a chain releases its view.
//!
//! Terminal operators read the view first and go to the database only
//! when the context still needs loading.

use std::fmt;
use std::sync::Arc;

use objectstore_cache::{CollectionChange, ContextView, SaveBatch, UnitOfWork};
use objectstore_core::{EntityRef, Result, Value, object_id};
use objectstore_query::{Expr, QueryContext, QueryExpr, compile_selector};
use tracing::{debug, instrument};

use crate::store::ObjectStore;
use crate::worker::{DatabaseWorker, FetchHandle};

/// A query chain over one mapped table.
pub struct Query {
    store: ObjectStore,
    worker: Arc<DatabaseWorker>,
    expr: QueryExpr,
    view: Arc<ContextView>,
}

impl Query {
    pub(crate) fn new(store: ObjectStore, expr: QueryExpr) -> Result<Self> {
        let worker = store.worker(expr.mapping().table())?;
        let context = store.inner.contexts.analyse(&expr)?;
        let view = worker.cache().view(&context)?;
        Ok(Self {
            store,
            worker,
            expr,
            view,
        })
    }

    fn chain(&self, expr: QueryExpr) -> Result<Query> {
        Query::new(self.store.clone(), expr)
    }

    pub fn filter(&self, predicate: Expr) -> Result<Query> {
        self.chain(self.expr.clone().filter(predicate))
    }

    pub fn order_by(&self, key: Expr) -> Result<Query> {
        self.chain(self.expr.clone().order_by(key))
    }

    pub fn order_by_desc(&self, key: Expr) -> Result<Query> {
        self.chain(self.expr.clone().order_by_desc(key))
    }

    pub fn then_by(&self, key: Expr) -> Result<Query> {
        self.chain(self.expr.clone().then_by(key))
    }

    pub fn then_by_desc(&self, key: Expr) -> Result<Query> {
        self.chain(self.expr.clone().then_by_desc(key))
    }

    pub fn take(&self, count: usize) -> Result<Query> {
        self.chain(self.expr.clone().take(count))
    }

    /// Always read from the database.
    pub fn force_load(&self) -> Result<Query> {
        self.chain(self.expr.clone().force_load())
    }

    /// Never read from the database; the cache is authoritative.
    pub fn force_cache(&self) -> Result<Query> {
        self.chain(self.expr.clone().force_cache())
    }

    pub fn expr(&self) -> &QueryExpr {
        &self.expr
    }

    pub fn context(&self) -> &Arc<QueryContext> {
        self.view.context()
    }

    pub fn view(&self) -> &Arc<ContextView> {
        &self.view
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Read from the database when the context calls for it.
    pub fn load(&self) -> Result<()> {
        if self.context().should_load() {
            self.worker.fetch(self.context())?;
        }
        Ok(())
    }

    /// Warm the cache without waiting.
    pub fn fetch_async(&self) -> Result<FetchHandle> {
        self.worker.fetch_async(self.context())
    }

    /// The matching live objects in order, limited by `take`.
    pub fn items(&self) -> Result<Vec<EntityRef>> {
        self.load()?;
        Ok(self.limited(self.view.items()))
    }

    fn limited(&self, mut items: Vec<EntityRef>) -> Vec<EntityRef> {
        if let Some(top) = self.context().top() {
            items.truncate(top);
        }
        items
    }

    pub fn contains(&self, object: &EntityRef) -> Result<bool> {
        let present = |items: &[EntityRef]| {
            let id = object_id(object);
            items.iter().any(|o| object_id(o) == id)
        };
        if self.context().top().is_some() {
            return Ok(present(&self.items()?));
        }
        if !self.context().is_force_load() && self.view.contains(object) {
            return Ok(true);
        }
        self.load()?;
        Ok(self.view.contains(object))
    }

    pub fn any(&self) -> Result<bool> {
        if self.context().top() == Some(0) {
            return Ok(false);
        }
        if !self.context().is_force_load() && !self.view.is_empty() {
            return Ok(true);
        }
        self.load()?;
        Ok(!self.view.is_empty())
    }

    pub fn count(&self) -> Result<usize> {
        self.load()?;
        let count = self.view.len();
        Ok(self.context().top().map_or(count, |top| count.min(top)))
    }

    /// The first object. An unordered query answers from the cache when it
    /// has any member, unless it forces a load; an ordered one loads first
    /// so the minimum is known.
    pub fn first_or_default(&self) -> Result<Option<EntityRef>> {
        if self.context().top() == Some(0) {
            return Ok(None);
        }
        if self.context().order().is_empty() && !self.context().is_force_load() {
            if let Some(first) = self.view.items().into_iter().next() {
                return Ok(Some(first));
            }
        }
        self.load()?;
        Ok(self.view.items().into_iter().next())
    }

    /// Project every item in memory.
    pub fn select<T, F>(&self, projection: F) -> Result<Vec<T>>
    where
        F: Fn(&EntityRef) -> Result<T>,
    {
        self.items()?.iter().map(projection).collect()
    }

    /// Project every item through a value expression.
    pub fn select_expr(&self, expr: &Expr) -> Result<Vec<Value>> {
        let selector = compile_selector(expr)?;
        self.select(|object| selector(object))
    }

    /// Persist every pending change of the view's members, deleted ones
    /// included, as one batch.
    #[instrument(level = "debug", skip(self), fields(query = %self.expr))]
    pub fn save(&self) -> Result<()> {
        let members = self.view.members();
        let mut batch = SaveBatch::new(self.store.inner.as_ref());
        batch.save_all(&members)?;
        debug!(executed = batch.len(), "query saved");
        batch.commit()
    }

    /// Like [`save`](Self::save), completed by `unit`.
    pub fn save_in(&self, unit: &mut UnitOfWork) -> Result<()> {
        let members = self.view.members();
        let mut batch = SaveBatch::new(self.store.inner.as_ref());
        batch.save_all(&members)?;
        batch.defer(unit);
        Ok(())
    }

    /// Mark every current item for deletion. Returns how many were marked.
    pub fn delete(&self) -> Result<usize> {
        let items = self.items()?;
        for object in &items {
            object.delete()?;
        }
        Ok(items.len())
    }

    /// Revert unsaved edits of the view's members and their children.
    pub fn drop_changes(&self) -> Result<()> {
        for object in self.view.members() {
            object.drop_changes()?;
            object.drop_changes_child_objects()?;
        }
        Ok(())
    }

    /// A new tracked object of this query's table.
    pub fn create(&self) -> Result<EntityRef> {
        self.store.create(self.expr.mapping().table())
    }

    /// Observe insertions into and removals from the live list.
    pub fn subscribe<F>(&self, observer: F) -> u64
    where
        F: Fn(&CollectionChange) -> Result<()> + Send + Sync + 'static,
    {
        self.view.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.view.unsubscribe(id)
    }
}

impl Clone for Query {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            worker: Arc::clone(&self.worker),
            expr: self.expr.clone(),
            view: Arc::clone(&self.view),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("query", &self.expr.to_string())
            .field("context", &self.context().id())
            .field("members", &self.view.len())
            .finish()
    }
}
