//! The object store: explicitly owned registry of every per-table structure.
//!
//! An [`ObjectStore`] holds the mapping registry, the analyzed-context
//! cache, one [`DatabaseWorker`] (and with it one identity map) per
//! registered table, the connection pool and the queue registry. Several
//! stores can live side by side in one process; nothing is global.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use objectstore_cache::{CommandExecutor, ExecOutcome, SaveBatch, UnitOfWork, WeakCache};
use objectstore_core::{
    ChildRelation, CommandKind, DatabaseProvider, EntityRef, Error, ForeignResolver,
    LoadBehavior, MappedObjectKeys, MappingRegistry, Result, TableMapping,
};
use objectstore_pool::{ConnectionPool, QueueRegistry};
use objectstore_query::{ContextRegistry, Expr, QueryExpr};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, trace};

use crate::config::StoreConfig;
use crate::query::Query;
use crate::worker::DatabaseWorker;

pub(crate) struct StoreInner {
    this: Weak<StoreInner>,
    config: StoreConfig,
    provider: Arc<dyn DatabaseProvider>,
    mappings: Arc<MappingRegistry>,
    pub(crate) contexts: ContextRegistry,
    workers: RwLock<HashMap<String, Arc<DatabaseWorker>>>,
    pool: Arc<ConnectionPool>,
    queues: QueueRegistry,
}

/// Entry point: register mappings, then query, create and save objects.
///
/// Cloning is cheap; clones share every table.
#[derive(Clone)]
pub struct ObjectStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl ObjectStore {
    pub fn new(provider: Arc<dyn DatabaseProvider>, config: StoreConfig) -> Self {
        let pool = ConnectionPool::new(Arc::clone(&provider), config.pool.clone());
        let queues = QueueRegistry::new(&pool);
        info!(provider = provider.name(), "object store created");
        Self {
            inner: Arc::new_cyclic(|this| StoreInner {
                this: this.clone(),
                config,
                provider,
                mappings: Arc::new(MappingRegistry::new()),
                contexts: ContextRegistry::new(),
                workers: RwLock::new(HashMap::new()),
                pool,
                queues,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn provider(&self) -> &Arc<dyn DatabaseProvider> {
        &self.inner.provider
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub fn mappings(&self) -> &Arc<MappingRegistry> {
        &self.inner.mappings
    }

    /// Register a table. Its identity map and worker exist from now on; an
    /// `EagerRetain` table also gets its whole-table view, kept for the
    /// store's lifetime.
    pub fn register(&self, mapping: Arc<TableMapping>) -> Result<()> {
        let inner = &self.inner;
        inner.mappings.register(Arc::clone(&mapping))?;

        let resolver: Weak<dyn ForeignResolver> = inner.this.clone();
        let cache = WeakCache::new(&mapping, resolver, inner.config.prune_threshold);
        let queue = inner.queues.queue(&inner.config.connection_string);
        let worker = Arc::new(DatabaseWorker::new(
            Arc::clone(&mapping),
            Arc::clone(&cache),
            queue,
            Arc::clone(&inner.provider),
            Arc::clone(&inner.mappings),
        ));
        inner
            .workers
            .write()
            .insert(mapping.table().to_string(), worker);

        if mapping.load_behavior() == LoadBehavior::EagerRetain {
            let context = inner.contexts.analyse(&QueryExpr::table(&mapping))?;
            cache.view(&context)?;
        }
        debug!(table = mapping.table(), "table registered");
        Ok(())
    }

    pub fn mapping(&self, table: &str) -> Result<Arc<TableMapping>> {
        self.inner.mappings.get(table)
    }

    pub fn worker(&self, table: &str) -> Result<Arc<DatabaseWorker>> {
        self.inner.worker(table)
    }

    /// Every row of `table`.
    pub fn query(&self, table: &str) -> Result<Query> {
        let mapping = self.mapping(table)?;
        self.query_expr(QueryExpr::table(&mapping))
    }

    /// A query over an explicit operator chain.
    pub fn query_expr(&self, expr: QueryExpr) -> Result<Query> {
        Query::new(self.clone(), expr)
    }

    /// A blank tracked object of `table` in the `Created` state.
    pub fn create(&self, table: &str) -> Result<EntityRef> {
        let worker = self.worker(table)?;
        let object = worker.mapping().create();
        worker.cache().add_new(&object)?;
        Ok(object)
    }

    /// Start tracking a new object built outside the store.
    pub fn add(&self, object: &EntityRef) -> Result<()> {
        self.worker(object.mapping().table())?
            .cache()
            .add_new(object)
    }

    /// The object of `table` with `keys`, from the cache or the database.
    pub fn get(&self, table: &str, keys: &MappedObjectKeys) -> Result<Option<EntityRef>> {
        self.worker(table)?.get(keys)
    }

    /// Save `objects` as one batch.
    #[instrument(level = "debug", skip_all, fields(objects = objects.len()))]
    pub fn save(&self, objects: &[EntityRef]) -> Result<()> {
        let mut batch = SaveBatch::new(self.inner.as_ref());
        batch.save_all(objects)?;
        batch.commit()
    }

    /// Save `objects` and leave their completion to `unit`.
    pub fn save_in(&self, objects: &[EntityRef], unit: &mut UnitOfWork) -> Result<()> {
        let mut batch = SaveBatch::new(self.inner.as_ref());
        batch.save_all(objects)?;
        batch.defer(unit);
        Ok(())
    }

    /// Sweep dead identity entries, dropped views and released contexts.
    pub fn prune(&self) -> usize {
        let workers: Vec<_> = self.inner.workers.read().values().cloned().collect();
        let cached: usize = workers.iter().map(|w| w.cache().prune()).sum();
        let contexts = self.inner.contexts.prune();
        trace!(cached, contexts, "pruned store");
        cached + contexts
    }

    /// Close every pooled connection and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

impl StoreInner {
    fn worker(&self, table: &str) -> Result<Arc<DatabaseWorker>> {
        self.workers
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::mapping(table, "table is not registered"))
    }
}

impl ForeignResolver for StoreInner {
    fn resolve(&self, table: &str, keys: &MappedObjectKeys) -> Result<Option<EntityRef>> {
        self.worker(table)?.get(keys)
    }

    fn children(&self, parent: &EntityRef, relation: &ChildRelation) -> Result<Vec<EntityRef>> {
        // Children of an unsaved parent cannot reference it yet.
        if parent.keys().is_placeholder() {
            return Ok(Vec::new());
        }
        let worker = self.worker(&relation.child_table)?;
        let mapping = worker.mapping();
        let foreign = mapping.foreign(&relation.navigation).ok_or_else(|| {
            Error::mapping(
                mapping.table(),
                format!("no foreign relation '{}'", relation.navigation),
            )
        })?;

        let mut predicate: Option<Expr> = None;
        for (local, target) in &foreign.columns {
            let condition = Expr::field(local).eq(Expr::lit(parent.get(target)?));
            predicate = Some(match predicate {
                Some(p) => p.and(condition),
                None => condition,
            });
        }
        let mut query = QueryExpr::table(mapping);
        if let Some(p) = predicate {
            query = query.filter(p);
        }

        let context = self.contexts.analyse(&query)?;
        let view = worker.cache().view(&context)?;
        if context.should_load() {
            worker.fetch(&context)?;
        }
        trace!(relation = %relation.name, parent = ?parent, children = view.len(), "resolved children");
        Ok(view.items())
    }
}

impl CommandExecutor for StoreInner {
    fn execute(&self, object: &EntityRef, kind: CommandKind) -> Result<ExecOutcome> {
        self.worker(object.mapping().table())?.execute(object, kind)
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tables: Vec<String> = self.inner.workers.read().keys().cloned().collect();
        tables.sort();
        f.debug_struct("ObjectStore")
            .field("provider", &self.inner.provider.name())
            .field("tables", &tables)
            .field("contexts", &self.inner.contexts.len())
            .field("pool", &self.inner.pool.stats())
            .finish()
    }
}
