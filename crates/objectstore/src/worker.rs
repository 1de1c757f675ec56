//! Per-table database worker.
//!
//! A [`DatabaseWorker`] owns one table's identity map and talks to the
//! table's worker queue. Fetches stage rows into the cache inside the
//! batch's result handler and apply them in the commit pass, so every
//! handler of a batch has consumed its result set before any view changes.

use std::fmt;
use std::sync::Arc;

use objectstore_cache::{ExecOutcome, WeakCache};
use objectstore_core::{
    Command, CommandKind, DatabaseProvider, EntityRef, Error, MappedObjectKeys, MappingRegistry,
    Result, ResultSet, TableMapping,
};
use objectstore_pool::{Handled, Pending, WorkerQueue};
use objectstore_query::{QueryContext, select_command};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

type Filled = Arc<Mutex<Vec<EntityRef>>>;

/// Handle of a fetch that has been queued but not necessarily executed.
pub struct FetchHandle {
    pending: Pending<Filled>,
}

impl FetchHandle {
    pub fn is_ready(&self) -> bool {
        self.pending.is_ready()
    }

    /// Block until the objects are in the cache and return them in row order.
    pub fn wait(self) -> Result<Vec<EntityRef>> {
        let filled = self.pending.wait()?;
        let objects = std::mem::take(&mut *filled.lock());
        Ok(objects)
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn single_set(results: Vec<ResultSet>) -> ResultSet {
    results.into_iter().next().unwrap_or_default()
}

/// Database access of one mapped table.
pub struct DatabaseWorker {
    mapping: Arc<TableMapping>,
    cache: Arc<WeakCache>,
    queue: Arc<WorkerQueue>,
    provider: Arc<dyn DatabaseProvider>,
    registry: Arc<MappingRegistry>,
}

impl DatabaseWorker {
    pub(crate) fn new(
        mapping: Arc<TableMapping>,
        cache: Arc<WeakCache>,
        queue: Arc<WorkerQueue>,
        provider: Arc<dyn DatabaseProvider>,
        registry: Arc<MappingRegistry>,
    ) -> Self {
        Self {
            mapping,
            cache,
            queue,
            provider,
            registry,
        }
    }

    pub fn mapping(&self) -> &Arc<TableMapping> {
        &self.mapping
    }

    pub fn cache(&self) -> &Arc<WeakCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<WorkerQueue> {
        &self.queue
    }

    /// Load the rows of `context` and wait for them.
    #[instrument(level = "debug", skip(self, context), fields(table = self.mapping.table(), context = context.id()))]
    pub fn fetch(&self, context: &Arc<QueryContext>) -> Result<Vec<EntityRef>> {
        self.fetch_async(context)?.wait()
    }

    /// Queue the load of `context` without waiting. Translation errors are
    /// returned here, before anything is queued.
    pub fn fetch_async(&self, context: &Arc<QueryContext>) -> Result<FetchHandle> {
        let command = select_command(self.provider.dialect(), &self.registry, context)?;
        Ok(self.enqueue_fill(command, Some(Arc::clone(context))))
    }

    fn enqueue_fill(&self, command: Command, context: Option<Arc<QueryContext>>) -> FetchHandle {
        let cache = Arc::clone(&self.cache);
        let pending = self.queue.enqueue(command, move |results| {
            let rows = single_set(results);
            let staged = cache.fill(&rows, context.as_ref())?;
            let filled: Filled = Arc::new(Mutex::new(Vec::new()));
            let slot = Arc::clone(&filled);
            Ok(Handled::with_commit(filled, move || {
                *slot.lock() = staged.commit()?;
                Ok(())
            }))
        });
        FetchHandle { pending }
    }

    /// The object with `keys`: the tracked instance when there is one,
    /// otherwise the row read from the database.
    pub fn get(&self, keys: &MappedObjectKeys) -> Result<Option<EntityRef>> {
        if let Some(object) = self.cache.get(keys) {
            return Ok(Some(object));
        }
        self.fetch_by_keys(keys)
    }

    /// Read one row by key, bypassing the cache lookup.
    pub fn fetch_by_keys(&self, keys: &MappedObjectKeys) -> Result<Option<EntityRef>> {
        let key_fields: Vec<_> = self.mapping.key_fields().collect();
        if keys.arity() != key_fields.len() {
            return Err(Error::mapping(
                self.mapping.table(),
                format!(
                    "expected {} key values, got {}",
                    key_fields.len(),
                    keys.arity()
                ),
            ));
        }
        let mut builder = self
            .provider
            .command_builder(&self.mapping, CommandKind::Select);
        for (field, value) in key_fields.iter().zip(keys.values()) {
            builder.key(&field.column, value.clone());
        }
        let command = builder.build()?;
        trace!(table = self.mapping.table(), keys = %keys, "reading by key");
        let objects = self.enqueue_fill(command, None).wait()?;
        Ok(objects.into_iter().next())
    }

    /// Run the insert, update or delete of one object and stage the row
    /// the database returned on it.
    pub fn execute(&self, object: &EntityRef, kind: CommandKind) -> Result<ExecOutcome> {
        let mut builder = self.provider.command_builder(&self.mapping, kind);
        object.fill_command(kind, &mut builder)?;
        let command = builder.build()?;
        debug!(table = self.mapping.table(), kind = ?kind, sql = %command, "queueing object command");

        let target = Arc::clone(object);
        self.queue
            .enqueue(command, move |results| {
                let set = single_set(results);
                let outcome = match (kind, set.first()) {
                    (CommandKind::Delete, _) => ExecOutcome::Done,
                    (_, Some(row)) => {
                        target.fill(row)?;
                        ExecOutcome::Refilled
                    }
                    (CommandKind::Update, None) if set.rows_affected == 0 => ExecOutcome::NoRow,
                    (_, None) => ExecOutcome::Done,
                };
                Ok(Handled::value(outcome))
            })
            .wait()
    }
}

impl fmt::Debug for DatabaseWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseWorker")
            .field("table", &self.mapping.table())
            .field("cache", &self.cache)
            .field("queue", &self.queue)
            .finish()
    }
}
