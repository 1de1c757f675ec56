//! Batching worker queue.
//!
//! One [`WorkerQueue`] exists per (provider, connection string). Enqueued
//! items collect in a pending list; a background worker swaps the whole list
//! out, combines the commands into one multi-statement command, executes it
//! once and hands each item its own result sets in submission order. After
//! every handler of the batch ran, a second pass runs the items' commit hooks
//! and resolves their [`Pending`] handles.
//!
//! The worker holds one pooled connection while it drains and exits once the
//! list is empty; the next enqueue starts a new worker.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use objectstore_core::error::QueryError;
use objectstore_core::{
    Command, DataReader, Error, PoolErrorKind, QueryErrorKind, Result, ResultSet,
};
use parking_lot::Mutex;
use tracing::{debug, error, instrument, trace, warn};

use crate::pending::{Completer, Pending, pending};
use crate::pool::{ConnectionPool, PooledConnection};

type CommitHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// What a result handler produced: the caller's value plus an optional hook
/// run in the batch's commit pass.
pub struct Handled<T> {
    value: T,
    commit: Option<CommitHook>,
}

impl<T> Handled<T> {
    pub fn value(value: T) -> Self {
        Self {
            value,
            commit: None,
        }
    }

    pub fn with_commit<F>(value: T, commit: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            value,
            commit: Some(Box::new(commit)),
        }
    }
}

trait Job: Send {
    fn command(&self) -> &Command;
    /// First pass: consume this item's result sets.
    fn handle(&mut self, results: Vec<ResultSet>);
    /// Second pass: run the commit hook and resolve the handle.
    fn finish(self: Box<Self>);
    fn fail(self: Box<Self>, error: &Arc<Error>);
}

struct TypedJob<T, H> {
    command: Command,
    handler: Option<H>,
    outcome: Option<Result<Handled<T>>>,
    completer: Completer<T>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn panicked(what: &str, payload: &(dyn Any + Send)) -> Error {
    Error::pool(
        PoolErrorKind::HandlerPanicked,
        format!("{} panicked: {}", what, panic_message(payload)),
    )
}

impl<T, H> Job for TypedJob<T, H>
where
    T: Send + 'static,
    H: FnOnce(Vec<ResultSet>) -> Result<Handled<T>> + Send + 'static,
{
    fn command(&self) -> &Command {
        &self.command
    }

    fn handle(&mut self, results: Vec<ResultSet>) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| handler(results)))
            .unwrap_or_else(|payload| Err(panicked("result handler", payload.as_ref())));
        self.outcome = Some(outcome);
    }

    fn finish(self: Box<Self>) {
        let TypedJob {
            outcome, completer, ..
        } = *self;
        let result = match outcome {
            Some(Ok(Handled { value, commit })) => {
                let committed = match commit {
                    Some(hook) => catch_unwind(AssertUnwindSafe(hook))
                        .unwrap_or_else(|payload| Err(panicked("commit hook", payload.as_ref()))),
                    None => Ok(()),
                };
                committed.map(|()| value)
            }
            Some(Err(e)) => Err(e),
            None => Err(Error::pool(
                PoolErrorKind::Abandoned,
                "batch finished before the item was handled",
            )),
        };
        completer.complete(result);
    }

    fn fail(self: Box<Self>, error: &Arc<Error>) {
        self.completer.complete(Err(Error::Shared(Arc::clone(error))));
    }
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Box<dyn Job>>,
    running: bool,
    worker: Option<ThreadId>,
}

struct QueueInner {
    pool: Arc<ConnectionPool>,
    connection_string: String,
    state: Mutex<QueueState>,
    batches: AtomicU64,
}

/// Command queue of one (provider, connection string) pair.
pub struct WorkerQueue {
    inner: Arc<QueueInner>,
}

impl WorkerQueue {
    pub fn new(pool: &Arc<ConnectionPool>, connection_string: &str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pool: Arc::clone(pool),
                connection_string: connection_string.to_string(),
                state: Mutex::new(QueueState::default()),
                batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn connection_string(&self) -> &str {
        &self.inner.connection_string
    }

    /// Number of physical executions so far.
    pub fn batches(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    /// Queue `command`. `handler` receives exactly the result sets of this
    /// command's statements, runs on the worker thread, and must not wait on
    /// this queue.
    pub fn enqueue<T, H>(&self, command: Command, handler: H) -> Pending<T>
    where
        T: Send + 'static,
        H: FnOnce(Vec<ResultSet>) -> Result<Handled<T>> + Send + 'static,
    {
        let (completer, handle) = pending();
        let job: Box<dyn Job> = Box::new(TypedJob {
            command,
            handler: Some(handler),
            outcome: None,
            completer,
        });

        let start = {
            let mut state = self.inner.state.lock();
            if state.worker == Some(thread::current().id()) {
                drop(state);
                // Commit hooks of the running batch may query again; those
                // run inline on the worker's connection.
                trace!(connection_string = %self.inner.connection_string, "running nested command inline");
                self.inner.run_inline(job);
                return handle;
            }
            state.pending.push(job);
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            self.start_worker();
        }
        handle
    }

    /// Queue a command and collect its result sets.
    pub fn execute(&self, command: Command) -> Pending<Vec<ResultSet>> {
        self.enqueue(command, |results| Ok(Handled::value(results)))
    }

    fn start_worker(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("objectstore-queue".into())
            .spawn(move || inner.run());
        if let Err(e) = spawned {
            error!(error = %e, "cannot start queue worker");
            let failure = Arc::new(Error::pool(
                PoolErrorKind::Closed,
                format!("cannot start queue worker: {}", e),
            ));
            let jobs = {
                let mut state = self.inner.state.lock();
                state.running = false;
                std::mem::take(&mut state.pending)
            };
            for job in jobs {
                job.fail(&failure);
            }
        }
    }
}

impl QueueInner {
    fn take_batch(&self) -> Option<Vec<Box<dyn Job>>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.running = false;
            state.worker = None;
            return None;
        }
        Some(std::mem::take(&mut state.pending))
    }

    fn run(&self) {
        self.state.lock().worker = Some(thread::current().id());
        let lease = match self.pool.acquire(&self.connection_string) {
            Ok(lease) => lease,
            Err(e) => {
                warn!(connection_string = %self.connection_string, error = %e, "queue worker cannot connect");
                let failure = Arc::new(e);
                while let Some(batch) = self.take_batch() {
                    for job in batch {
                        job.fail(&failure);
                    }
                }
                return;
            }
        };
        while let Some(batch) = self.take_batch() {
            self.execute_batch(&lease, batch);
        }
        debug!(connection_string = %self.connection_string, "queue drained; worker exiting");
    }

    #[instrument(level = "debug", skip_all, fields(items = batch.len()))]
    fn execute_batch(&self, lease: &PooledConnection, mut batch: Vec<Box<dyn Job>>) {
        let executed = catch_unwind(AssertUnwindSafe(|| self.read_batch(lease, &mut batch)))
            .unwrap_or_else(|payload| Err(panicked("batch execution", payload.as_ref())));
        match executed {
            Ok(()) => {
                for job in batch {
                    job.finish();
                }
            }
            Err(e) => {
                warn!(error = %e, items = batch.len(), "batch failed");
                let failure = Arc::new(e);
                for job in batch {
                    job.fail(&failure);
                }
            }
        }
    }

    fn read_batch(&self, lease: &PooledConnection, batch: &mut [Box<dyn Job>]) -> Result<()> {
        let commands: Vec<Command> = batch.iter().map(|job| job.command().clone()).collect();
        let combined = self.pool.provider().combine(&commands)?;
        self.batches.fetch_add(1, Ordering::Relaxed);
        debug!(
            commands = commands.len(),
            statements = combined.statements,
            "executing batch"
        );
        let mut connection = lease.lock();
        let mut reader = connection.execute(&combined)?;
        for job in batch.iter_mut() {
            let results = read_sets(reader.as_mut(), job.command())?;
            job.handle(results);
        }
        Ok(())
    }

    fn run_inline(&self, mut job: Box<dyn Job>) {
        let outcome = self.pool.acquire(&self.connection_string).and_then(|lease| {
            let mut connection = lease.lock();
            let mut reader = connection.execute(job.command())?;
            let results = read_sets(reader.as_mut(), job.command())?;
            drop(reader);
            drop(connection);
            job.handle(results);
            Ok(())
        });
        match outcome {
            Ok(()) => job.finish(),
            Err(e) => job.fail(&Arc::new(e)),
        }
    }
}

fn read_sets(reader: &mut dyn DataReader, command: &Command) -> Result<Vec<ResultSet>> {
    let mut results = Vec::with_capacity(command.statements);
    for _ in 0..command.statements {
        match reader.next_result()? {
            Some(set) => results.push(set),
            None => {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::MissingResult,
                    sql: Some(command.text.clone()),
                    message: "batch returned fewer result sets than statements".to_string(),
                    source: None,
                }));
            }
        }
    }
    Ok(results)
}

impl fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerQueue")
            .field("connection_string", &self.inner.connection_string)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}

/// Lazily created queues keyed by (provider name, connection string).
pub struct QueueRegistry {
    pool: Arc<ConnectionPool>,
    queues: Mutex<HashMap<(String, String), Arc<WorkerQueue>>>,
}

impl QueueRegistry {
    pub fn new(pool: &Arc<ConnectionPool>) -> Self {
        Self {
            pool: Arc::clone(pool),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self, connection_string: &str) -> Arc<WorkerQueue> {
        let key = (
            self.pool.provider().name().to_string(),
            connection_string.to_string(),
        );
        let mut queues = self.queues.lock();
        Arc::clone(
            queues
                .entry(key)
                .or_insert_with(|| Arc::new(WorkerQueue::new(&self.pool, connection_string))),
        )
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_support::ScriptedProvider;
    use objectstore_core::Value;
    use std::time::Duration;

    fn queue(provider: &Arc<ScriptedProvider>) -> (Arc<ConnectionPool>, WorkerQueue) {
        let pool = ConnectionPool::new(provider.clone(), PoolConfig::new().sweep_interval(60_000));
        let queue = WorkerQueue::new(&pool, "db");
        (pool, queue)
    }

    fn echoed(results: &[ResultSet]) -> Vec<String> {
        results
            .iter()
            .map(|set| match set.rows[0].get(0) {
                Some(Value::Text(sql)) => sql.clone(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    #[test]
    fn concurrent_enqueues_share_one_round_trip() {
        let provider = ScriptedProvider::shared();
        let (_pool, queue) = queue(&provider);
        provider.close_gate();

        let first = queue.execute(Command::new("SELECT 1"));
        let second = queue.execute(Command::new("SELECT 2"));
        let third = queue.execute(Command::new("SELECT @x").param("x", 3));
        provider.open_gate();

        assert_eq!(echoed(&first.wait().unwrap()), vec!["SELECT 1"]);
        assert_eq!(echoed(&second.wait().unwrap()), vec!["SELECT 2"]);
        assert_eq!(echoed(&third.wait().unwrap()), vec!["SELECT @b2_x"]);
        assert_eq!(provider.executed().len(), 1);
        assert_eq!(queue.batches(), 1);
    }

    #[test]
    fn commits_run_after_every_handler() {
        let provider = ScriptedProvider::shared();
        let (_pool, queue) = queue(&provider);
        provider.close_gate();

        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<Pending<usize>> = (0..2)
            .map(|i| {
                let handled = Arc::clone(&order);
                let committed = Arc::clone(&order);
                queue.enqueue(Command::new(format!("SELECT {}", i)), move |_| {
                    handled.lock().push(format!("handle {}", i));
                    Ok(Handled::with_commit(i, move || {
                        committed.lock().push(format!("commit {}", i));
                        Ok(())
                    }))
                })
            })
            .collect();
        provider.open_gate();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i);
        }
        assert_eq!(
            *order.lock(),
            vec!["handle 0", "handle 1", "commit 0", "commit 1"]
        );
    }

    #[test]
    fn execution_failure_reaches_every_item() {
        let provider = ScriptedProvider::shared();
        let (_pool, queue) = queue(&provider);
        provider.fail_on("broken");
        provider.close_gate();
        let ok = queue.execute(Command::new("SELECT 1"));
        let bad = queue.execute(Command::new("SELECT broken"));
        provider.open_gate();

        for handle in [ok, bad] {
            let err = handle.wait().unwrap_err();
            assert!(matches!(err, Error::Shared(_)));
            assert!(matches!(err.root(), Error::Query(_)));
        }
    }

    #[test]
    fn panicking_handler_fails_only_its_item() {
        let provider = ScriptedProvider::shared();
        let (_pool, queue) = queue(&provider);
        provider.close_gate();
        let bad: Pending<()> = queue.enqueue(Command::new("SELECT 1"), |_| panic!("handler bug"));
        let good = queue.execute(Command::new("SELECT 2"));
        provider.open_gate();

        let err = bad.wait().unwrap_err();
        assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::HandlerPanicked));
        assert_eq!(echoed(&good.wait().unwrap()), vec!["SELECT 2"]);
    }

    #[test]
    fn worker_restarts_after_draining() {
        let provider = ScriptedProvider::shared();
        let (_pool, queue) = queue(&provider);
        queue.execute(Command::new("SELECT 1")).wait().unwrap();
        // Let the first worker exit.
        for _ in 0..100 {
            if !queue.inner.state.lock().running {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        queue.execute(Command::new("SELECT 2")).wait().unwrap();
        assert_eq!(queue.batches(), 2);
    }

    #[test]
    fn registry_reuses_queues() {
        let provider = ScriptedProvider::shared();
        let pool = ConnectionPool::new(provider.clone(), PoolConfig::default());
        let registry = QueueRegistry::new(&pool);
        let a = registry.queue("db");
        let b = registry.queue("db");
        let c = registry.queue("other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }
}
