//! Explicit unit of work for deferred save outcomes.
//!
//! Saves made under a unit of work do not touch object state until the unit
//! completes. Callers register `on_commit`/`on_rollback` hooks (a
//! [`SaveBatch`](crate::SaveBatch) does this through `defer`) and then call
//! [`UnitOfWork::commit`] or [`UnitOfWork::rollback`] when their own
//! transaction finished. Dropping an incomplete unit rolls it back.

use std::fmt;

use objectstore_core::Result;
use tracing::{debug, warn};

type Hook = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
pub struct UnitOfWork {
    on_commit: Vec<Hook>,
    on_rollback: Vec<Hook>,
    completed: bool,
}

fn run(hooks: Vec<Hook>) -> Result<()> {
    let mut first_error = None;
    for hook in hooks {
        if let Err(e) = hook() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_commit<F>(&mut self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.on_commit.push(Box::new(hook));
    }

    pub fn on_rollback<F>(&mut self, hook: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.on_rollback.push(Box::new(hook));
    }

    /// Number of registered commit hooks.
    pub fn pending(&self) -> usize {
        self.on_commit.len()
    }

    /// Run every commit hook in registration order. All hooks run; the first
    /// failure is returned.
    pub fn commit(mut self) -> Result<()> {
        self.completed = true;
        self.on_rollback.clear();
        debug!(hooks = self.on_commit.len(), "unit of work committed");
        run(std::mem::take(&mut self.on_commit))
    }

    /// Run every rollback hook in registration order.
    pub fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.on_commit.clear();
        debug!(hooks = self.on_rollback.len(), "unit of work rolled back");
        run(std::mem::take(&mut self.on_rollback))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.completed || self.on_rollback.is_empty() {
            return;
        }
        warn!(hooks = self.on_rollback.len(), "unit of work dropped without completion; rolling back");
        if let Err(e) = run(std::mem::take(&mut self.on_rollback)) {
            warn!(error = %e, "rollback of dropped unit of work failed");
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("on_commit", &self.on_commit.len())
            .field("on_rollback", &self.on_rollback.len())
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn log() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn register(unit: &mut UnitOfWork, log: &Arc<Mutex<Vec<&'static str>>>) {
        let commits = Arc::clone(log);
        unit.on_commit(move || {
            commits.lock().push("commit");
            Ok(())
        });
        let rollbacks = Arc::clone(log);
        unit.on_rollback(move || {
            rollbacks.lock().push("rollback");
            Ok(())
        });
    }

    #[test]
    fn commit_runs_commit_hooks_only() {
        let events = log();
        let mut unit = UnitOfWork::new();
        register(&mut unit, &events);
        register(&mut unit, &events);
        assert_eq!(unit.pending(), 2);
        unit.commit().unwrap();
        assert_eq!(*events.lock(), vec!["commit", "commit"]);
    }

    #[test]
    fn dropping_an_open_unit_rolls_back() {
        let events = log();
        {
            let mut unit = UnitOfWork::new();
            register(&mut unit, &events);
        }
        assert_eq!(*events.lock(), vec!["rollback"]);
    }

    #[test]
    fn failing_hook_does_not_stop_the_rest() {
        let events = log();
        let mut unit = UnitOfWork::new();
        unit.on_commit(|| Err(objectstore_core::Error::Custom("boom".into())));
        register(&mut unit, &events);
        assert!(unit.commit().is_err());
        assert_eq!(*events.lock(), vec!["commit"]);
    }
}
