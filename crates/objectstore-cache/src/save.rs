//! Save batches over a set of tracked objects.
//!
//! A [`SaveBatch`] runs the command each object's state calls for,
//! follows the cascading child hooks, and records what must happen to the
//! object once the whole batch succeeded. Nothing is committed while the batch
//! runs; a failure rolls back every object that was already executed.

use std::collections::HashSet;
use std::sync::Arc;

use objectstore_core::{
    CommandKind, EntityRef, Error, ObjectId, ObjectSaver, ObjectState, Result, SaveError,
    object_id,
};
use tracing::{debug, instrument, trace, warn};

use crate::unit_of_work::UnitOfWork;

/// Result of running one object's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The database returned the refreshed row; it was staged on the object.
    Refilled,
    /// The statement touched no row.
    NoRow,
    /// The statement ran and returned nothing to stage.
    Done,
}

/// Runs single-object commands for a save batch.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, object: &EntityRef, kind: CommandKind) -> Result<ExecOutcome>;
}

#[derive(Clone)]
enum Completion {
    /// Accept staged values and edits as the new original
    Commit(EntityRef),
    /// The row is gone; detach
    Finalize(EntityRef),
}

impl Completion {
    fn object(&self) -> &EntityRef {
        match self {
            Completion::Commit(object) | Completion::Finalize(object) => object,
        }
    }

    fn apply(&self) -> Result<()> {
        match self {
            Completion::Commit(object) => object.commit(false),
            Completion::Finalize(object) => object.deattach(),
        }
    }
}

fn apply_all(completions: &[Completion]) -> Result<()> {
    let mut first_error = None;
    for completion in completions {
        if let Err(e) = completion.apply() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn rollback_all(completions: &[Completion]) {
    for completion in completions {
        completion.object().rollback();
    }
}

/// One in-flight save.
pub struct SaveBatch<'e> {
    executor: &'e dyn CommandExecutor,
    completions: Vec<Completion>,
    visited: HashSet<ObjectId>,
}

impl<'e> SaveBatch<'e> {
    pub fn new(executor: &'e dyn CommandExecutor) -> Self {
        Self {
            executor,
            completions: Vec::new(),
            visited: HashSet::new(),
        }
    }

    /// Save every object in order. On failure the batch is rolled back and
    /// the error names the failing object.
    #[instrument(level = "debug", skip_all, fields(objects = objects.len()))]
    pub fn save_all(&mut self, objects: &[EntityRef]) -> Result<()> {
        for object in objects {
            if let Err(e) = self.save(object) {
                warn!(error = %e, executed = self.completions.len(), "save failed; rolling back batch");
                rollback_all(&self.completions);
                self.completions.clear();
                return Err(e);
            }
        }
        debug!(executed = self.completions.len(), "save batch executed");
        Ok(())
    }

    /// Number of objects whose command ran.
    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    fn save_one(&mut self, object: &EntityRef) -> Result<()> {
        let state = object.state();
        trace!(object = ?object, "saving");
        match state {
            ObjectState::Created => {
                self.executor.execute(object, CommandKind::Insert)?;
                self.completions.push(Completion::Commit(Arc::clone(object)));
                object.save_child_objects(self)
            }
            ObjectState::Changed => {
                match self.executor.execute(object, CommandKind::Update)? {
                    ExecOutcome::NoRow => {
                        debug!(object = ?object, "updated row no longer exists; detaching");
                        self.completions.push(Completion::Finalize(Arc::clone(object)));
                        return Ok(());
                    }
                    ExecOutcome::Refilled | ExecOutcome::Done => {
                        self.completions.push(Completion::Commit(Arc::clone(object)));
                    }
                }
                object.save_child_objects(self)
            }
            ObjectState::Deleted => {
                self.executor.execute(object, CommandKind::Delete)?;
                self.completions.push(Completion::Finalize(Arc::clone(object)));
                object.delete_child_objects(self)
            }
            ObjectState::Original => {
                if object.check_child_objects_changed()? {
                    object.save_child_objects(self)?;
                }
                Ok(())
            }
            ObjectState::NotAttached => Ok(()),
        }
    }

    /// Apply the recorded outcomes: executed inserts and updates become
    /// `Original`, deleted and vanished rows are detached.
    pub fn commit(self) -> Result<()> {
        apply_all(&self.completions)
    }

    /// Discard everything staged by the executed commands.
    pub fn rollback(self) {
        rollback_all(&self.completions);
    }

    /// Hand the outcome to a unit of work: applied when it commits,
    /// discarded when it rolls back.
    pub fn defer(self, unit: &mut UnitOfWork) {
        let on_commit = self.completions.clone();
        let on_rollback = self.completions;
        unit.on_commit(move || apply_all(&on_commit));
        unit.on_rollback(move || {
            rollback_all(&on_rollback);
            Ok(())
        });
    }
}

impl ObjectSaver for SaveBatch<'_> {
    fn save(&mut self, object: &EntityRef) -> Result<()> {
        if !self.visited.insert(object_id(object)) {
            return Ok(());
        }
        self.save_one(object).map_err(|e| match e {
            Error::Save(_) => e,
            other => Error::Save(SaveError {
                object: Arc::clone(object),
                source: Box::new(other),
            }),
        })
    }
}
