//! The fillable-object capability consumed by the cache and the workers.
//!
//! Any mapped entity implements [`Fillable`]. The crate ships one generic
//! implementation, [`Record`](crate::record::Record), built from the cells in
//! [`cells`](crate::cells); hand-written entities may implement the trait
//! directly and plug in through [`TableMapping`]'s factory.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::Result;
use crate::command::CommandBuilder;
use crate::keys::MappedObjectKeys;
use crate::mapping::{ChildRelation, TableMapping};
use crate::row::Row;
use crate::value::Value;

/// Shared handle to a live mapped object.
pub type EntityRef = Arc<dyn Fillable>;

/// Identity of a live object within the process (its allocation address).
pub type ObjectId = usize;

pub fn object_id(object: &EntityRef) -> ObjectId {
    Arc::as_ptr(object).cast::<()>() as usize
}

/// Lifecycle state of a mapped object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Matches the last committed row
    Original,
    /// In memory only; no row yet
    Created,
    /// Has uncommitted field edits
    Changed,
    /// Marked for delete
    Deleted,
    /// Detached from every cache and view
    NotAttached,
}

impl ObjectState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ObjectState::Original => "original",
            ObjectState::Created => "created",
            ObjectState::Changed => "changed",
            ObjectState::Deleted => "deleted",
            ObjectState::NotAttached => "not-attached",
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification raised by a fillable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Something changed; re-evaluate everything
    Any,
    /// One named property changed
    Property(Arc<str>),
    /// The lifecycle state moved
    State { from: ObjectState, to: ObjectState },
}

impl Change {
    pub fn property(name: &str) -> Self {
        Change::Property(Arc::from(name))
    }
}

/// Receives change notifications from subscribed objects.
pub trait ChangeListener: Send + Sync {
    fn object_changed(&self, object: &EntityRef, change: &Change) -> Result<()>;
}

/// Resolves navigation properties for bound objects.
pub trait ForeignResolver: Send + Sync {
    /// The live object of `table` with the given keys, loading it if needed.
    fn resolve(&self, table: &str, keys: &MappedObjectKeys) -> Result<Option<EntityRef>>;

    /// Every child of `parent` along `relation`.
    fn children(&self, parent: &EntityRef, relation: &ChildRelation) -> Result<Vec<EntityRef>>;
}

/// Persists objects reached by cascading hooks within one save batch.
pub trait ObjectSaver {
    /// Run the command matching the object's state, then its cascades.
    fn save(&mut self, object: &EntityRef) -> Result<()>;
}

/// Statement kind an object contributes to a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl CommandKind {
    /// Command required to persist an object in `state`, if any.
    pub const fn for_state(state: ObjectState) -> Option<Self> {
        match state {
            ObjectState::Created => Some(CommandKind::Insert),
            ObjectState::Changed => Some(CommandKind::Update),
            ObjectState::Deleted => Some(CommandKind::Delete),
            ObjectState::Original | ObjectState::NotAttached => None,
        }
    }
}

/// A mapped entity whose fields can be filled from rows and whose edits can
/// be committed or rolled back.
pub trait Fillable: Send + Sync + 'static {
    fn mapping(&self) -> &Arc<TableMapping>;

    /// Identity tuple; a placeholder while the object has no row.
    fn keys(&self) -> MappedObjectKeys;

    fn state(&self) -> ObjectState;

    /// Has anything that a save would write.
    fn modified(&self) -> bool;

    /// Current value of a field property.
    fn get(&self, property: &str) -> Result<Value>;

    /// Assign a field property.
    fn set(&self, property: &str, value: Value) -> Result<()>;

    /// Current target of a navigation property.
    fn navigate(&self, property: &str) -> Result<Option<EntityRef>>;

    /// Point a navigation property at another object (or clear it).
    fn set_foreign(&self, property: &str, target: Option<&EntityRef>) -> Result<()>;

    /// Stage the row's values. They become visible on [`commit`](Self::commit).
    fn fill(&self, row: &Row) -> Result<()>;

    /// Make staged values the original snapshot. Remaining edits are accepted
    /// (`undo_changes == false`) or discarded.
    fn commit(&self, undo_changes: bool) -> Result<()>;

    /// Discard staged values.
    fn rollback(&self);

    /// Revert to the last committed values.
    fn drop_changes(&self) -> Result<()>;

    /// Mark for delete. A never-saved object detaches immediately.
    fn delete(&self) -> Result<()>;

    /// Detach from every cache and view.
    fn deattach(&self) -> Result<()>;

    /// Write the values a command of `kind` needs into the builder.
    fn fill_command(&self, kind: CommandKind, builder: &mut CommandBuilder) -> Result<()>;

    fn subscribe(&self, listener: Weak<dyn ChangeListener>);

    /// Attach the resolver used for navigation and cascades.
    fn bind(&self, resolver: Weak<dyn ForeignResolver>);

    fn delete_child_objects(&self, _saver: &mut dyn ObjectSaver) -> Result<()> {
        Ok(())
    }

    fn save_child_objects(&self, _saver: &mut dyn ObjectSaver) -> Result<()> {
        Ok(())
    }

    fn check_child_objects_changed(&self) -> Result<bool> {
        Ok(false)
    }

    fn drop_changes_child_objects(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Fillable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} [{}]",
            self.mapping().table(),
            self.keys(),
            self.state()
        )
    }
}
