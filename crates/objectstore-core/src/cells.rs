//! Backing-store cells holding one field of an entity.
//!
//! A cell keeps the last committed value, an optional local edit and an
//! optional value staged by a fill. Staged values stay invisible until
//! committed.

use std::sync::Weak;

use crate::entity::{EntityRef, Fillable};
use crate::keys::MappedObjectKeys;
use crate::value::Value;

/// A writable field.
#[derive(Debug, Clone, Default)]
pub struct ValueCell {
    original: Value,
    current: Option<Value>,
    staged: Option<Value>,
}

impl ValueCell {
    pub fn new(value: Value) -> Self {
        Self {
            original: value,
            current: None,
            staged: None,
        }
    }

    pub fn get(&self) -> &Value {
        self.current.as_ref().unwrap_or(&self.original)
    }

    pub fn original(&self) -> &Value {
        &self.original
    }

    /// Assign a value; returns `true` if the visible value changed.
    pub fn set(&mut self, value: Value) -> bool {
        if *self.get() == value {
            return false;
        }
        if value == self.original {
            self.current = None;
        } else {
            self.current = Some(value);
        }
        true
    }

    pub fn stage(&mut self, value: Value) {
        self.staged = Some(value);
    }

    pub fn is_modified(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Returns `true` if the visible value changed.
    pub fn commit(&mut self, undo_changes: bool) -> bool {
        let before = self.get().clone();
        if let Some(staged) = self.staged.take() {
            self.original = staged;
            self.current = None;
        } else if undo_changes {
            self.current = None;
        } else if let Some(current) = self.current.take() {
            self.original = current;
        }
        before != *self.get()
    }

    pub fn rollback(&mut self) {
        self.staged = None;
    }

    /// Returns `true` if the visible value changed.
    pub fn drop_changes(&mut self) -> bool {
        self.staged = None;
        self.current.take().is_some()
    }
}

/// A field only the database writes.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyCell {
    value: Value,
    staged: Option<Value>,
}

impl ReadOnlyCell {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            staged: None,
        }
    }

    pub fn get(&self) -> &Value {
        &self.value
    }

    pub fn stage(&mut self, value: Value) {
        self.staged = Some(value);
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Returns `true` if the value changed.
    pub fn commit(&mut self) -> bool {
        match self.staged.take() {
            Some(staged) if staged != self.value => {
                self.value = staged;
                true
            }
            _ => false,
        }
    }

    pub fn rollback(&mut self) {
        self.staged = None;
    }
}

/// A navigation property.
///
/// An explicitly assigned target is held strongly until committed, so a new
/// parent reachable only through its child stays alive. Resolved targets are
/// held weakly together with the keys they were resolved for.
#[derive(Default)]
pub struct ForeignCell {
    assigned: Option<Option<EntityRef>>,
    resolved: Option<(MappedObjectKeys, Weak<dyn Fillable>)>,
}

impl ForeignCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit assignment, `Some(None)` meaning "cleared".
    pub fn assigned(&self) -> Option<Option<&EntityRef>> {
        self.assigned.as_ref().map(Option::as_ref)
    }

    pub fn assign(&mut self, target: Option<EntityRef>) {
        self.assigned = Some(target);
        self.resolved = None;
    }

    /// Cached target for `keys`, if still alive.
    pub fn cached(&self, keys: &MappedObjectKeys) -> Option<EntityRef> {
        match &self.resolved {
            Some((cached_keys, target)) if cached_keys == keys => target.upgrade(),
            _ => None,
        }
    }

    pub fn remember(&mut self, keys: MappedObjectKeys, target: &EntityRef) {
        self.resolved = Some((keys, std::sync::Arc::downgrade(target)));
    }

    /// Turn an assignment into a cached resolution.
    pub fn commit(&mut self) {
        if let Some(Some(target)) = self.assigned.take() {
            let keys = target.keys();
            if !keys.is_placeholder() {
                self.remember(keys, &target);
            }
        }
    }

    /// Forget an uncommitted assignment.
    pub fn drop_changes(&mut self) -> bool {
        self.assigned.take().is_some()
    }
}
