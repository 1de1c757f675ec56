//! Generic mapped entity built from backing-store cells.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::Result;
use crate::cells::{ForeignCell, ReadOnlyCell, ValueCell};
use crate::command::CommandBuilder;
use crate::entity::{
    Change, ChangeListener, CommandKind, EntityRef, Fillable, ForeignResolver, ObjectSaver,
    ObjectState,
};
use crate::error::Error;
use crate::keys::MappedObjectKeys;
use crate::mapping::{ChildRelation, TableMapping};
use crate::row::Row;
use crate::value::Value;

enum FieldCell {
    Value(ValueCell),
    ReadOnly(ReadOnlyCell),
}

impl FieldCell {
    fn get(&self) -> &Value {
        match self {
            FieldCell::Value(cell) => cell.get(),
            FieldCell::ReadOnly(cell) => cell.get(),
        }
    }

    fn stage(&mut self, value: Value) {
        match self {
            FieldCell::Value(cell) => cell.stage(value),
            FieldCell::ReadOnly(cell) => cell.stage(value),
        }
    }

    fn is_modified(&self) -> bool {
        matches!(self, FieldCell::Value(cell) if cell.is_modified())
    }

    fn commit(&mut self, undo_changes: bool) -> bool {
        match self {
            FieldCell::Value(cell) => cell.commit(undo_changes),
            FieldCell::ReadOnly(cell) => cell.commit(),
        }
    }

    fn rollback(&mut self) {
        match self {
            FieldCell::Value(cell) => cell.rollback(),
            FieldCell::ReadOnly(cell) => cell.rollback(),
        }
    }

    fn drop_changes(&mut self) -> bool {
        match self {
            FieldCell::Value(cell) => cell.drop_changes(),
            FieldCell::ReadOnly(cell) => {
                cell.rollback();
                false
            }
        }
    }
}

struct RecordInner {
    state: ObjectState,
    keys: MappedObjectKeys,
    cells: Vec<FieldCell>,
    foreign: Vec<ForeignCell>,
    listeners: Vec<Weak<dyn ChangeListener>>,
    resolver: Option<Weak<dyn ForeignResolver>>,
}

impl RecordInner {
    fn has_edits(&self) -> bool {
        self.cells.iter().any(FieldCell::is_modified)
            || self.foreign.iter().any(|f| f.assigned().is_some())
    }

    // Original <-> Changed follows whether any edit remains.
    fn refresh_edit_state(&mut self) -> Option<Change> {
        let from = self.state;
        let to = match from {
            ObjectState::Original | ObjectState::Changed if self.has_edits() => {
                ObjectState::Changed
            }
            ObjectState::Original | ObjectState::Changed => ObjectState::Original,
            other => other,
        };
        self.state = to;
        (from != to).then_some(Change::State { from, to })
    }

    fn key_from_locals(&self, locals: &[usize]) -> Option<MappedObjectKeys> {
        let mut values = Vec::new();
        for &index in locals {
            let value = self.cells[index].get();
            if value.is_null() {
                return None;
            }
            values.push(value.clone());
        }
        Some(MappedObjectKeys::new(values))
    }
}

/// A mapped entity whose fields are cells described by its [`TableMapping`].
///
/// Property access goes through [`Fillable::get`] and [`Fillable::set`].
/// Key fields can only be assigned while the record is `Created`.
pub struct Record {
    mapping: Arc<TableMapping>,
    this: Weak<Record>,
    inner: Mutex<RecordInner>,
}

impl Record {
    /// A blank record in the `Created` state with every field at its default.
    pub fn new(mapping: &Arc<TableMapping>) -> Arc<Record> {
        let cells = mapping
            .fields()
            .iter()
            .map(|field| {
                if field.read_only {
                    FieldCell::ReadOnly(ReadOnlyCell::new(field.default.clone()))
                } else {
                    FieldCell::Value(ValueCell::new(field.default.clone()))
                }
            })
            .collect();
        let foreign = mapping
            .foreign_relations()
            .iter()
            .map(|_| ForeignCell::new())
            .collect();
        Arc::new_cyclic(|this| Record {
            mapping: Arc::clone(mapping),
            this: this.clone(),
            inner: Mutex::new(RecordInner {
                state: ObjectState::Created,
                keys: MappedObjectKeys::placeholder(),
                cells,
                foreign,
                listeners: Vec::new(),
                resolver: None,
            }),
        })
    }

    fn entity(&self) -> Option<EntityRef> {
        self.this.upgrade().map(|this| this as EntityRef)
    }

    fn field_index(&self, property: &str) -> Result<usize> {
        self.mapping.field_index(property).ok_or_else(|| {
            Error::mapping(
                self.mapping.table(),
                format!("unknown property '{}'", property),
            )
        })
    }

    fn relation_index(&self, property: &str) -> Result<usize> {
        self.mapping
            .foreign_relations()
            .iter()
            .position(|r| r.property == property)
            .ok_or_else(|| {
                Error::mapping(
                    self.mapping.table(),
                    format!("unknown navigation property '{}'", property),
                )
            })
    }

    fn local_indices(&self, relation: usize) -> Vec<usize> {
        self.mapping.foreign_relations()[relation]
            .local_properties()
            .filter_map(|p| self.mapping.field_index(p))
            .collect()
    }

    fn check_writable(&self, state: ObjectState) -> Result<()> {
        match state {
            ObjectState::Deleted | ObjectState::NotAttached => Err(Error::state(format!(
                "cannot modify a {} object of '{}'",
                state,
                self.mapping.table()
            ))),
            _ => Ok(()),
        }
    }

    fn resolver(&self) -> Result<Arc<dyn ForeignResolver>> {
        self.inner
            .lock()
            .resolver
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                Error::state(format!(
                    "object of '{}' is not bound to a store",
                    self.mapping.table()
                ))
            })
    }

    fn children_along(&self, relation: &ChildRelation) -> Result<Vec<EntityRef>> {
        let Some(this) = self.entity() else {
            return Ok(Vec::new());
        };
        self.resolver()?.children(&this, relation)
    }

    /// Deliver changes to every live listener, outside the record lock.
    fn notify(&self, changes: Vec<Change>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let listeners: Vec<Arc<dyn ChangeListener>> = {
            let mut inner = self.inner.lock();
            inner.listeners.retain(|l| l.strong_count() > 0);
            inner.listeners.iter().filter_map(Weak::upgrade).collect()
        };
        let Some(this) = self.entity() else {
            return Ok(());
        };
        let mut first_error = None;
        for change in &changes {
            tracing::trace!(
                table = self.mapping.table(),
                change = ?change,
                listeners = listeners.len(),
                "object changed"
            );
            for listener in &listeners {
                if let Err(e) = listener.object_changed(&this, change) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Fillable for Record {
    fn mapping(&self) -> &Arc<TableMapping> {
        &self.mapping
    }

    fn keys(&self) -> MappedObjectKeys {
        self.inner.lock().keys.clone()
    }

    fn state(&self) -> ObjectState {
        self.inner.lock().state
    }

    fn modified(&self) -> bool {
        matches!(
            self.inner.lock().state,
            ObjectState::Created | ObjectState::Changed | ObjectState::Deleted
        )
    }

    fn get(&self, property: &str) -> Result<Value> {
        let index = self.field_index(property)?;
        Ok(self.inner.lock().cells[index].get().clone())
    }

    fn set(&self, property: &str, value: Value) -> Result<()> {
        let index = self.field_index(property)?;
        let field = &self.mapping.fields()[index];
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            self.check_writable(inner.state)?;
            if field.key && inner.state != ObjectState::Created {
                return Err(Error::state(format!(
                    "key '{}' of '{}' cannot change once saved",
                    property,
                    self.mapping.table()
                )));
            }
            let FieldCell::Value(cell) = &mut inner.cells[index] else {
                return Err(Error::state(format!(
                    "'{}' of '{}' is read-only",
                    property,
                    self.mapping.table()
                )));
            };
            if !cell.set(value) {
                return Ok(());
            }
            changes.push(Change::property(property));
            for relation in self.mapping.relations_using(property) {
                if let Ok(i) = self.relation_index(&relation.property) {
                    inner.foreign[i].drop_changes();
                }
                changes.push(Change::property(&relation.property));
            }
            changes.extend(inner.refresh_edit_state());
        }
        self.notify(changes)
    }

    fn navigate(&self, property: &str) -> Result<Option<EntityRef>> {
        let relation = self.relation_index(property)?;
        let locals = self.local_indices(relation);
        let keys = {
            let inner = self.inner.lock();
            if let Some(assigned) = inner.foreign[relation].assigned() {
                return Ok(assigned.cloned());
            }
            let Some(keys) = inner.key_from_locals(&locals) else {
                return Ok(None);
            };
            if let Some(target) = inner.foreign[relation].cached(&keys) {
                return Ok(Some(target));
            }
            keys
        };
        let target_table = &self.mapping.foreign_relations()[relation].target;
        let target = self.resolver()?.resolve(target_table, &keys)?;
        if let Some(target) = &target {
            self.inner.lock().foreign[relation].remember(keys, target);
        }
        Ok(target)
    }

    fn set_foreign(&self, property: &str, target: Option<&EntityRef>) -> Result<()> {
        let relation_index = self.relation_index(property)?;
        let relation = &self.mapping.foreign_relations()[relation_index];
        if let Some(target) = target {
            if target.mapping().table() != relation.target {
                return Err(Error::mapping(
                    self.mapping.table(),
                    format!(
                        "'{}' expects a '{}' object, got '{}'",
                        property,
                        relation.target,
                        target.mapping().table()
                    ),
                ));
            }
        }
        let target_keys = target.map(|t| t.keys());
        let mut changes = vec![Change::property(property)];
        {
            let mut inner = self.inner.lock();
            self.check_writable(inner.state)?;
            for (position, (local, _)) in relation.columns.iter().enumerate() {
                let value = match &target_keys {
                    Some(keys) if keys.is_placeholder() => continue,
                    Some(keys) => keys.values().get(position).cloned().unwrap_or(Value::Null),
                    None => Value::Null,
                };
                let index = self.field_index(local)?;
                if let FieldCell::Value(cell) = &mut inner.cells[index] {
                    if cell.set(value) {
                        changes.push(Change::property(local));
                    }
                }
            }
            inner.foreign[relation_index].assign(target.cloned());
            changes.extend(inner.refresh_edit_state());
        }
        self.notify(changes)
    }

    fn fill(&self, row: &Row) -> Result<()> {
        let mut inner = self.inner.lock();
        for (field, cell) in self.mapping.fields().iter().zip(inner.cells.iter_mut()) {
            if let Some(value) = row.get_by_name(&field.column) {
                cell.stage(value.clone());
            }
        }
        Ok(())
    }

    fn commit(&self, undo_changes: bool) -> Result<()> {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut values_changed = false;
            for cell in &mut inner.cells {
                values_changed |= cell.commit(undo_changes);
            }
            for cell in &mut inner.foreign {
                if undo_changes {
                    values_changed |= cell.drop_changes();
                } else {
                    cell.commit();
                }
            }
            let from = inner.state;
            let to = match from {
                ObjectState::Created | ObjectState::Changed => ObjectState::Original,
                other => other,
            };
            if from == ObjectState::Created && to == ObjectState::Original {
                let keys = MappedObjectKeys::new(
                    self.mapping
                        .fields()
                        .iter()
                        .zip(&inner.cells)
                        .filter(|(field, _)| field.key)
                        .map(|(_, cell)| cell.get().clone())
                        .collect::<Vec<_>>(),
                );
                if keys.has_null() {
                    tracing::warn!(
                        table = self.mapping.table(),
                        keys = %keys,
                        "committed object has no complete key; keeping placeholder"
                    );
                } else {
                    inner.keys = keys;
                }
            }
            inner.state = to;
            if from != to {
                changes.push(Change::State { from, to });
            } else if values_changed {
                changes.push(Change::Any);
            }
        }
        self.notify(changes)
    }

    fn rollback(&self) {
        let mut inner = self.inner.lock();
        for cell in &mut inner.cells {
            cell.rollback();
        }
    }

    fn drop_changes(&self) -> Result<()> {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut values_changed = false;
            for cell in &mut inner.cells {
                values_changed |= cell.drop_changes();
            }
            for cell in &mut inner.foreign {
                values_changed |= cell.drop_changes();
            }
            let from = inner.state;
            let to = match from {
                ObjectState::Changed | ObjectState::Deleted => ObjectState::Original,
                ObjectState::Created => ObjectState::NotAttached,
                other => other,
            };
            inner.state = to;
            if values_changed {
                changes.push(Change::Any);
            }
            if from != to {
                changes.push(Change::State { from, to });
            }
        }
        self.notify(changes)
    }

    fn delete(&self) -> Result<()> {
        let change = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            let to = match from {
                ObjectState::Created => ObjectState::NotAttached,
                ObjectState::Original | ObjectState::Changed => ObjectState::Deleted,
                other => other,
            };
            inner.state = to;
            (from != to).then_some(Change::State { from, to })
        };
        self.notify(change.into_iter().collect())
    }

    fn deattach(&self) -> Result<()> {
        let change = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = ObjectState::NotAttached;
            (from != ObjectState::NotAttached).then_some(Change::State {
                from,
                to: ObjectState::NotAttached,
            })
        };
        self.notify(change.into_iter().collect())
    }

    fn fill_command(&self, kind: CommandKind, builder: &mut CommandBuilder) -> Result<()> {
        let mut inner = self.inner.lock();

        // Parents assigned while new have keys by now.
        for (i, relation) in self.mapping.foreign_relations().iter().enumerate() {
            let Some(Some(target)) = inner.foreign[i].assigned().map(|t| t.cloned()) else {
                continue;
            };
            let keys = target.keys();
            if keys.is_placeholder() {
                return Err(Error::state(format!(
                    "'{}' of '{}' points at an unsaved '{}' object",
                    relation.property,
                    self.mapping.table(),
                    relation.target
                )));
            }
            for ((local, _), value) in relation.columns.iter().zip(keys.values()) {
                let index = self.field_index(local)?;
                if let FieldCell::Value(cell) = &mut inner.cells[index] {
                    cell.set(value.clone());
                }
            }
        }

        let fields = self.mapping.fields().iter().zip(&inner.cells);
        match kind {
            CommandKind::Insert => {
                for (field, cell) in fields {
                    let value = cell.get();
                    if field.read_only || (field.generated && value.is_null()) {
                        continue;
                    }
                    builder.set(&field.column, value.clone());
                }
            }
            CommandKind::Update => {
                for (field, cell) in fields {
                    if field.key {
                        builder.key(&field.column, cell.get().clone());
                    } else if cell.is_modified() {
                        builder.set(&field.column, cell.get().clone());
                    }
                }
            }
            CommandKind::Delete | CommandKind::Select => {
                for (field, cell) in fields.filter(|(field, _)| field.key) {
                    builder.key(&field.column, cell.get().clone());
                }
            }
        }
        Ok(())
    }

    fn subscribe(&self, listener: Weak<dyn ChangeListener>) {
        let mut inner = self.inner.lock();
        if !inner.listeners.iter().any(|l| Weak::ptr_eq(l, &listener)) {
            inner.listeners.push(listener);
        }
    }

    fn bind(&self, resolver: Weak<dyn ForeignResolver>) {
        self.inner.lock().resolver = Some(resolver);
    }

    fn delete_child_objects(&self, saver: &mut dyn ObjectSaver) -> Result<()> {
        for relation in self.mapping.children().iter().filter(|r| r.cascade_delete) {
            for child in self.children_along(relation)? {
                child.delete()?;
                saver.save(&child)?;
            }
        }
        Ok(())
    }

    fn save_child_objects(&self, saver: &mut dyn ObjectSaver) -> Result<()> {
        for relation in self.mapping.children().iter().filter(|r| r.cascade_save) {
            for child in self.children_along(relation)? {
                if child.modified() || child.check_child_objects_changed()? {
                    saver.save(&child)?;
                }
            }
        }
        Ok(())
    }

    fn check_child_objects_changed(&self) -> Result<bool> {
        for relation in self.mapping.children().iter().filter(|r| r.cascade_save) {
            for child in self.children_along(relation)? {
                if child.modified() || child.check_child_objects_changed()? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn drop_changes_child_objects(&self) -> Result<()> {
        for relation in self.mapping.children().iter().filter(|r| r.cascade_save) {
            for child in self.children_along(relation)? {
                child.drop_changes()?;
                child.drop_changes_child_objects()?;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
