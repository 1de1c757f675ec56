//! Declarative mapping metadata.
//!
//! Each mapped type is described once at startup by a [`TableMapping`] built
//! with chained setters and registered in a [`MappingRegistry`]:
//!
//! ```ignore
//! let users = TableMapping::new("users")
//!     .field(FieldMapping::new("id").key(true).generated(true))
//!     .field(FieldMapping::new("name"))
//!     .foreign(ForeignRelation::new("team", "teams").column("team_id", "id"))
//!     .build()?;
//! registry.register(users)?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Result;
use crate::entity::EntityRef;
use crate::error::Error;
use crate::keys::MappedObjectKeys;
use crate::record::Record;
use crate::row::Row;
use crate::value::Value;

/// Constructs a blank instance of a mapped type.
pub type EntityFactory = Arc<dyn Fn(&Arc<TableMapping>) -> EntityRef + Send + Sync>;

/// One mapped field: entity property name and database column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub property: String,
    pub column: String,
    /// Part of the primary key
    pub key: bool,
    /// Value produced by the database (autoincrement, computed default)
    pub generated: bool,
    /// Never written by inserts or updates
    pub read_only: bool,
    /// Initial value of a freshly created object
    pub default: Value,
}

impl FieldMapping {
    /// A field whose column name equals the property name.
    pub fn new(property: impl Into<String>) -> Self {
        let property = property.into();
        Self {
            column: property.clone(),
            property,
            key: false,
            generated: false,
            read_only: false,
            default: Value::Null,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn key(mut self, key: bool) -> Self {
        self.key = key;
        self
    }

    pub fn generated(mut self, generated: bool) -> Self {
        self.generated = generated;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }
}

/// A navigation property resolving local foreign-key fields to a row of
/// another mapped table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignRelation {
    pub property: String,
    pub target: String,
    /// Pairs of (local property, target key property), in target key order
    pub columns: Vec<(String, String)>,
}

impl ForeignRelation {
    pub fn new(property: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            target: target.into(),
            columns: Vec::new(),
        }
    }

    /// Map a local property onto a key property of the target.
    pub fn column(mut self, local: impl Into<String>, target: impl Into<String>) -> Self {
        self.columns.push((local.into(), target.into()));
        self
    }

    pub fn local_properties(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(local, _)| local.as_str())
    }
}

/// Children of this table: rows of `child_table` whose foreign relation
/// `navigation` points back here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRelation {
    pub name: String,
    pub child_table: String,
    pub navigation: String,
    /// Delete children when the parent is deleted
    pub cascade_delete: bool,
    /// Save pending child changes with the parent
    pub cascade_save: bool,
}

impl ChildRelation {
    pub fn new(
        name: impl Into<String>,
        child_table: impl Into<String>,
        navigation: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            child_table: child_table.into(),
            navigation: navigation.into(),
            cascade_delete: false,
            cascade_save: false,
        }
    }

    pub fn cascade_delete(mut self, cascade: bool) -> Self {
        self.cascade_delete = cascade;
        self
    }

    pub fn cascade_save(mut self, cascade: bool) -> Self {
        self.cascade_save = cascade;
        self
    }
}

/// How the whole-table view of a mapped type is retained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBehavior {
    /// Views live as long as some query handle holds them
    #[default]
    Lazy,
    /// The whole-table view is loaded eagerly and never dropped
    EagerRetain,
}

/// Mapping metadata of one table.
pub struct TableMapping {
    table: String,
    fields: Vec<FieldMapping>,
    foreign: Vec<ForeignRelation>,
    children: Vec<ChildRelation>,
    load_behavior: LoadBehavior,
    factory: Option<EntityFactory>,
    property_index: HashMap<String, usize>,
}

impl TableMapping {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(table: impl Into<String>) -> TableMappingBuilder {
        TableMappingBuilder {
            table: table.into(),
            fields: Vec::new(),
            foreign: Vec::new(),
            children: Vec::new(),
            load_behavior: LoadBehavior::Lazy,
            factory: None,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    pub fn field(&self, property: &str) -> Option<&FieldMapping> {
        self.field_index(property).map(|i| &self.fields[i])
    }

    /// Position of a field property in [`fields`](Self::fields).
    pub fn field_index(&self, property: &str) -> Option<usize> {
        self.property_index.get(property).copied()
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.key)
    }

    pub fn key_properties(&self) -> Vec<&str> {
        self.key_fields().map(|f| f.property.as_str()).collect()
    }

    pub fn foreign_relations(&self) -> &[ForeignRelation] {
        &self.foreign
    }

    pub fn foreign(&self, property: &str) -> Option<&ForeignRelation> {
        self.foreign.iter().find(|r| r.property == property)
    }

    /// Foreign relations that include the given local property.
    pub fn relations_using(&self, property: &str) -> impl Iterator<Item = &ForeignRelation> {
        self.foreign
            .iter()
            .filter(move |r| r.local_properties().any(|p| p == property))
    }

    pub fn children(&self) -> &[ChildRelation] {
        &self.children
    }

    pub fn load_behavior(&self) -> LoadBehavior {
        self.load_behavior
    }

    /// Extract the identity tuple of a row using the key columns.
    pub fn keys_from_row(&self, row: &Row) -> Result<MappedObjectKeys> {
        let mut values = Vec::new();
        for field in self.key_fields() {
            let value = row.get_by_name(&field.column).ok_or_else(|| {
                Error::mapping(
                    &self.table,
                    format!("result set has no key column '{}'", field.column),
                )
            })?;
            values.push(value.clone());
        }
        Ok(MappedObjectKeys::new(values))
    }

    /// Construct a blank instance in the `Created` state.
    pub fn create(self: &Arc<Self>) -> EntityRef {
        match &self.factory {
            Some(factory) => factory(self),
            None => Record::new(self),
        }
    }
}

impl fmt::Debug for TableMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableMapping")
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("foreign", &self.foreign)
            .field("children", &self.children)
            .field("load_behavior", &self.load_behavior)
            .field("custom_factory", &self.factory.is_some())
            .finish()
    }
}

/// Builder returned by [`TableMapping::new`].
pub struct TableMappingBuilder {
    table: String,
    fields: Vec<FieldMapping>,
    foreign: Vec<ForeignRelation>,
    children: Vec<ChildRelation>,
    load_behavior: LoadBehavior,
    factory: Option<EntityFactory>,
}

impl TableMappingBuilder {
    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    pub fn foreign(mut self, relation: ForeignRelation) -> Self {
        self.foreign.push(relation);
        self
    }

    pub fn child(mut self, relation: ChildRelation) -> Self {
        self.children.push(relation);
        self
    }

    pub fn load_behavior(mut self, behavior: LoadBehavior) -> Self {
        self.load_behavior = behavior;
        self
    }

    /// Override the default [`Record`] factory.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Arc<TableMapping>) -> EntityRef + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Validate the table-local rules and freeze the mapping.
    pub fn build(self) -> Result<Arc<TableMapping>> {
        let table = &self.table;
        if self.fields.iter().all(|f| !f.key) {
            return Err(Error::mapping(table, "at least one key field is required"));
        }

        let mut property_index = HashMap::new();
        for (i, field) in self.fields.iter().enumerate() {
            if property_index.insert(field.property.clone(), i).is_some() {
                return Err(Error::mapping(
                    table,
                    format!("duplicate property '{}'", field.property),
                ));
            }
        }

        let mut navigations = HashSet::new();
        for relation in &self.foreign {
            if property_index.contains_key(&relation.property) {
                return Err(Error::mapping(
                    table,
                    format!(
                        "foreign property '{}' shadows a field",
                        relation.property
                    ),
                ));
            }
            if !navigations.insert(relation.property.as_str()) {
                return Err(Error::mapping(
                    table,
                    format!("duplicate foreign property '{}'", relation.property),
                ));
            }
            if relation.columns.is_empty() {
                return Err(Error::mapping(
                    table,
                    format!("foreign property '{}' maps no columns", relation.property),
                ));
            }
            for local in relation.local_properties() {
                if !property_index.contains_key(local) {
                    return Err(Error::mapping(
                        table,
                        format!(
                            "foreign property '{}' uses unknown field '{}'",
                            relation.property, local
                        ),
                    ));
                }
            }
        }

        Ok(Arc::new(TableMapping {
            table: self.table,
            fields: self.fields,
            foreign: self.foreign,
            children: self.children,
            load_behavior: self.load_behavior,
            factory: self.factory,
            property_index,
        }))
    }
}

/// All mappings known to one store, keyed by table name.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    tables: RwLock<HashMap<String, Arc<TableMapping>>>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping, checking its relations against every table
    /// already known (and theirs against it).
    pub fn register(&self, mapping: Arc<TableMapping>) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(mapping.table()) {
            return Err(Error::mapping(mapping.table(), "table is already registered"));
        }

        for relation in mapping.foreign_relations() {
            let target = if relation.target == mapping.table() {
                Some(&mapping)
            } else {
                tables.get(&relation.target)
            };
            if let Some(target) = target {
                check_relation(&mapping, relation, target)?;
            }
        }
        for other in tables.values() {
            for relation in other.foreign_relations() {
                if relation.target == mapping.table() {
                    check_relation(other, relation, &mapping)?;
                }
            }
        }

        tracing::debug!(table = mapping.table(), "registered mapping");
        tables.insert(mapping.table().to_string(), mapping);
        Ok(())
    }

    pub fn get(&self, table: &str) -> Result<Arc<TableMapping>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::mapping(table, "table is not registered"))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.read().contains_key(table)
    }

    /// Names of every registered table.
    pub fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

fn check_relation(
    owner: &TableMapping,
    relation: &ForeignRelation,
    target: &TableMapping,
) -> Result<()> {
    let target_keys = target.key_properties();
    if target_keys.len() != relation.columns.len() {
        return Err(Error::mapping(
            owner.table(),
            format!(
                "foreign property '{}' maps {} columns but '{}' has {} key fields",
                relation.property,
                relation.columns.len(),
                target.table(),
                target_keys.len()
            ),
        ));
    }
    for ((_, target_property), key) in relation.columns.iter().zip(&target_keys) {
        if target_property != key {
            return Err(Error::mapping(
                owner.table(),
                format!(
                    "foreign property '{}' must map target key '{}' in order, found '{}'",
                    relation.property, key, target_property
                ),
            ));
        }
    }
    Ok(())
}
