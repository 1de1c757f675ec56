use std::sync::{Arc, Weak};

use objectstore_core::{
    ChildRelation, EntityRef, FieldMapping, ForeignResolver, MappedObjectKeys, Result, Row,
    TableMapping, Value,
};

/// A resolver for tables without relations.
pub(crate) struct NoResolver;

impl NoResolver {
    pub(crate) fn shared() -> Arc<NoResolver> {
        Arc::new(NoResolver)
    }

    pub(crate) fn weak(resolver: &Arc<NoResolver>) -> Weak<dyn ForeignResolver> {
        let resolver: Arc<dyn ForeignResolver> = resolver.clone();
        Arc::downgrade(&resolver)
    }
}

impl ForeignResolver for NoResolver {
    fn resolve(&self, _table: &str, _keys: &MappedObjectKeys) -> Result<Option<EntityRef>> {
        Ok(None)
    }

    fn children(&self, _parent: &EntityRef, _relation: &ChildRelation) -> Result<Vec<EntityRef>> {
        Ok(Vec::new())
    }
}

pub(crate) fn users() -> Arc<TableMapping> {
    TableMapping::new("users")
        .field(FieldMapping::new("id").key(true))
        .field(FieldMapping::new("name"))
        .field(FieldMapping::new("age"))
        .build()
        .unwrap()
}

pub(crate) fn user_row(id: i64, name: &str, age: i64) -> Row {
    Row::new(
        vec!["id".into(), "name".into(), "age".into()],
        vec![Value::BigInt(id), Value::from(name), Value::BigInt(age)],
    )
}

/// An object in the `Original` state built from one row.
pub(crate) fn loaded(mapping: &Arc<TableMapping>, id: i64, name: &str, age: i64) -> EntityRef {
    let object = mapping.create();
    object.fill(&user_row(id, name, age)).unwrap();
    object.commit(false).unwrap();
    object
}
