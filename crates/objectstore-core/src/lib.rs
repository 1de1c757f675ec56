//! Core types and traits for ObjectStore Rust.
//!
//! This crate provides the foundations every other layer builds on:
//!
//! - `Value`, `Row` and `ResultSet` for data moving to and from the database
//! - `MappedObjectKeys` identity tuples
//! - Declarative mapping metadata (`TableMapping` and friends)
//! - The `Fillable` capability of mapped objects and the generic `Record`
//! - `Command`/`CommandBuilder`/`Dialect` and the `DatabaseProvider` traits

pub mod cells;
pub mod command;
pub mod entity;
pub mod error;
pub mod keys;
pub mod mapping;
pub mod provider;
pub mod record;
pub mod row;
pub mod value;

pub use cells::{ForeignCell, ReadOnlyCell, ValueCell};
pub use command::{Command, CommandBuilder, Dialect};
pub use entity::{
    Change, ChangeListener, CommandKind, EntityRef, Fillable, ForeignResolver, ObjectId,
    ObjectSaver, ObjectState, object_id,
};
pub use error::{
    Error, PoolErrorKind, QueryErrorKind, Result, SaveError, TranslationError,
    TranslationErrorKind,
};
pub use keys::MappedObjectKeys;
pub use mapping::{
    ChildRelation, EntityFactory, FieldMapping, ForeignRelation, LoadBehavior, MappingRegistry,
    TableMapping, TableMappingBuilder,
};
pub use provider::{BufferedReader, DataReader, DatabaseProvider, DbConnection};
pub use record::Record;
pub use row::{ColumnInfo, FromValue, ResultSet, Row};
pub use value::Value;
