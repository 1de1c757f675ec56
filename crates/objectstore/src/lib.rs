//! ObjectStore - object-relational mapping with a live identity map.
//!
//! ObjectStore maps tables onto tracked objects and keeps every query result
//! current as objects change:
//!
//! - At most one live object per key and table (weak identity map)
//! - Materialized views that re-evaluate membership and order on every change
//! - Query chains translated to SQL, with null-safe in-memory evaluation
//! - Commands from concurrent callers batched into one round trip per
//!   connection string
//! - Save batches that roll back every object when one of them fails
//!
//! # Quick Start
//!
//! ```ignore
//! use objectstore::prelude::*;
//!
//! let store = ObjectStore::new(provider, StoreConfig::new("file:app.db"));
//! store.register(
//!     TableMapping::new("users")
//!         .field(FieldMapping::new("id").key(true).generated(true))
//!         .field(FieldMapping::new("name"))
//!         .field(FieldMapping::new("age"))
//!         .build()?,
//! )?;
//!
//! // Query
//! let adults = store
//!     .query("users")?
//!     .filter(Expr::field("age").ge(18))?
//!     .order_by(Expr::field("name"))?;
//! for user in adults.items()? {
//!     println!("{}", user.get("name")?);
//! }
//!
//! // Create and save
//! let user = store.create("users")?;
//! user.set("name", "Ada".into())?;
//! user.set("age", 36.into())?;
//! adults.save()?; // the new user matches, so the view saves it
//!
//! // Delete
//! adults.filter(Expr::field("name").eq("Ada"))?.delete()?;
//! adults.save()?;
//! ```

pub mod config;
pub mod query;
pub mod store;
pub mod worker;

pub use config::StoreConfig;
pub use query::Query;
pub use store::ObjectStore;
pub use worker::{DatabaseWorker, FetchHandle};

pub use objectstore_cache::{
    CollectionChange, CollectionObserver, CommandExecutor, ContextView, ExecOutcome, FillCommit,
    SaveBatch, UnitOfWork, WeakCache,
};
pub use objectstore_core::{
    BufferedReader, ChildRelation, Command, CommandBuilder, CommandKind, DataReader,
    DatabaseProvider, DbConnection, Dialect, EntityRef, Error, FieldMapping, Fillable,
    ForeignRelation, LoadBehavior, MappedObjectKeys, MappingRegistry, ObjectState, PoolErrorKind,
    QueryErrorKind, Record, Result, ResultSet, Row, SaveError, TableMapping, TranslationErrorKind,
    Value,
};
pub use objectstore_pool::{ConnectionPool, Pending, PoolConfig, PoolStats, WorkerQueue};
pub use objectstore_query::{Expr, OrderDirection, QueryContext, QueryExpr, SqlFunction};

/// Common imports.
///
/// ```ignore
/// use objectstore::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        ChildRelation, CollectionChange, DatabaseProvider, EntityRef, Error, Expr, FieldMapping,
        Fillable, ForeignRelation, LoadBehavior, MappedObjectKeys, ObjectState, ObjectStore,
        PoolConfig, Query, QueryExpr, Result, Row, StoreConfig, TableMapping, UnitOfWork, Value,
    };
}
