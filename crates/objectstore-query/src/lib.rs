//! Query analysis and SQL translation for ObjectStore Rust.
//!
//! `objectstore-query` sits between the application's query chains and the
//! cache:
//!
//! - **Expressions**: `Expr` trees with a small builder DSL.
//! - **In-memory evaluation**: predicates and selectors compiled once into
//!   closures, with null-safe navigation.
//! - **Contexts**: `ContextRegistry` analyzes `QueryExpr` chains into shared
//!   `QueryContext`s, collapsing structurally equal queries.
//! - **Translation**: `SqlTranslator` and `select_command` render contexts
//!   as parameterized SQL with deduplicated joins.

pub mod clause;
pub mod compile;
pub mod context;
pub mod expr;
pub mod join;
pub mod select;
pub mod translate;

#[cfg(test)]
mod test_support;

pub use clause::{OrderDirection, OrderItem};
pub use compile::{Eval, Predicate, Selector, compile_predicate, compile_selector, evaluate_constant};
pub use context::{ContextRegistry, QueryContext, QueryExpr};
pub use expr::{BinaryOp, Captured, Expr, SqlFunction, UnaryOp};
pub use join::{Join, JoinSet, ROOT_ALIAS};
pub use select::select_command;
pub use translate::SqlTranslator;
