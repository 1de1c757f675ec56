//! Identity map and materialized views for ObjectStore Rust.
//!
//! Each mapped table gets one [`WeakCache`]:
//!
//! - **Identity map**: at most one live object per key, held weakly.
//! - **Views**: one [`ContextView`] per live query context, kept in sync
//!   with object mutations through property-based change routing.
//! - **Fills**: result sets are staged and applied atomically through
//!   [`FillCommit`].
//! - **Saves**: [`SaveBatch`] executes per-object commands through a
//!   [`CommandExecutor`] and commits or rolls back the batch as a whole,
//!   optionally deferred to a [`UnitOfWork`].

pub mod fill;
pub mod identity_map;
pub mod routing;
pub mod save;
pub mod unit_of_work;
pub mod view;

#[cfg(test)]
mod test_support;

pub use fill::FillCommit;
pub use identity_map::{DEFAULT_PRUNE_THRESHOLD, WeakCache};
pub use routing::ViewRoutes;
pub use save::{CommandExecutor, ExecOutcome, SaveBatch};
pub use unit_of_work::UnitOfWork;
pub use view::{CollectionChange, CollectionObserver, ContextView, PredicateErrors};
