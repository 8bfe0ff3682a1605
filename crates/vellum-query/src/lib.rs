//! Query layer for the vellum document store.
//!
//! The fluent [`QueryBuilder`] accumulates a backend-independent
//! [`QueryPlan`]; the [`sql`] module compiles plans and document mutations
//! into parameterized SQLite statements; [`ddl`] generates the per-collection
//! schema statements.

pub mod builder;
pub mod ddl;
pub mod plan;
pub mod sql;

// Re-exports for convenience.
pub use builder::{FieldBuilder, OrBranchBuilder, QueryBuilder, QueryExecutor};
pub use plan::{FilterLeaf, FilterNode, FilterOp, FilterTree, FilterValue, QueryPlan, SortDir};
pub use sql::SqlValue;
