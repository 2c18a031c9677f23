#![forbid(unsafe_code)]

//! Access-path selection and join ordering for a query block.
//!
//! This module provides the predicate bookkeeping, cost model and
//! join-order search that turn a block of base tables and WHERE-clause
//! conjuncts into a costed plan.

/// Constant values appearing in predicates.
pub mod value;

/// Sets of table numbers.
pub mod table_map;

/// Boolean conditions over columns and constants.
///
/// Knows which index keys a condition can serve and how selective it is.
pub mod expr;

/// A WHERE-clause conjunct and the roles it plays in a scan.
pub mod predicate;

/// Ordered predicate lists with start, stop and qualifier counters.
pub mod predicate_list;

/// Transitive closure and redundancy removal over predicate lists.
pub mod closure;

/// Statistics-driven selectivity of a table's predicates.
pub mod selectivity;

/// Cost estimates.
pub mod cost;

/// Sort order produced by a join prefix.
pub mod ordering;

/// Conglomerate, join strategy and lock mode chosen for a table.
pub mod access_path;

/// Join strategies and how they split predicates.
pub mod join_strategy;

/// Catalog and store cost interfaces.
///
/// Describes tables and their conglomerates, and estimates the cost of
/// reading them.
pub mod metadata;

/// A base table enumerating and costing its access paths.
pub mod optimizable;

/// Join-order search and the resulting plan.
pub mod optimizer;

/// Explain trees and plan hashes.
pub mod explain;

pub use access_path::{AccessPath, LockMode};
pub use cost::CostEstimate;
pub use join_strategy::JoinStrategy;
pub use optimizable::{BaseTable, Existence, PlanType, TableProperties};
pub use optimizer::{
    CompilationContext, OrderByColumns, Optimizer, QueryBlock, QueryPlan, RequiredRowOrdering,
    SortRequirement, TablePlan,
};
pub use ordering::{Direction, RowOrdering};
pub use predicate::Predicate;
pub use predicate_list::PredicateList;
