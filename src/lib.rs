//! Access-path selection for a relational query optimizer.
//!
//! Given the base tables of a query block, their catalog descriptors and
//! the WHERE-clause conjuncts, [`Optimizer`] chooses a join order and, for
//! each table, a conglomerate, join strategy and lock mode, then assigns
//! every predicate to the place in the plan where it is evaluated.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use accesspath::query::metadata::{ConglomerateDescriptor, InMemoryCostController, InMemoryMetadata, TableDescriptor};
//! use accesspath::types::{ConglomId, TableNumber};
//! use accesspath::{BaseTable, CompilationContext, Optimizer, OptimizerConfig, PredicateList, QueryBlock};
//!
//! let table = Arc::new(
//!     TableDescriptor::new("T")
//!         .with_column("A", 4)
//!         .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(1), "T")),
//! );
//! let metadata = InMemoryMetadata::new().with_controller(ConglomId(1), InMemoryCostController::new(100.0));
//! let mut block = QueryBlock::new(vec![BaseTable::new(TableNumber(0), table)], PredicateList::new())?;
//! let plan = Optimizer::new(OptimizerConfig::default(), Arc::new(metadata))
//!     .optimize(&mut block, &mut CompilationContext::new())?;
//! println!("{}", plan.to_json()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod query;
pub mod types;

pub use config::{ConfigError, OptimizerConfig};
pub use error::{PlanError, Result};
pub use query::{
    AccessPath, BaseTable, CompilationContext, CostEstimate, Direction, Existence, JoinStrategy,
    LockMode, Optimizer, OrderByColumns, PlanType, Predicate, PredicateList, QueryBlock, QueryPlan,
    RequiredRowOrdering, RowOrdering, SortRequirement, TablePlan, TableProperties,
};
