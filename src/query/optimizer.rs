//! Cost-based join-order search for one query block.
//!
//! The search places tables depth first in ascending table order. Each
//! placement receives the predicates that become evaluable at that point,
//! walks its access paths and keeps the cheapest; a prefix already dearer
//! than the best complete order is abandoned. The winning order is then
//! finalized into a [`QueryPlan`].

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::config::OptimizerConfig;
use crate::error::{PlanError, Result};
use crate::query::access_path::AccessPath;
use crate::query::cost::CostEstimate;
use crate::query::explain::{build_explain_tree, compute_plan_hash, ExplainNode};
use crate::query::join_strategy::JoinStrategy;
use crate::query::metadata::{MetadataProvider, TableDescriptor};
use crate::query::optimizable::{unique_join_for, BaseTable, CostContext, Existence, PlanType};
use crate::query::ordering::{Direction, RowOrdering};
use crate::query::predicate_list::PredicateList;
use crate::query::table_map::TableMap;
use crate::types::{ColumnNumber, ColumnRef, EquivalenceClass, TableNumber};

/// Per-compilation state shared by every query block.
#[derive(Debug, Default)]
pub struct CompilationContext {
    next_class: u32,
}

impl CompilationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A class number not handed out before in this compilation.
    pub fn next_equivalence_class(&mut self) -> EquivalenceClass {
        let class = EquivalenceClass(self.next_class);
        self.next_class += 1;
        class
    }
}

#[derive(Clone, Debug)]
struct OuterTable {
    number: TableNumber,
    descriptor: Arc<TableDescriptor>,
    single_scan_row_count: f64,
}

/// Snapshot of the join prefix ahead of the table being costed.
#[derive(Clone, Debug)]
pub struct OuterTables {
    tables: Vec<OuterTable>,
    row_count: f64,
}

impl Default for OuterTables {
    fn default() -> Self {
        Self::new()
    }
}

impl OuterTables {
    /// The empty prefix: no tables, one row.
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            row_count: 1.0,
        }
    }

    /// Appends a placed table using its best access path so far.
    pub fn push(&mut self, table: &BaseTable) {
        self.tables.push(OuterTable {
            number: table.number(),
            descriptor: Arc::clone(table.descriptor()),
            single_scan_row_count: table.best_access_path().cost_estimate().single_scan_row_count(),
        });
    }

    /// Sets the number of rows the prefix produces.
    pub fn with_row_count(mut self, row_count: f64) -> Self {
        self.row_count = row_count;
        self
    }

    /// Product of the unique-join row counts of the outer tables whose
    /// unique keys `preds` fully bind, divided by the prefix row count;
    /// -1 when no outer table is bound that way.
    pub fn unique_join_with_outer_table(&self, preds: &PredicateList) -> f64 {
        let mut unique_keys = 1.0;
        for outer in self.tables.iter().rev() {
            let keys = unique_join_for(
                outer.number,
                &outer.descriptor,
                outer.single_scan_row_count,
                preds,
            );
            if keys > 0.0 {
                unique_keys *= keys;
            }
        }
        if unique_keys != 1.0 && self.row_count > 0.0 {
            unique_keys / self.row_count
        } else {
            -1.0
        }
    }
}

/// Answer of a [`RequiredRowOrdering`] for a join prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortRequirement {
    NothingRequired,
    SortRequired,
}

/// An ordering the query's consumer needs, such as ORDER BY.
pub trait RequiredRowOrdering: Send + Sync {
    /// Whether rows produced in `ordering` by the tables in `assigned`
    /// still need a sort.
    fn sort_required(&self, ordering: &RowOrdering, assigned: &TableMap) -> SortRequirement;
    /// Cost of sorting `rows` rows.
    fn estimate_sort_cost(&self, rows: f64) -> f64;
}

/// ORDER BY over plain columns.
#[derive(Clone, Debug)]
pub struct OrderByColumns {
    columns: Vec<(ColumnRef, Direction)>,
    row_cost: f64,
}

impl OrderByColumns {
    pub fn new(columns: impl IntoIterator<Item = (ColumnRef, Direction)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
            row_cost: 0.1,
        }
    }

    /// Cost per row and comparison level of the external sort.
    pub fn with_row_cost(mut self, row_cost: f64) -> Self {
        self.row_cost = row_cost;
        self
    }
}

impl RequiredRowOrdering for OrderByColumns {
    fn sort_required(&self, ordering: &RowOrdering, assigned: &TableMap) -> SortRequirement {
        let mut position = 0;
        for (idx, (col, direction)) in self.columns.iter().enumerate() {
            if !assigned.contains(col.table) {
                // Later tables can still deliver the rest unless an
                // already placed table shows up again, as in ORDER BY s.a, t.b, s.c.
                let placed_again = self.columns[idx + 1..]
                    .iter()
                    .any(|(c, _)| assigned.contains(c.table));
                return if placed_again {
                    SortRequirement::SortRequired
                } else {
                    SortRequirement::NothingRequired
                };
            }
            if ordering.always_ordered(col.table) || ordering.is_constant_column(col.table, col.column) {
                continue;
            }
            if !ordering.ordered_on_column_at(*direction, position, col.table, col.column) {
                return SortRequirement::SortRequired;
            }
            position += 1;
        }
        SortRequirement::NothingRequired
    }

    fn estimate_sort_cost(&self, rows: f64) -> f64 {
        if rows <= 1.0 {
            return 0.0;
        }
        rows * rows.log2() * self.row_cost
    }
}

/// How one table is read in the final plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TablePlan {
    pub table: TableNumber,
    pub name: String,
    pub access_path: AccessPath,
    /// Predicates evaluated by the scan itself, in key order.
    pub store_restrictions: PredicateList,
    /// Hash join probes evaluated after the build side is read.
    pub non_store_restrictions: PredicateList,
    /// Predicates re-checked against base rows fetched through a non-covering index.
    pub requalification: PredicateList,
    /// Pushed predicates the access path cannot use.
    pub residual: PredicateList,
    /// Columns the hash table is keyed on; empty for nested loop.
    pub hash_key_columns: Vec<ColumnNumber>,
}

/// Outcome of optimizing one query block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryPlan {
    /// Tables in join order, outermost first.
    pub tables: Vec<TablePlan>,
    pub cost: CostEstimate,
    pub plan_type: PlanType,
    /// Whether an explicit sort still has to run on top of the joins.
    pub sort_required: bool,
    /// Predicates that could not be pushed to any table.
    pub remaining_predicates: PredicateList,
    pub explain: ExplainNode,
    pub plan_hash: u64,
}

impl QueryPlan {
    pub fn join_order(&self) -> Vec<TableNumber> {
        self.tables.iter().map(|plan| plan.table).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Tables and WHERE-clause conjuncts of one SELECT.
#[derive(Clone, Debug)]
pub struct QueryBlock {
    tables: Vec<BaseTable>,
    predicates: PredicateList,
}

impl QueryBlock {
    /// Tables must be numbered 0, 1, 2... in FROM-list order.
    pub fn new(tables: Vec<BaseTable>, predicates: PredicateList) -> Result<Self> {
        if let Some((idx, table)) = tables
            .iter()
            .enumerate()
            .find(|(idx, table)| table.number().0 as usize != *idx)
        {
            return Err(PlanError::InvalidArgument(format!(
                "table {} found at FROM-list position {idx}",
                table.number()
            )));
        }
        Ok(Self { tables, predicates })
    }

    pub fn tables(&self) -> &[BaseTable] {
        &self.tables
    }

    pub fn predicates(&self) -> &PredicateList {
        &self.predicates
    }

    /// Derives the predicates implied by transitivity before the search.
    pub fn preprocess(&mut self, ctx: &mut CompilationContext) {
        let num_tables = self.tables.len();
        if num_tables > 1 {
            let not_exists: TableMap = self
                .tables
                .iter()
                .filter(|table| table.existence() == Existence::NotExists)
                .map(BaseTable::number)
                .collect();
            self.predicates
                .join_clause_transitive_closure(num_tables, &not_exists, ctx);
        }
        let hash_join_specified = self
            .tables
            .iter()
            .any(|table| table.properties().join_strategy == Some(JoinStrategy::Hash));
        self.predicates
            .search_clause_transitive_closure(num_tables, hash_join_specified);
    }
}

/// Cost-based optimizer for query blocks.
pub struct Optimizer {
    config: OptimizerConfig,
    metadata: Arc<dyn MetadataProvider>,
    required_ordering: Option<Box<dyn RequiredRowOrdering>>,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            config,
            metadata,
            required_ordering: None,
        }
    }

    /// Makes the search weigh plans that deliver `ordering` without a sort.
    pub fn with_required_ordering(mut self, ordering: impl RequiredRowOrdering + 'static) -> Self {
        self.required_ordering = Some(Box::new(ordering));
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Preprocesses and optimizes `block`.
    pub fn optimize(&self, block: &mut QueryBlock, ctx: &mut CompilationContext) -> Result<QueryPlan> {
        if block.tables.is_empty() {
            return Err(PlanError::InvalidArgument("query block has no tables".into()));
        }
        self.config.validate()?;
        block.preprocess(ctx);

        let required = self.required_ordering.as_deref();
        let (best, join_orders) = {
            let mut search = Search {
                tables: &mut block.tables,
                predicates: &mut block.predicates,
                metadata: self.metadata.as_ref(),
                config: &self.config,
                required,
                order: Vec::new(),
                assigned: TableMap::new(),
                join_orders: 0,
                best: None,
                stopped: false,
            };
            let start = Prefix {
                normal: CostEstimate::outermost(),
                sort_avoidance: required.map(|_| CostEstimate::outermost()),
                ordering: RowOrdering::new(),
            };
            search.search(&start)?;
            (search.best, search.join_orders)
        };
        let Some(best) = best else {
            debug!(join_orders, "optimizer.no_best_plan");
            return Err(PlanError::NoBestPlan);
        };
        info!(
            order = ?best.order,
            cost = best.cost.cost(),
            rows = best.cost.row_count(),
            join_orders,
            "optimizer.best_plan"
        );
        self.modify_access_paths(block, &best)
    }

    /// Pushes predicates along the chosen join order and finalizes every table.
    fn modify_access_paths(&self, block: &mut QueryBlock, best: &BestPlan) -> Result<QueryPlan> {
        let mut assigned = TableMap::new();
        let mut plans = Vec::with_capacity(best.order.len());
        for &idx in &best.order {
            let table = &mut block.tables[idx];
            assigned.insert(table.number());
            for pred in block
                .predicates
                .drain_where(|pred| pred.is_pushable() && assigned.contains_all(pred.referenced_tables()))
            {
                table.push_opt_predicate(pred);
            }
            plans.push(table.finalize()?);
        }
        let remaining_predicates = std::mem::take(&mut block.predicates);
        let sort_required = self.required_ordering.is_some() && best.plan_type == PlanType::Normal;
        let explain = build_explain_tree(&plans, &best.cost, sort_required);
        let plan_hash = compute_plan_hash(&explain);
        Ok(QueryPlan {
            tables: plans,
            cost: best.cost,
            plan_type: best.plan_type,
            sort_required,
            remaining_predicates,
            explain,
            plan_hash,
        })
    }
}

#[derive(Clone, Debug)]
struct BestPlan {
    order: Vec<usize>,
    cost: CostEstimate,
    plan_type: PlanType,
}

/// Accumulated state after placing a join prefix.
#[derive(Clone, Debug)]
struct Prefix {
    normal: CostEstimate,
    /// Cost when every table so far reads in the required order.
    sort_avoidance: Option<CostEstimate>,
    ordering: RowOrdering,
}

struct Search<'a> {
    tables: &'a mut [BaseTable],
    predicates: &'a mut PredicateList,
    metadata: &'a dyn MetadataProvider,
    config: &'a OptimizerConfig,
    required: Option<&'a dyn RequiredRowOrdering>,
    order: Vec<usize>,
    assigned: TableMap,
    join_orders: u64,
    best: Option<BestPlan>,
    stopped: bool,
}

impl Search<'_> {
    fn search(&mut self, prefix: &Prefix) -> Result<()> {
        let position = self.order.len();
        for idx in 0..self.tables.len() {
            if self.stopped {
                break;
            }
            let number = self.tables[idx].number();
            if self.assigned.contains(number) || !self.tables[idx].legal_join_order(&self.assigned) {
                continue;
            }
            self.place(idx);
            if let Some(next) = self.cost_position(idx, prefix)? {
                if position + 1 == self.tables.len() {
                    self.complete(&next);
                } else if self.exceeds_best(&next) {
                    trace!(order = ?self.order, cost = next.normal.cost(), "optimizer.prune");
                } else {
                    self.search(&next)?;
                }
            }
            self.unplace(idx);
        }
        Ok(())
    }

    /// Places the table and hands it every predicate that just became evaluable.
    fn place(&mut self, idx: usize) {
        let number = self.tables[idx].number();
        self.assigned.insert(number);
        self.order.push(idx);
        let assigned = &self.assigned;
        for pred in self
            .predicates
            .drain_where(|pred| pred.is_pushable() && assigned.contains_all(pred.referenced_tables()))
        {
            self.tables[idx].push_opt_predicate(pred);
        }
    }

    fn unplace(&mut self, idx: usize) {
        self.tables[idx].pull_opt_predicates(self.predicates);
        self.assigned.remove(self.tables[idx].number());
        self.order.pop();
    }

    /// Walks the access paths of the table just placed; `None` when none
    /// of them is feasible.
    fn cost_position(&mut self, idx: usize, prefix: &Prefix) -> Result<Option<Prefix>> {
        let mut outer = OuterTables::new().with_row_count(prefix.normal.row_count());
        for &placed in &self.order[..self.order.len() - 1] {
            outer.push(&self.tables[placed]);
        }
        let ctx = CostContext {
            metadata: self.metadata,
            config: self.config,
            outer: &outer,
        };
        let can_avoid_sort = self.required.is_some() && prefix.sort_avoidance.is_some();

        let table = &mut self.tables[idx];
        table.start_optimizing();
        let mut ordering = prefix.ordering.clone();
        let mut sort_avoiding_ordering = None;
        while table.advance(&mut ordering)? {
            if !table.feasible_join_strategy(table.restriction_list()) {
                trace!(table = %table.number(), strategy = ?table.current_access_path().join_strategy(), "optimizer.infeasible_strategy");
                continue;
            }
            let estimate = table.optimize_it(&prefix.normal, &mut ordering, &ctx)?;
            if !table.memory_usage_ok(self.config.max_memory_per_table) {
                trace!(table = %table.number(), "optimizer.skip_memory");
                continue;
            }
            let avoids_sort = can_avoid_sort
                && self
                    .required
                    .map(|required| required.sort_required(&ordering, &self.assigned))
                    == Some(SortRequirement::NothingRequired);
            if table.remember_if_cheaper(&estimate, avoids_sort) {
                sort_avoiding_ordering = Some(ordering.clone());
            }
        }

        let best = *table.best_access_path().cost_estimate();
        if best.is_max() {
            debug!(table = %table.number(), "optimizer.no_feasible_access_path");
            return Ok(None);
        }
        let normal = CostEstimate::new(
            prefix.normal.cost() + best.cost(),
            best.row_count(),
            best.single_scan_row_count(),
        );
        let sort_avoidance = match prefix.sort_avoidance {
            Some(outer_cost) if table.consider_sort_avoidance_path() => {
                let path = table.best_sort_avoidance_path().cost_estimate();
                Some(CostEstimate::new(
                    outer_cost.cost() + path.cost(),
                    path.row_count(),
                    path.single_scan_row_count(),
                ))
            }
            _ => None,
        };
        Ok(Some(Prefix {
            normal,
            sort_avoidance,
            ordering: sort_avoiding_ordering.unwrap_or(ordering),
        }))
    }

    fn exceeds_best(&self, prefix: &Prefix) -> bool {
        let Some(best) = &self.best else {
            return false;
        };
        let limit = best.cost.cost();
        prefix.normal.cost() > limit && prefix.sort_avoidance.map_or(true, |cost| cost.cost() > limit)
    }

    fn complete(&mut self, prefix: &Prefix) {
        self.join_orders += 1;
        let (cost, plan_type) = match self.required {
            None => (prefix.normal, PlanType::Normal),
            Some(required) => {
                let sort_cost = required.estimate_sort_cost(prefix.normal.row_count());
                let sorted = CostEstimate::new(
                    prefix.normal.cost() + sort_cost,
                    prefix.normal.row_count(),
                    prefix.normal.single_scan_row_count(),
                );
                match prefix.sort_avoidance {
                    Some(avoiding) if avoiding.compare(&sorted) != Ordering::Greater => {
                        (avoiding, PlanType::SortAvoidance)
                    }
                    _ => (sorted, PlanType::Normal),
                }
            }
        };
        trace!(order = ?self.order, cost = cost.cost(), plan = ?plan_type, "optimizer.complete_join_order");

        let improves = self
            .best
            .as_ref()
            .map_or(true, |best| cost.compare(&best.cost) == Ordering::Less);
        if improves {
            for &idx in &self.order {
                self.tables[idx].remember_as_best(plan_type);
            }
            debug!(order = ?self.order, cost = cost.cost(), "optimizer.new_best_join_order");
            self.best = Some(BestPlan {
                order: self.order.clone(),
                cost,
                plan_type,
            });
        }
        if let Some(max) = self.config.max_join_orders {
            if self.join_orders >= max {
                debug!(join_orders = self.join_orders, "optimizer.join_order_cap");
                self.stopped = true;
            }
        }
    }
}
