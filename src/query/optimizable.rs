//! A base table as seen by the join-order search.
//!
//! [`BaseTable`] walks the table's candidate access paths one at a time
//! (every conglomerate crossed with every join strategy, narrowed by user
//! hints), costs each against the predicates pushed to it, and remembers
//! the cheapest. Once the search settles on a join order, [`BaseTable::finalize`]
//! hands the winning path's predicates to the scan.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::OptimizerConfig;
use crate::error::{internal, Result};
use crate::query::access_path::{AccessPath, LockMode};
use crate::query::cost::CostEstimate;
use crate::query::expr::Condition;
use crate::query::join_strategy::JoinStrategy;
use crate::query::metadata::{
    ConglomerateDescriptor, MetadataProvider, ScanCostRequest, StoreCostController, TableDescriptor,
};
use crate::query::optimizer::{OuterTables, TablePlan};
use crate::query::ordering::{Direction, RowOrdering};
use crate::query::predicate::Predicate;
use crate::query::predicate_list::PredicateList;
use crate::query::table_map::TableMap;
use crate::query::value::Value;
use crate::types::{ColumnNumber, TableNumber};

/// Extra bytes per hashed row for the row location of a non-covering index.
const ROW_LOCATION_WIDTH: f64 = 12.0;

/// Optimizer hints attached to a table reference.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Forces the named index; `"NULL"` forces a heap scan.
    pub index: Option<String>,
    /// Forces the index backing the named constraint.
    pub constraint: Option<String>,
    /// Restricts the search to one join strategy.
    pub join_strategy: Option<JoinStrategy>,
}

/// Whether the table was flattened out of an EXISTS or NOT EXISTS subquery.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Existence {
    #[default]
    Plain,
    Exists,
    NotExists,
}

/// Which remembered path becomes the table's final choice.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanType {
    Normal,
    SortAvoidance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cursor {
    NoConglomerate,
    /// Position in the table's conglomerate list; join strategies cycle here.
    Conglomerate(usize),
    Exhausted,
}

/// Everything cost estimation reads besides the table and its predicates.
#[derive(Clone, Copy)]
pub struct CostContext<'a> {
    pub metadata: &'a dyn MetadataProvider,
    pub config: &'a OptimizerConfig,
    /// Tables already placed ahead of this one in the join order.
    pub outer: &'a OuterTables,
}

/// A base table taking part in join-order search.
#[derive(Clone, Debug)]
pub struct BaseTable {
    number: TableNumber,
    descriptor: Arc<TableDescriptor>,
    properties: TableProperties,
    referenced_columns: Vec<ColumnNumber>,
    for_update: bool,
    existence: Existence,
    dependencies: TableMap,
    cursor: Cursor,
    next_strategy: usize,
    current: AccessPath,
    best: AccessPath,
    best_sort_avoidance: AccessPath,
    truly_best: AccessPath,
    consider_sort_avoidance: bool,
    restriction_list: PredicateList,
    single_scan_row_count: f64,
    statistics_refresh_checked: bool,
}

impl BaseTable {
    pub fn new(number: TableNumber, descriptor: Arc<TableDescriptor>) -> Self {
        Self {
            number,
            descriptor,
            properties: TableProperties::default(),
            referenced_columns: Vec::new(),
            for_update: false,
            existence: Existence::Plain,
            dependencies: TableMap::new(),
            cursor: Cursor::NoConglomerate,
            next_strategy: 0,
            current: AccessPath::new(),
            best: AccessPath::new(),
            best_sort_avoidance: AccessPath::new(),
            truly_best: AccessPath::new(),
            consider_sort_avoidance: false,
            restriction_list: PredicateList::new(),
            single_scan_row_count: 0.0,
            statistics_refresh_checked: false,
        }
    }

    pub fn with_properties(mut self, properties: TableProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Columns the query reads from this table; decides index coverage.
    pub fn with_referenced_columns(mut self, columns: impl IntoIterator<Item = u16>) -> Self {
        self.referenced_columns = columns.into_iter().map(ColumnNumber).collect();
        self.referenced_columns.sort_unstable();
        self.referenced_columns.dedup();
        self
    }

    pub fn with_for_update(mut self, for_update: bool) -> Self {
        self.for_update = for_update;
        self
    }

    /// Marks the table as the body of a flattened EXISTS that correlates
    /// with `dependencies`.
    pub fn with_exists(mut self, dependencies: TableMap) -> Self {
        self.existence = Existence::Exists;
        self.dependencies = dependencies;
        self
    }

    /// Marks the table as the body of a flattened NOT EXISTS.
    pub fn with_not_exists(mut self, dependencies: TableMap) -> Self {
        self.existence = Existence::NotExists;
        self.dependencies = dependencies;
        self
    }

    pub fn number(&self) -> TableNumber {
        self.number
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<TableDescriptor> {
        &self.descriptor
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub fn existence(&self) -> Existence {
        self.existence
    }

    pub fn current_access_path(&self) -> &AccessPath {
        &self.current
    }

    pub fn best_access_path(&self) -> &AccessPath {
        &self.best
    }

    pub fn best_sort_avoidance_path(&self) -> &AccessPath {
        &self.best_sort_avoidance
    }

    pub fn truly_the_best_access_path(&self) -> &AccessPath {
        &self.truly_best
    }

    pub fn restriction_list(&self) -> &PredicateList {
        &self.restriction_list
    }

    /// Whether the best path found so far also delivers rows in the
    /// required order.
    pub fn consider_sort_avoidance_path(&self) -> bool {
        self.consider_sort_avoidance
    }

    /// Rows one scan of the last costed path yields.
    pub fn single_scan_row_count(&self) -> f64 {
        self.single_scan_row_count
    }

    /// Starts a fresh walk over the access paths for a new join position.
    pub fn start_optimizing(&mut self) {
        self.cursor = Cursor::NoConglomerate;
        self.next_strategy = 0;
        self.current.reset();
        self.best.reset();
        self.best_sort_avoidance.reset();
        self.consider_sort_avoidance = false;
        self.single_scan_row_count = 0.0;
    }

    /// Advances to the next candidate access path.
    ///
    /// Join strategies cycle fastest; when they run out the next
    /// conglomerate is taken, unless a hint pins the conglomerate. The
    /// table's previous contribution to `ordering` is replaced by what the
    /// new conglomerate guarantees. Returns `false` once every candidate
    /// has been produced.
    pub fn next_access_path(&mut self, preds: &PredicateList, ordering: &mut RowOrdering) -> Result<bool> {
        ordering.remove_optimizable(self.number);

        let next = match self.cursor {
            Cursor::Exhausted => None,
            Cursor::NoConglomerate => {
                let first = self.first_conglomerate()?;
                if first.is_some() {
                    self.reset_join_strategies();
                    self.next_join_strategy();
                }
                first
            }
            Cursor::Conglomerate(idx) => {
                if self.next_join_strategy() {
                    Some(idx)
                } else if self.conglomerate_forced() {
                    None
                } else {
                    let following = idx + 1;
                    if following < self.descriptor.conglomerates().len() {
                        self.reset_join_strategies();
                        self.next_join_strategy();
                        Some(following)
                    } else {
                        None
                    }
                }
            }
        };

        let Some(idx) = next else {
            self.cursor = Cursor::Exhausted;
            self.current.set_conglomerate(None);
            trace!(table = %self.number, "optimizer.next_access_path.exhausted");
            return Ok(false);
        };
        let conglomerate = Arc::clone(&self.descriptor.conglomerates()[idx]);
        self.cursor = Cursor::Conglomerate(idx);
        self.tell_row_ordering_about_constant_columns(preds, ordering);
        self.describe_ordering(&conglomerate, preds, ordering);
        trace!(
            table = %self.number,
            conglomerate = %conglomerate.name(),
            strategy = ?self.current.join_strategy(),
            "optimizer.next_access_path"
        );
        self.current.set_conglomerate(Some(conglomerate));
        Ok(true)
    }

    fn conglomerate_forced(&self) -> bool {
        self.properties.index.is_some() || self.properties.constraint.is_some()
    }

    fn first_conglomerate(&self) -> Result<Option<usize>> {
        let conglomerates = self.descriptor.conglomerates();
        if let Some(name) = &self.properties.index {
            let found = if name.eq_ignore_ascii_case("NULL") {
                conglomerates.iter().position(|cd| !cd.is_index())
            } else {
                conglomerates.iter().position(|cd| cd.name() == name)
            };
            return found.map(Some).ok_or_else(|| {
                internal(format!(
                    "index {name} requested for table {} does not exist",
                    self.descriptor.name()
                ))
            });
        }
        if let Some(name) = &self.properties.constraint {
            return conglomerates
                .iter()
                .position(|cd| cd.constraint_name() == Some(name.as_str()))
                .map(Some)
                .ok_or_else(|| {
                    internal(format!(
                        "constraint {name} requested for table {} has no backing conglomerate",
                        self.descriptor.name()
                    ))
                });
        }
        Ok((!conglomerates.is_empty()).then_some(0))
    }

    fn reset_join_strategies(&mut self) {
        self.next_strategy = 0;
        self.current.set_join_strategy(None);
    }

    fn next_join_strategy(&mut self) -> bool {
        if let Some(forced) = self.properties.join_strategy {
            if self.current.join_strategy().is_some() {
                self.current.set_join_strategy(None);
                return false;
            }
            self.current.set_join_strategy(Some(forced));
            return true;
        }
        match JoinStrategy::ALL.get(self.next_strategy) {
            Some(strategy) => {
                self.current.set_join_strategy(Some(*strategy));
                self.next_strategy += 1;
                true
            }
            None => false,
        }
    }

    fn tell_row_ordering_about_constant_columns(&self, preds: &PredicateList, ordering: &mut RowOrdering) {
        for pred in preds.iter() {
            if let Some(col) = pred.condition().equals_constant_column(self.number) {
                ordering.column_always_ordered(self.number, col.column);
            }
        }
    }

    fn describe_ordering(
        &self,
        conglomerate: &ConglomerateDescriptor,
        preds: &PredicateList,
        ordering: &mut RowOrdering,
    ) {
        let Some(index) = conglomerate.index_descriptor() else {
            if self.is_one_row_result_set(preds) {
                ordering.optimizable_always_ordered(self.number);
            } else {
                ordering.add_unordered_optimizable(self.number);
            }
            return;
        };
        for (position, column) in index.base_column_positions().iter().enumerate() {
            let direction = if index.is_ascending(position) {
                Direction::Ascending
            } else {
                Direction::Descending
            };
            // x in an index on (x, y) pinned by x = 1 must not take the
            // first position away from y.
            if !ordering.ordered_on_column(direction, self.number, *column) {
                ordering.next_order_position(direction);
                ordering.add_ordered_column(direction, self.number, *column);
            }
        }
    }

    /// An index holding every column the query reads from the table.
    pub fn is_covering_index(&self, conglomerate: &ConglomerateDescriptor) -> bool {
        let Some(index) = conglomerate.index_descriptor() else {
            return false;
        };
        let keys = index.base_column_positions();
        self.referenced_columns.iter().all(|column| keys.contains(column))
    }

    /// At most one row qualifies through some conglomerate.
    pub fn is_one_row_result_set(&self, preds: &PredicateList) -> bool {
        if self.existence != Existence::Plain {
            return true;
        }
        self.descriptor
            .conglomerates()
            .iter()
            .any(|cd| self.is_one_row_result_set_for(cd, preds))
    }

    /// `conglomerate` is a unique index with an equality (or IS NULL) on
    /// every key column.
    pub fn is_one_row_result_set_for(&self, conglomerate: &ConglomerateDescriptor, preds: &PredicateList) -> bool {
        let Some(index) = conglomerate.index_descriptor() else {
            return false;
        };
        index.is_unique()
            && index
                .base_column_positions()
                .iter()
                .all(|column| preds.has_optimizable_equality_predicate(self.number, *column, true))
    }

    /// Rows per key when an equality in `preds` covers one of this table's
    /// unique indexes, or -1.
    pub fn unique_join(&self, preds: &PredicateList) -> f64 {
        unique_join_for(
            self.number,
            &self.descriptor,
            self.best.cost_estimate().single_scan_row_count(),
            preds,
        )
    }

    /// EXISTS and NOT EXISTS tables wait for the tables they correlate with.
    pub fn legal_join_order(&self, assigned: &TableMap) -> bool {
        match self.existence {
            Existence::Plain => true,
            Existence::Exists | Existence::NotExists => assigned.contains_all(&self.dependencies),
        }
    }

    /// Bytes one row of this table occupies while joined.
    fn per_row_usage(&self) -> f64 {
        let mut usage: f64 = self
            .referenced_columns
            .iter()
            .map(|column| f64::from(self.descriptor.column_width(*column)))
            .sum();
        if let Some(cd) = self.current.conglomerate() {
            if cd.is_index() && !self.is_covering_index(cd) {
                usage += ROW_LOCATION_WIDTH;
            }
        }
        usage
    }

    /// Memory the current join strategy holds for `rows` rows.
    pub fn memory_usage(&self, rows: f64) -> f64 {
        self.current
            .join_strategy()
            .map(|strategy| strategy.memory_usage(self.per_row_usage(), rows))
            .unwrap_or(0.0)
    }

    /// The current path fits the per-table limit; a user-chosen join
    /// strategy is never rejected for memory.
    pub fn memory_usage_ok(&self, max_memory_per_table: u64) -> bool {
        if self.properties.join_strategy.is_some() {
            return true;
        }
        self.memory_usage(self.single_scan_row_count) <= max_memory_per_table as f64
    }

    pub fn feasible_join_strategy(&self, preds: &PredicateList) -> bool {
        match (self.current.join_strategy(), self.current.conglomerate()) {
            (Some(strategy), Some(cd)) => strategy.feasible(self.number, &self.descriptor, cd, preds),
            _ => false,
        }
    }

    pub fn push_opt_predicate(&mut self, pred: Predicate) {
        self.restriction_list.push(pred);
    }

    /// Returns every pushed predicate to `preds`.
    pub fn pull_opt_predicates(&mut self, preds: &mut PredicateList) {
        self.restriction_list.transfer_all_predicates(preds);
    }

    pub fn remember_join_strategy_as_best(&self, path: &mut AccessPath) {
        path.set_join_strategy(self.current.join_strategy());
    }

    /// Copies the best normal or sort-avoiding path into the final choice.
    pub fn remember_as_best(&mut self, plan_type: PlanType) {
        let chosen = match plan_type {
            PlanType::Normal => &self.best,
            PlanType::SortAvoidance => &self.best_sort_avoidance,
        };
        self.truly_best.copy_from(chosen);
        debug!(
            table = %self.number,
            plan = ?plan_type,
            path = %self.truly_best,
            "optimizer.remember_as_best"
        );
    }

    /// Keeps the current candidate if it beats the best path so far (and,
    /// when it also avoids the sort, the best sort-avoiding path). Returns
    /// whether it became the best sort-avoiding path.
    pub fn remember_if_cheaper(&mut self, estimate: &CostEstimate, avoids_sort: bool) -> bool {
        let Some(cd) = self.current.conglomerate_arc().cloned() else {
            return false;
        };
        let mut candidate = AccessPath::new();
        candidate.set_conglomerate(Some(Arc::clone(&cd)));
        candidate.set_cost_estimate(*estimate);
        candidate.set_covering_index_scan(self.is_covering_index(&cd));
        candidate.set_non_matching_index_scan(!self.restriction_list.useful(self.number, &cd));
        candidate.set_lock_mode(self.current.lock_mode());
        self.remember_join_strategy_as_best(&mut candidate);

        if cheaper(estimate, self.best.cost_estimate()) {
            self.best.copy_from(&candidate);
        }
        if avoids_sort && cheaper(estimate, self.best_sort_avoidance.cost_estimate()) {
            self.best_sort_avoidance.copy_from(&candidate);
            self.consider_sort_avoidance = true;
            return true;
        }
        false
    }

    /// Moves to the next access path using the pushed predicates.
    pub fn advance(&mut self, ordering: &mut RowOrdering) -> Result<bool> {
        let preds = std::mem::take(&mut self.restriction_list);
        let found = self.next_access_path(&preds, ordering);
        self.restriction_list = preds;
        found
    }

    /// Costs the current access path against the pushed predicates.
    pub fn optimize_it(
        &mut self,
        outer_cost: &CostEstimate,
        ordering: &mut RowOrdering,
        ctx: &CostContext<'_>,
    ) -> Result<CostEstimate> {
        let cd = self
            .current
            .conglomerate_arc()
            .cloned()
            .ok_or_else(|| internal(format!("table {} costed without a conglomerate", self.number)))?;
        let mut preds = std::mem::take(&mut self.restriction_list);
        let estimate = self.estimate_cost(&mut preds, &cd, outer_cost, ordering, ctx);
        self.restriction_list = preds;
        estimate
    }

    /// Estimates reading this table through `conglomerate` with the
    /// current join strategy, once per outer row where the strategy
    /// rescans. Also picks the lock mode of the current path.
    pub fn estimate_cost(
        &mut self,
        preds: &mut PredicateList,
        conglomerate: &Arc<ConglomerateDescriptor>,
        outer_cost: &CostEstimate,
        ordering: &mut RowOrdering,
        ctx: &CostContext<'_>,
    ) -> Result<CostEstimate> {
        let table = self.number;
        let cd = conglomerate.as_ref();
        let strategy = self
            .current
            .join_strategy()
            .ok_or_else(|| internal(format!("table {table} costed without a join strategy")))?;
        let descriptor = Arc::clone(&self.descriptor);
        let controller = ctx.metadata.cost_controller(cd.id())?;
        let base_controller = match descriptor.heap() {
            Some(heap) => ctx.metadata.cost_controller(heap.id())?,
            None => Arc::clone(&controller),
        };
        let base_row_count = base_controller.estimated_row_count();

        if !self.statistics_refresh_checked {
            ctx.metadata.schedule_statistics_refresh(&descriptor);
            self.statistics_refresh_checked = true;
        }

        let mut stats_for_table = false;
        let mut stats_for_conglomerate = false;
        let mut unknown = None;
        if ctx.config.use_statistics {
            stats_for_table = ctx.metadata.statistics_exist(&descriptor, None);
            stats_for_conglomerate = ctx.metadata.statistics_exist(&descriptor, Some(cd));
            let mut copy = PredicateList::new();
            preds.copy_predicates_to_other_list(&mut copy);
            unknown = Some(copy);
        }

        let table_uniqueness = ctx.outer.unique_join_with_outer_table(preds);
        let one_row_for_some = self.is_one_row_result_set(preds);

        let mut base = PredicateList::new();
        strategy.get_base_predicates(table, &TableMap::single(table), cd, preds, &mut base);

        let estimate = if self.is_one_row_result_set_for(cd, &base) {
            self.one_row_cost(cd, &base, strategy, outer_cost, &*controller, &*base_controller, ordering, ctx)
        } else {
            self.scan_cost(
                ScanInputs {
                    conglomerate: cd,
                    base: &base,
                    remaining: preds,
                    strategy,
                    outer_cost,
                    base_row_count,
                    one_row_for_some,
                    table_uniqueness,
                    stats_for_table,
                    stats_for_conglomerate,
                    unknown,
                },
                &*controller,
                &*base_controller,
                ctx,
            )
        };

        strategy.put_base_predicates(preds, &mut base);
        self.current.set_cost_estimate(estimate);
        debug!(
            table = %table,
            conglomerate = %cd.name(),
            strategy = %strategy,
            cost = estimate.cost(),
            rows = estimate.row_count(),
            single_scan_rows = estimate.single_scan_row_count(),
            lock = ?self.current.lock_mode(),
            "optimizer.estimate_cost"
        );
        Ok(estimate)
    }

    #[allow(clippy::too_many_arguments)]
    fn one_row_cost(
        &mut self,
        cd: &ConglomerateDescriptor,
        base: &PredicateList,
        strategy: JoinStrategy,
        outer_cost: &CostEstimate,
        controller: &dyn StoreCostController,
        base_controller: &dyn StoreCostController,
        ordering: &mut RowOrdering,
        ctx: &CostContext<'_>,
    ) -> CostEstimate {
        ordering.optimizable_always_ordered(self.number);
        self.single_scan_row_count = 1.0;

        let mut cost = controller.fetch_from_full_key_cost(&[]);
        if strategy.multiply_base_cost_by_outer_rows() {
            cost *= outer_cost.row_count();
        }
        let mut estimate = CostEstimate::new(cost, outer_cost.row_count(), 1.0);

        // Constant keys always hit the same row.
        let constant_start_stop = base
            .iter()
            .take_while(|pred| pred.is_start_or_stop())
            .all(|pred| pred.referenced_tables().has_single_table());
        if constant_start_stop {
            self.current.set_lock_mode(Some(LockMode::Record));
        } else {
            self.set_locking_based_on_threshold(estimate.row_count(), ctx.config);
        }

        if cd.is_index() && !self.is_covering_index(cd) {
            let fetch = base_controller.fetch_from_row_location_cost(&[]) * estimate.row_count();
            estimate.set_estimated_cost(estimate.cost() + fetch);
        }
        trace!(table = %self.number, cost = estimate.cost(), "optimizer.estimate_cost.one_row");
        estimate
    }

    fn scan_cost(
        &mut self,
        inputs: ScanInputs<'_>,
        controller: &dyn StoreCostController,
        base_controller: &dyn StoreCostController,
        ctx: &CostContext<'_>,
    ) -> CostEstimate {
        let table = self.number;
        let ScanInputs {
            conglomerate: cd,
            base,
            remaining,
            strategy,
            outer_cost,
            base_row_count,
            one_row_for_some,
            table_uniqueness,
            stats_for_table,
            stats_for_conglomerate,
            mut unknown,
        } = inputs;

        // Keys the store cannot see at compile time are estimated here:
        // the first index column narrows pages and rows, later columns only
        // rows.
        let mut extra_first_column = 1.0;
        let mut extra_start_stop = 1.0;
        let mut extra_qualifier = 1.0;
        let mut extra_non_qualifier = 1.0;
        let mut constant_start_stop = true;
        let mut start_stop_found = false;
        let mut start_gap = false;
        let mut stop_gap = false;
        let mut first_column = None;
        let mut seen_first_column = false;
        let mut start_stop_pred_count = 0usize;
        let mut start_keys: Vec<Value> = Vec::new();
        let mut stop_keys: Vec<Value> = Vec::new();
        let mut probe_values: Option<usize> = None;

        for (idx, pred) in base.iter().enumerate() {
            let cond = pred.condition();
            if pred.is_start_or_stop() {
                start_stop_found = true;
                if !pred.referenced_tables().has_single_table() {
                    constant_start_stop = false;
                }
                if probe_values.is_none() {
                    probe_values = cond.source_in_list().and_then(|list| list.list_len());
                }
                let known = cond.compare_with_known_constant(table);
                let mut handed_to_store = false;
                if pred.is_start_key() {
                    if known && !start_gap {
                        start_keys.push(cond.compare_value(table).unwrap_or(Value::Null));
                        handed_to_store = true;
                    } else {
                        start_gap = true;
                    }
                }
                if pred.is_stop_key() {
                    if known && !stop_gap {
                        stop_keys.push(cond.compare_value(table).unwrap_or(Value::Null));
                        handed_to_store = true;
                    } else {
                        stop_gap = true;
                    }
                }
                if let Some(unknown) = unknown.as_mut().filter(|_| handed_to_store) {
                    forget(unknown, cond);
                }
                if start_gap || stop_gap {
                    if base.is_redundant_predicate(idx) {
                        continue;
                    }
                    if pred.is_start_key() && pred.is_stop_key() {
                        start_stop_pred_count += 1;
                    }
                    if pred.index_position() == Some(0) {
                        extra_first_column *= cond.selectivity();
                        if !seen_first_column {
                            first_column = cond.any_column_operand(table);
                            seen_first_column = true;
                        }
                    } else {
                        extra_start_stop *= cond.selectivity();
                    }
                }
            } else {
                if base.is_redundant_predicate(idx) {
                    continue;
                }
                // LIKE ? on the first key column tends to a narrower range
                // than a plain inequality.
                if let Some(col) = first_column {
                    if cond.is_like_parameter_on(col) {
                        extra_first_column *= 0.2;
                    }
                }
                if pred.is_qualifier() {
                    extra_qualifier *= cond.selectivity();
                } else {
                    extra_non_qualifier *= cond.selectivity();
                }
                start_gap = true;
                stop_gap = true;
            }
        }

        let mut stat_composite = 1.0;
        if let Some(unknown) = &unknown {
            let selectivity = unknown.selectivity(table, &self.descriptor, ctx.metadata);
            if selectivity >= 0.0 {
                stat_composite = selectivity;
            }
        }
        let mut stat_start_stop = 1.0;
        if seen_first_column && stats_for_conglomerate && start_stop_pred_count > 0 {
            stat_start_stop =
                ctx.metadata
                    .selectivity_for_conglomerate(&self.descriptor, cd, start_stop_pred_count);
        }
        extra_non_qualifier *= strategy.non_base_predicate_selectivity(remaining);

        // A keyless scan costs slightly more than the table so that an
        // index with keys wins ties.
        let scan_rows = if start_keys.is_empty() && stop_keys.is_empty() {
            base_row_count + 5.0
        } else {
            base_row_count
        };
        let request = ScanCostRequest {
            scan_type: strategy.scan_cost_type(),
            row_count: scan_rows,
            for_update: self.for_update,
            start_keys: (!start_keys.is_empty()).then_some(start_keys.as_slice()),
            start_op: base.start_operator(),
            stop_keys: (!stop_keys.is_empty()).then_some(stop_keys.as_slice()),
            stop_op: base.stop_operator(),
        };
        let mut estimate = controller.scan_cost(&request);

        let mut initial_position_cost = 0.0;
        if cd.is_index() {
            initial_position_cost = controller.fetch_from_full_key_cost(&[]);
            // Some other index is unique on these predicates; make this
            // one look a little worse.
            if one_row_for_some && estimate.row_count() <= 1.0 {
                estimate.set_cost(
                    estimate.cost() * 2.0,
                    estimate.row_count() + 2.0,
                    estimate.single_scan_row_count() + 2.0,
                );
            }
        }

        let mut initial_row_count = estimate.row_count();
        if stat_start_stop != 1.0 {
            let cost = scan_cost_after_selectivity(
                estimate.cost(),
                initial_position_cost,
                stat_start_stop,
                one_row_for_some,
                base_row_count,
            );
            estimate.set_cost(
                cost,
                estimate.row_count() * stat_start_stop,
                estimate.single_scan_row_count() * stat_start_stop,
            );
        } else {
            if extra_first_column != 1.0 {
                let cost = scan_cost_after_selectivity(
                    estimate.cost(),
                    initial_position_cost,
                    extra_first_column,
                    one_row_for_some,
                    base_row_count,
                );
                estimate.set_cost(
                    cost,
                    estimate.row_count() * extra_first_column,
                    estimate.single_scan_row_count() * extra_first_column,
                );
            }
            if extra_start_stop != 1.0 {
                estimate.set_cost(
                    estimate.cost(),
                    estimate.row_count() * extra_start_stop,
                    estimate.single_scan_row_count() * extra_start_stop,
                );
            }
        }

        // One probe per IN-list value, never more rows than the scan holds.
        if let Some(values) = probe_values {
            let n = values as f64;
            estimate.set_cost(
                estimate.cost() * n,
                (estimate.row_count() * n).min(initial_row_count),
                (estimate.single_scan_row_count() * n).min(initial_row_count),
            );
        }

        if !start_stop_found {
            self.current.set_lock_mode(Some(LockMode::Table));
        } else {
            let mut touched = estimate.row_count();
            if !constant_start_stop && strategy.multiply_base_cost_by_outer_rows() {
                touched = rows_touched(
                    base_row_count,
                    estimate.row_count(),
                    outer_cost.row_count(),
                    ctx.config.table_lock_threshold,
                );
            }
            self.set_locking_based_on_threshold(touched, ctx.config);
        }

        // Every index row found needs its base row; later filters do not
        // change that.
        if cd.is_index() && !self.is_covering_index(cd) {
            let fetch = base_controller.fetch_from_row_location_cost(&[]) * estimate.row_count();
            estimate.set_estimated_cost(estimate.cost() + fetch);
        }

        if extra_qualifier != 1.0 {
            estimate.set_cost(
                estimate.cost(),
                estimate.row_count() * extra_qualifier,
                estimate.single_scan_row_count() * extra_qualifier,
            );
        }

        self.single_scan_row_count = estimate.single_scan_row_count();

        let outer_rows = outer_cost.row_count();
        let mut cost = estimate.cost();
        if strategy.multiply_base_cost_by_outer_rows() {
            cost *= outer_rows;
        }
        let mut row_count = estimate.row_count() * outer_rows;
        initial_row_count *= outer_rows;
        if one_row_for_some && outer_rows < row_count {
            row_count = outer_rows;
        }

        if cd.is_index() && start_stop_found && !constant_start_stop {
            let scan_uniqueness = ctx.outer.unique_join_with_outer_table(base);
            if scan_uniqueness > 0.0 {
                let max_rows = base_row_count / scan_uniqueness;
                if row_count > max_rows {
                    cost *= max_rows / row_count;
                }
            }
        }
        if table_uniqueness > 0.0 {
            let max_rows = base_row_count / table_uniqueness;
            if row_count > max_rows {
                row_count = max_rows;
            }
        }
        estimate.set_cost(cost, row_count, estimate.single_scan_row_count());

        if self.existence != Existence::Plain {
            estimate.set_cost(estimate.cost(), 1.0, 1.0);
        } else if extra_non_qualifier != 1.0 {
            let rows = if one_row_for_some {
                estimate.row_count()
            } else {
                estimate.row_count() * extra_non_qualifier
            };
            estimate.set_cost(
                estimate.cost(),
                rows,
                estimate.single_scan_row_count() * extra_non_qualifier,
            );
        }

        if stats_for_table && !one_row_for_some && stat_composite != 1.0 {
            let composite_rows = initial_row_count * stat_composite;
            let above_uniqueness =
                table_uniqueness > 0.0 && composite_rows > base_row_count / table_uniqueness;
            if !above_uniqueness {
                let single = if self.existence != Existence::Plain {
                    1.0
                } else if outer_rows > 0.0 {
                    composite_rows / outer_rows
                } else {
                    composite_rows
                };
                estimate.set_cost(estimate.cost(), composite_rows, single);
                trace!(table = %table, selectivity = stat_composite, "optimizer.estimate_cost.composite_statistics");
            }
        }
        estimate
    }

    fn set_locking_based_on_threshold(&mut self, rows_touched: f64, config: &OptimizerConfig) {
        let mode = if rows_touched > f64::from(config.table_lock_threshold) {
            LockMode::Table
        } else {
            LockMode::Record
        };
        self.current.set_lock_mode(Some(mode));
    }

    /// Pushes the useful predicates into the scan chosen for this table
    /// and splits the rest by where they are evaluated.
    pub fn finalize(&mut self) -> Result<TablePlan> {
        let table = self.number;
        let path = self.truly_best.clone();
        let strategy = path
            .join_strategy()
            .ok_or_else(|| internal(format!("table {table} finalized without a join strategy")))?;
        let cd = path
            .conglomerate_arc()
            .cloned()
            .ok_or_else(|| internal(format!("table {table} finalized without a conglomerate")))?;

        let mut residual = std::mem::take(&mut self.restriction_list);
        residual.remove_redundant_predicates();
        let mut base = PredicateList::new();
        residual.push_useful_predicates(table, &path, &mut base)?;
        base.remove_redundant_predicates();

        let mut store = PredicateList::new();
        let mut non_store = PredicateList::new();
        let mut requalification = PredicateList::new();
        let mut hash_key_columns = Vec::new();
        match strategy {
            JoinStrategy::NestedLoop => base.set_predicates_and_properties(&mut store),
            JoinStrategy::Hash => {
                base.copy_predicates_to_other_list(&mut requalification);
                base.transfer_predicates(&mut store, &TableMap::single(table), table, &path);
                base.copy_predicates_to_other_list(&mut non_store);
                if cd.is_index() && !self.is_covering_index(&cd) {
                    // Keys are already satisfied by the index scan itself.
                    for pred in store.iter().filter(|pred| pred.is_start_or_stop()) {
                        forget(&mut requalification, pred.condition());
                    }
                } else {
                    requalification = PredicateList::new();
                }
                hash_key_columns = self.hash_key_columns(&cd, &non_store);
                if hash_key_columns.is_empty() {
                    return Err(internal(format!(
                        "hash join chosen for table {table} without an equi-join key"
                    )));
                }
            }
        }
        store.verify_counters()?;

        debug!(
            table = %table,
            path = %path,
            store = store.len(),
            residual = residual.len(),
            requalification = requalification.len(),
            "optimizer.finalize"
        );
        Ok(TablePlan {
            table,
            name: self.descriptor.name().to_string(),
            access_path: path,
            store_restrictions: store,
            non_store_restrictions: non_store,
            requalification,
            residual,
            hash_key_columns,
        })
    }

    fn hash_key_columns(&self, cd: &ConglomerateDescriptor, preds: &PredicateList) -> Vec<ColumnNumber> {
        let candidates: Vec<ColumnNumber> = match cd.index_descriptor() {
            Some(index) => index.base_column_positions().to_vec(),
            None => (1..=self.descriptor.column_count() as u16).map(ColumnNumber).collect(),
        };
        candidates
            .into_iter()
            .filter(|column| preds.has_optimizable_equijoin(self.number, *column))
            .collect()
    }
}

struct ScanInputs<'a> {
    conglomerate: &'a ConglomerateDescriptor,
    base: &'a PredicateList,
    remaining: &'a PredicateList,
    strategy: JoinStrategy,
    outer_cost: &'a CostEstimate,
    base_row_count: f64,
    one_row_for_some: bool,
    table_uniqueness: f64,
    stats_for_table: bool,
    stats_for_conglomerate: bool,
    unknown: Option<PredicateList>,
}

fn cheaper(candidate: &CostEstimate, best: &CostEstimate) -> bool {
    best.is_max() || candidate.compare(best) == Ordering::Less
}

/// Drops the first predicate with `condition` from the list, if any.
fn forget(list: &mut PredicateList, condition: &Condition) {
    let found = list.iter().position(|pred| pred.condition() == condition);
    if let Some(idx) = found {
        list.remove(idx);
    }
}

/// Applies `selectivity` to the part of a scan cost after the initial
/// positioning. When another index is unique on the predicates, the
/// selectivity never drops below two rows' worth.
fn scan_cost_after_selectivity(
    original_cost: f64,
    initial_position_cost: f64,
    selectivity: f64,
    another_index_unique: bool,
    base_row_count: f64,
) -> f64 {
    let mut selectivity = selectivity;
    if another_index_unique && base_row_count > 0.0 {
        selectivity = selectivity.max(2.0 / base_row_count);
    }
    let after_initial = ((original_cost - initial_position_cost) * selectivity).max(0.0);
    initial_position_cost + after_initial
}

/// Distinct rows touched by `outer_rows` scans of `per_scan` rows each out
/// of `base_rows`: r * (1 - (1 - s/r)^o). An empty table, a scan that
/// reads every row, or an estimate that is not finite counts as above the
/// lock threshold.
fn rows_touched(base_rows: f64, per_scan: f64, outer_rows: f64, threshold: u32) -> f64 {
    let above_threshold = f64::from(threshold) + 1.0;
    if base_rows.is_nan() || base_rows <= 0.0 || per_scan >= base_rows {
        return above_threshold;
    }
    let untouched_per_scan = (1.0 - per_scan / base_rows).clamp(0.0, 1.0);
    let touched = base_rows * (1.0 - untouched_per_scan.powf(outer_rows));
    if touched.is_finite() {
        touched
    } else {
        above_threshold
    }
}

/// Rows per key of `table` when equalities in `preds` cover one of its
/// unique indexes, otherwise -1.
pub(crate) fn unique_join_for(
    table: TableNumber,
    descriptor: &TableDescriptor,
    single_scan_row_count: f64,
    preds: &PredicateList,
) -> f64 {
    let pinned = preds.equality_columns(table);
    let covers_unique = descriptor.conglomerates().iter().any(|cd| {
        cd.index_descriptor()
            .filter(|index| index.is_unique())
            .map(|index| index.base_column_positions().iter().all(|col| pinned.contains(col)))
            .unwrap_or(false)
    });
    if covers_unique {
        single_scan_row_count
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::{Operand, RelOp};
    use crate::query::metadata::{IndexDescriptor, InMemoryCostController, InMemoryMetadata};
    use crate::types::ConglomId;

    const T: TableNumber = TableNumber(0);

    fn descriptor(unique: bool) -> Arc<TableDescriptor> {
        Arc::new(
            TableDescriptor::new("T")
                .with_column("A", 4)
                .with_column("B", 8)
                .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(1), "T"))
                .with_conglomerate(ConglomerateDescriptor::index(
                    ConglomId(2),
                    "T_A",
                    IndexDescriptor::new([1]).with_unique(unique),
                )),
        )
    }

    fn metadata() -> InMemoryMetadata {
        InMemoryMetadata::new()
            .with_controller(ConglomId(1), InMemoryCostController::new(1000.0))
            .with_controller(ConglomId(2), InMemoryCostController::new(1000.0))
    }

    fn a_equals_5() -> PredicateList {
        [Predicate::new(Condition::compare(
            Operand::column(0, 1),
            RelOp::Eq,
            Operand::constant(5i64),
        ))]
        .into_iter()
        .collect()
    }

    fn walk(table: &mut BaseTable, preds: &PredicateList) -> Vec<(String, JoinStrategy)> {
        let mut ordering = RowOrdering::new();
        let mut seen = Vec::new();
        table.start_optimizing();
        while table.next_access_path(preds, &mut ordering).unwrap() {
            let path = table.current_access_path();
            seen.push((
                path.conglomerate().unwrap().name().to_string(),
                path.join_strategy().unwrap(),
            ));
        }
        seen
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    #[test]
    fn enumerates_conglomerates_times_strategies() {
        let mut table = BaseTable::new(T, descriptor(false));
        let seen = walk(&mut table, &PredicateList::new());
        assert_eq!(
            seen,
            vec![
                ("T".to_string(), JoinStrategy::NestedLoop),
                ("T".to_string(), JoinStrategy::Hash),
                ("T_A".to_string(), JoinStrategy::NestedLoop),
                ("T_A".to_string(), JoinStrategy::Hash),
            ]
        );
        let mut ordering = RowOrdering::new();
        assert!(!table.next_access_path(&PredicateList::new(), &mut ordering).unwrap());
    }

    #[test]
    fn hints_narrow_the_walk() {
        let mut table = BaseTable::new(T, descriptor(false)).with_properties(TableProperties {
            index: Some("T_A".into()),
            constraint: None,
            join_strategy: Some(JoinStrategy::NestedLoop),
        });
        assert_eq!(
            walk(&mut table, &PredicateList::new()),
            vec![("T_A".to_string(), JoinStrategy::NestedLoop)]
        );

        let mut heap_only = BaseTable::new(T, descriptor(false)).with_properties(TableProperties {
            index: Some("null".into()),
            ..TableProperties::default()
        });
        assert_eq!(walk(&mut heap_only, &PredicateList::new()).len(), 2);
    }

    #[test]
    fn missing_index_hint_is_internal_failure() {
        let mut table = BaseTable::new(T, descriptor(false)).with_properties(TableProperties {
            index: Some("NOPE".into()),
            ..TableProperties::default()
        });
        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        let err = table.next_access_path(&PredicateList::new(), &mut ordering).unwrap_err();
        assert!(matches!(err, crate::error::PlanError::Internal(_)));
    }

    #[test]
    fn index_ordering_and_heap_unordered() {
        let mut table = BaseTable::new(T, descriptor(false));
        let preds = PredicateList::new();
        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        assert!(table.next_access_path(&preds, &mut ordering).unwrap());
        assert!(ordering.is_unordered(T));
        table.next_access_path(&preds, &mut ordering).unwrap();
        assert!(table.next_access_path(&preds, &mut ordering).unwrap());
        assert!(!ordering.is_unordered(T));
        assert!(ordering.ordered_on_column_at(Direction::Ascending, 0, T, ColumnNumber(1)));
    }

    #[test]
    fn unique_full_match_costs_one_fetch() {
        let meta = metadata();
        let config = OptimizerConfig::default();
        let outer = OuterTables::new();
        let ctx = CostContext {
            metadata: &meta,
            config: &config,
            outer: &outer,
        };
        let mut table = BaseTable::new(T, descriptor(true)).with_referenced_columns([1]);
        let mut preds = a_equals_5();
        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        table.next_access_path(&preds, &mut ordering).unwrap();
        table.next_access_path(&preds, &mut ordering).unwrap();
        table.next_access_path(&preds, &mut ordering).unwrap();
        let index = table.current_access_path().conglomerate_arc().cloned().unwrap();
        assert!(index.is_index());

        let estimate = table
            .estimate_cost(&mut preds, &index, &CostEstimate::outermost(), &mut ordering, &ctx)
            .unwrap();
        assert_close(estimate.cost(), 2.0);
        assert_close(estimate.row_count(), 1.0);
        assert_eq!(table.current_access_path().lock_mode(), Some(LockMode::Record));
        assert!(ordering.always_ordered(T));
        assert_eq!(preds.len(), 1);
    }

    #[test]
    fn heap_scan_caps_rows_when_some_index_is_unique() {
        let meta = metadata();
        let config = OptimizerConfig::default();
        let outer = OuterTables::new();
        let ctx = CostContext {
            metadata: &meta,
            config: &config,
            outer: &outer,
        };
        let mut table = BaseTable::new(T, descriptor(true)).with_referenced_columns([1, 2]);
        let mut preds = a_equals_5();
        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        table.next_access_path(&preds, &mut ordering).unwrap();
        let heap = table.current_access_path().conglomerate_arc().cloned().unwrap();
        let estimate = table
            .estimate_cost(&mut preds, &heap, &CostEstimate::outermost(), &mut ordering, &ctx)
            .unwrap();
        assert_close(estimate.cost(), 1.0 + 1005.0 * 0.1);
        assert_close(estimate.row_count(), 1.0);
        assert_close(estimate.single_scan_row_count(), 100.5);
        assert_eq!(table.current_access_path().lock_mode(), Some(LockMode::Table));
    }

    #[test]
    fn keyed_non_unique_index_adds_base_row_fetches() {
        let meta = metadata();
        let config = OptimizerConfig::default();
        let outer = OuterTables::new();
        let ctx = CostContext {
            metadata: &meta,
            config: &config,
            outer: &outer,
        };
        let mut table = BaseTable::new(T, descriptor(false)).with_referenced_columns([1, 2]);
        let mut preds = a_equals_5();
        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        for _ in 0..3 {
            table.next_access_path(&preds, &mut ordering).unwrap();
        }
        let index = table.current_access_path().conglomerate_arc().cloned().unwrap();
        let estimate = table
            .estimate_cost(&mut preds, &index, &CostEstimate::outermost(), &mut ordering, &ctx)
            .unwrap();
        // 100 rows: open 1 + 100 * 0.1 + fetch 2, then 100 base rows at 1.0.
        assert_close(estimate.cost(), 113.0);
        assert_close(estimate.row_count(), 100.0);
        assert_eq!(table.current_access_path().lock_mode(), Some(LockMode::Record));
    }

    #[test]
    fn unique_outer_join_caps_inner_rows() {
        let meta = metadata();
        let config = OptimizerConfig::default();
        let outer_desc = Arc::new(
            TableDescriptor::new("O")
                .with_column("A", 4)
                .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(5), "O"))
                .with_conglomerate(ConglomerateDescriptor::index(
                    ConglomId(6),
                    "O_A",
                    IndexDescriptor::new([1]).with_unique(true),
                )),
        );
        let mut outer_table = BaseTable::new(TableNumber(0), outer_desc);
        outer_table.start_optimizing();
        outer_table
            .next_access_path(&PredicateList::new(), &mut RowOrdering::new())
            .unwrap();
        outer_table.remember_if_cheaper(&CostEstimate::new(10.0, 50.0, 50.0), false);
        let mut outer = OuterTables::new();
        outer.push(&outer_table);
        let ctx = CostContext {
            metadata: &meta,
            config: &config,
            outer: &outer,
        };

        let inner_number = TableNumber(1);
        let mut table = BaseTable::new(inner_number, descriptor(false)).with_referenced_columns([1, 2]);
        let mut preds: PredicateList = [Predicate::new(Condition::compare(
            Operand::column(0, 1),
            RelOp::Eq,
            Operand::column(1, 1),
        ))]
        .into_iter()
        .collect();
        assert_close(outer.unique_join_with_outer_table(&preds), 50.0);

        let mut ordering = RowOrdering::new();
        table.start_optimizing();
        table.next_access_path(&preds, &mut ordering).unwrap();
        let heap = table.current_access_path().conglomerate_arc().cloned().unwrap();
        let estimate = table
            .estimate_cost(&mut preds, &heap, &CostEstimate::new(10.0, 1.0, 1.0), &mut ordering, &ctx)
            .unwrap();
        // 100.5 qualifying rows per scan, capped at 1000 / 50.
        assert_close(estimate.row_count(), 20.0);
        assert_close(estimate.cost(), 101.5);
    }

    #[test]
    fn rows_touched_formula_and_empty_table() {
        assert_close(rows_touched(100.0, 10.0, 1.0, 50), 10.0);
        assert_close(rows_touched(100.0, 50.0, 2.0, 50), 75.0);
        assert_close(rows_touched(0.0, 10.0, 3.0, 50), 51.0);
    }

    #[test]
    fn rows_touched_falls_back_to_table_lock_when_scan_covers_table() {
        // A bumped unique estimate on a one-row table reads past its end.
        assert_close(rows_touched(1.0, 3.0, 2.5, 50), 51.0);
        assert_close(rows_touched(100.0, 1000.0, 1000.0, 50), 51.0);
        assert_close(rows_touched(100.0, 100.0, 4.0, 50), 51.0);
        assert_close(rows_touched(100.0, 10.0, f64::INFINITY, 50), 100.0);
        assert_close(rows_touched(f64::NAN, 10.0, 2.0, 50), 51.0);
        for (base, per_scan, outer) in [(1.0, 3.0, 2.5), (10.0, 9.5, 1e9), (5.0, 0.0, 0.5)] {
            let touched = rows_touched(base, per_scan, outer, 50);
            assert!(touched.is_finite() && touched >= 0.0, "{touched}");
        }
    }

    #[test]
    fn selectivity_floor_applies_with_another_unique_index() {
        assert_close(scan_cost_after_selectivity(12.0, 2.0, 0.1, false, 100.0), 3.0);
        assert_close(scan_cost_after_selectivity(12.0, 2.0, 0.001, true, 100.0), 2.2);
    }

    #[test]
    fn exists_tables_wait_for_dependencies() {
        let deps: TableMap = [TableNumber(1)].into_iter().collect();
        let table = BaseTable::new(T, descriptor(false)).with_exists(deps.clone());
        assert!(!table.legal_join_order(&TableMap::new()));
        assert!(table.legal_join_order(&deps));
        assert!(table.is_one_row_result_set(&PredicateList::new()));
    }

    #[test]
    fn covering_needs_every_referenced_column() {
        let desc = descriptor(false);
        let index = desc.conglomerates()[1].clone();
        let narrow = BaseTable::new(T, Arc::clone(&desc)).with_referenced_columns([1]);
        let wide = BaseTable::new(T, Arc::clone(&desc)).with_referenced_columns([1, 2]);
        assert!(narrow.is_covering_index(&index));
        assert!(!wide.is_covering_index(&index));
        assert!(!narrow.is_covering_index(&desc.conglomerates()[0]));
    }
}
