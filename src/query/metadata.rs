//! Catalog descriptors and the storage-facing cost interfaces.
//!
//! The optimizer never touches storage directly. Everything it needs to know
//! about a table (its conglomerates, their key shape, statistics and the cost
//! of reading them) comes through [`MetadataProvider`] and
//! [`StoreCostController`]. The in-memory implementations at the bottom of
//! this module are deterministic and intended for tests and prototyping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};
use crate::query::cost::CostEstimate;
use crate::query::expr::ScanOp;
use crate::query::join_strategy::ScanCostType;
use crate::query::value::Value;
use crate::types::{ColumnNumber, ConglomId};

/// Key shape of an index conglomerate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    base_column_positions: Vec<ColumnNumber>,
    ascending: Vec<bool>,
    unique: bool,
}

impl IndexDescriptor {
    /// Non-unique ascending index over the given 1-based base columns.
    pub fn new(columns: impl IntoIterator<Item = u16>) -> Self {
        let base_column_positions: Vec<ColumnNumber> =
            columns.into_iter().map(ColumnNumber).collect();
        let ascending = vec![true; base_column_positions.len()];
        Self {
            base_column_positions,
            ascending,
            unique: false,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Marks the key column at `position` (0-based) as descending.
    pub fn with_descending(mut self, position: usize) -> Self {
        if let Some(flag) = self.ascending.get_mut(position) {
            *flag = false;
        }
        self
    }

    pub fn base_column_positions(&self) -> &[ColumnNumber] {
        &self.base_column_positions
    }

    pub fn is_ascending(&self, position: usize) -> bool {
        self.ascending.get(position).copied().unwrap_or(true)
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn key_count(&self) -> usize {
        self.base_column_positions.len()
    }
}

/// A heap or index structure storing a table's rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConglomerateDescriptor {
    id: ConglomId,
    name: String,
    constraint_name: Option<String>,
    index: Option<IndexDescriptor>,
}

impl ConglomerateDescriptor {
    pub fn heap(id: ConglomId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            constraint_name: None,
            index: None,
        }
    }

    pub fn index(id: ConglomId, name: impl Into<String>, index: IndexDescriptor) -> Self {
        Self {
            id,
            name: name.into(),
            constraint_name: None,
            index: Some(index),
        }
    }

    /// Records the constraint (primary key, unique, foreign key) backed by this index.
    pub fn with_constraint(mut self, name: impl Into<String>) -> Self {
        self.constraint_name = Some(name.into());
        self
    }

    pub fn id(&self) -> ConglomId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn constraint_name(&self) -> Option<&str> {
        self.constraint_name.as_deref()
    }

    pub fn index_descriptor(&self) -> Option<&IndexDescriptor> {
        self.index.as_ref()
    }

    pub fn is_index(&self) -> bool {
        self.index.is_some()
    }
}

/// Column metadata the optimizer uses for memory estimates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Estimated stored width in bytes.
    pub width: u32,
}

/// Read-only table metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    name: String,
    columns: Vec<ColumnDescriptor>,
    conglomerates: Vec<Arc<ConglomerateDescriptor>>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            conglomerates: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, width: u32) -> Self {
        self.columns.push(ColumnDescriptor {
            name: name.into(),
            width,
        });
        self
    }

    /// Adds a conglomerate; catalog order is insertion order, heap first.
    pub fn with_conglomerate(mut self, conglomerate: ConglomerateDescriptor) -> Self {
        self.conglomerates.push(Arc::new(conglomerate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, column: ColumnNumber) -> Option<&ColumnDescriptor> {
        (column.0 as usize)
            .checked_sub(1)
            .and_then(|idx| self.columns.get(idx))
    }

    pub fn column_width(&self, column: ColumnNumber) -> u32 {
        self.column(column).map(|col| col.width).unwrap_or(0)
    }

    pub fn conglomerates(&self) -> &[Arc<ConglomerateDescriptor>] {
        &self.conglomerates
    }

    pub fn heap(&self) -> Option<&Arc<ConglomerateDescriptor>> {
        self.conglomerates.iter().find(|cd| !cd.is_index())
    }
}

/// Arguments of a scan cost request.
#[derive(Clone, Debug)]
pub struct ScanCostRequest<'a> {
    pub scan_type: ScanCostType,
    /// Estimated rows in the conglomerate.
    pub row_count: f64,
    pub for_update: bool,
    /// Compile-time start key values; `None` starts at the beginning.
    pub start_keys: Option<&'a [Value]>,
    pub start_op: ScanOp,
    /// Compile-time stop key values; `None` runs to the end.
    pub stop_keys: Option<&'a [Value]>,
    pub stop_op: ScanOp,
}

/// Cost primitives the storage engine reports for one conglomerate.
pub trait StoreCostController: Send + Sync {
    /// Cost of fetching one row by its complete key.
    fn fetch_from_full_key_cost(&self, columns: &[ColumnNumber]) -> f64;
    /// Cost of fetching one base row given a row location.
    fn fetch_from_row_location_cost(&self, columns: &[ColumnNumber]) -> f64;
    /// Cost and row counts of one scan between the given keys.
    fn scan_cost(&self, request: &ScanCostRequest<'_>) -> CostEstimate;
    /// Current estimate of rows in the conglomerate.
    fn estimated_row_count(&self) -> f64;
}

/// Catalog and statistics access needed while costing.
pub trait MetadataProvider: Send + Sync {
    /// Cost controller for a conglomerate.
    fn cost_controller(&self, conglomerate: ConglomId) -> Result<Arc<dyn StoreCostController>>;
    /// Whether statistics exist for the conglomerate, or for any of the
    /// table's conglomerates when `conglomerate` is `None`.
    fn statistics_exist(
        &self,
        table: &TableDescriptor,
        conglomerate: Option<&ConglomerateDescriptor>,
    ) -> bool;
    /// Fraction of rows matched by equality on the first `matched_columns` keys.
    fn selectivity_for_conglomerate(
        &self,
        table: &TableDescriptor,
        conglomerate: &ConglomerateDescriptor,
        matched_columns: usize,
    ) -> f64;
    /// Lets the catalog decide whether the table's statistics need refreshing.
    fn schedule_statistics_refresh(&self, _table: &TableDescriptor) {}
}

/// Deterministic cost model over a fixed row count.
///
/// Each leading key column bound by equal start and stop values keeps a tenth
/// of the rows; any remaining range bound keeps half of what is left.
#[derive(Clone, Debug)]
pub struct InMemoryCostController {
    row_count: f64,
    open_cost: f64,
    row_cost: f64,
    fetch_cost: f64,
    row_location_cost: f64,
}

impl InMemoryCostController {
    pub fn new(row_count: f64) -> Self {
        Self {
            row_count,
            open_cost: 1.0,
            row_cost: 0.1,
            fetch_cost: 2.0,
            row_location_cost: 1.0,
        }
    }

    pub fn with_row_cost(mut self, row_cost: f64) -> Self {
        self.row_cost = row_cost;
        self
    }

    pub fn with_open_cost(mut self, open_cost: f64) -> Self {
        self.open_cost = open_cost;
        self
    }

    pub fn with_fetch_cost(mut self, fetch_cost: f64) -> Self {
        self.fetch_cost = fetch_cost;
        self
    }

    pub fn with_row_location_cost(mut self, cost: f64) -> Self {
        self.row_location_cost = cost;
        self
    }

    fn matched_fraction(request: &ScanCostRequest<'_>) -> f64 {
        let start = request.start_keys.unwrap_or(&[]);
        let stop = request.stop_keys.unwrap_or(&[]);
        let equal = start
            .iter()
            .zip(stop.iter())
            .take_while(|(a, b)| a.same_constant(b))
            .count();
        let mut fraction = 0.1f64.powi(equal as i32);
        if start.len() > equal || stop.len() > equal {
            fraction *= 0.5;
        }
        fraction
    }
}

impl StoreCostController for InMemoryCostController {
    fn fetch_from_full_key_cost(&self, _columns: &[ColumnNumber]) -> f64 {
        self.fetch_cost
    }

    fn fetch_from_row_location_cost(&self, _columns: &[ColumnNumber]) -> f64 {
        self.row_location_cost
    }

    fn scan_cost(&self, request: &ScanCostRequest<'_>) -> CostEstimate {
        let rows = request.row_count * Self::matched_fraction(request);
        let keyed = request.start_keys.is_some() || request.stop_keys.is_some();
        let mut cost = self.open_cost + rows * self.row_cost;
        if keyed {
            cost += self.fetch_cost;
        }
        if request.scan_type == ScanCostType::Set {
            cost += rows * self.row_cost * 0.1;
        }
        if request.for_update {
            cost += rows * self.row_cost * 0.05;
        }
        CostEstimate::new(cost, rows, rows)
    }

    fn estimated_row_count(&self) -> f64 {
        self.row_count
    }
}

/// Metadata provider backed by explicit registrations.
#[derive(Default)]
pub struct InMemoryMetadata {
    controllers: FxHashMap<ConglomId, Arc<dyn StoreCostController>>,
    statistics: FxHashMap<ConglomId, Vec<f64>>,
    refresh_requests: AtomicUsize,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the cost controller serving a conglomerate.
    pub fn with_controller(
        mut self,
        conglomerate: ConglomId,
        controller: impl StoreCostController + 'static,
    ) -> Self {
        self.controllers.insert(conglomerate, Arc::new(controller));
        self
    }

    /// Registers index statistics: `selectivities[n - 1]` applies to an
    /// equality match on the first `n` key columns.
    pub fn with_statistics(mut self, conglomerate: ConglomId, selectivities: Vec<f64>) -> Self {
        self.statistics.insert(conglomerate, selectivities);
        self
    }

    /// Number of statistics refresh checks requested so far.
    pub fn refresh_requests(&self) -> usize {
        self.refresh_requests.load(Ordering::Relaxed)
    }
}

impl MetadataProvider for InMemoryMetadata {
    fn cost_controller(&self, conglomerate: ConglomId) -> Result<Arc<dyn StoreCostController>> {
        self.controllers
            .get(&conglomerate)
            .cloned()
            .ok_or(PlanError::NotFound("cost controller"))
    }

    fn statistics_exist(
        &self,
        table: &TableDescriptor,
        conglomerate: Option<&ConglomerateDescriptor>,
    ) -> bool {
        match conglomerate {
            Some(cd) => self.statistics.contains_key(&cd.id()),
            None => table
                .conglomerates()
                .iter()
                .any(|cd| self.statistics.contains_key(&cd.id())),
        }
    }

    fn selectivity_for_conglomerate(
        &self,
        _table: &TableDescriptor,
        conglomerate: &ConglomerateDescriptor,
        matched_columns: usize,
    ) -> f64 {
        let Some(values) = self.statistics.get(&conglomerate.id()) else {
            return 1.0;
        };
        if matched_columns == 0 {
            return 1.0;
        }
        values
            .get(matched_columns - 1)
            .or_else(|| values.last())
            .copied()
            .unwrap_or(1.0)
    }

    fn schedule_statistics_refresh(&self, _table: &TableDescriptor) {
        self.refresh_requests.fetch_add(1, Ordering::Relaxed);
    }
}
