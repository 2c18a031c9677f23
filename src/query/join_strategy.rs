//! Join strategies an inner table can be read with.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::metadata::{ConglomerateDescriptor, TableDescriptor};
use crate::query::predicate_list::PredicateList;
use crate::query::table_map::TableMap;
use crate::types::{ColumnNumber, TableNumber};

/// Kind of scan requested from the store's cost model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanCostType {
    /// Repeated keyed or full scans, one per outer row.
    Normal,
    /// One scan materializing the whole qualifying set.
    Set,
}

/// How the rows of an inner table are matched with the outer rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinStrategy {
    NestedLoop,
    Hash,
}

impl JoinStrategy {
    /// Enumeration order used when cycling strategies for a conglomerate.
    pub const ALL: [JoinStrategy; 2] = [JoinStrategy::NestedLoop, JoinStrategy::Hash];

    pub fn name(self) -> &'static str {
        match self {
            JoinStrategy::NestedLoop => "NESTEDLOOP",
            JoinStrategy::Hash => "HASH",
        }
    }

    /// Parses a user-supplied strategy name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(name))
    }

    pub fn is_hash(self) -> bool {
        self == JoinStrategy::Hash
    }

    /// Whether the strategy can read `table` through `conglomerate` given
    /// the predicates pushed so far.
    pub fn feasible(
        self,
        table: TableNumber,
        descriptor: &TableDescriptor,
        conglomerate: &ConglomerateDescriptor,
        predicates: &PredicateList,
    ) -> bool {
        match self {
            JoinStrategy::NestedLoop => true,
            JoinStrategy::Hash => match conglomerate.index_descriptor() {
                Some(index) => index
                    .base_column_positions()
                    .iter()
                    .any(|column| predicates.has_optimizable_equijoin(table, *column)),
                None => (1..=descriptor.column_count() as u16)
                    .any(|column| predicates.has_optimizable_equijoin(table, ColumnNumber(column))),
            },
        }
    }

    /// Nested loop rescans the inner table once per outer row.
    pub fn multiply_base_cost_by_outer_rows(self) -> bool {
        self == JoinStrategy::NestedLoop
    }

    pub fn scan_cost_type(self) -> ScanCostType {
        match self {
            JoinStrategy::NestedLoop => ScanCostType::Normal,
            JoinStrategy::Hash => ScanCostType::Set,
        }
    }

    /// Moves the predicates evaluated by the base scan into `base` and
    /// classifies them against `conglomerate`.
    pub fn get_base_predicates(
        self,
        table: TableNumber,
        table_map: &TableMap,
        conglomerate: &ConglomerateDescriptor,
        predicates: &mut PredicateList,
        base: &mut PredicateList,
    ) {
        match self {
            JoinStrategy::NestedLoop => predicates.transfer_all_predicates(base),
            JoinStrategy::Hash => {
                for pred in predicates.drain_where(|pred| table_map.contains_all(pred.referenced_tables())) {
                    base.push(pred);
                }
            }
        }
        base.classify(table, conglomerate);
    }

    /// Returns the base predicates to the list they came from.
    pub fn put_base_predicates(self, predicates: &mut PredicateList, base: &mut PredicateList) {
        base.transfer_all_predicates(predicates);
    }

    /// Selectivity of the predicates the strategy applies outside the scan.
    pub fn non_base_predicate_selectivity(self, predicates: &PredicateList) -> f64 {
        match self {
            JoinStrategy::NestedLoop => 1.0,
            JoinStrategy::Hash => (0..predicates.len())
                .filter(|idx| !predicates.is_redundant_predicate(*idx))
                .filter_map(|idx| predicates.get(idx))
                .map(|pred| pred.condition().selectivity())
                .product(),
        }
    }

    /// Bytes held in memory while joining `rows` rows of `per_row` bytes.
    pub fn memory_usage(self, per_row: f64, rows: f64) -> f64 {
        match self {
            JoinStrategy::NestedLoop => 0.0,
            JoinStrategy::Hash => per_row * rows,
        }
    }
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
