//! Sort order of the rows produced by a join prefix.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::table_map::TableMap;
use crate::types::{ColumnNumber, ColumnRef, TableNumber};

/// Direction of an order position, or of a requested ordering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
    /// Only valid in requests: any direction satisfies it.
    DontCare,
}

/// One position in the ordering; every column in it has the same value
/// ordering, e.g. `t1.a` and `t2.b` after a merge on `t1.a = t2.b`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct OrderPosition {
    direction: Direction,
    columns: SmallVec<[ColumnRef; 2]>,
}

impl OrderPosition {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            columns: SmallVec::new(),
        }
    }

    fn ordered(&self, direction: Direction, column: ColumnRef) -> bool {
        if direction != Direction::DontCare && direction != self.direction {
            return false;
        }
        self.columns.contains(&column)
    }
}

/// Accumulated row ordering for the tables placed so far.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOrdering {
    positions: Vec<OrderPosition>,
    constant_columns: Vec<ColumnRef>,
    always_ordered: TableMap,
    unordered: TableMap,
}

impl RowOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn copy_from(&mut self, other: &RowOrdering) {
        self.clone_from(other);
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Whether rows are ordered on the column at any position.
    pub fn ordered_on_column(&self, direction: Direction, table: TableNumber, column: ColumnNumber) -> bool {
        let col = ColumnRef { table, column };
        if self.always_ordered(table) || self.constant_columns.contains(&col) {
            return true;
        }
        self.positions.iter().any(|pos| pos.ordered(direction, col))
    }

    /// Whether rows are ordered on the column at exactly `position`.
    pub fn ordered_on_column_at(
        &self,
        direction: Direction,
        position: usize,
        table: TableNumber,
        column: ColumnNumber,
    ) -> bool {
        let col = ColumnRef { table, column };
        if self.always_ordered(table) || self.constant_columns.contains(&col) {
            return true;
        }
        self.positions
            .get(position)
            .map(|pos| pos.ordered(direction, col))
            .unwrap_or(false)
    }

    /// Adds a column to the last order position, opening one if needed.
    pub fn add_ordered_column(&mut self, direction: Direction, table: TableNumber, column: ColumnNumber) {
        if !self.unordered.is_empty() {
            return;
        }
        if self.positions.is_empty() {
            self.positions.push(OrderPosition::new(direction));
        }
        if let Some(last) = self.positions.last_mut() {
            last.columns.push(ColumnRef { table, column });
        }
    }

    /// Opens a new order position.
    pub fn next_order_position(&mut self, direction: Direction) {
        if !self.unordered.is_empty() {
            return;
        }
        self.positions.push(OrderPosition::new(direction));
    }

    /// Records that the table yields at most one row, so any order holds.
    pub fn optimizable_always_ordered(&mut self, table: TableNumber) {
        let mut others = self.unordered.clone();
        others.remove(table);
        if !others.is_empty() {
            return;
        }
        self.always_ordered.insert(table);
    }

    /// Records a column pinned to a single value.
    pub fn column_always_ordered(&mut self, table: TableNumber, column: ColumnNumber) {
        let col = ColumnRef { table, column };
        if !self.constant_columns.contains(&col) {
            self.constant_columns.push(col);
        }
    }

    /// Whether an equality with a constant pins the column.
    pub fn is_constant_column(&self, table: TableNumber, column: ColumnNumber) -> bool {
        self.constant_columns.contains(&ColumnRef { table, column })
    }

    pub fn add_unordered_optimizable(&mut self, table: TableNumber) {
        self.unordered.insert(table);
    }

    pub fn always_ordered(&self, table: TableNumber) -> bool {
        self.always_ordered.contains(table)
    }

    pub fn is_unordered(&self, table: TableNumber) -> bool {
        self.unordered.contains(table)
    }

    /// Forgets everything the table contributed.
    pub fn remove_optimizable(&mut self, table: TableNumber) {
        for pos in &mut self.positions {
            pos.columns.retain(|col| col.table != table);
        }
        self.positions.retain(|pos| !pos.columns.is_empty());
        self.constant_columns.retain(|col| col.table != table);
        self.always_ordered.remove(table);
        self.unordered.remove(table);
    }
}

impl fmt::Display for RowOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, pos) in self.positions.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            let dir = match pos.direction {
                Direction::Ascending => "ASC",
                Direction::Descending => "DESC",
                Direction::DontCare => "ANY",
            };
            let cols: Vec<String> = pos.columns.iter().map(ToString::to_string).collect();
            write!(f, "[{}] {dir}", cols.join("="))?;
        }
        Ok(())
    }
}
