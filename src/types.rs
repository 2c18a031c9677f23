#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Zero-based position of a table within the query's FROM list.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TableNumber(pub u16);
/// One-based column position within a base table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ColumnNumber(pub u16);
/// Storage identifier of a heap or index conglomerate.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ConglomId(pub u64);
/// Group of join predicates known to express the same equality.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct EquivalenceClass(pub u32);

/// Bound reference to a column of a specific table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: TableNumber,
    pub column: ColumnNumber,
}

impl ColumnRef {
    pub fn new(table: u16, column: u16) -> Self {
        Self {
            table: TableNumber(table),
            column: ColumnNumber(column),
        }
    }
}

impl fmt::Display for TableNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ColumnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConglomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.c{}", self.table, self.column)
    }
}

impl From<u16> for TableNumber {
    fn from(value: u16) -> Self {
        TableNumber(value)
    }
}

impl From<u16> for ColumnNumber {
    fn from(value: u16) -> Self {
        ColumnNumber(value)
    }
}

impl From<u64> for ConglomId {
    fn from(value: u64) -> Self {
        ConglomId(value)
    }
}
