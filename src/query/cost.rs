//! Cost triples produced by the store and combined by the optimizer.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Estimated cost of a scan together with the rows it produces.
///
/// `row_count` is the total number of rows over the life of the query (all
/// outer rows included) while `single_scan_row_count` is the number of rows
/// one scan yields. The three values always change together.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    cost: f64,
    row_count: f64,
    single_scan_row_count: f64,
}

impl CostEstimate {
    pub fn new(cost: f64, row_count: f64, single_scan_row_count: f64) -> Self {
        Self {
            cost,
            row_count,
            single_scan_row_count,
        }
    }

    /// Cost of the empty join prefix: nothing spent, one outer row.
    pub fn outermost() -> Self {
        Self::new(0.0, 1.0, 1.0)
    }

    /// Sentinel larger than any real estimate.
    pub fn max() -> Self {
        Self::new(f64::MAX, f64::MAX, f64::MAX)
    }

    pub fn is_max(&self) -> bool {
        self.cost == f64::MAX
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn row_count(&self) -> f64 {
        self.row_count
    }

    pub fn single_scan_row_count(&self) -> f64 {
        self.single_scan_row_count
    }

    pub fn set_cost(&mut self, cost: f64, row_count: f64, single_scan_row_count: f64) {
        self.cost = cost;
        self.row_count = row_count;
        self.single_scan_row_count = single_scan_row_count;
    }

    /// Replaces only the cost component.
    pub fn set_estimated_cost(&mut self, cost: f64) {
        self.cost = cost;
    }

    /// Orders by cost, then row count, then single-scan row count.
    pub fn compare(&self, other: &CostEstimate) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.row_count.total_cmp(&other.row_count))
            .then_with(|| {
                self.single_scan_row_count
                    .total_cmp(&other.single_scan_row_count)
            })
    }

    /// Component-wise sum.
    pub fn add(&self, other: &CostEstimate) -> CostEstimate {
        CostEstimate::new(
            self.cost + other.cost,
            self.row_count + other.row_count,
            self.single_scan_row_count + other.single_scan_row_count,
        )
    }
}

impl Default for CostEstimate {
    fn default() -> Self {
        Self::max()
    }
}

impl fmt::Display for CostEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cost={:.4} rows={:.2} scan_rows={:.2}",
            self.cost, self.row_count, self.single_scan_row_count
        )
    }
}
