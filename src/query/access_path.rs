//! The way one table is read: conglomerate, join strategy, locking and cost.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::cost::CostEstimate;
use crate::query::join_strategy::JoinStrategy;
use crate::query::metadata::ConglomerateDescriptor;

/// Lock granularity requested from the store for a scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Record,
    Table,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Record => write!(f, "row"),
            LockMode::Table => write!(f, "table"),
        }
    }
}

/// Working description of a candidate or chosen access to a table.
///
/// A table keeps several of these (current, best, best without sorting, and
/// the one finally chosen) and overwrites them freely during the search.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessPath {
    conglomerate: Option<Arc<ConglomerateDescriptor>>,
    join_strategy: Option<JoinStrategy>,
    lock_mode: Option<LockMode>,
    cost_estimate: CostEstimate,
    covering_index_scan: bool,
    non_matching_index_scan: bool,
}

impl AccessPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conglomerate(&self) -> Option<&ConglomerateDescriptor> {
        self.conglomerate.as_deref()
    }

    pub fn conglomerate_arc(&self) -> Option<&Arc<ConglomerateDescriptor>> {
        self.conglomerate.as_ref()
    }

    pub fn set_conglomerate(&mut self, conglomerate: Option<Arc<ConglomerateDescriptor>>) {
        self.conglomerate = conglomerate;
    }

    pub fn join_strategy(&self) -> Option<JoinStrategy> {
        self.join_strategy
    }

    pub fn set_join_strategy(&mut self, strategy: Option<JoinStrategy>) {
        self.join_strategy = strategy;
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, mode: Option<LockMode>) {
        self.lock_mode = mode;
    }

    pub fn cost_estimate(&self) -> &CostEstimate {
        &self.cost_estimate
    }

    pub fn set_cost_estimate(&mut self, estimate: CostEstimate) {
        self.cost_estimate = estimate;
    }

    pub fn covering_index_scan(&self) -> bool {
        self.covering_index_scan
    }

    pub fn set_covering_index_scan(&mut self, covering: bool) {
        self.covering_index_scan = covering;
    }

    pub fn non_matching_index_scan(&self) -> bool {
        self.non_matching_index_scan
    }

    pub fn set_non_matching_index_scan(&mut self, non_matching: bool) {
        self.non_matching_index_scan = non_matching;
    }

    /// Copies every field of `other` into this path.
    pub fn copy_from(&mut self, other: &AccessPath) {
        self.clone_from(other);
    }

    /// Forgets the conglomerate and cost so the path can be reused.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conglomerate() {
            Some(cd) => write!(f, "{}", cd.name())?,
            None => write!(f, "<none>")?,
        }
        if let Some(strategy) = self.join_strategy {
            write!(f, " via {}", strategy.name())?;
        }
        if let Some(lock) = self.lock_mode {
            write!(f, " lock={lock}")?;
        }
        write!(f, " ({})", self.cost_estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConglomId;

    #[test]
    fn reset_returns_to_unchosen() {
        let mut path = AccessPath::new();
        path.set_conglomerate(Some(Arc::new(ConglomerateDescriptor::heap(ConglomId(1), "T"))));
        path.set_lock_mode(Some(LockMode::Table));
        path.set_cost_estimate(CostEstimate::new(1.0, 2.0, 2.0));
        let mut best = AccessPath::new();
        best.copy_from(&path);
        assert_eq!(best, path);
        path.reset();
        assert!(path.conglomerate().is_none());
        assert!(path.cost_estimate().is_max());
        assert_eq!(best.lock_mode(), Some(LockMode::Table));
    }
}
