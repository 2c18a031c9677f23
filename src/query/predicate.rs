//! A single conjunct plus the roles the optimizer has assigned to it.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::query::expr::{Condition, RelOp};
use crate::query::table_map::TableMap;
use crate::types::EquivalenceClass;

/// Conjunct of a WHERE clause annotated for scan planning.
///
/// The start/stop/qualifier flags are only meaningful relative to the access
/// path the owning [`PredicateList`](crate::query::predicate_list::PredicateList)
/// was last classified against; the list keeps counters in step with them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    condition: Condition,
    referenced: TableMap,
    start_key: bool,
    stop_key: bool,
    qualifier: bool,
    index_position: Option<usize>,
    equivalence_class: Option<EquivalenceClass>,
    pushable: bool,
    search_clauses_added: SmallVec<[RelOp; 2]>,
}

impl Predicate {
    pub fn new(condition: Condition) -> Self {
        let referenced = condition.referenced_tables();
        Self {
            condition,
            referenced,
            start_key: false,
            stop_key: false,
            qualifier: false,
            index_position: None,
            equivalence_class: None,
            pushable: true,
            search_clauses_added: SmallVec::new(),
        }
    }

    /// Marks whether the binder allows pushing this conjunct below its query block.
    pub fn with_pushable(mut self, pushable: bool) -> Self {
        self.pushable = pushable;
        self
    }

    pub fn with_equivalence_class(mut self, class: EquivalenceClass) -> Self {
        self.equivalence_class = Some(class);
        self
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn referenced_tables(&self) -> &TableMap {
        &self.referenced
    }

    pub fn is_start_key(&self) -> bool {
        self.start_key
    }

    pub fn is_stop_key(&self) -> bool {
        self.stop_key
    }

    pub fn is_qualifier(&self) -> bool {
        self.qualifier
    }

    pub fn is_start_or_stop(&self) -> bool {
        self.start_key || self.stop_key
    }

    pub fn index_position(&self) -> Option<usize> {
        self.index_position
    }

    pub fn equivalence_class(&self) -> Option<EquivalenceClass> {
        self.equivalence_class
    }

    pub fn is_pushable(&self) -> bool {
        self.pushable
    }

    pub fn is_relational(&self) -> bool {
        self.condition.is_relational()
    }

    pub fn is_in_list(&self) -> bool {
        self.condition.is_in_list()
    }

    pub fn is_probe(&self) -> bool {
        self.condition.is_probe()
    }

    pub(crate) fn condition_mut(&mut self) -> &mut Condition {
        &mut self.condition
    }

    pub(crate) fn mark_start_key(&mut self) {
        self.start_key = true;
    }

    pub(crate) fn mark_stop_key(&mut self) {
        self.stop_key = true;
    }

    pub(crate) fn mark_qualifier(&mut self) {
        self.qualifier = true;
    }

    /// Drops every scan role before the predicate moves between lists.
    pub(crate) fn clear_scan_flags(&mut self) {
        self.start_key = false;
        self.stop_key = false;
        self.qualifier = false;
        self.index_position = None;
    }

    pub(crate) fn set_index_position(&mut self, position: Option<usize>) {
        self.index_position = position;
    }

    pub(crate) fn set_equivalence_class(&mut self, class: EquivalenceClass) {
        self.equivalence_class = Some(class);
    }

    pub(crate) fn search_clause_added(&self, op: RelOp) -> bool {
        self.search_clauses_added.contains(&op)
    }

    pub(crate) fn note_search_clause_added(&mut self, op: RelOp) {
        if !self.search_clauses_added.contains(&op) {
            self.search_clauses_added.push(op);
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition)?;
        let mut roles = SmallVec::<[&str; 3]>::new();
        if self.start_key {
            roles.push("start");
        }
        if self.stop_key {
            roles.push("stop");
        }
        if self.qualifier {
            roles.push("qualifier");
        }
        if !roles.is_empty() {
            write!(f, " [{}]", roles.join(","))?;
        }
        Ok(())
    }
}
