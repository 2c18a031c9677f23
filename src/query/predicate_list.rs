//! Ordered predicate lists and their scan classification.
//!
//! A [`PredicateList`] owns its predicates outright. Moving one between lists
//! is always a remove followed by a push so that the start/stop/qualifier
//! counters of both lists stay exact.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{internal, Result};
use crate::query::access_path::AccessPath;
use crate::query::expr::{RelOp, ScanOp};
use crate::query::join_strategy::JoinStrategy;
use crate::query::metadata::{ConglomerateDescriptor, IndexDescriptor};
use crate::query::predicate::Predicate;
use crate::query::table_map::TableMap;
use crate::types::{ColumnNumber, TableNumber};

/// Destination of a classification pass that physically pushes predicates.
pub struct PushTarget<'a> {
    /// Restriction list receiving the classified predicates.
    pub list: &'a mut PredicateList,
    /// Join strategy of the access path being finalized.
    pub join_strategy: Option<JoinStrategy>,
}

/// Conjuncts of one query block, or of one table's restriction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PredicateList {
    preds: Vec<Predicate>,
    num_start: usize,
    num_stop: usize,
    num_qualifiers: usize,
}

impl PredicateList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Predicate> {
        self.preds.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> + '_ {
        self.preds.iter()
    }

    pub fn as_slice(&self) -> &[Predicate] {
        &self.preds
    }

    pub fn start_count(&self) -> usize {
        self.num_start
    }

    pub fn stop_count(&self) -> usize {
        self.num_stop
    }

    pub fn qualifier_count(&self) -> usize {
        self.num_qualifiers
    }

    /// Appends a predicate, counting whatever roles it already carries.
    pub fn push(&mut self, pred: Predicate) {
        self.count(&pred, true);
        self.preds.push(pred);
    }

    pub fn insert(&mut self, idx: usize, pred: Predicate) {
        self.count(&pred, true);
        self.preds.insert(idx, pred);
    }

    /// Removes the predicate at `idx`, keeping the counters exact.
    pub fn remove(&mut self, idx: usize) -> Predicate {
        let pred = self.preds.remove(idx);
        self.count(&pred, false);
        pred
    }

    /// Recomputes the role counters and fails if the cached ones drifted.
    pub fn verify_counters(&self) -> Result<()> {
        let (start, stop, qual) = self.true_counts();
        if (start, stop, qual) != (self.num_start, self.num_stop, self.num_qualifiers) {
            return Err(internal(format!(
                "predicate counters ({}, {}, {}) disagree with flags ({start}, {stop}, {qual})",
                self.num_start, self.num_stop, self.num_qualifiers
            )));
        }
        Ok(())
    }

    fn count(&mut self, pred: &Predicate, add: bool) {
        let step = |counter: &mut usize, flag: bool| {
            if flag {
                if add {
                    *counter += 1;
                } else {
                    *counter -= 1;
                }
            }
        };
        step(&mut self.num_start, pred.is_start_key());
        step(&mut self.num_stop, pred.is_stop_key());
        step(&mut self.num_qualifiers, pred.is_qualifier());
    }

    fn true_counts(&self) -> (usize, usize, usize) {
        self.preds.iter().fold((0, 0, 0), |(s, p, q), pred| {
            (
                s + pred.is_start_key() as usize,
                p + pred.is_stop_key() as usize,
                q + pred.is_qualifier() as usize,
            )
        })
    }

    pub(crate) fn recount(&mut self) {
        let (start, stop, qual) = self.true_counts();
        self.num_start = start;
        self.num_stop = stop;
        self.num_qualifiers = qual;
    }

    pub(crate) fn preds_mut(&mut self) -> &mut [Predicate] {
        &mut self.preds
    }

    /// Removes every predicate matching `select`, preserving relative order.
    pub(crate) fn drain_where(&mut self, mut select: impl FnMut(&Predicate) -> bool) -> Vec<Predicate> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.preds.len());
        for pred in self.preds.drain(..) {
            if select(&pred) {
                taken.push(pred);
            } else {
                kept.push(pred);
            }
        }
        self.preds = kept;
        self.recount();
        taken
    }

    /// Assigns scan roles for `table` read through `conglomerate`.
    pub fn classify(&mut self, table: TableNumber, conglomerate: &ConglomerateDescriptor) {
        self.order_useful_predicates(table, conglomerate, None, false, false);
    }

    /// Marks start keys, stop keys and qualifiers for a scan of `conglomerate`.
    ///
    /// With a push target the classified predicates move into it in index
    /// column order; otherwise they move to the front of this list.
    pub fn order_useful_predicates(
        &mut self,
        table: TableNumber,
        conglomerate: &ConglomerateDescriptor,
        push_into: Option<PushTarget<'_>>,
        non_matching_index_scan: bool,
        covering_index_scan: bool,
    ) {
        for pred in &mut self.preds {
            pred.clear_scan_flags();
        }
        match conglomerate.index_descriptor() {
            Some(index) if !(non_matching_index_scan && covering_index_scan) => {
                self.order_index_predicates(table, index, push_into)
            }
            _ => self.order_heap_predicates(table, push_into),
        }
        trace!(
            table = %table,
            conglomerate = %conglomerate.name(),
            start = self.num_start,
            stop = self.num_stop,
            qualifiers = self.num_qualifiers,
            "optimizer.classify"
        );
    }

    fn order_heap_predicates(&mut self, table: TableNumber, push_into: Option<PushTarget<'_>>) {
        for pred in &mut self.preds {
            let cond = pred.condition();
            if (cond.is_relational() && cond.is_qualifier(table)) || cond.is_pushable_or_clause(table) {
                pred.mark_qualifier();
            }
        }
        self.recount();
        if let Some(target) = push_into {
            for pred in self.drain_where(Predicate::is_qualifier) {
                target.list.push(pred);
            }
        }
    }

    fn order_index_predicates(
        &mut self,
        table: TableNumber,
        index: &IndexDescriptor,
        push_into: Option<PushTarget<'_>>,
    ) {
        let base_columns = index.base_column_positions();
        let hash_push = push_into
            .as_ref()
            .map(|target| target.join_strategy == Some(JoinStrategy::Hash))
            .unwrap_or(false);

        let mut usable: Vec<(usize, usize)> = Vec::new();
        for (idx, pred) in self.preds.iter().enumerate() {
            let cond = pred.condition();
            let is_in = cond.is_in_list();
            if !is_in && !(cond.is_relational() && cond.is_qualifier(table)) {
                continue;
            }
            if cond.is_probe() && hash_push {
                continue;
            }
            let position = if is_in {
                base_columns
                    .first()
                    .filter(|column| cond.in_list_on(table, **column))
                    .map(|_| 0)
            } else {
                base_columns.iter().position(|column| {
                    cond.column_operand(table, *column)
                        .map(|col| !cond.self_comparison(col))
                        .unwrap_or(false)
                })
            };
            match position {
                Some(0) => usable.push((0, idx)),
                Some(pos) if !cond.is_probe() => usable.push((pos, idx)),
                _ => {}
            }
        }

        usable.sort_by_key(|&(pos, idx)| {
            let equality = self.preds[idx]
                .condition()
                .operator()
                .map(RelOp::is_equality)
                .unwrap_or(false);
            (pos, !equality)
        });

        let mut current_start: isize = -1;
        let mut current_stop: isize = -1;
        let mut start_gap = false;
        let mut stop_gap = false;
        let mut seen_gt = false;
        let mut seen_ge = false;
        let mut seen_non_equals = false;
        let mut first_non_equals: isize = -1;
        let mut last_start_equals: isize = -1;

        for &(position, idx) in &usable {
            let pos = position as isize;
            let ascending = index.is_ascending(position);
            let pred = &mut self.preds[idx];
            pred.set_index_position(Some(position));
            let cond = pred.condition();
            let is_in = cond.is_in_list();
            let equality = cond.operator().map(RelOp::is_equality).unwrap_or(false);
            let useful_start = cond.useful_start_key(table);
            let useful_stop = cond.useful_stop_key(table);
            let start_op = cond.start_operator();
            let stop_op = cond.stop_operator();
            let mut marked = false;

            if pos != current_start {
                if pos - current_start > 1 {
                    start_gap = true;
                }
                if !start_gap && equality {
                    last_start_equals = pos;
                }
                if !start_gap
                    && !seen_gt
                    && (is_in || (useful_start && ascending) || (useful_stop && !ascending))
                {
                    pred.mark_start_key();
                    current_start = pos;
                    marked = true;
                    seen_gt = start_op == ScanOp::Gt;
                }
            }

            if pos != current_stop {
                if pos - current_stop > 1 {
                    stop_gap = true;
                }
                if !stop_gap
                    && !seen_ge
                    && (is_in || (useful_stop && ascending) || (useful_start && !ascending))
                {
                    pred.mark_stop_key();
                    current_stop = pos;
                    marked = true;
                    seen_ge = stop_op == ScanOp::Ge;
                }
            }

            if !is_in && (!marked || (seen_non_equals && pos != first_non_equals)) {
                pred.mark_qualifier();
            }

            if last_start_equals != pos && first_non_equals == -1 && !equality {
                seen_non_equals = true;
                first_non_equals = pos;
            }
        }

        let mut slots: Vec<Option<Predicate>> = self.preds.drain(..).map(Some).collect();
        match push_into {
            Some(target) => {
                for &(_, idx) in &usable {
                    let Some(pred) = slots[idx].as_mut() else {
                        continue;
                    };
                    if pred.is_in_list() {
                        if pred.is_start_or_stop() {
                            target.list.push(pred.clone());
                            pred.clear_scan_flags();
                        }
                    } else if let Some(pred) = slots[idx].take() {
                        target.list.push(pred);
                    }
                }
                self.preds = slots.into_iter().flatten().collect();
            }
            None => {
                let mut ordered = Vec::with_capacity(slots.len());
                for &(_, idx) in &usable {
                    if let Some(pred) = slots[idx].take() {
                        ordered.push(pred);
                    }
                }
                ordered.extend(slots.into_iter().flatten());
                self.preds = ordered;
            }
        }
        self.recount();
    }

    /// True when `conglomerate` is an index some predicate can position on.
    pub fn useful(&self, table: TableNumber, conglomerate: &ConglomerateDescriptor) -> bool {
        let Some(index) = conglomerate.index_descriptor() else {
            return false;
        };
        let Some(&first) = index.base_column_positions().first() else {
            return false;
        };
        self.preds.iter().any(|pred| {
            let cond = pred.condition();
            if cond.is_in_list() {
                return cond.in_list_on(table, first);
            }
            if !(cond.useful_start_key(table) || cond.useful_stop_key(table)) {
                return false;
            }
            cond.column_operand(table, first)
                .map(|col| !cond.self_comparison(col))
                .unwrap_or(false)
        })
    }

    /// Final push of the predicates the chosen access path can use.
    pub fn push_useful_predicates(
        &mut self,
        table: TableNumber,
        path: &AccessPath,
        destination: &mut PredicateList,
    ) -> Result<()> {
        let conglomerate = path
            .conglomerate()
            .ok_or_else(|| internal(format!("table {table} has no chosen conglomerate")))?;
        self.order_useful_predicates(
            table,
            conglomerate,
            Some(PushTarget {
                list: destination,
                join_strategy: path.join_strategy(),
            }),
            path.non_matching_index_scan(),
            path.covering_index_scan(),
        );
        Ok(())
    }

    pub fn mark_all_predicates_qualifiers(&mut self) {
        for pred in &mut self.preds {
            pred.mark_qualifier();
        }
        self.recount();
    }

    pub fn has_optimizable_equality_predicate(
        &self,
        table: TableNumber,
        column: ColumnNumber,
        null_ok: bool,
    ) -> bool {
        self.preds
            .iter()
            .any(|pred| pred.condition().optimizable_equality(table, column, null_ok))
    }

    /// An equality on `column` joining `table` with some other table.
    pub fn has_optimizable_equijoin(&self, table: TableNumber, column: ColumnNumber) -> bool {
        self.preds.iter().any(|pred| {
            let cond = pred.condition();
            cond.optimizable_equality(table, column, false)
                && cond.is_qualifier(table)
                && !pred.referenced_tables().has_single_table()
        })
    }

    pub fn put_optimizable_equality_predicate_first(
        &mut self,
        table: TableNumber,
        column: ColumnNumber,
    ) -> Result<()> {
        let idx = self
            .preds
            .iter()
            .position(|pred| pred.condition().optimizable_equality(table, column, false))
            .ok_or_else(|| {
                internal(format!(
                    "no optimizable equality predicate on table {table} column {column}"
                ))
            })?;
        if idx != 0 {
            let pred = self.preds.remove(idx);
            self.preds.insert(0, pred);
        }
        Ok(())
    }

    /// Moves everything that is not a qualifier for `table` into `other`;
    /// what stays becomes a qualifier.
    pub fn transfer_non_qualifiers(&mut self, table: TableNumber, other: &mut PredicateList) {
        let moved = self.drain_where(|pred| {
            let cond = pred.condition();
            !cond.is_relational() || !cond.is_qualifier(table)
        });
        for mut pred in moved {
            pred.clear_scan_flags();
            other.push(pred);
        }
        self.mark_all_predicates_qualifiers();
    }

    /// Moves predicates that only reference tables in `table_map` into
    /// `other`, then orders `other` for `conglomerate` when one is known.
    pub fn transfer_predicates(
        &mut self,
        other: &mut PredicateList,
        table_map: &TableMap,
        table: TableNumber,
        path: &AccessPath,
    ) {
        let moved = self.drain_where(|pred| table_map.contains_all(pred.referenced_tables()));
        for mut pred in moved {
            pred.clear_scan_flags();
            other.push(pred);
        }
        if let Some(conglomerate) = path.conglomerate() {
            other.order_useful_predicates(
                table,
                conglomerate,
                None,
                path.non_matching_index_scan(),
                path.covering_index_scan(),
            );
        }
        other.recount();
    }

    pub fn transfer_all_predicates(&mut self, other: &mut PredicateList) {
        for mut pred in self.preds.drain(..) {
            pred.clear_scan_flags();
            other.push(pred);
        }
        self.recount();
    }

    pub fn copy_predicates_to_other_list(&self, other: &mut PredicateList) {
        for pred in &self.preds {
            other.push(pred.clone());
        }
    }

    /// Makes `other` an exact copy of this list, counters included.
    pub fn set_predicates_and_properties(&self, other: &mut PredicateList) {
        other.preds.clear();
        other.preds.extend(self.preds.iter().cloned());
        other.num_start = self.num_start;
        other.num_stop = self.num_stop;
        other.num_qualifiers = self.num_qualifiers;
    }

    /// True when an earlier predicate carries the same equivalence class.
    pub fn is_redundant_predicate(&self, idx: usize) -> bool {
        let Some(class) = self.preds.get(idx).and_then(Predicate::equivalence_class) else {
            return false;
        };
        self.preds[..idx]
            .iter()
            .any(|pred| pred.equivalence_class() == Some(class))
    }

    /// Operator of the last start key, or `Gt` without start keys.
    pub fn start_operator(&self) -> ScanOp {
        self.preds
            .iter()
            .rev()
            .find(|pred| pred.is_start_key())
            .map(|pred| pred.condition().start_operator())
            .unwrap_or(ScanOp::Gt)
    }

    /// Operator of the last stop key, or `Gt` without stop keys.
    pub fn stop_operator(&self) -> ScanOp {
        self.preds
            .iter()
            .rev()
            .find(|pred| pred.is_stop_key())
            .map(|pred| pred.condition().stop_operator())
            .unwrap_or(ScanOp::Gt)
    }

    /// Start and stop keys are the same predicates, so the scan can reuse one key.
    pub fn same_start_stop_position(&self) -> bool {
        if self.num_start != self.num_stop {
            return false;
        }
        self.preds
            .iter()
            .all(|pred| pred.is_start_key() == pred.is_stop_key() && !pred.is_in_list())
    }

    pub fn all_pushable(&self) -> bool {
        self.preds.iter().all(Predicate::is_pushable)
    }

    /// Removes and returns the pushable predicates covered by `referenced_map`.
    pub fn get_pushable_predicates(&mut self, referenced_map: &TableMap) -> PredicateList {
        let mut pushed = PredicateList::new();
        for pred in self.drain_where(|pred| {
            pred.is_pushable() && referenced_map.contains_all(pred.referenced_tables())
        }) {
            pushed.push(pred);
        }
        pushed
    }

    /// Columns of `table` pinned by an equality with something outside it.
    pub fn equality_columns(&self, table: TableNumber) -> Vec<ColumnNumber> {
        let mut columns: Vec<ColumnNumber> = self
            .preds
            .iter()
            .filter_map(|pred| pred.condition().equality_column(table))
            .collect();
        columns.sort_unstable();
        columns.dedup();
        columns
    }

    /// Product of the heuristic selectivities of every predicate.
    pub fn selectivity_no_statistics(&self) -> f64 {
        self.preds
            .iter()
            .map(|pred| pred.condition().selectivity())
            .product()
    }
}

impl fmt::Display for PredicateList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, pred) in self.preds.iter().enumerate() {
            if idx > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{pred}")?;
        }
        Ok(())
    }
}

impl FromIterator<Predicate> for PredicateList {
    fn from_iter<I: IntoIterator<Item = Predicate>>(iter: I) -> Self {
        let mut list = PredicateList::new();
        for pred in iter {
            list.push(pred);
        }
        list
    }
}
