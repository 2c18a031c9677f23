//! Transitive closure over join and search clauses, and removal of the
//! redundant predicates it can produce.

use tracing::debug;

use crate::query::expr::{Condition, Operand, RelOp};
use crate::query::optimizer::CompilationContext;
use crate::query::predicate::Predicate;
use crate::query::predicate_list::PredicateList;
use crate::query::table_map::TableMap;
use crate::types::ColumnRef;

impl PredicateList {
    /// Drops later predicates that share an equivalence class with an
    /// earlier one, keeping the scan roles of what was dropped.
    pub fn remove_redundant_predicates(&mut self) {
        let mut idx = 0;
        let mut removed = 0usize;
        while idx < self.len() {
            let Some(class) = self.as_slice()[idx].equivalence_class() else {
                idx += 1;
                continue;
            };
            let mut later = idx + 1;
            while later < self.len() {
                if self.as_slice()[later].equivalence_class() != Some(class) {
                    later += 1;
                    continue;
                }
                let dropped = self.remove(later);
                removed += 1;
                let survivor = &mut self.preds_mut()[idx];
                if dropped.is_start_key() {
                    survivor.mark_start_key();
                }
                if dropped.is_stop_key() {
                    survivor.mark_stop_key();
                }
                if dropped.is_start_or_stop() && dropped.is_qualifier() {
                    survivor.mark_qualifier();
                }
            }
            idx += 1;
        }
        self.recount();
        if removed > 0 {
            debug!(removed, "optimizer.remove_redundant");
        }
    }

    /// Adds the equi-joins implied by chains such as `a.x = b.y AND b.y = c.z`
    /// and groups the predicates of each chain into one equivalence class.
    ///
    /// Only meaningful with three or more tables; tables in `not_exists`
    /// are left out.
    pub fn join_clause_transitive_closure(
        &mut self,
        num_tables: usize,
        not_exists: &TableMap,
        ctx: &mut CompilationContext,
    ) {
        if num_tables < 3 {
            return;
        }
        let in_block = |col: &ColumnRef| (col.table.0 as usize) < num_tables;

        let mut joins: Vec<Vec<usize>> = vec![Vec::new(); num_tables];
        for (idx, pred) in self.iter().enumerate() {
            let Some((left, right)) = pred.condition().equijoin_columns() else {
                continue;
            };
            if !in_block(&left) || !in_block(&right) {
                continue;
            }
            if not_exists.contains(left.table) || not_exists.contains(right.table) {
                continue;
            }
            joins[left.table.0 as usize].push(idx);
            joins[right.table.0 as usize].push(idx);
        }

        for list in &mut joins {
            let (classed, rest): (Vec<usize>, Vec<usize>) = list
                .iter()
                .partition(|idx| self.as_slice()[**idx].equivalence_class().is_some());
            *list = classed.into_iter().chain(rest).collect();
        }

        let mut added = 0usize;
        for outer_table in 0..num_tables {
            let mut outer_idx = 0;
            while outer_idx < joins[outer_table].len() {
                let outer_pred = joins[outer_table][outer_idx];
                let class = match self.as_slice()[outer_pred].equivalence_class() {
                    Some(class) => class,
                    None => {
                        let class = ctx.next_equivalence_class();
                        self.preds_mut()[outer_pred].set_equivalence_class(class);
                        class
                    }
                };
                let Some((left, right)) = self.as_slice()[outer_pred].condition().equijoin_columns()
                else {
                    outer_idx += 1;
                    continue;
                };
                let (outer_col, middle_col) = if left.table.0 as usize == outer_table {
                    (left, right)
                } else {
                    (right, left)
                };

                let middle_table = middle_col.table.0 as usize;
                let mut middle_idx = 0;
                while middle_idx < joins[middle_table].len() {
                    let middle_pred = joins[middle_table][middle_idx];
                    middle_idx += 1;
                    let pred = &self.as_slice()[middle_pred];
                    if pred.equivalence_class().is_some_and(|c| c != class) {
                        continue;
                    }
                    let Some(inner_col) = far_side(pred, middle_col) else {
                        continue;
                    };
                    if inner_col == outer_col {
                        continue;
                    }
                    self.preds_mut()[middle_pred].set_equivalence_class(class);

                    let inner_table = inner_col.table.0 as usize;
                    let closing = joins[inner_table].iter().copied().find(|idx| {
                        let pred = &self.as_slice()[*idx];
                        !pred.equivalence_class().is_some_and(|c| c != class)
                            && far_side(pred, inner_col) == Some(outer_col)
                    });
                    match closing {
                        Some(idx) => self.preds_mut()[idx].set_equivalence_class(class),
                        None => {
                            let pred = Predicate::new(Condition::compare(
                                Operand::Column(outer_col),
                                RelOp::Eq,
                                Operand::Column(inner_col),
                            ))
                            .with_equivalence_class(class);
                            self.push(pred);
                            let new_idx = self.len() - 1;
                            joins[outer_table].insert(outer_idx + 1, new_idx);
                            joins[inner_table].push(new_idx);
                            added += 1;
                        }
                    }
                }
                outer_idx += 1;
            }
        }
        if added > 0 {
            debug!(added, "optimizer.join_closure");
        }
    }

    /// Copies search clauses across equi-joins: `a.x = b.y AND a.x < 5`
    /// implies `b.y < 5`.
    ///
    /// Unless a hash join was requested, equi-joins that produced an `=`
    /// search clause are dropped afterwards since the two constant
    /// restrictions make them redundant.
    pub fn search_clause_transitive_closure(&mut self, num_tables: usize, hash_join_specified: bool) {
        let in_block = |col: &ColumnRef| (col.table.0 as usize) < num_tables;
        let mut equijoins = Vec::new();
        let mut searches = Vec::new();
        for idx in 0..self.len() {
            let cond = self.preds_mut()[idx].condition_mut();
            if !cond.is_relational() || cond.is_probe() {
                continue;
            }
            if let Some((left, right)) = cond.equijoin_columns() {
                if in_block(&left) && in_block(&right) {
                    equijoins.push(idx);
                }
                continue;
            }
            cond.put_column_on_left();
            if cond.search_clause().is_some() {
                searches.push(idx);
            }
        }
        if equijoins.is_empty() || searches.is_empty() {
            return;
        }

        let mut added = 0usize;
        let mut sc = 0;
        while sc < searches.len() {
            let search = searches[sc];
            sc += 1;
            let Some((search_col, op)) = self.as_slice()[search]
                .condition()
                .search_clause()
                .map(|(col, op, _)| (col, op))
            else {
                continue;
            };
            for &join in &equijoins {
                let pred = &self.as_slice()[join];
                if pred.search_clause_added(op) {
                    continue;
                }
                let Some(other_col) = far_side(pred, search_col) else {
                    continue;
                };
                self.preds_mut()[join].note_search_clause_added(op);

                let source = self.as_slice()[search].condition();
                let comparand = source.search_clause().and_then(|(_, _, value)| value);
                let matched = self.iter().any(|pred| match pred.condition().search_clause() {
                    Some((col, other_op, other_value)) => {
                        col == other_col
                            && other_op == op
                            && match (comparand, other_value) {
                                (None, None) => true,
                                (Some(a), Some(b)) => a.same_comparand(b),
                                _ => false,
                            }
                    }
                    None => false,
                });
                if matched {
                    continue;
                }
                if let Some(cond) = source.with_search_column(other_col) {
                    self.push(Predicate::new(cond));
                    searches.push(self.len() - 1);
                    added += 1;
                }
            }
        }

        let dropped = if hash_join_specified {
            0
        } else {
            self.drain_where(|pred| pred.search_clause_added(RelOp::Eq)).len()
        };
        debug!(added, dropped, "optimizer.search_closure");
    }
}

/// The column an equi-join compares `col` with, if `col` is one of its sides.
fn far_side(pred: &Predicate, col: ColumnRef) -> Option<ColumnRef> {
    let (left, right) = pred.condition().equijoin_columns()?;
    if left == col {
        Some(right)
    } else if right == col {
        Some(left)
    } else {
        None
    }
}
