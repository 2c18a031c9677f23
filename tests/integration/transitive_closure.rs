use std::sync::Arc;

use accesspath::query::expr::{Condition, Operand, RelOp};
use accesspath::query::metadata::{ConglomerateDescriptor, TableDescriptor};
use accesspath::query::table_map::TableMap;
use accesspath::types::{ColumnRef, ConglomId, TableNumber};
use accesspath::{BaseTable, CompilationContext, Predicate, PredicateList, QueryBlock};
use proptest::prelude::*;

fn join(a: (u16, u16), b: (u16, u16)) -> Predicate {
    Predicate::new(Condition::compare(
        Operand::column(a.0, a.1),
        RelOp::Eq,
        Operand::column(b.0, b.1),
    ))
}

fn search(column: (u16, u16), op: RelOp, value: i64) -> Predicate {
    Predicate::new(Condition::compare(
        Operand::column(column.0, column.1),
        op,
        Operand::constant(value),
    ))
}

fn tables(count: u16) -> Vec<BaseTable> {
    (0..count)
        .map(|n| {
            let name = format!("T{n}");
            let descriptor = TableDescriptor::new(name.clone())
                .with_column("A", 4)
                .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(u64::from(n) + 1), name));
            BaseTable::new(TableNumber(n), Arc::new(descriptor))
        })
        .collect()
}

#[test]
fn preprocess_closes_join_chain() {
    let preds: PredicateList = [join((0, 1), (1, 1)), join((1, 1), (2, 1))].into_iter().collect();
    let mut block = QueryBlock::new(tables(3), preds).expect("block");
    block.preprocess(&mut CompilationContext::new());

    let predicates = block.predicates();
    assert_eq!(predicates.len(), 3);
    assert!(predicates
        .iter()
        .any(|p| p.condition().equijoin_columns() == Some((ColumnRef::new(0, 1), ColumnRef::new(2, 1)))));
    let class = predicates.get(0).and_then(Predicate::equivalence_class);
    assert!(class.is_some());
    assert!(predicates.iter().all(|p| p.equivalence_class() == class));
}

#[test]
fn join_closure_runs_once() {
    let mut list: PredicateList = [join((0, 1), (1, 1)), join((1, 1), (2, 1)), join((2, 1), (3, 1))]
        .into_iter()
        .collect();
    let mut ctx = CompilationContext::new();
    list.join_clause_transitive_closure(4, &TableMap::new(), &mut ctx);
    let closed = list.len();
    assert!(closed > 3);
    list.join_clause_transitive_closure(4, &TableMap::new(), &mut ctx);
    assert_eq!(list.len(), closed);
}

#[test]
fn preprocess_copies_range_across_join() {
    let preds: PredicateList = [join((0, 1), (1, 1)), search((0, 1), RelOp::Gt, 5)].into_iter().collect();
    let mut block = QueryBlock::new(tables(2), preds).expect("block");
    block.preprocess(&mut CompilationContext::new());

    let predicates = block.predicates();
    assert_eq!(predicates.len(), 3);
    let added = predicates.get(2).expect("implied clause");
    let (column, op, value) = added.condition().search_clause().expect("search clause");
    assert_eq!(column, ColumnRef::new(1, 1));
    assert_eq!(op, RelOp::Gt);
    assert_eq!(value, Some(&Operand::constant(5i64)));
}

#[test]
fn redundant_join_is_dropped_after_closure() {
    let mut list: PredicateList = [join((0, 1), (1, 1)), join((1, 1), (2, 1))].into_iter().collect();
    list.join_clause_transitive_closure(3, &TableMap::new(), &mut CompilationContext::new());
    assert_eq!(list.len(), 3);
    list.remove_redundant_predicates();
    assert_eq!(list.len(), 1);
    list.verify_counters().expect("counters");
}

fn arb_range() -> impl Strategy<Value = Predicate> {
    let op = prop_oneof![Just(RelOp::Lt), Just(RelOp::Le), Just(RelOp::Gt), Just(RelOp::Ge)];
    (0u16..=1, op, -20i64..20).prop_map(|(table, op, value)| search((table, 1), op, value))
}

proptest! {
    #[test]
    fn prop_search_closure_is_idempotent(ranges in prop::collection::vec(arb_range(), 1..6)) {
        let mut list: PredicateList = std::iter::once(join((0, 1), (1, 1))).chain(ranges).collect();
        let original = list.len();
        list.search_clause_transitive_closure(2, false);
        let closed = list.len();
        prop_assert!(closed >= original);
        list.search_clause_transitive_closure(2, false);
        prop_assert_eq!(list.len(), closed);
        prop_assert!(list.verify_counters().is_ok());
    }
}
