use accesspath::query::expr::{Condition, Operand, RelOp};
use accesspath::query::metadata::{ConglomerateDescriptor, IndexDescriptor};
use accesspath::types::{ColumnNumber, ConglomId, TableNumber};
use accesspath::{Predicate, PredicateList};
use proptest::prelude::*;

const T: TableNumber = TableNumber(0);

fn cmp(column: u16, op: RelOp, value: i64) -> Predicate {
    Predicate::new(Condition::compare(
        Operand::column(0, column),
        op,
        Operand::constant(value),
    ))
}

fn index_ab() -> ConglomerateDescriptor {
    ConglomerateDescriptor::index(ConglomId(2), "T_AB", IndexDescriptor::new([1, 2]))
}

fn assert_counters_match_flags(list: &PredicateList) {
    list.verify_counters().expect("counters agree with flags");
    assert_eq!(list.start_count(), list.iter().filter(|p| p.is_start_key()).count());
    assert_eq!(list.stop_count(), list.iter().filter(|p| p.is_stop_key()).count());
    assert_eq!(list.qualifier_count(), list.iter().filter(|p| p.is_qualifier()).count());
}

#[test]
fn equality_then_range_on_composite_index() {
    let mut list: PredicateList = [
        cmp(3, RelOp::Eq, 1),
        cmp(2, RelOp::Gt, 3),
        cmp(1, RelOp::Eq, 5),
    ]
    .into_iter()
    .collect();
    list.classify(T, &index_ab());

    let first = list.get(0).expect("leading key");
    assert_eq!(first.index_position(), Some(0));
    assert!(first.is_start_key() && first.is_stop_key());
    let second = list.get(1).expect("second key");
    assert_eq!(second.index_position(), Some(1));
    assert!(second.is_start_key());
    assert!(!second.is_stop_key());
    assert_eq!(list.start_count(), 2);
    assert_eq!(list.stop_count(), 1);
    assert_counters_match_flags(&list);
}

#[test]
fn heap_scan_has_only_qualifiers() {
    let heap = ConglomerateDescriptor::heap(ConglomId(1), "T");
    let mut list: PredicateList = [cmp(1, RelOp::Eq, 5), cmp(2, RelOp::Lt, 9)].into_iter().collect();
    list.classify(T, &heap);
    assert_eq!(list.start_count(), 0);
    assert_eq!(list.stop_count(), 0);
    assert_eq!(list.qualifier_count(), 2);
    assert_counters_match_flags(&list);
}

#[test]
fn transfer_all_clears_scan_roles() {
    let mut list: PredicateList = [cmp(1, RelOp::Eq, 5)].into_iter().collect();
    list.classify(T, &index_ab());
    assert_eq!(list.start_count(), 1);

    let mut other = PredicateList::new();
    list.transfer_all_predicates(&mut other);
    assert!(list.is_empty());
    assert_eq!(other.len(), 1);
    assert_eq!(other.start_count(), 0);
    assert!(!other.get(0).expect("moved").is_start_or_stop());
    assert_counters_match_flags(&other);
}

#[test]
fn optimizable_equality_moves_to_front() {
    let mut list: PredicateList = [cmp(2, RelOp::Lt, 9), cmp(1, RelOp::Eq, 5)].into_iter().collect();
    assert!(list.has_optimizable_equality_predicate(T, ColumnNumber(1), false));
    list.put_optimizable_equality_predicate_first(T, ColumnNumber(1))
        .expect("equality present");
    assert_eq!(
        list.get(0).and_then(|p| p.condition().equality_column(T)),
        Some(ColumnNumber(1))
    );
    assert!(list
        .put_optimizable_equality_predicate_first(T, ColumnNumber(4))
        .is_err());
}

fn arb_predicate() -> impl Strategy<Value = Predicate> {
    let op = prop_oneof![
        Just(RelOp::Eq),
        Just(RelOp::Ne),
        Just(RelOp::Lt),
        Just(RelOp::Le),
        Just(RelOp::Gt),
        Just(RelOp::Ge),
    ];
    prop_oneof![
        (1u16..=4, op.clone(), -10i64..10).prop_map(|(column, op, value)| cmp(column, op, value)),
        (1u16..=4, op, 1u16..=3).prop_map(|(column, op, other)| {
            Predicate::new(Condition::compare(
                Operand::column(0, column),
                op,
                Operand::column(1, other),
            ))
        }),
        (1u16..=4).prop_map(|column| Predicate::new(Condition::is_null(Operand::column(0, column)))),
    ]
}

proptest! {
    #[test]
    fn prop_counters_track_flags(preds in prop::collection::vec(arb_predicate(), 0..12), heap in any::<bool>()) {
        let conglomerate = if heap {
            ConglomerateDescriptor::heap(ConglomId(1), "T")
        } else {
            index_ab()
        };
        let mut list: PredicateList = preds.into_iter().collect();
        list.classify(T, &conglomerate);
        prop_assert!(list.verify_counters().is_ok());
        prop_assert_eq!(list.start_count(), list.iter().filter(|p| p.is_start_key()).count());
        prop_assert_eq!(list.stop_count(), list.iter().filter(|p| p.is_stop_key()).count());
        prop_assert_eq!(list.qualifier_count(), list.iter().filter(|p| p.is_qualifier()).count());
    }

    #[test]
    fn prop_classification_is_idempotent(preds in prop::collection::vec(arb_predicate(), 0..12)) {
        let mut once: PredicateList = preds.into_iter().collect();
        once.classify(T, &index_ab());
        let mut twice = once.clone();
        twice.classify(T, &index_ab());
        prop_assert_eq!(once, twice);
    }
}
