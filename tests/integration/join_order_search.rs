use std::sync::{Arc, Once};

use accesspath::query::expr::{Condition, Operand, RelOp};
use accesspath::query::metadata::{
    ConglomerateDescriptor, IndexDescriptor, InMemoryCostController, InMemoryMetadata, TableDescriptor,
};
use accesspath::query::table_map::TableMap;
use accesspath::types::{ColumnRef, ConglomId, TableNumber};
use accesspath::{
    BaseTable, CompilationContext, Direction, JoinStrategy, Optimizer, OptimizerConfig, OrderByColumns,
    PlanError, PlanType, Predicate, PredicateList, QueryBlock, TableProperties,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("accesspath=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Table `name` with a heap `heap` and, optionally, a unique index on column 1.
fn table(name: &str, heap: u64, unique_index: Option<u64>) -> Arc<TableDescriptor> {
    let mut desc = TableDescriptor::new(name)
        .with_column("A", 4)
        .with_column("B", 4)
        .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(heap), name));
    if let Some(id) = unique_index {
        desc = desc.with_conglomerate(ConglomerateDescriptor::index(
            ConglomId(id),
            format!("{name}_A"),
            IndexDescriptor::new([1]).with_unique(true),
        ));
    }
    Arc::new(desc)
}

fn join(a: u16, b: u16) -> Predicate {
    Predicate::new(Condition::compare(
        Operand::column(a, 1),
        RelOp::Eq,
        Operand::column(b, 1),
    ))
}

fn optimizer(config: OptimizerConfig, rows: &[(u64, f64)]) -> Optimizer {
    let meta = rows.iter().fold(InMemoryMetadata::new(), |meta, (id, count)| {
        meta.with_controller(ConglomId(*id), InMemoryCostController::new(*count))
    });
    Optimizer::new(config, Arc::new(meta))
}

/// BIG (1000 rows, unique index) joined to SMALL (10 rows) on column 1.
fn big_small_block() -> QueryBlock {
    let big = BaseTable::new(TableNumber(0), table("BIG", 1, Some(2))).with_referenced_columns([1, 2]);
    let small = BaseTable::new(TableNumber(1), table("SMALL", 3, None)).with_referenced_columns([1]);
    QueryBlock::new(vec![big, small], [join(0, 1)].into_iter().collect()).expect("block")
}

const BIG_SMALL_ROWS: [(u64, f64); 3] = [(1, 1000.0), (2, 1000.0), (3, 10.0)];

#[test]
fn small_outer_table_drives_index_lookups() {
    init_tracing();
    let mut block = big_small_block();
    let plan = optimizer(OptimizerConfig::default(), &BIG_SMALL_ROWS)
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    assert_eq!(plan.join_order(), vec![TableNumber(1), TableNumber(0)]);
    let inner = &plan.tables[1];
    assert_eq!(inner.access_path.conglomerate().map(|cd| cd.name()), Some("BIG_A"));
    assert_eq!(inner.access_path.join_strategy(), Some(JoinStrategy::NestedLoop));
    assert_eq!(inner.store_restrictions.start_count(), 1);
    assert_eq!(plan.plan_type, PlanType::Normal);
    assert!(!plan.sort_required);
    assert!(plan.remaining_predicates.is_empty());
}

#[test]
fn join_order_cap_keeps_first_complete_order() {
    let mut block = big_small_block();
    let plan = optimizer(OptimizerConfig::bounded(1), &BIG_SMALL_ROWS)
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");
    assert_eq!(plan.join_order(), vec![TableNumber(0), TableNumber(1)]);
}

#[test]
fn three_way_chain_starts_from_smallest_table() {
    init_tracing();
    let t0 = BaseTable::new(TableNumber(0), table("T0", 1, None)).with_referenced_columns([1]);
    let t1 = BaseTable::new(TableNumber(1), table("T1", 2, Some(3))).with_referenced_columns([1, 2]);
    let t2 = BaseTable::new(TableNumber(2), table("T2", 4, Some(5))).with_referenced_columns([1, 2]);
    let preds: PredicateList = [join(0, 1), join(1, 2)].into_iter().collect();
    let mut block = QueryBlock::new(vec![t0, t1, t2], preds).expect("block");
    let rows = [(1, 10.0), (2, 1000.0), (3, 1000.0), (4, 1000.0), (5, 1000.0)];
    let plan = optimizer(OptimizerConfig::default(), &rows)
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    assert_eq!(plan.join_order()[0], TableNumber(0));
    for inner in &plan.tables[1..] {
        assert!(inner.access_path.conglomerate().is_some_and(|cd| cd.is_index()));
        assert_eq!(inner.access_path.join_strategy(), Some(JoinStrategy::NestedLoop));
        inner.store_restrictions.verify_counters().expect("counters");
    }
    assert!(plan.remaining_predicates.is_empty());
}

#[test]
fn exists_table_waits_for_its_correlation() {
    let outer = BaseTable::new(TableNumber(0), table("O", 1, None));
    let exists = BaseTable::new(TableNumber(1), table("E", 2, None))
        .with_exists(TableMap::single(TableNumber(0)));
    let mut block = QueryBlock::new(vec![outer, exists], PredicateList::new()).expect("block");
    let plan = optimizer(OptimizerConfig::default(), &[(1, 1000.0), (2, 10.0)])
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");
    assert_eq!(plan.join_order(), vec![TableNumber(0), TableNumber(1)]);
}

#[test]
fn index_order_avoids_sort() {
    let t = BaseTable::new(TableNumber(0), table("T", 1, Some(2))).with_referenced_columns([1]);
    let mut block = QueryBlock::new(vec![t], PredicateList::new()).expect("block");
    let plan = optimizer(OptimizerConfig::default(), &[(1, 1000.0), (2, 1000.0)])
        .with_required_ordering(OrderByColumns::new([(ColumnRef::new(0, 1), Direction::Ascending)]))
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    assert_eq!(plan.plan_type, PlanType::SortAvoidance);
    assert!(!plan.sort_required);
    assert_eq!(plan.tables[0].access_path.conglomerate().map(|cd| cd.name()), Some("T_A"));
    assert_eq!(plan.explain.op, "IndexScan");
}

#[test]
fn unordered_column_keeps_sort() {
    let t = BaseTable::new(TableNumber(0), table("T", 1, Some(2))).with_referenced_columns([1, 2]);
    let mut block = QueryBlock::new(vec![t], PredicateList::new()).expect("block");
    let plan = optimizer(OptimizerConfig::default(), &[(1, 1000.0), (2, 1000.0)])
        .with_required_ordering(OrderByColumns::new([(ColumnRef::new(0, 2), Direction::Ascending)]))
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    assert_eq!(plan.plan_type, PlanType::Normal);
    assert!(plan.sort_required);
    assert_eq!(plan.explain.op, "Sort");
}

#[test]
fn infeasible_hint_yields_no_best_plan() {
    let t = BaseTable::new(TableNumber(0), table("T", 1, None)).with_properties(TableProperties {
        join_strategy: Some(JoinStrategy::Hash),
        ..TableProperties::default()
    });
    let mut block = QueryBlock::new(vec![t], PredicateList::new()).expect("block");
    let err = optimizer(OptimizerConfig::default(), &[(1, 100.0)])
        .optimize(&mut block, &mut CompilationContext::new())
        .unwrap_err();
    assert!(matches!(err, PlanError::NoBestPlan));
}

#[test]
fn empty_block_is_rejected() {
    let mut block = QueryBlock::new(Vec::new(), PredicateList::new()).expect("block");
    let err = optimizer(OptimizerConfig::default(), &[])
        .optimize(&mut block, &mut CompilationContext::new())
        .unwrap_err();
    assert!(matches!(err, PlanError::InvalidArgument(_)));
}

#[test]
fn plan_hash_is_stable_and_serializes() {
    let first = optimizer(OptimizerConfig::default(), &BIG_SMALL_ROWS)
        .optimize(&mut big_small_block(), &mut CompilationContext::new())
        .expect("plan");
    let second = optimizer(OptimizerConfig::default(), &BIG_SMALL_ROWS)
        .optimize(&mut big_small_block(), &mut CompilationContext::new())
        .expect("plan");
    assert_eq!(first.plan_hash, second.plan_hash);

    let json = first.to_json().expect("json");
    let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(value["plan_hash"].as_u64(), Some(first.plan_hash));
    assert_eq!(value["tables"].as_array().map(Vec::len), Some(2));
}
