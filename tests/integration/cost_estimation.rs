use std::io::Write as _;
use std::sync::Arc;

use accesspath::query::expr::{Condition, Operand, RelOp};
use accesspath::query::metadata::{
    ConglomerateDescriptor, IndexDescriptor, InMemoryCostController, InMemoryMetadata, TableDescriptor,
};
use accesspath::types::{ConglomId, TableNumber};
use accesspath::{
    BaseTable, CompilationContext, ConfigError, LockMode, Optimizer, OptimizerConfig, Predicate,
    PredicateList, QueryBlock, TableProperties,
};
use proptest::prelude::*;

fn descriptor(unique: bool) -> Arc<TableDescriptor> {
    Arc::new(
        TableDescriptor::new("T")
            .with_column("A", 4)
            .with_column("B", 8)
            .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(1), "T"))
            .with_conglomerate(ConglomerateDescriptor::index(
                ConglomId(2),
                "T_A",
                IndexDescriptor::new([1]).with_unique(unique),
            )),
    )
}

fn metadata() -> InMemoryMetadata {
    InMemoryMetadata::new()
        .with_controller(ConglomId(1), InMemoryCostController::new(1000.0))
        .with_controller(ConglomId(2), InMemoryCostController::new(1000.0))
}

fn a_equals(value: i64) -> PredicateList {
    [Predicate::new(Condition::compare(
        Operand::column(0, 1),
        RelOp::Eq,
        Operand::constant(value),
    ))]
    .into_iter()
    .collect()
}

fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
}

#[test]
fn unique_lookup_wins_and_keys_reach_the_scan() {
    let table = BaseTable::new(TableNumber(0), descriptor(true)).with_referenced_columns([1]);
    let mut block = QueryBlock::new(vec![table], a_equals(5)).expect("block");
    let plan = Optimizer::new(OptimizerConfig::default(), Arc::new(metadata()))
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    let scan = &plan.tables[0];
    assert_eq!(scan.access_path.conglomerate().map(|cd| cd.name()), Some("T_A"));
    assert_eq!(scan.access_path.lock_mode(), Some(LockMode::Record));
    assert_close(plan.cost.cost(), 2.0);
    assert_close(plan.cost.row_count(), 1.0);
    assert_eq!(scan.store_restrictions.len(), 1);
    assert_eq!(scan.store_restrictions.start_count(), 1);
    assert_eq!(scan.store_restrictions.stop_count(), 1);
    assert!(plan.remaining_predicates.is_empty());
}

#[test]
fn full_scan_prefers_heap_and_locks_table() {
    let table = BaseTable::new(TableNumber(0), descriptor(false)).with_referenced_columns([1, 2]);
    let mut block = QueryBlock::new(vec![table], PredicateList::new()).expect("block");
    let plan = Optimizer::new(OptimizerConfig::default(), Arc::new(metadata()))
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");

    let scan = &plan.tables[0];
    assert_eq!(scan.access_path.conglomerate().map(|cd| cd.name()), Some("T"));
    assert_eq!(scan.access_path.lock_mode(), Some(LockMode::Table));
    assert_close(plan.cost.cost(), 101.5);
}

#[test]
fn lock_threshold_escalates_keyed_scan() {
    let forced = TableProperties {
        index: Some("T_A".into()),
        ..TableProperties::default()
    };
    let plan_with = |threshold: u32| {
        let table = BaseTable::new(TableNumber(0), descriptor(false))
            .with_referenced_columns([1, 2])
            .with_properties(forced.clone());
        let mut block = QueryBlock::new(vec![table], a_equals(5)).expect("block");
        let config = OptimizerConfig {
            table_lock_threshold: threshold,
            ..OptimizerConfig::default()
        };
        Optimizer::new(config, Arc::new(metadata()))
            .optimize(&mut block, &mut CompilationContext::new())
            .expect("plan")
    };

    let relaxed = plan_with(5000);
    assert_eq!(relaxed.tables[0].access_path.lock_mode(), Some(LockMode::Record));
    assert_close(relaxed.cost.cost(), 113.0);
    assert_close(relaxed.cost.row_count(), 100.0);

    let strict = plan_with(50);
    assert_eq!(strict.tables[0].access_path.lock_mode(), Some(LockMode::Table));
}

#[test]
fn statistics_refresh_checked_once_per_table() {
    let meta = Arc::new(metadata());
    let table = BaseTable::new(TableNumber(0), descriptor(false)).with_referenced_columns([1, 2]);
    let mut block = QueryBlock::new(vec![table], a_equals(5)).expect("block");
    Optimizer::new(OptimizerConfig::default(), meta.clone())
        .optimize(&mut block, &mut CompilationContext::new())
        .expect("plan");
    assert_eq!(meta.refresh_requests(), 1);
}

#[test]
fn missing_cost_controller_is_reported() {
    let table = BaseTable::new(TableNumber(0), descriptor(false));
    let mut block = QueryBlock::new(vec![table], PredicateList::new()).expect("block");
    let err = Optimizer::new(OptimizerConfig::default(), Arc::new(InMemoryMetadata::new()))
        .optimize(&mut block, &mut CompilationContext::new())
        .unwrap_err();
    assert!(matches!(err, accesspath::PlanError::NotFound(_)));
}

#[test]
fn disabling_statistics_keeps_heuristic_row_estimate() {
    let plan_with = |config: OptimizerConfig| {
        let table = BaseTable::new(TableNumber(0), descriptor(false)).with_referenced_columns([1, 2]);
        let mut block = QueryBlock::new(vec![table], a_equals(5)).expect("block");
        let meta = metadata().with_statistics(ConglomId(2), vec![0.02]);
        Optimizer::new(config, Arc::new(meta))
            .optimize(&mut block, &mut CompilationContext::new())
            .expect("plan")
    };

    // The heap wins either way; only its row estimate follows the statistics.
    let with_stats = plan_with(OptimizerConfig::default());
    assert_eq!(with_stats.tables[0].access_path.conglomerate().map(|cd| cd.name()), Some("T"));
    assert_close(with_stats.cost.cost(), 101.5);
    assert_close(with_stats.cost.row_count(), 1005.0 * 0.02);

    let without = plan_with(OptimizerConfig::without_statistics());
    assert_eq!(without.tables[0].access_path.conglomerate().map(|cd| cd.name()), Some("T"));
    assert_close(without.cost.cost(), 101.5);
    assert_close(without.cost.row_count(), 100.5);
}

#[test]
fn config_round_trips_through_toml_file() {
    let config = OptimizerConfig {
        use_statistics: false,
        table_lock_threshold: 250,
        max_memory_per_table: 4096,
        max_join_orders: Some(12),
    };
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(config.to_toml_string().expect("serialize").as_bytes())
        .expect("write");
    let loaded = OptimizerConfig::load(file.path()).expect("load");
    assert_eq!(loaded, config);

    let partial = OptimizerConfig::from_toml_str("table_lock_threshold = 10").expect("parse");
    assert_eq!(partial.table_lock_threshold, 10);
    assert!(partial.use_statistics);

    assert!(matches!(
        OptimizerConfig::from_toml_str("table_lock_threshold = 0"),
        Err(ConfigError::Invalid { .. })
    ));
    assert!(matches!(
        OptimizerConfig::from_toml_str("unknown_knob = 1"),
        Err(ConfigError::Parse { .. })
    ));
}

fn statistics_table() -> TableDescriptor {
    TableDescriptor::new("S")
        .with_conglomerate(ConglomerateDescriptor::heap(ConglomId(1), "S"))
        .with_conglomerate(ConglomerateDescriptor::index(ConglomId(2), "S_AB", IndexDescriptor::new([1, 2])))
        .with_conglomerate(ConglomerateDescriptor::index(ConglomId(3), "S_C", IndexDescriptor::new([3])))
}

proptest! {
    #[test]
    fn prop_statistics_selectivity_is_a_fraction(
        columns in prop::collection::vec(1u16..=4, 1..8),
        ab in prop::collection::vec(0.0001f64..=1.0, 1..3),
        c in 0.0001f64..=1.0,
    ) {
        let list: PredicateList = columns
            .into_iter()
            .map(|column| {
                Predicate::new(Condition::compare(
                    Operand::column(0, column),
                    RelOp::Eq,
                    Operand::constant(1i64),
                ))
            })
            .collect();
        let meta = InMemoryMetadata::new()
            .with_statistics(ConglomId(2), ab)
            .with_statistics(ConglomId(3), vec![c]);
        let selectivity = list.selectivity(TableNumber(0), &statistics_table(), &meta);
        prop_assert!(selectivity == -1.0 || (selectivity > 0.0 && selectivity <= 1.0), "got {}", selectivity);
    }

    #[test]
    fn prop_more_matched_equalities_never_raise_selectivity(
        matched in 1usize..=2,
        first in 0.0001f64..=1.0,
        narrowing in 0.0001f64..=1.0,
        c in 0.0001f64..=1.0,
        with_residual in any::<bool>(),
        reversed in any::<bool>(),
    ) {
        let eq = |column: u16| {
            Predicate::new(Condition::compare(
                Operand::column(0, column),
                RelOp::Eq,
                Operand::constant(1i64),
            ))
        };
        let build = |columns: usize| -> PredicateList {
            let mut preds: Vec<Predicate> = (1..=columns as u16).map(eq).collect();
            if with_residual {
                preds.push(eq(4));
            }
            if reversed {
                preds.reverse();
            }
            preds.into_iter().collect()
        };
        // Statistics for a longer key prefix are never looser than a shorter one.
        let meta = InMemoryMetadata::new()
            .with_statistics(ConglomId(2), vec![first, first * narrowing])
            .with_statistics(ConglomId(3), vec![c]);
        let table = statistics_table();

        let before = build(matched).selectivity(TableNumber(0), &table, &meta);
        let after = build(matched + 1).selectivity(TableNumber(0), &table, &meta);
        prop_assert!(before > 0.0 && before <= 1.0, "before {}", before);
        prop_assert!(after > 0.0 && after <= 1.0, "after {}", after);
        prop_assert!(after <= before, "{} > {}", after, before);
    }
}
