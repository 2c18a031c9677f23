//! Explain tree and plan hash for a finished [`QueryPlan`](crate::query::optimizer::QueryPlan).

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

use crate::query::cost::CostEstimate;
use crate::query::optimizer::TablePlan;
use crate::query::predicate_list::PredicateList;

/// One operator of the chosen plan: a table or index scan, a join of the
/// plan so far with the next table, or the final sort.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExplainNode {
    /// `TableScan`, `IndexScan`, `Join`, `Sort` or `Empty`.
    pub op: String,
    /// Annotations in insertion order.
    pub props: Vec<ExplainProp>,
    /// Outer side first; scans have none.
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Operator `op` without annotations or inputs.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Value of the first property named `key`.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|prop| prop.key == key)
            .map(|prop| prop.value.as_str())
    }

    /// Copy of the tree with literal property values masked.
    pub fn redacted(&self) -> ExplainNode {
        ExplainNode {
            op: self.op.clone(),
            props: self
                .props
                .iter()
                .map(|prop| ExplainProp {
                    value: if prop.redactable { "?".into() } else { prop.value.clone() },
                    ..prop.clone()
                })
                .collect(),
            inputs: self.inputs.iter().map(ExplainNode::redacted).collect(),
        }
    }
}

/// Key/value annotation on a plan operator, such as the conglomerate a scan
/// reads or the predicates handed to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplainProp {
    /// Annotation name, e.g. `conglomerate` or `store`.
    pub key: String,
    /// Rendered value.
    pub value: String,
    /// Set when `value` embeds query constants.
    pub redactable: bool,
}

impl ExplainProp {
    fn shown(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_redaction(key, value, false)
    }

    fn masked(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_redaction(key, value, true)
    }

    fn with_redaction(key: impl Into<String>, value: impl Into<String>, redactable: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable,
        }
    }
}

/// Builds a left-deep tree: each join takes the tree so far as its outer
/// input and the next table's scan as its inner input.
pub(crate) fn build_explain_tree(tables: &[TablePlan], cost: &CostEstimate, sort_required: bool) -> ExplainNode {
    let mut tree: Option<ExplainNode> = None;
    for plan in tables {
        let scan = scan_node(plan);
        tree = Some(match tree {
            None => scan,
            Some(outer) => {
                let strategy = plan
                    .access_path
                    .join_strategy()
                    .map(|strategy| strategy.name())
                    .unwrap_or("unknown");
                let mut join = ExplainNode::new("Join");
                join.props.push(ExplainProp::shown("strategy", strategy));
                join.inputs = vec![outer, scan];
                join
            }
        });
    }
    let mut root = tree.unwrap_or_else(|| ExplainNode::new("Empty"));
    if sort_required {
        let mut sort = ExplainNode::new("Sort");
        sort.inputs.push(root);
        root = sort;
    }
    root.props.push(ExplainProp::shown("cost", fmt_number(cost.cost())));
    root.props.push(ExplainProp::shown("rows", fmt_number(cost.row_count())));
    root
}

fn scan_node(plan: &TablePlan) -> ExplainNode {
    let path = &plan.access_path;
    let op = match path.conglomerate() {
        Some(cd) if cd.is_index() => "IndexScan",
        _ => "TableScan",
    };
    let mut node = ExplainNode::new(op);
    node.props.push(ExplainProp::shown("table", plan.name.clone()));
    node.props.push(ExplainProp::shown("table_number", plan.table.to_string()));
    if let Some(cd) = path.conglomerate() {
        node.props.push(ExplainProp::shown("conglomerate", cd.name()));
    }
    if let Some(lock) = path.lock_mode() {
        node.props.push(ExplainProp::shown("lock", lock.to_string()));
    }
    if path.covering_index_scan() {
        node.props.push(ExplainProp::shown("covering", "true"));
    }
    if !plan.hash_key_columns.is_empty() {
        let keys: Vec<String> = plan.hash_key_columns.iter().map(|col| col.0.to_string()).collect();
        node.props.push(ExplainProp::shown("hash_keys", keys.join(",")));
    }
    push_predicates(&mut node, "store", &plan.store_restrictions);
    push_predicates(&mut node, "probe", &plan.non_store_restrictions);
    push_predicates(&mut node, "requalify", &plan.requalification);
    push_predicates(&mut node, "residual", &plan.residual);
    node.props.push(ExplainProp::shown("cost", fmt_number(path.cost_estimate().cost())));
    node.props.push(ExplainProp::shown("rows", fmt_number(path.cost_estimate().row_count())));
    node
}

fn push_predicates(node: &mut ExplainNode, key: &str, preds: &PredicateList) {
    if !preds.is_empty() {
        node.props.push(ExplainProp::masked(key, preds.to_string()));
    }
}

fn fmt_number(value: f64) -> String {
    format!("{value:.4}")
}

/// Deterministic hash over operators and property values.
pub(crate) fn compute_plan_hash(root: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_explain_node(root, &mut hasher);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}
