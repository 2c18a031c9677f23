//! Boolean conjuncts as the optimizer sees them.
//!
//! Only the shape of each conjunct matters here: which side holds a column of
//! the table being optimized, what the other side references, and which
//! relational operator connects them. Everything else a binder would know is
//! folded into [`Operand::Expression`] and [`Condition::Opaque`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::table_map::TableMap;
use crate::query::value::Value;
use crate::types::{ColumnNumber, ColumnRef, TableNumber};

/// One side of a comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Column of a table in the query block.
    Column(ColumnRef),
    /// Literal known at compile time.
    Constant(Value),
    /// Dynamic parameter, known once per execution.
    Parameter(u32),
    /// Any other expression, described by the tables it references.
    Expression { tables: TableMap, text: String },
}

impl Operand {
    pub fn column(table: u16, column: u16) -> Self {
        Operand::Column(ColumnRef::new(table, column))
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Operand::Constant(value.into())
    }

    pub fn referenced_tables(&self) -> TableMap {
        match self {
            Operand::Column(col) => TableMap::single(col.table),
            Operand::Constant(_) | Operand::Parameter(_) => TableMap::new(),
            Operand::Expression { tables, .. } => tables.clone(),
        }
    }

    pub fn references(&self, table: TableNumber) -> bool {
        match self {
            Operand::Column(col) => col.table == table,
            Operand::Constant(_) | Operand::Parameter(_) => false,
            Operand::Expression { tables, .. } => tables.contains(table),
        }
    }

    pub fn as_column(&self) -> Option<ColumnRef> {
        match self {
            Operand::Column(col) => Some(*col),
            _ => None,
        }
    }

    /// The column if it belongs to `table`.
    pub fn column_of(&self, table: TableNumber) -> Option<ColumnRef> {
        self.as_column().filter(|col| col.table == table)
    }

    /// Constants and parameters have a single value for the whole scan.
    pub fn is_known_constant(&self) -> bool {
        matches!(self, Operand::Constant(_) | Operand::Parameter(_))
    }

    /// Same constant (numerically for numbers) or same parameter.
    pub fn same_comparand(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Constant(a), Operand::Constant(b)) => a.same_constant(b),
            (Operand::Parameter(a), Operand::Parameter(b)) => a == b,
            _ => false,
        }
    }

    pub fn constant_value(&self) -> Option<&Value> {
        match self {
            Operand::Constant(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Column(col) => write!(f, "{col}"),
            Operand::Constant(value) => write!(f, "{value}"),
            Operand::Parameter(idx) => write!(f, "?{idx}"),
            Operand::Expression { text, .. } => write!(f, "{text}"),
        }
    }
}

/// Relational operators understood by scan classification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
}

impl RelOp {
    /// Operator that keeps the comparison true when its operands swap sides.
    pub fn flip(self) -> Self {
        match self {
            RelOp::Lt => RelOp::Gt,
            RelOp::Le => RelOp::Ge,
            RelOp::Gt => RelOp::Lt,
            RelOp::Ge => RelOp::Le,
            other => other,
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, RelOp::Eq | RelOp::IsNull)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            RelOp::Eq => "=",
            RelOp::Ne => "<>",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
            RelOp::IsNull => "IS NULL",
            RelOp::IsNotNull => "IS NOT NULL",
        }
    }

    /// Heuristic fraction of rows satisfying the operator.
    pub fn default_selectivity(self) -> f64 {
        match self {
            RelOp::Eq | RelOp::IsNull => 0.1,
            RelOp::Ne | RelOp::IsNotNull => 0.9,
            RelOp::Lt | RelOp::Le | RelOp::Gt | RelOp::Ge => 0.33,
        }
    }
}

/// Positioning operator handed to the store for a start or stop key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOp {
    /// Position at or after (start) / stop at or after (stop) the key.
    Ge,
    /// Position strictly after (start) / stop strictly after (stop) the key.
    Gt,
}

/// A top-level conjunct of the WHERE clause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Binary comparison `left <op> right`.
    Compare {
        op: RelOp,
        left: Operand,
        right: Operand,
    },
    /// `operand IS [NOT] NULL`.
    Unary { op: RelOp, operand: Operand },
    /// `operand IN (values...)` kept in its original form.
    InList { operand: Operand, values: Vec<Operand> },
    /// `column = ?` placeholder standing for an IN-list probed at execution.
    Probe { column: ColumnRef, values: Vec<Operand> },
    /// Disjunction of simpler conditions.
    Or(Vec<Condition>),
    /// `operand LIKE pattern`.
    Like { operand: Operand, pattern: Operand },
    /// Anything else; carries its own selectivity guess.
    Opaque {
        tables: TableMap,
        selectivity: f64,
        text: String,
    },
}

impl Condition {
    pub fn compare(left: Operand, op: RelOp, right: Operand) -> Self {
        Condition::Compare { op, left, right }
    }

    pub fn is_null(operand: Operand) -> Self {
        Condition::Unary {
            op: RelOp::IsNull,
            operand,
        }
    }

    pub fn is_not_null(operand: Operand) -> Self {
        Condition::Unary {
            op: RelOp::IsNotNull,
            operand,
        }
    }

    pub fn referenced_tables(&self) -> TableMap {
        let mut map = TableMap::new();
        match self {
            Condition::Compare { left, right, .. } => {
                map.union_with(&left.referenced_tables());
                map.union_with(&right.referenced_tables());
            }
            Condition::Unary { operand, .. } => map.union_with(&operand.referenced_tables()),
            Condition::InList { operand, values } => {
                map.union_with(&operand.referenced_tables());
                for value in values {
                    map.union_with(&value.referenced_tables());
                }
            }
            Condition::Probe { column, values } => {
                map.insert(column.table);
                for value in values {
                    map.union_with(&value.referenced_tables());
                }
            }
            Condition::Or(items) => {
                for item in items {
                    map.union_with(&item.referenced_tables());
                }
            }
            Condition::Like { operand, pattern } => {
                map.union_with(&operand.referenced_tables());
                map.union_with(&pattern.referenced_tables());
            }
            Condition::Opaque { tables, .. } => map.union_with(tables),
        }
        map
    }

    /// The relational operator, for conditions scans can use as keys.
    pub fn operator(&self) -> Option<RelOp> {
        match self {
            Condition::Compare { op, .. } | Condition::Unary { op, .. } => Some(*op),
            Condition::Probe { .. } => Some(RelOp::Eq),
            _ => None,
        }
    }

    pub fn is_relational(&self) -> bool {
        self.operator().is_some()
    }

    pub fn is_in_list(&self) -> bool {
        matches!(self, Condition::InList { .. })
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, Condition::Probe { .. })
    }

    /// Number of values an IN-list or probe placeholder stands for.
    pub fn list_len(&self) -> Option<usize> {
        match self {
            Condition::InList { values, .. } | Condition::Probe { values, .. } => {
                Some(values.len())
            }
            _ => None,
        }
    }

    /// The IN-list a probe placeholder was derived from.
    pub fn source_in_list(&self) -> Option<Condition> {
        match self {
            Condition::Probe { column, values } => Some(Condition::InList {
                operand: Operand::Column(*column),
                values: values.clone(),
            }),
            _ => None,
        }
    }

    /// Column of `table` with position `column` on either side of a relational operator.
    pub fn column_operand(&self, table: TableNumber, column: ColumnNumber) -> Option<ColumnRef> {
        let wanted = |operand: &Operand| {
            operand
                .column_of(table)
                .filter(|col| col.column == column)
        };
        match self {
            Condition::Compare { left, right, .. } => wanted(left).or_else(|| wanted(right)),
            Condition::Unary { operand, .. } => wanted(operand),
            Condition::Probe { column: col, .. } => {
                Some(*col).filter(|c| c.table == table && c.column == column)
            }
            _ => None,
        }
    }

    /// Any column of `table` on one side of a relational operator, left first.
    pub fn any_column_operand(&self, table: TableNumber) -> Option<ColumnRef> {
        match self {
            Condition::Compare { left, right, .. } => {
                left.column_of(table).or_else(|| right.column_of(table))
            }
            Condition::Unary { operand, .. } => operand.column_of(table),
            Condition::Probe { column, .. } => Some(*column).filter(|c| c.table == table),
            _ => None,
        }
    }

    /// True when the side opposite `col` references `col`'s own table.
    pub fn self_comparison(&self, col: ColumnRef) -> bool {
        match self {
            Condition::Compare { left, right, .. } => {
                let other = if left.as_column() == Some(col) { right } else { left };
                other.references(col.table)
            }
            Condition::Probe { values, .. } | Condition::InList { values, .. } => {
                values.iter().any(|value| value.references(col.table))
            }
            _ => false,
        }
    }

    /// Whether the store can evaluate this operator row by row for `table`.
    pub fn is_qualifier(&self, table: TableNumber) -> bool {
        match self {
            Condition::Compare { left, right, .. } => {
                (left.column_of(table).is_some() && !right.references(table))
                    || (right.column_of(table).is_some() && !left.references(table))
            }
            Condition::Unary { operand, .. } => operand.column_of(table).is_some(),
            Condition::Probe { column, values } => {
                column.table == table && !values.iter().any(|v| v.references(table))
            }
            _ => false,
        }
    }

    fn column_on_left(&self, table: TableNumber) -> Option<bool> {
        match self {
            Condition::Compare { left, right, .. } => {
                if left.column_of(table).is_some() {
                    Some(true)
                } else if right.column_of(table).is_some() {
                    Some(false)
                } else {
                    None
                }
            }
            Condition::Unary { operand, .. } => operand.column_of(table).map(|_| true),
            Condition::Probe { column, .. } => (column.table == table).then_some(true),
            _ => None,
        }
    }

    /// Operator with the column of `table` normalized onto the left side.
    fn column_side_operator(&self, table: TableNumber) -> Option<RelOp> {
        let op = self.operator()?;
        let left = self.column_on_left(table)?;
        Some(if left { op } else { op.flip() })
    }

    pub fn useful_start_key(&self, table: TableNumber) -> bool {
        matches!(
            self.column_side_operator(table),
            Some(RelOp::Eq | RelOp::Gt | RelOp::Ge | RelOp::IsNull)
        )
    }

    pub fn useful_stop_key(&self, table: TableNumber) -> bool {
        matches!(
            self.column_side_operator(table),
            Some(RelOp::Eq | RelOp::Lt | RelOp::Le | RelOp::IsNull)
        )
    }

    pub fn start_operator(&self) -> ScanOp {
        match self.operator() {
            Some(RelOp::Lt | RelOp::Gt) => ScanOp::Gt,
            _ => ScanOp::Ge,
        }
    }

    pub fn stop_operator(&self) -> ScanOp {
        match self.operator() {
            Some(RelOp::Lt | RelOp::Gt) => ScanOp::Ge,
            _ => ScanOp::Gt,
        }
    }

    /// The key value compares a column of `table` against a constant or parameter.
    pub fn compare_with_known_constant(&self, table: TableNumber) -> bool {
        match self {
            Condition::Compare { left, right, .. } => {
                (left.column_of(table).is_some() && right.is_known_constant())
                    || (right.column_of(table).is_some() && left.is_known_constant())
            }
            Condition::Unary { op, operand } => {
                *op == RelOp::IsNull && operand.column_of(table).is_some()
            }
            Condition::Probe { column, .. } => column.table == table,
            _ => false,
        }
    }

    /// Compile-time key value; `None` when only known at execution.
    pub fn compare_value(&self, table: TableNumber) -> Option<Value> {
        match self {
            Condition::Compare { left, right, .. } => {
                let other = if left.column_of(table).is_some() { right } else { left };
                other.constant_value().cloned()
            }
            Condition::Unary {
                op: RelOp::IsNull, ..
            } => Some(Value::Null),
            _ => None,
        }
    }

    /// Column of `table` pinned by `col = <constant or parameter>`.
    pub fn equals_constant_column(&self, table: TableNumber) -> Option<ColumnRef> {
        match self {
            Condition::Compare {
                op: RelOp::Eq,
                left,
                right,
            } => match (left.column_of(table), right.column_of(table)) {
                (Some(col), _) if right.is_known_constant() => Some(col),
                (_, Some(col)) if left.is_known_constant() => Some(col),
                _ => None,
            },
            _ => None,
        }
    }

    /// `col = <expr not referencing table>` (or `col IS NULL` when allowed) on `column`.
    pub fn optimizable_equality(&self, table: TableNumber, column: ColumnNumber, null_ok: bool) -> bool {
        let op = match self {
            Condition::Compare { op, .. } | Condition::Unary { op, .. } => *op,
            _ => return false,
        };
        let accepted = op == RelOp::Eq || (null_ok && op == RelOp::IsNull);
        if !accepted {
            return false;
        }
        match self.column_operand(table, column) {
            Some(col) => !self.self_comparison(col),
            None => false,
        }
    }

    /// Column of `table` equated with something that does not reference it.
    pub fn equality_column(&self, table: TableNumber) -> Option<ColumnNumber> {
        match self {
            Condition::Compare {
                op: RelOp::Eq,
                left,
                right,
            } => {
                if let Some(col) = left.column_of(table) {
                    if !right.references(table) {
                        return Some(col.column);
                    }
                }
                if let Some(col) = right.column_of(table) {
                    if !left.references(table) {
                        return Some(col.column);
                    }
                }
                None
            }
            _ => None,
        }
    }

    /// Position within `positions` of a column of `table` this equality pins.
    pub fn equality_position(&self, positions: &[ColumnNumber], table: TableNumber) -> Option<usize> {
        if self.operator() != Some(RelOp::Eq) {
            return None;
        }
        positions.iter().position(|column| {
            self.column_operand(table, *column)
                .map(|col| !self.self_comparison(col))
                .unwrap_or(false)
        })
    }

    /// Column pair of a `t1.a = t2.b` join between different tables.
    pub fn equijoin_columns(&self) -> Option<(ColumnRef, ColumnRef)> {
        match self {
            Condition::Compare {
                op: RelOp::Eq,
                left: Operand::Column(left),
                right: Operand::Column(right),
            } if left.table != right.table => Some((*left, *right)),
            _ => None,
        }
    }

    /// Rewrites `const <op> col` as `col <op'> const`.
    pub fn put_column_on_left(&mut self) {
        if let Condition::Compare { op, left, right } = self {
            if left.is_known_constant() && matches!(right, Operand::Column(_)) {
                std::mem::swap(left, right);
                *op = op.flip();
            }
        }
    }

    /// `(column, operator, comparand)` view of a search clause: a column
    /// compared with a constant or parameter, or a null test on a column.
    pub fn search_clause(&self) -> Option<(ColumnRef, RelOp, Option<&Operand>)> {
        match self {
            Condition::Compare {
                op,
                left: Operand::Column(col),
                right,
            } if right.is_known_constant() => Some((*col, *op, Some(right))),
            Condition::Unary {
                op,
                operand: Operand::Column(col),
            } => Some((*col, *op, None)),
            _ => None,
        }
    }

    /// The same search clause applied to another column.
    pub fn with_search_column(&self, column: ColumnRef) -> Option<Condition> {
        match self {
            Condition::Compare {
                op,
                left: Operand::Column(_),
                right,
            } => Some(Condition::Compare {
                op: *op,
                left: Operand::Column(column),
                right: right.clone(),
            }),
            Condition::Unary {
                op,
                operand: Operand::Column(_),
            } => Some(Condition::Unary {
                op: *op,
                operand: Operand::Column(column),
            }),
            _ => None,
        }
    }

    /// An OR whose every branch is a single-table qualifier on `table`.
    pub fn is_pushable_or_clause(&self, table: TableNumber) -> bool {
        match self {
            Condition::Or(items) => {
                !items.is_empty()
                    && items.iter().all(|item| {
                        item.is_relational()
                            && !item.is_probe()
                            && item.is_qualifier(table)
                            && item.referenced_tables() == TableMap::single(table)
                    })
            }
            _ => false,
        }
    }

    /// `column IN (...)` on `column` of `table` whose values do not reference the table.
    pub fn in_list_on(&self, table: TableNumber, column: ColumnNumber) -> bool {
        match self {
            Condition::InList {
                operand: Operand::Column(col),
                values,
            } => {
                col.table == table
                    && col.column == column
                    && !values.iter().any(|value| value.references(table))
            }
            _ => false,
        }
    }

    /// `col LIKE ?` on the given column.
    pub fn is_like_parameter_on(&self, column: ColumnRef) -> bool {
        matches!(
            self,
            Condition::Like {
                operand: Operand::Column(col),
                pattern: Operand::Parameter(_),
            } if *col == column
        )
    }

    /// Heuristic fraction of rows that satisfy the condition.
    pub fn selectivity(&self) -> f64 {
        match self {
            Condition::Compare { op, .. } | Condition::Unary { op, .. } => {
                op.default_selectivity()
            }
            Condition::Probe { values, .. } | Condition::InList { values, .. } => {
                (0.1 * values.len() as f64).min(1.0)
            }
            Condition::Or(_) | Condition::Like { .. } => 0.5,
            Condition::Opaque { selectivity, .. } => *selectivity,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { op, left, right } => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            Condition::Unary { op, operand } => write!(f, "{operand} {}", op.symbol()),
            Condition::InList { operand, values } => {
                write!(f, "{operand} IN (")?;
                write_list(f, values)?;
                write!(f, ")")
            }
            Condition::Probe { column, values } => {
                write!(f, "{column} = ?probe[")?;
                write_list(f, values)?;
                write!(f, "]")
            }
            Condition::Or(items) => {
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " OR ")?;
                    }
                    write!(f, "({item})")?;
                }
                Ok(())
            }
            Condition::Like { operand, pattern } => write!(f, "{operand} LIKE {pattern}"),
            Condition::Opaque { text, .. } => write!(f, "{text}"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, values: &[Operand]) -> fmt::Result {
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}
