//! # Bound Query Representation
//!
//! This module defines the query tree the advisor analyses. The tree is already
//! bound to catalog objects: every column reference names the range-table slot it
//! belongs to and the attribute number inside that relation, so no name resolution
//! is needed while walking it.
//!
//! ## Range Tables and Nesting
//!
//! A `Query` owns a range table (`Vec<RangeTableEntry>`). A column reference (`Var`)
//! points into a range table with a 1-based `varno`, and `levels_up` says how many
//! query levels outward that range table lives. `levels_up == 0` is the current query,
//! `1` is the immediately enclosing query (a correlated reference from a sub-link),
//! and so on. The `RangeTableStack` tracks the range tables of the queries currently
//! being walked and resolves a `Var` to its entry.
//!
//! ## Scalar Expressions (`Expr`)
//! Column references, constants, operators, boolean connectives, function calls,
//! type coercions and sub-links (nested queries inside an expression). Node kinds the
//! walkers do not treat specially are still reachable through `Expr::children`.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a relation (table) in the catalog.
pub type RelId = u32;
/// Attribute number of a column inside its relation. `0` marks an expression slot;
/// negative numbers are system columns.
pub type AttrNumber = i16;
/// Identifier of a data type.
pub type TypeId = u32;
/// Identifier of an index, physical or hypothetical.
pub type IndexId = u32;
/// Identifier of an operator class.
pub type OpClassId = u32;
/// Identifier of a collation.
pub type CollationId = u32;
/// Identifier of a function.
pub type FuncId = u32;

/// Well-known type identifiers.
pub mod types {
    use super::TypeId;

    pub const BOOL: TypeId = 16;
    pub const INT8: TypeId = 20;
    pub const INT4: TypeId = 23;
    pub const TEXT: TypeId = 25;
    pub const FLOAT8: TypeId = 701;
    pub const BPCHAR: TypeId = 1042;
    pub const VARCHAR: TypeId = 1043;
    pub const DATE: TypeId = 1082;
    pub const TIMESTAMP: TypeId = 1114;

    /// Types whose values are compared as character strings.
    pub fn is_text_like(type_id: TypeId) -> bool {
        matches!(type_id, TEXT | BPCHAR | VARCHAR)
    }
}

/// Collation used for text keys when nothing else is specified.
pub const DEFAULT_COLLATION: CollationId = 100;

/// Constant value appearing in a query.
///
/// `OrderedFloat` keeps floats usable in `Eq`/`Hash` comparisons, which the
/// relation-clause deduplication relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Utf8(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
        }
    }
}

/// A typed constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Const {
    pub value: ScalarValue,
    pub type_id: TypeId,
}

/// Bound column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    /// 1-based position in the range table `levels_up` queries outward.
    pub varno: usize,
    pub attno: AttrNumber,
    pub type_id: TypeId,
    pub levels_up: usize,
}

/// Binary operators for comparison, pattern matching and arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// Equality comparison (`=`).
    Eq,
    /// Inequality comparison (`<>`).
    NotEq,
    /// Less than (`<`).
    Lt,
    /// Less than or equal (`<=`).
    LtEq,
    /// Greater than (`>`).
    Gt,
    /// Greater than or equal (`>=`).
    GtEq,
    /// Pattern match (`LIKE`).
    Like,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    /// Operators an ordered index can serve: equality, the four ordering comparisons
    /// and pattern matching.
    pub fn is_index_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
                | BinaryOp::Like
        )
    }

    /// The operator to use when the operands are swapped, if there is one.
    pub fn commute(self) -> Option<BinaryOp> {
        match self {
            BinaryOp::Eq => Some(BinaryOp::Eq),
            BinaryOp::NotEq => Some(BinaryOp::NotEq),
            BinaryOp::Lt => Some(BinaryOp::Gt),
            BinaryOp::LtEq => Some(BinaryOp::GtEq),
            BinaryOp::Gt => Some(BinaryOp::Lt),
            BinaryOp::GtEq => Some(BinaryOp::LtEq),
            BinaryOp::Add => Some(BinaryOp::Add),
            BinaryOp::Mul => Some(BinaryOp::Mul),
            BinaryOp::Like | BinaryOp::Sub | BinaryOp::Div => None,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Like => "LIKE",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        f.write_str(s)
    }
}

/// Unary operators for boolean logic and null checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Boolean negation (`NOT`).
    Not,
    /// Arithmetic negation (unary minus).
    Neg,
    IsNull,
    IsNotNull,
}

/// One `WHEN condition THEN result` arm of a `CASE` expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseArm {
    pub condition: Expr,
    pub result: Expr,
}

/// Scalar expressions used in qualifiers, target lists and join alias lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Const(Const),
    /// Binary operation (e.g., `a = 1`, `price + tax`, `name LIKE 'x%'`).
    BinaryOp {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// Function call (e.g., `lower(name)`).
    Function {
        func_id: FuncId,
        name: String,
        result_type: TypeId,
        args: Vec<Expr>,
    },
    /// Binary-compatible relabeling or I/O coercion of `arg` to `result_type`.
    Coerce {
        arg: Box<Expr>,
        result_type: TypeId,
    },
    /// Conjunction, stored flat.
    And(Vec<Expr>),
    /// Disjunction, stored flat.
    Or(Vec<Expr>),
    /// A nested query used as an expression (`EXISTS`, `IN (SELECT ...)`, scalar sub-select).
    SubLink(Box<Query>),
    Case {
        arms: Vec<CaseArm>,
        default: Option<Box<Expr>>,
    },
    /// Aggregate or window function call.
    Aggregate {
        name: String,
        args: Vec<Expr>,
    },
    Array(Vec<Expr>),
}

impl Expr {
    /// Direct child expressions. Sub-link queries are not expressions and are not
    /// returned; walkers that care about them match `Expr::SubLink` themselves.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var(_) | Expr::Const(_) | Expr::SubLink(_) => Vec::new(),
            Expr::BinaryOp { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::UnaryOp { operand, .. } => vec![operand.as_ref()],
            Expr::Coerce { arg, .. } => vec![arg.as_ref()],
            Expr::Function { args, .. }
            | Expr::Aggregate { args, .. }
            | Expr::And(args)
            | Expr::Or(args)
            | Expr::Array(args) => args.iter().collect(),
            Expr::Case { arms, default } => {
                let mut out: Vec<&Expr> = arms
                    .iter()
                    .flat_map(|arm| [&arm.condition, &arm.result])
                    .collect();
                if let Some(d) = default {
                    out.push(d.as_ref());
                }
                out
            }
        }
    }

    /// Range-table slots of the current query level referenced anywhere in this
    /// expression, including from correlated sub-links.
    pub fn local_varnos(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        self.collect_varnos(0, &mut out);
        out
    }

    fn collect_varnos(&self, depth: usize, out: &mut BTreeSet<usize>) {
        match self {
            Expr::Var(v) => {
                if v.levels_up == depth {
                    out.insert(v.varno);
                }
            }
            Expr::SubLink(q) => q.collect_varnos(depth + 1, out),
            other => {
                for child in other.children() {
                    child.collect_varnos(depth, out);
                }
            }
        }
    }

    pub fn contains_sublink(&self) -> bool {
        matches!(self, Expr::SubLink(_)) || self.children().iter().any(|c| c.contains_sublink())
    }

    /// Flatten AND-chains: (A AND (B AND C)) → [A, B, C].
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(exprs) => exprs.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// For a comparison written `constant op column`, the equivalent
    /// `column op' constant`; anything else is returned unchanged.
    pub fn column_first(&self) -> Expr {
        fn is_column(e: &Expr) -> bool {
            match e {
                Expr::Var(_) => true,
                Expr::Coerce { arg, .. } => is_column(arg),
                _ => false,
            }
        }

        if let Expr::BinaryOp { op, left, right } = self {
            let column_on_right = is_column(right) && !is_column(left);
            if column_on_right {
                if let Some(commuted) = op.commute() {
                    return Expr::BinaryOp {
                        op: commuted,
                        left: right.clone(),
                        right: left.clone(),
                    };
                }
            }
        }
        self.clone()
    }

    /// Copy of this expression with every column reference pointing at the first
    /// range-table slot of the current level. Used for predicates and index
    /// expressions that are stored against a single relation.
    pub fn rebased(&self) -> Expr {
        match self {
            Expr::Var(v) => Expr::Var(Var {
                varno: 1,
                levels_up: 0,
                ..v.clone()
            }),
            Expr::Const(_) | Expr::SubLink(_) => self.clone(),
            Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
                op: *op,
                left: Box::new(left.rebased()),
                right: Box::new(right.rebased()),
            },
            Expr::UnaryOp { op, operand } => Expr::UnaryOp {
                op: *op,
                operand: Box::new(operand.rebased()),
            },
            Expr::Function {
                func_id,
                name,
                result_type,
                args,
            } => Expr::Function {
                func_id: *func_id,
                name: name.clone(),
                result_type: *result_type,
                args: args.iter().map(Expr::rebased).collect(),
            },
            Expr::Coerce { arg, result_type } => Expr::Coerce {
                arg: Box::new(arg.rebased()),
                result_type: *result_type,
            },
            Expr::And(args) => Expr::And(args.iter().map(Expr::rebased).collect()),
            Expr::Or(args) => Expr::Or(args.iter().map(Expr::rebased).collect()),
            Expr::Array(args) => Expr::Array(args.iter().map(Expr::rebased).collect()),
            Expr::Aggregate { name, args } => Expr::Aggregate {
                name: name.clone(),
                args: args.iter().map(Expr::rebased).collect(),
            },
            Expr::Case { arms, default } => Expr::Case {
                arms: arms
                    .iter()
                    .map(|arm| CaseArm {
                        condition: arm.condition.rebased(),
                        result: arm.result.rebased(),
                    })
                    .collect(),
                default: default.as_ref().map(|d| Box::new(d.rebased())),
            },
        }
    }

    /// Convenience constructor for a column reference at the current level.
    pub fn column(varno: usize, attno: AttrNumber, type_id: TypeId) -> Expr {
        Expr::Var(Var {
            varno,
            attno,
            type_id,
            levels_up: 0,
        })
    }

    pub fn int(value: i64) -> Expr {
        Expr::Const(Const {
            value: ScalarValue::Int64(value),
            type_id: types::INT8,
        })
    }

    pub fn boolean(value: bool) -> Expr {
        Expr::Const(Const {
            value: ScalarValue::Bool(value),
            type_id: types::BOOL,
        })
    }

    pub fn text(value: impl Into<String>) -> Expr {
        Expr::Const(Const {
            value: ScalarValue::Utf8(value.into()),
            type_id: types::TEXT,
        })
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// What a range-table slot is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeTableKind {
    /// A base relation. `inherit` is set when the reference also covers the
    /// relation's inheritance children.
    Relation { rel_id: RelId, inherit: bool },
    /// A sub-select in FROM.
    Subquery(Box<Query>),
    /// The output of a join; `alias_vars` lists the expression behind each output column.
    Join { alias_vars: Vec<Expr> },
    /// A reference to a common table expression declared in some enclosing query.
    Cte { name: String },
    /// A set-returning function in FROM.
    Function { args: Vec<Expr> },
}

/// A range-table slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeTableEntry {
    /// The name the slot is visible under in its query (table alias or table name).
    pub alias: String,
    pub kind: RangeTableKind,
}

impl RangeTableEntry {
    pub fn relation(alias: impl Into<String>, rel_id: RelId) -> Self {
        Self {
            alias: alias.into(),
            kind: RangeTableKind::Relation {
                rel_id,
                inherit: false,
            },
        }
    }

    pub fn inherited_relation(alias: impl Into<String>, rel_id: RelId) -> Self {
        Self {
            alias: alias.into(),
            kind: RangeTableKind::Relation {
                rel_id,
                inherit: true,
            },
        }
    }

    /// Relation id and inheritance flag, if this slot is a base relation.
    pub fn as_relation(&self) -> Option<(RelId, bool)> {
        match &self.kind {
            RangeTableKind::Relation { rel_id, inherit } => Some((*rel_id, *inherit)),
            _ => None,
        }
    }
}

/// A `WITH name AS (query)` item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommonTableExpr {
    pub name: String,
    pub query: Query,
}

/// One output column of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetEntry {
    pub expr: Expr,
    pub name: Option<String>,
}

/// A GROUP BY or ORDER BY key, referring to a target-list entry by 1-based position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortGroupClause {
    pub target_ref: usize,
    pub descending: bool,
}

impl SortGroupClause {
    pub fn new(target_ref: usize) -> Self {
        Self {
            target_ref,
            descending: false,
        }
    }
}

/// A bound query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub range_table: Vec<RangeTableEntry>,
    pub ctes: Vec<CommonTableExpr>,
    /// The WHERE clause together with any join conditions, as one qualifier.
    pub quals: Option<Expr>,
    pub target_list: Vec<TargetEntry>,
    pub group_by: Vec<SortGroupClause>,
    pub order_by: Vec<SortGroupClause>,
}

impl Query {
    /// Target-list expression a GROUP BY / ORDER BY key refers to.
    pub fn sort_group_target(&self, clause: &SortGroupClause) -> Option<&Expr> {
        clause
            .target_ref
            .checked_sub(1)
            .and_then(|i| self.target_list.get(i))
            .map(|te| &te.expr)
    }

    fn collect_varnos(&self, depth: usize, out: &mut BTreeSet<usize>) {
        for e in self.quals.iter().chain(self.target_list.iter().map(|te| &te.expr)) {
            e.collect_varnos(depth, out);
        }
        for rte in &self.range_table {
            match &rte.kind {
                RangeTableKind::Subquery(q) => q.collect_varnos(depth + 1, out),
                RangeTableKind::Join { alias_vars: args } | RangeTableKind::Function { args } => {
                    for e in args {
                        e.collect_varnos(depth, out);
                    }
                }
                RangeTableKind::Relation { .. } | RangeTableKind::Cte { .. } => {}
            }
        }
    }

    /// Whether this query references columns of its immediately enclosing query.
    pub fn is_correlated(&self) -> bool {
        let mut out = BTreeSet::new();
        self.collect_varnos(1, &mut out);
        !out.is_empty()
    }
}

/// Stack of the range tables of the queries currently being walked, innermost last.
#[derive(Debug, Default)]
pub struct RangeTableStack<'q> {
    frames: Vec<&'q [RangeTableEntry]>,
}

impl<'q> RangeTableStack<'q> {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, range_table: &'q [RangeTableEntry]) {
        self.frames.push(range_table);
    }

    pub fn pop(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Resolve a column reference's range-table entry, honoring its nesting depth.
    pub fn resolve(&self, var: &Var) -> Option<&'q RangeTableEntry> {
        let frame_index = self.frames.len().checked_sub(var.levels_up + 1)?;
        let frame = self.frames[frame_index];
        frame.get(var.varno.checked_sub(1)?)
    }
}
