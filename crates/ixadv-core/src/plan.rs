//! # Physical Plan Representation
//!
//! The Cost Oracle answers a planning request with a tree of physical operators.
//! Each `Plan` node carries its estimated startup and total cost, row estimate,
//! residual qualifier expressions, the ids of init-plans it depends on and up to two
//! child plans (`left` is the outer input, `right` the inner).
//!
//! Qualifier expressions are kept in their own small type (`PlanExpr`) rather than
//! reusing the query `Expr`: at plan level a nested query is no longer a tree but a
//! numeric reference (`PlanExpr::SubPlan`) into `PlannedQuery::subplans`.
//!
//! Node kinds the advisor does not know about are represented explicitly
//! (`PlanOp::Unrecognized`, `PlanExpr::Unrecognized`) so that walkers can report
//! them instead of guessing at their shape.

use crate::query::{BinaryOp, IndexId, RelId, ScalarValue};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Join algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    NestedLoop,
    Merge,
    Hash,
    /// Join node without a specific algorithm.
    Generic,
}

/// Physical operator of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanOp {
    SeqScan { rel_id: RelId },
    IndexScan { rel_id: RelId, index_id: IndexId },
    /// Index scan that answers the query from the index alone.
    IndexOnlyScan { rel_id: RelId, index_id: IndexId },
    BitmapIndexScan { rel_id: RelId, index_id: IndexId },
    /// Heap fetch driven by a bitmap built by `left`.
    BitmapHeapScan { rel_id: RelId },
    BitmapAnd { plans: Vec<Plan> },
    BitmapOr { plans: Vec<Plan> },
    SubqueryScan { subplan: Box<Plan> },
    Join { kind: JoinKind, join_qual: Vec<PlanExpr> },
    Append { plans: Vec<Plan> },
    Sort,
    Aggregate,
    Limit,
    Result,
    Material,
    Hash,
    Unique,
    FunctionScan,
    CteScan { name: String },
    /// A node kind not modelled here.
    Unrecognized { tag: String },
}

impl PlanOp {
    pub fn name(&self) -> &str {
        match self {
            PlanOp::SeqScan { .. } => "Seq Scan",
            PlanOp::IndexScan { .. } => "Index Scan",
            PlanOp::IndexOnlyScan { .. } => "Index Only Scan",
            PlanOp::BitmapIndexScan { .. } => "Bitmap Index Scan",
            PlanOp::BitmapHeapScan { .. } => "Bitmap Heap Scan",
            PlanOp::BitmapAnd { .. } => "BitmapAnd",
            PlanOp::BitmapOr { .. } => "BitmapOr",
            PlanOp::SubqueryScan { .. } => "Subquery Scan",
            PlanOp::Join { kind, .. } => match kind {
                JoinKind::NestedLoop => "Nested Loop",
                JoinKind::Merge => "Merge Join",
                JoinKind::Hash => "Hash Join",
                JoinKind::Generic => "Join",
            },
            PlanOp::Append { .. } => "Append",
            PlanOp::Sort => "Sort",
            PlanOp::Aggregate => "Aggregate",
            PlanOp::Limit => "Limit",
            PlanOp::Result => "Result",
            PlanOp::Material => "Materialize",
            PlanOp::Hash => "Hash",
            PlanOp::Unique => "Unique",
            PlanOp::FunctionScan => "Function Scan",
            PlanOp::CteScan { .. } => "CTE Scan",
            PlanOp::Unrecognized { tag } => tag.as_str(),
        }
    }

    /// Index the node reads, for the three index-driven scan kinds.
    pub fn index_id(&self) -> Option<IndexId> {
        match self {
            PlanOp::IndexScan { index_id, .. }
            | PlanOp::IndexOnlyScan { index_id, .. }
            | PlanOp::BitmapIndexScan { index_id, .. } => Some(*index_id),
            _ => None,
        }
    }
}

/// Expression attached to a plan node (residual qualifier or join qualifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanExpr {
    Op { op: BinaryOp, args: Vec<PlanExpr> },
    /// Boolean connective (AND, OR, NOT).
    Bool { args: Vec<PlanExpr> },
    /// Reference to `PlannedQuery::subplans[plan_id]`.
    SubPlan { plan_id: usize },
    Var { varno: usize, attno: i16 },
    Const(ScalarValue),
    Func { name: String, args: Vec<PlanExpr> },
    Coerce { arg: Box<PlanExpr> },
    Unrecognized { tag: String },
}

/// A physical plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub op: PlanOp,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub plan_rows: f64,
    pub qual: Vec<PlanExpr>,
    /// Sub-plan ids evaluated once before this node runs.
    pub init_plans: Vec<usize>,
    pub left: Option<Box<Plan>>,
    pub right: Option<Box<Plan>>,
}

impl Plan {
    pub fn new(op: PlanOp, startup_cost: f64, total_cost: f64, plan_rows: f64) -> Self {
        Self {
            op,
            startup_cost,
            total_cost,
            plan_rows,
            qual: Vec::new(),
            init_plans: Vec::new(),
            left: None,
            right: None,
        }
    }

    pub fn with_left(mut self, child: Plan) -> Self {
        self.left = Some(Box::new(child));
        self
    }

    pub fn with_right(mut self, child: Plan) -> Self {
        self.right = Some(Box::new(child));
        self
    }

    pub fn with_qual(mut self, qual: Vec<PlanExpr>) -> Self {
        self.qual = qual;
        self
    }
}

/// Result of planning a query: the top plan plus every sub-plan it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedQuery {
    pub plan: Plan,
    pub subplans: Vec<Plan>,
}

impl PlannedQuery {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            subplans: Vec::new(),
        }
    }

    pub fn startup_cost(&self) -> f64 {
        self.plan.startup_cost
    }

    pub fn total_cost(&self) -> f64 {
        self.plan.total_cost
    }

    /// Render the plan as indented EXPLAIN-style text. `index_name` supplies the
    /// display name of an index; returning `None` falls back to its numeric id.
    pub fn explain(&self, index_name: &dyn Fn(IndexId) -> Option<String>) -> String {
        let mut out = String::new();
        render(&self.plan, 0, index_name, &mut out);
        for (i, sub) in self.subplans.iter().enumerate() {
            let _ = writeln!(out, "SubPlan {}", i);
            render(sub, 1, index_name, &mut out);
        }
        out
    }
}

fn render(
    plan: &Plan,
    depth: usize,
    index_name: &dyn Fn(IndexId) -> Option<String>,
    out: &mut String,
) {
    let indent = "  ".repeat(depth);
    let arrow = if depth == 0 { "" } else { "-> " };
    let _ = write!(out, "{}{}{}", indent, arrow, plan.op.name());
    if let Some(id) = plan.op.index_id() {
        let name = index_name(id).unwrap_or_else(|| id.to_string());
        let _ = write!(out, " using {}", name);
    }
    let _ = writeln!(
        out,
        "  (cost={:.2}..{:.2} rows={:.0})",
        plan.startup_cost, plan.total_cost, plan.plan_rows
    );

    let nested: &[Plan] = match &plan.op {
        PlanOp::BitmapAnd { plans } | PlanOp::BitmapOr { plans } | PlanOp::Append { plans } => {
            plans
        }
        PlanOp::SubqueryScan { subplan } => std::slice::from_ref(subplan.as_ref()),
        _ => &[],
    };
    for child in nested {
        render(child, depth + 1, index_name, out);
    }
    for child in [&plan.left, &plan.right].into_iter().flatten() {
        render(child, depth + 1, index_name, out);
    }
}
