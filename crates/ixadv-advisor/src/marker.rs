//! # Plan Usage Marker
//!
//! Walks a plan produced with hypothetical indexes visible and flags every candidate
//! whose index is read by an index scan, an index-only scan or a bitmap index scan
//! anywhere in the tree: under joins, bitmap AND/OR nodes, subquery scans, append
//! children, init-plans, and sub-plans referenced from qualifiers.
//!
//! A node kind the marker does not know is reported and its subtree skipped; a
//! usage hidden below it is missed, which only makes the advice more conservative.

use ixadv_core::candidate::IndexCandidate;
use ixadv_core::plan::{Plan, PlanExpr, PlanOp, PlannedQuery};
use ixadv_core::query::IndexId;
use tracing::{trace, warn};

/// Set `used` on every candidate whose hypothetical index `planned` reads.
/// Returns the number of candidates marked.
pub fn mark_used_candidates(planned: &PlannedQuery, candidates: &mut [IndexCandidate]) -> usize {
    let mut marker = UsageMarker {
        planned,
        candidates,
        active: Vec::new(),
    };
    marker.visit_plan(&planned.plan);
    marker.candidates.iter().filter(|c| c.used).count()
}

struct UsageMarker<'p, 'c> {
    planned: &'p PlannedQuery,
    candidates: &'c mut [IndexCandidate],
    /// Sub-plans currently being walked.
    active: Vec<usize>,
}

impl<'p, 'c> UsageMarker<'p, 'c> {
    fn mark(&mut self, index_id: IndexId) {
        for cand in self.candidates.iter_mut() {
            if cand.index_id == Some(index_id) {
                trace!(index_id, candidate = %cand, "Candidate used by plan");
                cand.used = true;
            }
        }
    }

    fn visit_plan(&mut self, plan: &'p Plan) {
        match &plan.op {
            PlanOp::IndexScan { index_id, .. }
            | PlanOp::IndexOnlyScan { index_id, .. }
            | PlanOp::BitmapIndexScan { index_id, .. } => self.mark(*index_id),
            PlanOp::BitmapAnd { plans } | PlanOp::BitmapOr { plans } | PlanOp::Append { plans } => {
                for child in plans {
                    self.visit_plan(child);
                }
            }
            PlanOp::SubqueryScan { subplan } => self.visit_plan(subplan),
            PlanOp::Join { join_qual, .. } => {
                for e in join_qual {
                    self.visit_expr(e);
                }
            }
            PlanOp::Unrecognized { tag } => {
                warn!(node = %tag, "Unrecognized plan node; not scanned for index usage");
                return;
            }
            _ => {}
        }

        for id in &plan.init_plans {
            self.visit_subplan(*id);
        }
        if let Some(left) = &plan.left {
            self.visit_plan(left);
        }
        if let Some(right) = &plan.right {
            self.visit_plan(right);
        }
        for e in &plan.qual {
            self.visit_expr(e);
        }
    }

    fn visit_subplan(&mut self, plan_id: usize) {
        if self.active.contains(&plan_id) {
            return;
        }
        let planned = self.planned;
        let Some(sub) = planned.subplans.get(plan_id) else {
            warn!(plan_id, "Qualifier references a missing sub-plan");
            return;
        };
        self.active.push(plan_id);
        self.visit_plan(sub);
        self.active.pop();
    }

    fn visit_expr(&mut self, expr: &'p PlanExpr) {
        match expr {
            PlanExpr::Op { args, .. } | PlanExpr::Bool { args } | PlanExpr::Func { args, .. } => {
                for arg in args {
                    self.visit_expr(arg);
                }
            }
            PlanExpr::Coerce { arg } => self.visit_expr(arg),
            PlanExpr::SubPlan { plan_id } => self.visit_subplan(*plan_id),
            PlanExpr::Var { .. } | PlanExpr::Const(_) => {}
            PlanExpr::Unrecognized { tag } => {
                warn!(node = %tag, "Unrecognized plan expression; not scanned for index usage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixadv_core::candidate::IndexColumn;
    use ixadv_core::plan::JoinKind;
    use ixadv_core::query::{types, BinaryOp};

    fn candidates(ids: &[IndexId]) -> Vec<IndexCandidate> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let mut c = IndexCandidate::column(
                    1,
                    "t",
                    IndexColumn::new(i as i16 + 1, types::INT4, "k"),
                    false,
                );
                c.index_id = Some(*id);
                c
            })
            .collect()
    }

    fn node(op: PlanOp) -> Plan {
        Plan::new(op, 0.0, 1.0, 1.0)
    }

    fn index_scan(index_id: IndexId) -> Plan {
        node(PlanOp::IndexScan { rel_id: 1, index_id })
    }

    fn used(cands: &[IndexCandidate]) -> Vec<bool> {
        cands.iter().map(|c| c.used).collect()
    }

    #[test]
    fn test_scans_under_join_and_bitmap() {
        let bitmap = node(PlanOp::BitmapHeapScan { rel_id: 1 }).with_left(node(PlanOp::BitmapOr {
            plans: vec![
                node(PlanOp::BitmapIndexScan { rel_id: 1, index_id: 2 }),
                node(PlanOp::BitmapIndexScan { rel_id: 1, index_id: 3 }),
            ],
        }));
        let join = node(PlanOp::Join { kind: JoinKind::NestedLoop, join_qual: vec![] })
            .with_left(node(PlanOp::IndexOnlyScan { rel_id: 1, index_id: 1 }))
            .with_right(bitmap);
        let mut cands = candidates(&[1, 2, 3, 4]);
        let n = mark_used_candidates(&PlannedQuery::new(join), &mut cands);
        assert_eq!(n, 3);
        assert_eq!(used(&cands), vec![true, true, true, false]);
    }

    #[test]
    fn test_subquery_append_and_subplans() {
        let mut planned = PlannedQuery::new(
            node(PlanOp::Append {
                plans: vec![node(PlanOp::SubqueryScan { subplan: Box::new(index_scan(1)) })],
            })
            .with_qual(vec![PlanExpr::Bool {
                args: vec![PlanExpr::Op {
                    op: BinaryOp::Eq,
                    args: vec![PlanExpr::Var { varno: 1, attno: 1 }, PlanExpr::SubPlan { plan_id: 0 }],
                }],
            }]),
        );
        let mut init = index_scan(3);
        init.init_plans = vec![1];
        planned.subplans = vec![index_scan(2), init];
        planned.plan.init_plans = vec![1];

        let mut cands = candidates(&[1, 2, 3, 4]);
        mark_used_candidates(&planned, &mut cands);
        assert_eq!(used(&cands), vec![true, true, true, false]);
    }

    #[test]
    fn test_join_qual_subplan() {
        let mut planned = PlannedQuery::new(
            node(PlanOp::Join {
                kind: JoinKind::Hash,
                join_qual: vec![PlanExpr::SubPlan { plan_id: 0 }],
            })
            .with_left(node(PlanOp::SeqScan { rel_id: 1 })),
        );
        planned.subplans = vec![index_scan(2)];
        let mut cands = candidates(&[1, 2]);
        mark_used_candidates(&planned, &mut cands);
        assert_eq!(used(&cands), vec![false, true]);
    }

    #[test]
    fn test_unrecognized_node_stops_descent() {
        let planned = PlannedQuery::new(
            node(PlanOp::Limit)
                .with_left(node(PlanOp::Unrecognized { tag: "CustomScan".into() }).with_left(index_scan(1)))
                .with_right(index_scan(2)),
        );
        let mut cands = candidates(&[1, 2]);
        mark_used_candidates(&planned, &mut cands);
        assert_eq!(used(&cands), vec![false, true]);
    }

    #[test]
    fn test_self_referencing_subplan_terminates() {
        let mut planned = PlannedQuery::new(node(PlanOp::Result).with_qual(vec![PlanExpr::SubPlan { plan_id: 0 }]));
        planned.subplans = vec![index_scan(1).with_qual(vec![PlanExpr::SubPlan { plan_id: 0 }])];
        let mut cands = candidates(&[1]);
        assert_eq!(mark_used_candidates(&planned, &mut cands), 1);
    }
}
