//! # Expression Tree Scanner
//!
//! Walks a bound query and proposes index candidates from the columns its clauses
//! reference.
//!
//! ## Where Candidates Come From
//!
//! `scan_query` visits, in order: every CTE body, every sub-select in FROM and
//! every join alias list, then the query's own clauses. The query's own clauses are
//! consulted as a waterfall: the WHERE clause first; GROUP BY only if WHERE produced
//! nothing; ORDER BY only if GROUP BY produced nothing; the select list last. GROUP
//! BY and ORDER BY keys are mapped back to the select-list expression they name.
//!
//! ## Node Kinds
//!
//! - **AND**: each operand is scanned, and its candidates are combined with the
//!   candidates of all earlier operands into composite candidates.
//! - **OR / NOT**: operands are scanned and merged, no composites.
//! - **Comparison** (`=`, `<`, `>`, `<=`, `>=`, `LIKE`): a comparison on an
//!   allowlisted column is not descended into. Against a constant it is recorded
//!   as a partial-index predicate for that relation. Otherwise both sides are
//!   scanned. Other binary operators yield nothing.
//! - **Column reference**: a single-column candidate, if the column is a user column
//!   of a durable, non-catalog relation.
//! - **Function call**: a functional candidate when the first argument, through any
//!   chain of nested calls and coercions, is a plain column. Otherwise the arguments
//!   are scanned like any other node.
//! - **Sub-link**: scanned as a query.
//! - Anything else: its children are scanned.

use crate::config::AdvisorConfig;
use crate::deparse::Deparser;
use crate::inherit::{expand_inherited_candidates, expand_inherited_rel_clauses};
use ixadv_core::algebra::{build_composite_candidates, merge_candidates};
use ixadv_core::candidate::{IndexCandidate, IndexColumn, RelationClauses};
use ixadv_core::catalog::Catalog;
use ixadv_core::query::{Expr, Query, RangeTableKind, RangeTableStack, SortGroupClause, TypeId, Var};
use tracing::{debug, trace};

/// Candidates and partial-index predicates found in one statement.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Ascending in canonical candidate order.
    pub candidates: Vec<IndexCandidate>,
    pub clauses: RelationClauses,
}

pub struct Scanner<'a> {
    catalog: &'a dyn Catalog,
    config: &'a AdvisorConfig,
    clauses: RelationClauses,
}

impl<'a> Scanner<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a AdvisorConfig) -> Self {
        Self {
            catalog,
            config,
            clauses: RelationClauses::new(),
        }
    }

    /// Scan a top-level statement and expand the result over inheritance children.
    pub fn scan_statement(mut self, query: &Query) -> ScanResult {
        let mut stack = RangeTableStack::new();
        let candidates = self.scan_query(query, &mut stack);
        let candidates = expand_inherited_candidates(candidates, self.catalog);
        expand_inherited_rel_clauses(&mut self.clauses, self.catalog);
        ScanResult {
            candidates,
            clauses: self.clauses,
        }
    }

    /// Candidates of `query` and everything nested in it.
    pub fn scan_query<'q>(
        &mut self,
        query: &'q Query,
        stack: &mut RangeTableStack<'q>,
    ) -> Vec<IndexCandidate> {
        stack.push(&query.range_table);
        trace!(depth = stack.depth(), "Scanning query");

        let mut candidates = Vec::new();
        for cte in &query.ctes {
            trace!(cte = %cte.name, "Scanning CTE");
            let found = self.scan_query(&cte.query, stack);
            candidates = merge_candidates(candidates, found);
        }
        for rte in &query.range_table {
            match &rte.kind {
                RangeTableKind::Subquery(sub) => {
                    trace!(alias = %rte.alias, "Scanning sub-select");
                    let found = self.scan_query(sub, stack);
                    candidates = merge_candidates(candidates, found);
                }
                RangeTableKind::Join { alias_vars } => {
                    for var in alias_vars {
                        let found = self.scan(var, stack);
                        candidates = merge_candidates(candidates, found);
                    }
                }
                _ => {}
            }
        }

        let mut own = match &query.quals {
            Some(quals) => self.scan(quals, stack),
            None => Vec::new(),
        };
        if own.is_empty() && !query.group_by.is_empty() {
            own = self.scan_sort_group(query, &query.group_by, stack);
        }
        if own.is_empty() && !query.order_by.is_empty() {
            own = self.scan_sort_group(query, &query.order_by, stack);
        }
        if own.is_empty() {
            for te in &query.target_list {
                let found = self.scan(&te.expr, stack);
                own = merge_candidates(own, found);
            }
        }

        stack.pop();
        merge_candidates(candidates, own)
    }

    fn scan_sort_group<'q>(
        &mut self,
        query: &'q Query,
        keys: &[SortGroupClause],
        stack: &mut RangeTableStack<'q>,
    ) -> Vec<IndexCandidate> {
        let mut out = Vec::new();
        for key in keys {
            match query.sort_group_target(key) {
                Some(expr) => {
                    let found = self.scan(expr, stack);
                    out = merge_candidates(out, found);
                }
                None => trace!(target_ref = key.target_ref, "Sort/group key names no target"),
            }
        }
        out
    }

    /// Candidates found in one expression tree.
    pub fn scan<'q>(&mut self, node: &'q Expr, stack: &mut RangeTableStack<'q>) -> Vec<IndexCandidate> {
        match node {
            Expr::And(args) => {
                let mut singles: Vec<IndexCandidate> = Vec::new();
                let mut composites: Vec<IndexCandidate> = Vec::new();
                for arg in args {
                    let found = self.scan(arg, stack);
                    let built =
                        build_composite_candidates(&singles, &found, self.config.composite_max_cols);
                    composites = merge_candidates(composites, built);
                    singles = merge_candidates(singles, found);
                }
                merge_candidates(singles, composites)
            }
            Expr::Or(args) => {
                let mut out = Vec::new();
                for arg in args {
                    let found = self.scan(arg, stack);
                    out = merge_candidates(out, found);
                }
                out
            }
            Expr::BinaryOp { op, left, right } => {
                if !op.is_index_comparison() {
                    trace!(op = %op, "Operator not supported by an ordered index");
                    return Vec::new();
                }
                if self.fold_partial_predicate(node, left, right, stack) {
                    return Vec::new();
                }
                let found = self.scan(left, stack);
                let more = self.scan(right, stack);
                merge_candidates(found, more)
            }
            Expr::Var(var) => self.column_candidate(var, stack).into_iter().collect(),
            Expr::Function {
                args, result_type, ..
            } => match self.functional_candidate(node, args, *result_type, stack) {
                Some(candidate) => vec![candidate],
                None => self.scan_children(node, stack),
            },
            Expr::SubLink(sub) => self.scan_query(sub, stack),
            _ => self.scan_children(node, stack),
        }
    }

    fn scan_children<'q>(&mut self, node: &'q Expr, stack: &mut RangeTableStack<'q>) -> Vec<IndexCandidate> {
        let mut out = Vec::new();
        for child in node.children() {
            let found = self.scan(child, stack);
            out = merge_candidates(out, found);
        }
        out
    }

    /// Consume `clause` if one side is an allowlisted column. It is recorded as a
    /// partial-index predicate only when the other side is a (possibly coerced)
    /// constant; either way neither side becomes a candidate. Returns whether the
    /// clause was consumed.
    fn fold_partial_predicate(
        &mut self,
        clause: &Expr,
        left: &Expr,
        right: &Expr,
        stack: &RangeTableStack<'_>,
    ) -> bool {
        for (side, other) in [(left, right), (right, left)] {
            let Expr::Var(var) = side else { continue };
            let Some(rte) = stack.resolve(var) else { continue };
            let rel_id = match &rte.kind {
                RangeTableKind::Relation { rel_id, .. } => *rel_id,
                RangeTableKind::Cte { .. } => return false,
                _ => continue,
            };
            let Some(name) = self.catalog.column_name(rel_id, var.attno) else {
                continue;
            };
            if !self.config.is_partial_index_column(&name) {
                continue;
            }
            if matches!(strip_coercions(other), Expr::Const(_)) {
                let predicate = clause.column_first().rebased();
                debug!(rel_id, alias = %rte.alias, column = %name, "Collected partial index predicate");
                self.clauses.append(rel_id, &rte.alias, predicate);
            } else {
                trace!(rel_id, column = %name, "Allowlisted column not compared with a constant");
            }
            return true;
        }
        false
    }

    fn column_candidate(&self, var: &Var, stack: &RangeTableStack<'_>) -> Option<IndexCandidate> {
        let rte = stack.resolve(var)?;
        let (rel_id, inherit) = rte.as_relation()?;
        let relation = self.catalog.relation(rel_id)?;
        if !relation.durable || relation.system || var.attno <= 0 {
            trace!(rel_id, attno = var.attno, "Column not eligible for an index");
            return None;
        }
        let name = relation.column(var.attno)?.name.clone();
        trace!(rel_id, alias = %rte.alias, column = %name, "Column candidate");
        Some(IndexCandidate::column(
            rel_id,
            rte.alias.clone(),
            IndexColumn::new(var.attno, var.type_id, name),
            inherit,
        ))
    }

    fn functional_candidate(
        &self,
        func: &Expr,
        args: &[Expr],
        result_type: TypeId,
        stack: &RangeTableStack<'_>,
    ) -> Option<IndexCandidate> {
        let mut node = args.first()?;
        let var = loop {
            match node {
                Expr::Var(var) => break var,
                Expr::Function { args, .. } => node = args.first()?,
                Expr::Coerce { arg, .. } => node = arg.as_ref(),
                Expr::Const(_) => {
                    trace!("Function over a constant");
                    return None;
                }
                Expr::BinaryOp { .. } => {
                    trace!("Function argument too complex for an expression index");
                    return None;
                }
                _ => return None,
            }
        };
        if var.attno <= 0 {
            return None;
        }
        let rte = stack.resolve(var)?;
        let (rel_id, inherit) = rte.as_relation()?;
        let expr = func.rebased();
        let name = Deparser::new(self.catalog, rel_id).expr(&expr);
        trace!(rel_id, alias = %rte.alias, expression = %name, "Functional candidate");
        Some(IndexCandidate::expression(
            rel_id,
            rte.alias.clone(),
            result_type,
            name,
            expr,
            inherit,
        ))
    }
}

fn strip_coercions(expr: &Expr) -> &Expr {
    match expr {
        Expr::Coerce { arg, .. } => strip_coercions(arg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixadv_core::candidate::format_candidates;
    use ixadv_core::catalog::{ColumnDef, InMemoryCatalog, RelationInfo};
    use ixadv_core::query::{types, BinaryOp, CommonTableExpr, RangeTableEntry, TargetEntry};

    fn catalog() -> InMemoryCatalog {
        let mut catalog = InMemoryCatalog::with_builtin_opclasses();
        catalog.add_relation(
            RelationInfo::new(10, "t", 100.0, 10_000.0)
                .with_column(ColumnDef::new(1, "a", types::INT4))
                .with_column(ColumnDef::new(2, "b", types::INT4))
                .with_column(ColumnDef::new(3, "c", types::INT4))
                .with_column(ColumnDef::new(4, "is_deleted", types::BOOL))
                .with_column(ColumnDef::new(5, "name", types::TEXT))
                .with_column(ColumnDef::new(6, "was_deleted", types::BOOL)),
        );
        let mut temp = RelationInfo::new(20, "scratch", 10.0, 100.0)
            .with_column(ColumnDef::new(1, "a", types::INT4));
        temp.durable = false;
        catalog.add_relation(temp);
        catalog
    }

    fn col(attno: i16) -> Expr {
        let type_id = match attno {
            4 | 6 => types::BOOL,
            5 => types::TEXT,
            _ => types::INT4,
        };
        Expr::column(1, attno, type_id)
    }

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, l, r)
    }

    fn query_on(rte: RangeTableEntry, quals: Option<Expr>) -> Query {
        Query {
            range_table: vec![rte],
            quals,
            target_list: vec![TargetEntry { expr: col(2), name: None }],
            ..Query::default()
        }
    }

    fn scan(query: &Query) -> ScanResult {
        let catalog = catalog();
        let config = AdvisorConfig::default();
        Scanner::new(&catalog, &config).scan_statement(query)
    }

    #[test]
    fn test_and_builds_composites() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::And(vec![eq(col(1), Expr::int(1)), eq(col(3), Expr::int(2))])),
        );
        let result = scan(&q);
        assert_eq!(format_candidates(&result.candidates), "10_(1) 10_(3) 10_(1,3) 10_(3,1)");
    }

    #[test]
    fn test_later_operands_combine_with_all_earlier_ones() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::And(vec![
                eq(col(1), Expr::int(1)),
                eq(col(2), Expr::int(2)),
                eq(col(3), Expr::int(3)),
            ])),
        );
        let result = scan(&q);
        let two_col = result.candidates.iter().filter(|c| c.ncols() == 2).count();
        assert_eq!(two_col, 6);
    }

    #[test]
    fn test_or_builds_no_composites() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::Or(vec![eq(col(1), Expr::int(1)), eq(col(3), Expr::int(2))])),
        );
        assert_eq!(format_candidates(&scan(&q).candidates), "10_(1) 10_(3)");
    }

    #[test]
    fn test_allowlisted_column_becomes_relation_clause() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::And(vec![
                eq(Expr::boolean(false), col(4)),
                eq(col(1), Expr::int(5)),
            ])),
        );
        let result = scan(&q);
        assert_eq!(format_candidates(&result.candidates), "10_(1)");
        assert_eq!(
            result.clauses.predicate(10, "t"),
            &[eq(col(4), Expr::boolean(false))][..]
        );
    }

    #[test]
    fn test_waterfall_falls_back_to_order_by() {
        let mut q = query_on(RangeTableEntry::relation("t", 10), None);
        q.target_list = vec![
            TargetEntry { expr: col(2), name: None },
            TargetEntry { expr: col(3), name: None },
        ];
        q.order_by = vec![SortGroupClause::new(2)];
        assert_eq!(format_candidates(&scan(&q).candidates), "10_(3)");

        // WHERE wins over ORDER BY
        q.quals = Some(eq(col(1), Expr::int(1)));
        assert_eq!(format_candidates(&scan(&q).candidates), "10_(1)");
    }

    #[test]
    fn test_unsupported_operator_and_relation() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::binary(BinaryOp::NotEq, col(1), Expr::int(1))),
        );
        // falls through to the select list
        assert_eq!(format_candidates(&scan(&q).candidates), "10_(2)");

        let q = query_on(
            RangeTableEntry::relation("s", 20),
            Some(eq(col(1), Expr::int(1))),
        );
        assert!(scan(&q).candidates.is_empty());
    }

    #[test]
    fn test_functional_candidate() {
        let lower = Expr::Function {
            func_id: 870,
            name: "lower".into(),
            result_type: types::TEXT,
            args: vec![col(5)],
        };
        let q = query_on(RangeTableEntry::relation("t", 10), Some(eq(lower.clone(), Expr::text("x"))));
        let result = scan(&q);
        assert_eq!(result.candidates.len(), 1);
        let cand = &result.candidates[0];
        assert_eq!(cand.attnos(), vec![0]);
        assert_eq!(cand.expressions, vec![lower]);
        assert_eq!(cand.columns[0].name, "lower(name)");

        let over_const = Expr::Function {
            func_id: 870,
            name: "lower".into(),
            result_type: types::TEXT,
            args: vec![Expr::text("X")],
        };
        let q = query_on(RangeTableEntry::relation("t", 10), Some(eq(col(5), over_const)));
        assert_eq!(format_candidates(&scan(&q).candidates), "10_(5)");
    }

    #[test]
    fn test_correlated_sublink_resolves_outer_relation() {
        let inner = Query {
            range_table: vec![RangeTableEntry::relation("t2", 10)],
            quals: Some(eq(
                col(2),
                Expr::Var(Var { varno: 1, attno: 3, type_id: types::INT4, levels_up: 1 }),
            )),
            ..Query::default()
        };
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::SubLink(Box::new(inner))),
        );
        let result = scan(&q);
        let described: Vec<(String, Vec<i16>)> = result
            .candidates
            .iter()
            .map(|c| (c.alias.clone(), c.attnos()))
            .collect();
        assert!(described.contains(&("t".to_string(), vec![3])));
        assert!(described.contains(&("t2".to_string(), vec![2])));
    }

    fn lower(arg: Expr) -> Expr {
        Expr::Function {
            func_id: 870,
            name: "lower".into(),
            result_type: types::TEXT,
            args: vec![arg],
        }
    }

    fn described(result: &ScanResult) -> Vec<String> {
        result
            .candidates
            .iter()
            .map(|c| format!("{}:{}", c.alias, c))
            .collect()
    }

    #[test]
    fn test_allowlisted_column_against_coerced_constant() {
        let cast_false = Expr::Coerce {
            arg: Box::new(Expr::boolean(false)),
            result_type: types::BOOL,
        };
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::And(vec![eq(col(4), cast_false.clone()), eq(col(1), Expr::int(5))])),
        );
        let result = scan(&q);
        assert_eq!(format_candidates(&result.candidates), "10_(1)");
        assert_eq!(result.clauses.predicate(10, "t"), &[eq(col(4), cast_false)][..]);
    }

    #[test]
    fn test_allowlisted_column_against_column_is_consumed() {
        let q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(Expr::And(vec![eq(col(4), col(6)), eq(col(1), Expr::int(5))])),
        );
        let result = scan(&q);
        // neither side of the flag comparison becomes a candidate
        assert_eq!(format_candidates(&result.candidates), "10_(1)");
        assert!(result.clauses.is_empty());
    }

    #[test]
    fn test_cte_column_is_not_folded() {
        let q = query_on(
            RangeTableEntry {
                alias: "c".into(),
                kind: RangeTableKind::Cte { name: "c".into() },
            },
            Some(eq(col(4), Expr::boolean(false))),
        );
        let result = scan(&q);
        assert!(result.candidates.is_empty());
        assert!(result.clauses.is_empty());
    }

    #[test]
    fn test_cte_sub_select_and_group_by() {
        let cte_body = query_on(RangeTableEntry::relation("tc", 10), Some(eq(col(3), Expr::int(1))));
        let sub_select = query_on(RangeTableEntry::relation("ti", 10), Some(eq(col(2), Expr::int(2))));
        let q = Query {
            ctes: vec![CommonTableExpr {
                name: "recent".into(),
                query: cte_body,
            }],
            range_table: vec![
                RangeTableEntry::relation("t", 10),
                RangeTableEntry {
                    alias: "s".into(),
                    kind: RangeTableKind::Subquery(Box::new(sub_select)),
                },
            ],
            target_list: vec![
                TargetEntry { expr: col(1), name: None },
                TargetEntry { expr: col(3), name: None },
            ],
            // GROUP BY a wins over ORDER BY c and the select list
            group_by: vec![SortGroupClause::new(1)],
            order_by: vec![SortGroupClause::new(2)],
            ..Query::default()
        };
        assert_eq!(described(&scan(&q)), vec!["t:10_(1)", "tc:10_(3)", "ti:10_(2)"]);
    }

    #[test]
    fn test_join_alias_list_is_scanned() {
        let mut q = query_on(RangeTableEntry::relation("t", 10), None);
        q.range_table.push(RangeTableEntry::relation("u", 10));
        q.range_table.push(RangeTableEntry {
            alias: "j".into(),
            kind: RangeTableKind::Join {
                alias_vars: vec![Expr::column(2, 3, types::INT4)],
            },
        });
        q.target_list.clear();
        assert_eq!(described(&scan(&q)), vec!["u:10_(3)"]);
    }

    #[test]
    fn test_functional_candidate_through_nested_calls_and_casts() {
        let inner = Expr::Function {
            func_id: 885,
            name: "btrim".into(),
            result_type: types::TEXT,
            args: vec![Expr::Coerce {
                arg: Box::new(col(5)),
                result_type: types::TEXT,
            }],
        };
        let func = lower(inner);
        let mut q = query_on(RangeTableEntry::relation("t", 10), Some(eq(func.clone(), Expr::text("x"))));
        q.target_list.clear();
        let result = scan(&q);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.candidates[0].attnos(), vec![0]);
        assert_eq!(result.candidates[0].expressions, vec![func]);
        assert_eq!(result.candidates[0].columns[0].name, "lower(btrim(name))");
    }

    #[test]
    fn test_function_over_arithmetic_is_abandoned() {
        let plus_one = Expr::binary(BinaryOp::Add, col(1), Expr::int(1));
        let mut q = query_on(
            RangeTableEntry::relation("t", 10),
            Some(eq(lower(plus_one), Expr::text("x"))),
        );
        q.target_list.clear();
        assert!(scan(&q).candidates.is_empty());
    }
}
