//! # Reference Planner
//!
//! `SimplePlanner` is a small cost-based planner over an in-memory catalog. It
//! implements the Cost Oracle and Transactional Scope contracts so the advisor can be
//! developed and tested without a database host behind it.
//!
//! ## What It Plans
//!
//! - **Base relations**: a sequential scan, or an index scan over any real or
//!   overlay-supplied index whose leading keys match restriction clauses. An index
//!   whose keys cover every column the query needs from the relation is read with an
//!   index-only scan. A partial index is usable only when each of its predicate
//!   clauses appears among the relation's restrictions.
//! - **Joins**: left-deep in range-table order. Each step picks the cheaper of a hash
//!   join and a nested loop whose inner side is an index scan parameterized by the
//!   outer row.
//! - **Sub-selects in FROM** become subquery scans; sub-links inside expressions
//!   become numbered sub-plans (init-plans when uncorrelated).
//! - **Aggregation and ordering** are costed on top.
//!
//! ## Cost Model
//!
//! A weighted page/tuple model in the style of a disk-based row store:
//!
//! ```text
//! seq scan   = seq_page_cost * pages + cpu_tuple_cost * tuples + cpu_operator_cost * tuples * quals
//! index scan = random_page_cost * (index_pages + heap_pages) + (cpu_index_tuple_cost + cpu_tuple_cost) * fetched
//! ```
//!
//! ## Hypothetical Index Registry
//!
//! Materialized hypothetical index definitions are kept in a registry guarded by a
//! mutex. `begin()` snapshots the registry and `rollback()` restores the snapshot, so
//! nothing registered inside a scope survives it.

use crate::catalog::{Catalog, RelationInfo};
use crate::oracle::{
    CostOracle, HypotheticalIndexDef, IndexOverlay, OracleError, ScopeHandle, TransactionScope,
};
use crate::plan::{JoinKind, Plan, PlanExpr, PlanOp, PlannedQuery};
use crate::query::{
    AttrNumber, BinaryOp, Expr, IndexId, Query, RangeTableKind, UnaryOp,
};
use crate::stats;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// First identifier handed out to hypothetical indexes.
pub const FIRST_HYPOTHETICAL_INDEX_ID: IndexId = 900_000;

const DEFAULT_FUNCTION_ROWS: f64 = 1000.0;
const DEFAULT_GROUP_ROWS: f64 = 200.0;

/// Cost weights of the reference planner.
#[derive(Debug, Clone)]
pub struct PlannerCosts {
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub cpu_tuple_cost: f64,
    pub cpu_index_tuple_cost: f64,
    pub cpu_operator_cost: f64,
}

impl Default for PlannerCosts {
    fn default() -> Self {
        Self {
            seq_page_cost: 1.0,
            random_page_cost: 4.0,
            cpu_tuple_cost: 0.01,
            cpu_index_tuple_cost: 0.005,
            cpu_operator_cost: 0.0025,
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_index_id: IndexId,
    next_scope: u64,
    indexes: BTreeMap<IndexId, HypotheticalIndexDef>,
    scopes: Vec<(ScopeHandle, BTreeMap<IndexId, HypotheticalIndexDef>)>,
}

/// In-memory Cost Oracle and Transactional Scope.
pub struct SimplePlanner {
    catalog: Arc<dyn Catalog>,
    costs: PlannerCosts,
    registry: Mutex<Registry>,
}

impl SimplePlanner {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self {
            catalog,
            costs: PlannerCosts::default(),
            registry: Mutex::new(Registry {
                next_index_id: FIRST_HYPOTHETICAL_INDEX_ID,
                ..Registry::default()
            }),
        }
    }

    pub fn with_costs(mut self, costs: PlannerCosts) -> Self {
        self.costs = costs;
        self
    }

    /// Number of hypothetical indexes currently registered.
    pub fn hypothetical_index_count(&self) -> usize {
        self.registry().map(|r| r.indexes.len()).unwrap_or(0)
    }

    /// Number of scopes opened and not yet rolled back.
    pub fn open_scopes(&self) -> usize {
        self.registry().map(|r| r.scopes.len()).unwrap_or(0)
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, OracleError> {
        self.registry
            .lock()
            .map_err(|_| OracleError::Scope("hypothetical index registry poisoned".into()))
    }
}

impl CostOracle for SimplePlanner {
    fn plan(
        &self,
        query: &Query,
        overlay: Option<&mut dyn IndexOverlay>,
    ) -> Result<PlannedQuery, OracleError> {
        let mut ctx = PlanContext {
            catalog: self.catalog.as_ref(),
            costs: &self.costs,
            overlay,
            subplans: Vec::new(),
        };
        let plan = ctx.plan_query(query)?;
        debug!(
            startup = plan.startup_cost,
            total = plan.total_cost,
            subplans = ctx.subplans.len(),
            "Planned query"
        );
        Ok(PlannedQuery {
            plan,
            subplans: ctx.subplans,
        })
    }

    fn materialize_hypothetical_index(
        &self,
        def: &HypotheticalIndexDef,
    ) -> Result<IndexId, OracleError> {
        if self.catalog.relation(def.rel_id).is_none() {
            return Err(OracleError::UnknownRelation(def.rel_id));
        }
        if def.columns.is_empty() || def.op_classes.len() != def.columns.len() {
            return Err(OracleError::Materialization(format!(
                "{} key columns with {} operator classes",
                def.columns.len(),
                def.op_classes.len()
            )));
        }
        let expression_keys = def.columns.iter().filter(|a| **a == 0).count();
        if expression_keys != def.expressions.len() {
            return Err(OracleError::Materialization(format!(
                "{} expression keys with {} expressions",
                expression_keys,
                def.expressions.len()
            )));
        }
        let mut registry = self.registry()?;
        let id = registry.next_index_id;
        registry.next_index_id += 1;
        registry.indexes.insert(id, def.clone());
        trace!(index_id = id, rel_id = def.rel_id, "Registered hypothetical index");
        Ok(id)
    }

    fn drop_hypothetical_index(&self, index_id: IndexId) -> Result<(), OracleError> {
        let mut registry = self.registry()?;
        registry
            .indexes
            .remove(&index_id)
            .map(|_| ())
            .ok_or(OracleError::UnknownIndex(index_id))
    }
}

impl TransactionScope for SimplePlanner {
    fn begin(&self) -> Result<ScopeHandle, OracleError> {
        let mut registry = self.registry()?;
        registry.next_scope += 1;
        let handle = ScopeHandle(registry.next_scope);
        let snapshot = registry.indexes.clone();
        registry.scopes.push((handle, snapshot));
        Ok(handle)
    }

    fn rollback(&self, handle: ScopeHandle) -> Result<(), OracleError> {
        let mut registry = self.registry()?;
        let pos = registry
            .scopes
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or_else(|| OracleError::Scope(format!("no open scope {}", handle.0)))?;
        // Closing a scope also closes every scope opened inside it.
        let snapshot = registry
            .scopes
            .drain(pos..)
            .next()
            .map(|(_, snapshot)| snapshot)
            .ok_or_else(|| OracleError::Scope(format!("no open scope {}", handle.0)))?;
        registry.indexes = snapshot;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// What a restriction clause can be matched against.
#[derive(Debug, Clone, PartialEq)]
enum KeyRef {
    Column(AttrNumber),
    Expr(Expr),
}

/// A single-relation (or parameterized) clause as seen from one relation.
struct Restriction<'q> {
    clause: &'q Expr,
    /// Key side and operator when the clause is an indexable comparison.
    key: Option<(KeyRef, BinaryOp)>,
    selectivity: f64,
}

/// An index the planner may use, real or hypothetical.
struct IndexChoice {
    index_id: IndexId,
    keys: Vec<KeyRef>,
    predicate: Vec<Expr>,
    pages: f64,
}

/// A planned input of the join tree.
struct Input {
    plan: Plan,
    varnos: BTreeSet<usize>,
}

struct PlanContext<'c, 'o> {
    catalog: &'c dyn Catalog,
    costs: &'c PlannerCosts,
    overlay: Option<&'o mut (dyn IndexOverlay + 'o)>,
    subplans: Vec<Plan>,
}

fn strip_coercions(expr: &Expr) -> &Expr {
    match expr {
        Expr::Coerce { arg, .. } => strip_coercions(arg),
        other => other,
    }
}

fn key_of(side: &Expr) -> KeyRef {
    match strip_coercions(side) {
        Expr::Var(v) => KeyRef::Column(v.attno),
        _ => KeyRef::Expr(side.rebased()),
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    matches!(expr, Expr::Aggregate { .. }) || expr.children().iter().any(|c| contains_aggregate(c))
}

impl<'c, 'o> PlanContext<'c, 'o> {
    fn plan_query(&mut self, query: &Query) -> Result<Plan, OracleError> {
        let rels: HashMap<usize, RelationInfo> = query
            .range_table
            .iter()
            .enumerate()
            .filter_map(|(i, rte)| {
                rte.as_relation()
                    .map(|(rel_id, _)| (i + 1, rel_id))
            })
            .map(|(varno, rel_id)| {
                self.catalog
                    .relation(rel_id)
                    .map(|info| (varno, info))
                    .ok_or(OracleError::UnknownRelation(rel_id))
            })
            .collect::<Result<_, _>>()?;

        // Classify the conjuncts of the qualifier by the slots they reference.
        let mut single: HashMap<usize, Vec<&Expr>> = HashMap::new();
        let mut multi: Vec<(&Expr, BTreeSet<usize>)> = Vec::new();
        let mut constant: Vec<&Expr> = Vec::new();
        if let Some(quals) = &query.quals {
            for clause in quals.conjuncts() {
                let varnos = clause.local_varnos();
                match varnos.len() {
                    0 => constant.push(clause),
                    1 => {
                        if let Some(v) = varnos.iter().next() {
                            single.entry(*v).or_default().push(clause);
                        }
                    }
                    _ => multi.push((clause, varnos)),
                }
            }
        }

        let mut inputs: Vec<Input> = Vec::new();
        for (i, rte) in query.range_table.iter().enumerate() {
            let varno = i + 1;
            let clauses = single.remove(&varno).unwrap_or_default();
            let plan = match &rte.kind {
                RangeTableKind::Relation { .. } => match rels.get(&varno) {
                    Some(rel) => {
                        let needed = needed_columns(query, varno);
                        self.scan_relation(varno, rel, &clauses, &[], &needed, 1.0)?
                    }
                    None => continue,
                },
                RangeTableKind::Subquery(sub) => {
                    let subplan = self.plan_query(sub)?;
                    let rows = subplan.plan_rows;
                    let total = subplan.total_cost + rows * self.costs.cpu_tuple_cost;
                    let startup = subplan.startup_cost;
                    let mut plan = Plan::new(
                        PlanOp::SubqueryScan {
                            subplan: Box::new(subplan),
                        },
                        startup,
                        total,
                        rows,
                    );
                    self.attach_quals(&mut plan, &clauses)?;
                    plan
                }
                RangeTableKind::Cte { name } => {
                    let mut plan = Plan::new(
                        PlanOp::CteScan { name: name.clone() },
                        0.0,
                        DEFAULT_FUNCTION_ROWS * self.costs.cpu_tuple_cost,
                        DEFAULT_FUNCTION_ROWS,
                    );
                    self.attach_quals(&mut plan, &clauses)?;
                    plan
                }
                RangeTableKind::Function { .. } => {
                    let mut plan = Plan::new(
                        PlanOp::FunctionScan,
                        0.0,
                        DEFAULT_FUNCTION_ROWS * self.costs.cpu_tuple_cost,
                        DEFAULT_FUNCTION_ROWS,
                    );
                    self.attach_quals(&mut plan, &clauses)?;
                    plan
                }
                RangeTableKind::Join { .. } => continue,
            };
            inputs.push(Input {
                plan,
                varnos: BTreeSet::from([varno]),
            });
        }

        let mut iter = inputs.into_iter();
        let mut current = match iter.next() {
            Some(first) => first,
            None => Input {
                plan: Plan::new(PlanOp::Result, 0.0, self.costs.cpu_tuple_cost, 1.0),
                varnos: BTreeSet::new(),
            },
        };
        for inner in iter {
            current = self.join(query, &rels, current, inner, &mut multi)?;
        }

        // Anything left references slots we could not join on (or no slot at all).
        let leftover: Vec<&Expr> = multi
            .iter()
            .map(|(c, _)| *c)
            .chain(constant)
            .collect();
        let mut plan = current.plan;
        self.attach_quals(&mut plan, &leftover)?;

        for te in &query.target_list {
            self.plan_target_sublinks(&mut plan, &te.expr)?;
        }

        let aggregated = !query.group_by.is_empty()
            || query.target_list.iter().any(|te| contains_aggregate(&te.expr));
        if aggregated {
            let rows_in = plan.plan_rows;
            let rows = if query.group_by.is_empty() {
                1.0
            } else {
                rows_in.min(DEFAULT_GROUP_ROWS)
            };
            let work = rows_in * self.costs.cpu_operator_cost * (1 + query.group_by.len()) as f64;
            let total = plan.total_cost + work;
            plan = Plan::new(PlanOp::Aggregate, total, total, rows).with_left(plan);
        }

        if !query.order_by.is_empty() {
            let rows = plan.plan_rows;
            let comparisons = if rows > 1.0 { rows * rows.log2() } else { 1.0 };
            let sort = 2.0 * self.costs.cpu_operator_cost * comparisons;
            let startup = plan.total_cost + sort;
            let total = startup + self.costs.cpu_operator_cost * rows;
            plan = Plan::new(PlanOp::Sort, startup, total, rows).with_left(plan);
        }

        Ok(plan)
    }

    /// Classify `clauses` from the point of view of slot `varno`. Clauses in
    /// `params` may also reference already-joined slots, which then act as
    /// per-row parameters.
    fn restrictions<'q>(
        &self,
        varno: usize,
        rel: &RelationInfo,
        clauses: &[&'q Expr],
    ) -> Vec<Restriction<'q>> {
        clauses
            .iter()
            .map(|clause| {
                let key = indexable_side(clause, varno);
                let selectivity = match &key {
                    Some((KeyRef::Column(attno), BinaryOp::Eq)) => rel
                        .column(*attno)
                        .map(|c| 1.0 / c.distinct.max(1.0))
                        .unwrap_or(stats::DEFAULT_EQUALITY_SELECTIVITY),
                    Some((KeyRef::Expr(_), BinaryOp::Eq)) => stats::DEFAULT_EQUALITY_SELECTIVITY,
                    Some((_, BinaryOp::Like)) => stats::DEFAULT_FILTER_SELECTIVITY,
                    Some(_) => stats::RANGE_SELECTIVITY,
                    None => stats::clause_selectivity(clause, rel),
                };
                Restriction {
                    clause,
                    key,
                    selectivity,
                }
            })
            .collect()
    }

    fn index_choices(&mut self, rel: &RelationInfo) -> Vec<IndexChoice> {
        let mut choices: Vec<IndexChoice> = self
            .catalog
            .indexes(rel.rel_id)
            .into_iter()
            .filter(|ix| ix.valid && !ix.has_expressions && !ix.has_predicate)
            .map(|ix| {
                let widths: Vec<f64> = ix
                    .columns
                    .iter()
                    .map(|a| rel.column(*a).map(|c| c.avg_width).unwrap_or(8.0))
                    .collect();
                IndexChoice {
                    index_id: ix.index_id,
                    keys: ix.columns.iter().map(|a| KeyRef::Column(*a)).collect(),
                    predicate: Vec::new(),
                    pages: stats::estimate_index_pages(rel, &widths).max(1.0),
                }
            })
            .collect();

        if let Some(overlay) = self.overlay.as_deref_mut() {
            for hyp in overlay.hypothetical_indexes(rel) {
                let mut exprs = hyp.def.expressions.iter();
                let keys = hyp
                    .def
                    .columns
                    .iter()
                    .filter_map(|a| {
                        if *a == 0 {
                            exprs.next().map(|e| KeyRef::Expr(e.clone()))
                        } else {
                            Some(KeyRef::Column(*a))
                        }
                    })
                    .collect();
                choices.push(IndexChoice {
                    index_id: hyp.index_id,
                    keys,
                    predicate: hyp.def.predicate.clone(),
                    pages: hyp.pages.max(1) as f64,
                });
            }
        }
        choices
    }

    /// Cheapest access path for one relation. `params` are join clauses usable as
    /// index keys with the outer row supplying the other side; `loops` is only used
    /// for tracing.
    fn scan_relation<'q>(
        &mut self,
        varno: usize,
        rel: &RelationInfo,
        clauses: &[&'q Expr],
        params: &[&'q Expr],
        needed: &BTreeSet<AttrNumber>,
        loops: f64,
    ) -> Result<Plan, OracleError> {
        let costs = self.costs.clone();
        let restrictions = self.restrictions(varno, rel, clauses);
        let param_restrictions = self.restrictions(varno, rel, params);
        let selectivity: f64 = restrictions
            .iter()
            .chain(param_restrictions.iter())
            .map(|r| r.selectivity)
            .product();
        let rows = (rel.tuples * selectivity).max(1.0);

        let seq_total = costs.seq_page_cost * rel.pages
            + costs.cpu_tuple_cost * rel.tuples
            + costs.cpu_operator_cost * rel.tuples * clauses.len() as f64;
        let mut best = Plan::new(PlanOp::SeqScan { rel_id: rel.rel_id }, 0.0, seq_total, rows);
        let mut best_residual: Vec<&'q Expr> = clauses.to_vec();
        if !params.is_empty() {
            // A sequential scan cannot use join parameters; evaluate them as filters.
            best.total_cost += costs.cpu_operator_cost * rel.tuples * params.len() as f64;
            best_residual.extend(params.iter().copied());
        }

        let all: Vec<&Restriction> = restrictions.iter().chain(param_restrictions.iter()).collect();
        for index in self.index_choices(rel) {
            // Partial index: every predicate clause must be implied by a restriction.
            let implied: Vec<&Restriction> = all
                .iter()
                .copied()
                .filter(|r| index.predicate.contains(&r.clause.column_first().rebased()))
                .collect();
            let predicate_holds = index.predicate.iter().all(|p| {
                implied
                    .iter()
                    .any(|r| r.clause.column_first().rebased() == *p)
            });
            if !predicate_holds {
                continue;
            }

            let mut matched: Vec<&Restriction> = Vec::new();
            for key in &index.keys {
                let on_key: Vec<&Restriction> = all
                    .iter()
                    .copied()
                    .filter(|r| matches!(&r.key, Some((k, _)) if k == key))
                    .collect();
                if on_key.is_empty() {
                    break;
                }
                let has_equality = on_key
                    .iter()
                    .any(|r| matches!(r.key, Some((_, BinaryOp::Eq))));
                matched.extend(on_key);
                if !has_equality {
                    break;
                }
            }
            if matched.is_empty() {
                continue;
            }

            let key_selectivity: f64 = matched.iter().map(|r| r.selectivity).product();
            let predicate_selectivity: f64 = implied.iter().map(|r| r.selectivity).product();
            let fetched = (rel.tuples * predicate_selectivity * key_selectivity).max(1.0);
            let index_pages = (index.pages * key_selectivity).ceil().max(1.0);
            let covering = !needed.is_empty()
                && needed
                    .iter()
                    .all(|a| index.keys.contains(&KeyRef::Column(*a)));
            let heap_pages = if covering {
                0.0
            } else {
                fetched.min(rel.pages.max(1.0))
            };
            let residual: Vec<&'q Expr> = all
                .iter()
                .filter(|r| {
                    !matched.iter().any(|m| std::ptr::eq(m.clause, r.clause))
                        && !implied.iter().any(|m| std::ptr::eq(m.clause, r.clause))
                })
                .map(|r| r.clause)
                .collect();

            let startup = costs.random_page_cost;
            let total = startup
                + costs.random_page_cost * (index_pages + heap_pages)
                + (costs.cpu_index_tuple_cost + costs.cpu_tuple_cost) * fetched
                + costs.cpu_operator_cost * fetched * residual.len() as f64;
            trace!(
                rel_id = rel.rel_id,
                index_id = index.index_id,
                total,
                loops,
                "Costed index path"
            );
            if total < best.total_cost {
                let op = if covering {
                    PlanOp::IndexOnlyScan {
                        rel_id: rel.rel_id,
                        index_id: index.index_id,
                    }
                } else {
                    PlanOp::IndexScan {
                        rel_id: rel.rel_id,
                        index_id: index.index_id,
                    }
                };
                best = Plan::new(op, startup, total, rows);
                best_residual = residual;
            }
        }

        self.attach_quals(&mut best, &best_residual)?;
        Ok(best)
    }

    fn join<'q>(
        &mut self,
        query: &'q Query,
        rels: &HashMap<usize, RelationInfo>,
        outer: Input,
        inner: Input,
        pending: &mut Vec<(&'q Expr, BTreeSet<usize>)>,
    ) -> Result<Input, OracleError> {
        let mut varnos = outer.varnos.clone();
        varnos.extend(inner.varnos.iter().copied());

        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(pending)
            .into_iter()
            .partition(|(_, used)| used.is_subset(&varnos));
        *pending = rest;
        let join_clauses: Vec<&'q Expr> = ready.iter().map(|(c, _)| *c).collect();

        let join_selectivity: f64 = join_clauses
            .iter()
            .map(|c| join_clause_selectivity(c, rels))
            .product();
        let rows = (outer.plan.plan_rows * inner.plan.plan_rows * join_selectivity).max(1.0);
        let costs = self.costs.clone();

        let equi_join = join_clauses
            .iter()
            .any(|c| matches!(c, Expr::BinaryOp { op: BinaryOp::Eq, .. }));

        // Hash join (equi-joins) or a materialized nested loop.
        let (mut kind, mut startup, mut total) = if equi_join {
            let startup = inner.plan.total_cost
                + costs.cpu_operator_cost * inner.plan.plan_rows
                + outer.plan.startup_cost;
            let total = outer.plan.total_cost
                + inner.plan.total_cost
                + costs.cpu_operator_cost * (outer.plan.plan_rows + inner.plan.plan_rows)
                + costs.cpu_tuple_cost * rows;
            (JoinKind::Hash, startup, total)
        } else {
            let total = outer.plan.total_cost
                + inner.plan.total_cost
                + costs.cpu_tuple_cost * outer.plan.plan_rows * inner.plan.plan_rows;
            (JoinKind::NestedLoop, outer.plan.startup_cost, total)
        };
        let mut inner_plan = inner.plan;
        let mut join_qual = join_clauses.clone();

        // Nested loop over an index on the inner relation, parameterized by the outer row.
        let single_inner = inner.varnos.iter().next().copied().filter(|_| inner.varnos.len() == 1);
        if let Some((varno, rel)) = single_inner.and_then(|v| rels.get(&v).map(|r| (v, r))) {
            let params: Vec<&Expr> = join_clauses
                .iter()
                .copied()
                .filter(|c| indexable_side(c, varno).is_some())
                .collect();
            if !params.is_empty() {
                let local: Vec<&'q Expr> = query
                    .quals
                    .iter()
                    .flat_map(|q| q.conjuncts())
                    .filter(|c| c.local_varnos() == BTreeSet::from([varno]))
                    .collect();
                let needed = needed_columns(query, varno);
                // Sub-plans planned for a probe that loses are discarded again.
                let mark = self.subplans.len();
                let probe =
                    self.scan_relation(varno, rel, &local, &params, &needed, outer.plan.plan_rows)?;
                let nl_total = outer.plan.total_cost + outer.plan.plan_rows * probe.total_cost;
                if probe.op.index_id().is_some() && nl_total < total {
                    kind = JoinKind::NestedLoop;
                    startup = outer.plan.startup_cost + probe.startup_cost;
                    total = nl_total;
                    join_qual.retain(|c| !params.iter().any(|p| std::ptr::eq(*p, *c)));
                    inner_plan = probe;
                } else {
                    self.subplans.truncate(mark);
                }
            }
        }

        let mut plan = Plan::new(
            PlanOp::Join {
                kind,
                join_qual: Vec::new(),
            },
            startup,
            total,
            rows,
        )
        .with_left(outer.plan)
        .with_right(inner_plan);
        let (converted, extra) = self.convert_all(&join_qual, rows, &mut plan.init_plans)?;
        if let PlanOp::Join { join_qual, .. } = &mut plan.op {
            *join_qual = converted;
        }
        plan.total_cost += extra;
        Ok(Input { plan, varnos })
    }

    /// Convert `clauses` and attach them as the node's residual qualifier.
    fn attach_quals(&mut self, plan: &mut Plan, clauses: &[&Expr]) -> Result<(), OracleError> {
        if clauses.is_empty() {
            return Ok(());
        }
        let rows = plan.plan_rows;
        let (converted, extra) = self.convert_all(clauses, rows, &mut plan.init_plans)?;
        plan.qual.extend(converted);
        plan.total_cost += extra;
        Ok(())
    }

    fn convert_all(
        &mut self,
        clauses: &[&Expr],
        rows: f64,
        init_plans: &mut Vec<usize>,
    ) -> Result<(Vec<PlanExpr>, f64), OracleError> {
        let mut extra = 0.0;
        let mut out = Vec::with_capacity(clauses.len());
        for clause in clauses {
            out.push(self.convert(clause, rows, init_plans, &mut extra)?);
        }
        Ok((out, extra))
    }

    fn plan_sublink(
        &mut self,
        sub: &Query,
        rows: f64,
        init_plans: &mut Vec<usize>,
        extra: &mut f64,
    ) -> Result<usize, OracleError> {
        let subplan = self.plan_query(sub)?;
        let plan_id = self.subplans.len();
        if sub.is_correlated() {
            *extra += rows.max(1.0) * subplan.total_cost;
        } else {
            *extra += subplan.total_cost;
            init_plans.push(plan_id);
        }
        self.subplans.push(subplan);
        Ok(plan_id)
    }

    fn convert(
        &mut self,
        expr: &Expr,
        rows: f64,
        init_plans: &mut Vec<usize>,
        extra: &mut f64,
    ) -> Result<PlanExpr, OracleError> {
        let converted = match expr {
            Expr::Var(v) => PlanExpr::Var {
                varno: v.varno,
                attno: v.attno,
            },
            Expr::Const(c) => PlanExpr::Const(c.value.clone()),
            Expr::BinaryOp { op, left, right } => PlanExpr::Op {
                op: *op,
                args: vec![
                    self.convert(left, rows, init_plans, extra)?,
                    self.convert(right, rows, init_plans, extra)?,
                ],
            },
            Expr::UnaryOp {
                op: UnaryOp::Not,
                operand,
            } => PlanExpr::Bool {
                args: vec![self.convert(operand, rows, init_plans, extra)?],
            },
            Expr::And(args) | Expr::Or(args) => PlanExpr::Bool {
                args: args
                    .iter()
                    .map(|a| self.convert(a, rows, &mut *init_plans, &mut *extra))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Coerce { arg, .. } => PlanExpr::Coerce {
                arg: Box::new(self.convert(arg, rows, init_plans, extra)?),
            },
            Expr::SubLink(sub) => PlanExpr::SubPlan {
                plan_id: self.plan_sublink(sub, rows, init_plans, extra)?,
            },
            Expr::Function { name, args, .. } | Expr::Aggregate { name, args } => PlanExpr::Func {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|a| self.convert(a, rows, &mut *init_plans, &mut *extra))
                    .collect::<Result<_, _>>()?,
            },
            other => {
                let name = match other {
                    Expr::UnaryOp { op, .. } => format!("{:?}", op).to_lowercase(),
                    Expr::Case { .. } => "case".to_string(),
                    _ => "array".to_string(),
                };
                PlanExpr::Func {
                    name,
                    args: other
                        .children()
                        .into_iter()
                        .map(|a| self.convert(a, rows, &mut *init_plans, &mut *extra))
                        .collect::<Result<_, _>>()?,
                }
            }
        };
        *extra += self.costs.cpu_operator_cost * rows;
        Ok(converted)
    }

    /// Plan sub-links appearing in the select list; they run once per output row.
    fn plan_target_sublinks(&mut self, plan: &mut Plan, expr: &Expr) -> Result<(), OracleError> {
        if let Expr::SubLink(sub) = expr {
            let mut extra = 0.0;
            let rows = plan.plan_rows;
            let plan_id = self.plan_sublink(sub, rows, &mut plan.init_plans, &mut extra)?;
            if !plan.init_plans.contains(&plan_id) {
                plan.init_plans.push(plan_id);
            }
            plan.total_cost += extra;
            return Ok(());
        }
        for child in expr.children() {
            self.plan_target_sublinks(plan, child)?;
        }
        Ok(())
    }
}

/// For an indexable comparison between slot `varno` and something that does not
/// reference it, the key side (as seen by an index on `varno`) and the operator with
/// the key on the left.
fn indexable_side(clause: &Expr, varno: usize) -> Option<(KeyRef, BinaryOp)> {
    let Expr::BinaryOp { op, left, right } = clause else {
        return None;
    };
    if !op.is_index_comparison() || clause.contains_sublink() {
        return None;
    }
    let target = BTreeSet::from([varno]);
    let left_vars = left.local_varnos();
    let right_vars = right.local_varnos();
    if left_vars == target && !right_vars.contains(&varno) {
        return Some((key_of(left), *op));
    }
    if right_vars == target && !left_vars.contains(&varno) {
        return op.commute().map(|commuted| (key_of(right), commuted));
    }
    None
}

fn var_ndv(expr: &Expr, rels: &HashMap<usize, RelationInfo>) -> Option<f64> {
    match strip_coercions(expr) {
        Expr::Var(v) if v.levels_up == 0 => rels
            .get(&v.varno)
            .and_then(|r| r.column(v.attno))
            .map(|c| c.distinct.max(1.0)),
        _ => None,
    }
}

fn join_clause_selectivity(clause: &Expr, rels: &HashMap<usize, RelationInfo>) -> f64 {
    match clause {
        Expr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } => match (var_ndv(left, rels), var_ndv(right, rels)) {
            (Some(l), Some(r)) => 1.0 / l.max(r),
            (Some(n), None) | (None, Some(n)) => 1.0 / n,
            (None, None) => stats::DEFAULT_EQUALITY_SELECTIVITY,
        },
        _ => stats::DEFAULT_FILTER_SELECTIVITY,
    }
}

/// Attribute numbers of slot `varno` that the query reads at its own level.
fn needed_columns(query: &Query, varno: usize) -> BTreeSet<AttrNumber> {
    fn collect(expr: &Expr, varno: usize, out: &mut BTreeSet<AttrNumber>) {
        match expr {
            Expr::Var(v) if v.levels_up == 0 && v.varno == varno => {
                out.insert(v.attno);
            }
            _ => {
                for child in expr.children() {
                    collect(child, varno, out);
                }
            }
        }
    }

    let mut out = BTreeSet::new();
    for e in query.quals.iter().chain(query.target_list.iter().map(|te| &te.expr)) {
        collect(e, varno, &mut out);
    }
    for rte in &query.range_table {
        if let RangeTableKind::Join { alias_vars } = &rte.kind {
            for e in alias_vars {
                collect(e, varno, &mut out);
            }
        }
    }
    out
}
