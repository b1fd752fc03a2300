//! # Hypothetical Index Evaluator
//!
//! `IndexAdvisor` runs one analysis pass per planned statement:
//!
//! ```text
//! Idle → Scanning → Filtering → Materializing → Replanning → Marking → Scoring → RollingBack → Idle
//! ```
//!
//! 1. The baseline plan's costs are taken before any hypothetical index exists.
//! 2. The scanner proposes candidates, the filter drops the ones that cannot or need
//!    not become indexes, and inheritance children get their own copies.
//! 3. A nested scope is opened on the backend. Each candidate gets operator classes
//!    and collations and its relation's partial predicate, and is materialized as a
//!    hypothetical index. Candidates without a usable operator class are dropped.
//! 4. The backend re-plans the statement with an `IndexOverlay` that shows the
//!    hypothetical indexes, sizing each one as the planner asks for it.
//! 5. When the new plan is cheaper at startup or in total, the plan is walked and
//!    every candidate it reads is marked used.
//! 6. The hypothetical indexes are dropped, the total saving is split across used
//!    candidates by size, and the scope is rolled back, on success too.
//! 7. Used candidates become `AdviceRecord`s for the sink.
//!
//! ## Failure Semantics
//!
//! Nothing that goes wrong inside a pass reaches the caller's statement. A failure
//! to materialize or to re-plan aborts the pass; the scope is rolled back and the
//! error is reported as a warning on the returned `Analysis`. Sink failures are
//! reported the same way.
//!
//! ## Re-entrancy
//!
//! A backend may run statements of its own while re-planning, which would start a
//! nested pass on the same thread. A thread-local depth counter lets only the
//! outermost pass do any work. The counter is decremented by a guard, so every exit
//! path releases it.

use crate::config::AdvisorConfig;
use crate::deparse::Deparser;
use crate::error::AdvisorError;
use crate::filter::remove_irrelevant_candidates;
use crate::marker::mark_used_candidates;
use crate::scanner::Scanner;
use crate::sink::{statement_text, AdviceRecord, AdviceSink};
use ixadv_core::candidate::{format_candidates, IndexCandidate, RelationClauses};
use ixadv_core::catalog::{AccessMethod, Catalog, RelationInfo};
use ixadv_core::oracle::{
    HypotheticalIndex, HypotheticalIndexDef, IndexOverlay, ScopeHandle, WhatIfBackend,
};
use ixadv_core::plan::PlannedQuery;
use ixadv_core::query::{types, Query, DEFAULT_COLLATION};
use ixadv_core::stats;
use serde::Serialize;
use std::cell::Cell;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Width assumed for an expression key, which has no column statistics.
const EXPRESSION_KEY_WIDTH: f64 = 8.0;

thread_local! {
    static ANALYSIS_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Stages of an analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisorPhase {
    Idle,
    Scanning,
    Filtering,
    Materializing,
    Replanning,
    Marking,
    Scoring,
    RollingBack,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Analysis {
    /// One record per candidate the hypothetical plan used.
    pub advice: Vec<AdviceRecord>,
    /// Every candidate that was materialized, used or not.
    pub candidates: Vec<IndexCandidate>,
    pub startup_cost_saved: f64,
    pub total_cost_saved: f64,
    /// The hypothetical plan, when requested and advice was found.
    pub explain: Option<String>,
    pub warnings: Vec<String>,
}

impl Analysis {
    pub fn has_advice(&self) -> bool {
        !self.advice.is_empty()
    }

    fn failed(error: &AdvisorError) -> Self {
        Self {
            warnings: vec![error.to_string()],
            ..Self::default()
        }
    }
}

/// The baseline plan of a statement together with its analysis.
#[derive(Debug, Clone)]
pub struct AdvisedPlan {
    pub plan: PlannedQuery,
    pub analysis: Analysis,
}

pub struct IndexAdvisor {
    catalog: Arc<dyn Catalog>,
    config: AdvisorConfig,
}

impl IndexAdvisor {
    pub fn new(catalog: Arc<dyn Catalog>, config: AdvisorConfig) -> Self {
        Self { catalog, config }
    }

    pub fn config(&self) -> &AdvisorConfig {
        &self.config
    }

    /// Plan `query` as-is and analyse it against that plan.
    ///
    /// Only a failure to plan the statement itself is an error; the returned plan
    /// never depends on whether analysis succeeded.
    pub fn plan_with_advice(
        &self,
        query: &Query,
        query_text: &str,
        backend: &dyn WhatIfBackend,
        sink: &mut dyn AdviceSink,
    ) -> Result<AdvisedPlan, AdvisorError> {
        let plan = backend.plan(query, None).map_err(AdvisorError::Planning)?;
        let analysis = self.analyze(query, query_text, &plan, backend, sink);
        Ok(AdvisedPlan { plan, analysis })
    }

    /// Run an analysis pass; failures become warnings on the result.
    pub fn analyze(
        &self,
        query: &Query,
        query_text: &str,
        baseline: &PlannedQuery,
        backend: &dyn WhatIfBackend,
        sink: &mut dyn AdviceSink,
    ) -> Analysis {
        match self.try_analyze(query, query_text, baseline, backend, sink) {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Failed to create index advice for: {}: {}", statement_text(query_text), e);
                Analysis::failed(&e)
            }
        }
    }

    /// Run an analysis pass, returning the error that aborted it, if any.
    pub fn try_analyze(
        &self,
        query: &Query,
        query_text: &str,
        baseline: &PlannedQuery,
        backend: &dyn WhatIfBackend,
        sink: &mut dyn AdviceSink,
    ) -> Result<Analysis, AdvisorError> {
        let guard = RecursionGuard::enter();
        if !guard.is_outermost() {
            debug!(depth = guard.depth, "Analysis already running on this thread, skipping");
            return Ok(Analysis::default());
        }
        if self.catalog.bootstrap_mode() {
            debug!("Catalog is bootstrapping, skipping analysis");
            return Ok(Analysis::default());
        }

        let mut pass = PassContext::new();
        let mut analysis = self.run_pass(&mut pass, query, query_text, baseline, backend)?;
        pass.enter(AdvisorPhase::Idle);

        for record in &analysis.advice {
            if self.config.read_only {
                info!(
                    relation = %record.relation,
                    benefit = record.benefit,
                    size_kb = record.size_kb,
                    "Index advice (read only): {}",
                    record.definition
                );
                continue;
            }
            if let Err(e) = sink.record(record) {
                let e = AdvisorError::AdvicePersistence(e);
                warn!(definition = %record.definition, "{}", e);
                analysis.warnings.push(e.to_string());
            }
        }
        Ok(analysis)
    }

    fn run_pass(
        &self,
        pass: &mut PassContext,
        query: &Query,
        query_text: &str,
        baseline: &PlannedQuery,
        backend: &dyn WhatIfBackend,
    ) -> Result<Analysis, AdvisorError> {
        let catalog = self.catalog.as_ref();
        debug!(
            startup = baseline.startup_cost(),
            total = baseline.total_cost(),
            "Baseline plan"
        );

        pass.enter(AdvisorPhase::Scanning);
        let scanned = Scanner::new(catalog, &self.config).scan_statement(query);
        debug!("Generated candidates: {}", format_candidates(&scanned.candidates));

        pass.enter(AdvisorPhase::Filtering);
        let candidates = remove_irrelevant_candidates(scanned.candidates, catalog);
        debug!("Relevant candidates: {}", format_candidates(&candidates));
        if candidates.is_empty() {
            return Ok(Analysis::default());
        }

        let scope = NestedScope::begin(backend)?;
        let evaluated = self.evaluate(pass, query, baseline, backend, candidates, &scanned.clauses);
        pass.enter(AdvisorPhase::RollingBack);
        let rolled_back = scope.rollback();
        let mut analysis = match evaluated {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(phase = ?pass.phase, "Analysis pass aborted: {}", e);
                if let Err(scope_err) = rolled_back {
                    warn!("{}", scope_err);
                }
                return Err(e);
            }
        };
        rolled_back?;

        pass.enter(AdvisorPhase::Scoring);
        let statement = statement_text(query_text);
        analysis.advice = analysis
            .candidates
            .iter()
            .filter(|c| c.used)
            .map(|c| self.advice_record(c, statement))
            .collect();
        Ok(analysis)
    }

    /// Everything that happens inside the nested scope.
    fn evaluate(
        &self,
        pass: &mut PassContext,
        query: &Query,
        baseline: &PlannedQuery,
        backend: &dyn WhatIfBackend,
        candidates: Vec<IndexCandidate>,
        clauses: &RelationClauses,
    ) -> Result<Analysis, AdvisorError> {
        pass.enter(AdvisorPhase::Materializing);
        let mut materialized = Vec::with_capacity(candidates.len());
        for mut cand in candidates {
            if let Err(e) = self.resolve_operator_classes(&mut cand) {
                debug!("Discarded candidate {}: {}", cand, e);
                continue;
            }
            cand.predicate = clauses.predicate(cand.rel_id, &cand.alias).to_vec();
            let index_id = backend
                .materialize_hypothetical_index(&hypothetical_definition(&cand))
                .map_err(AdvisorError::Materialization)?;
            debug!(index_id, "Materialized hypothetical index {}", cand);
            cand.index_id = Some(index_id);
            materialized.push(cand);
        }
        if materialized.is_empty() {
            return Ok(Analysis::default());
        }

        pass.enter(AdvisorPhase::Replanning);
        let replanned = {
            let mut overlay = CandidateOverlay {
                candidates: &mut materialized,
            };
            backend.plan(query, Some(&mut overlay as &mut dyn IndexOverlay))
        };
        // The indexes go whether or not re-planning worked.
        drop_hypothetical_indexes(backend, &materialized);
        let planned = replanned.map_err(AdvisorError::Replan)?;

        let startup_saved = baseline.startup_cost() - planned.startup_cost();
        let total_saved = baseline.total_cost() - planned.total_cost();
        debug!(
            startup = planned.startup_cost(),
            total = planned.total_cost(),
            startup_saved,
            total_saved,
            "Plan with hypothetical indexes"
        );

        pass.enter(AdvisorPhase::Marking);
        if startup_saved > 0.0 || total_saved > 0.0 {
            mark_used_candidates(&planned, &mut materialized);
        }
        let used: Vec<IndexCandidate> = materialized.iter().filter(|c| c.used).cloned().collect();
        debug!("Used candidates: {}", format_candidates(&used));

        pass.enter(AdvisorPhase::Scoring);
        apportion_benefit(&mut materialized, total_saved);

        let explain = (self.config.explain && !used.is_empty()).then(|| {
            planned.explain(&|id| {
                materialized
                    .iter()
                    .any(|c| c.index_id == Some(id))
                    .then(|| format!("<V-Index>:{}", id))
            })
        });

        Ok(Analysis {
            advice: Vec::new(),
            candidates: materialized,
            startup_cost_saved: startup_saved,
            total_cost_saved: total_saved,
            explain,
            warnings: Vec::new(),
        })
    }

    /// Pick an operator class and a collation for every key column.
    fn resolve_operator_classes(&self, cand: &mut IndexCandidate) -> Result<(), AdvisorError> {
        let mut op_classes = Vec::with_capacity(cand.ncols());
        let mut collations = Vec::with_capacity(cand.ncols());
        for col in &cand.columns {
            let text_like = types::is_text_like(col.type_id);
            let pattern = if text_like && self.config.text_pattern_ops {
                self.catalog.pattern_operator_class(col.type_id)
            } else {
                None
            };
            let opclass = pattern
                .or_else(|| {
                    self.catalog
                        .default_operator_class(col.type_id, AccessMethod::BTree)
                })
                .ok_or(AdvisorError::NoUsableOperatorClass {
                    rel_id: cand.rel_id,
                    attno: col.attno,
                    type_id: col.type_id,
                })?;
            op_classes.push(opclass);
            collations.push(text_like.then_some(DEFAULT_COLLATION));
        }
        cand.op_classes = op_classes;
        cand.collations = collations;
        Ok(())
    }

    fn advice_record(&self, cand: &IndexCandidate, statement: &str) -> AdviceRecord {
        let deparser = Deparser::new(self.catalog.as_ref(), cand.rel_id);
        AdviceRecord {
            rel_id: cand.rel_id,
            relation: self
                .catalog
                .relation(cand.rel_id)
                .map(|r| r.name)
                .unwrap_or_else(|| cand.rel_id.to_string()),
            attnos: cand.attnos(),
            columns: cand.columns.iter().map(|c| c.name.clone()).collect(),
            benefit: cand.benefit,
            size_kb: AdviceRecord::size_kb_for_pages(cand.pages),
            op_classes: cand.op_classes.clone(),
            collations: cand.collations.clone(),
            expressions: cand.expressions.iter().map(|e| deparser.expr(e)).collect(),
            predicate: deparser.predicate(&cand.predicate),
            query: statement.to_string(),
            schema: self.config.advice_schema.clone(),
            definition: deparser.index_definition(cand),
            inherited_from: cand.parent,
        }
    }
}

/// Split `total_saved` across used candidates in proportion to their page counts.
/// Unused candidates score zero. `total_saved` is negative when the plan was
/// accepted for a lower startup cost alone, and the used candidates then carry a
/// negative benefit.
pub fn apportion_benefit(candidates: &mut [IndexCandidate], total_saved: f64) {
    let pages: u64 = candidates.iter().filter(|c| c.used).map(|c| c.pages).sum();
    for cand in candidates.iter_mut() {
        cand.benefit = if cand.used && pages > 0 {
            total_saved * cand.pages as f64 / pages as f64
        } else {
            0.0
        };
    }
}

fn hypothetical_definition(cand: &IndexCandidate) -> HypotheticalIndexDef {
    HypotheticalIndexDef {
        rel_id: cand.rel_id,
        columns: cand.attnos(),
        op_classes: cand.op_classes.clone(),
        collations: cand.collations.clone(),
        expressions: cand.expressions.clone(),
        predicate: cand.predicate.clone(),
    }
}

fn drop_hypothetical_indexes(backend: &dyn WhatIfBackend, candidates: &[IndexCandidate]) {
    for index_id in candidates.iter().filter_map(|c| c.index_id) {
        if let Err(e) = backend.drop_hypothetical_index(index_id) {
            warn!(index_id, "Could not drop hypothetical index: {}", e);
        }
    }
}

// ---------------------------------------------------------------------------
// Pass state
// ---------------------------------------------------------------------------

struct PassContext {
    phase: AdvisorPhase,
}

impl PassContext {
    fn new() -> Self {
        Self {
            phase: AdvisorPhase::Idle,
        }
    }

    fn enter(&mut self, next: AdvisorPhase) {
        debug!(from = ?self.phase, to = ?next, "Advisor phase");
        self.phase = next;
    }
}

/// Holds one level of the per-thread analysis depth.
struct RecursionGuard {
    depth: usize,
}

impl RecursionGuard {
    fn enter() -> Self {
        let depth = ANALYSIS_DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });
        Self { depth }
    }

    fn is_outermost(&self) -> bool {
        self.depth == 1
    }
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        ANALYSIS_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// An open rollback-only scope. Dropping it without `rollback` still rolls back.
struct NestedScope<'b> {
    backend: &'b dyn WhatIfBackend,
    handle: Option<ScopeHandle>,
}

impl<'b> NestedScope<'b> {
    fn begin(backend: &'b dyn WhatIfBackend) -> Result<Self, AdvisorError> {
        let handle = backend.begin().map_err(AdvisorError::Scope)?;
        Ok(Self {
            backend,
            handle: Some(handle),
        })
    }

    fn rollback(mut self) -> Result<(), AdvisorError> {
        match self.handle.take() {
            Some(handle) => self.backend.rollback(handle).map_err(AdvisorError::Scope),
            None => Ok(()),
        }
    }
}

impl Drop for NestedScope<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!(scope = handle.0, "Nested scope abandoned, rolling back");
            if let Err(e) = self.backend.rollback(handle) {
                warn!("{}", e);
            }
        }
    }
}

/// Shows materialized candidates to the planner and sizes them on request.
struct CandidateOverlay<'a> {
    candidates: &'a mut [IndexCandidate],
}

impl IndexOverlay for CandidateOverlay<'_> {
    fn hypothetical_indexes(&mut self, relation: &RelationInfo) -> Vec<HypotheticalIndex> {
        self.candidates
            .iter_mut()
            .filter(|c| c.rel_id == relation.rel_id)
            .filter_map(|cand| {
                let index_id = cand.index_id?;
                let widths: Vec<f64> = cand
                    .columns
                    .iter()
                    .map(|col| {
                        if col.is_expression() {
                            EXPRESSION_KEY_WIDTH
                        } else {
                            relation
                                .column(col.attno)
                                .map(|c| c.avg_width)
                                .unwrap_or(EXPRESSION_KEY_WIDTH)
                        }
                    })
                    .collect();
                let selectivity = stats::predicate_selectivity(&cand.predicate, relation);
                let size = stats::estimate_index_size(relation, &widths, selectivity);
                cand.pages = size.pages;
                cand.tuples = size.tuples;
                Some(HypotheticalIndex {
                    index_id,
                    def: hypothetical_definition(cand),
                    pages: size.pages,
                    tuples: size.tuples,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ixadv_core::candidate::IndexColumn;
    use ixadv_core::catalog::{ColumnDef, InMemoryCatalog};

    fn advisor(catalog: InMemoryCatalog, config: AdvisorConfig) -> IndexAdvisor {
        IndexAdvisor::new(Arc::new(catalog), config)
    }

    fn used(pages: u64) -> IndexCandidate {
        let mut c = IndexCandidate::column(1, "t", IndexColumn::new(1, types::INT4, "a"), false);
        c.pages = pages;
        c.used = true;
        c
    }

    #[test]
    fn test_benefit_split_by_pages() {
        let mut cands = vec![used(30), used(10), used(60)];
        cands[2].used = false;
        apportion_benefit(&mut cands, 40.0);
        assert_eq!(cands[0].benefit, 30.0);
        assert_eq!(cands[1].benefit, 10.0);
        assert_eq!(cands[2].benefit, 0.0);

        let mut single = vec![used(7)];
        apportion_benefit(&mut single, 40.0);
        assert_eq!(single[0].benefit, 40.0);
    }

    #[test]
    fn test_negative_saving_gives_negative_benefit() {
        let mut cands = vec![used(10), used(30), used(5)];
        cands[2].used = false;
        apportion_benefit(&mut cands, -4.0);
        assert_eq!(cands[0].benefit, -1.0);
        assert_eq!(cands[1].benefit, -3.0);
        assert_eq!(cands[2].benefit, 0.0);
    }

    #[test]
    fn test_text_columns_get_pattern_class_and_collation() {
        let mut cand = IndexCandidate::column(1, "t", IndexColumn::new(2, types::TEXT, "name"), false);
        let id = IndexCandidate::column(1, "t", IndexColumn::new(1, types::INT4, "id"), false);
        cand = IndexCandidate::composite(&cand, &id);

        let adv = advisor(InMemoryCatalog::with_builtin_opclasses(), AdvisorConfig::default());
        adv.resolve_operator_classes(&mut cand).unwrap();
        assert_eq!(cand.op_classes, vec![10049, 1978]);
        assert_eq!(cand.collations, vec![Some(DEFAULT_COLLATION), None]);

        let config = AdvisorConfig {
            text_pattern_ops: false,
            ..AdvisorConfig::default()
        };
        let adv = advisor(InMemoryCatalog::with_builtin_opclasses(), config);
        adv.resolve_operator_classes(&mut cand).unwrap();
        assert_eq!(cand.op_classes, vec![3126, 1978]);
    }

    #[test]
    fn test_missing_operator_class() {
        let mut cand = IndexCandidate::column(1, "t", IndexColumn::new(3, 600, "pt"), false);
        let adv = advisor(InMemoryCatalog::with_builtin_opclasses(), AdvisorConfig::default());
        assert!(matches!(
            adv.resolve_operator_classes(&mut cand),
            Err(AdvisorError::NoUsableOperatorClass { attno: 3, type_id: 600, .. })
        ));
    }

    #[test]
    fn test_recursion_guard_released() {
        {
            let outer = RecursionGuard::enter();
            assert!(outer.is_outermost());
            let inner = RecursionGuard::enter();
            assert!(!inner.is_outermost());
        }
        assert!(RecursionGuard::enter().is_outermost());
    }

    #[test]
    fn test_overlay_sizes_candidates() {
        let rel = RelationInfo::new(1, "t", 100.0, 10_000.0)
            .with_column(ColumnDef::new(1, "a", types::INT4).with_stats(4.0, 10.0));
        let mut cands = vec![used(0), used(0)];
        cands[0].index_id = Some(900_000);
        cands[1].rel_id = 2;
        cands[1].index_id = Some(900_001);

        let mut overlay = CandidateOverlay {
            candidates: &mut cands,
        };
        let shown = overlay.hypothetical_indexes(&rel);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].index_id, 900_000);
        assert!(cands[0].pages >= 1);
        assert_eq!(cands[0].tuples, 10_000.0);
        assert_eq!(cands[1].pages, 0);
    }
}
