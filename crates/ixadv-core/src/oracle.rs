//! # Cost Oracle and Transactional Scope
//!
//! The advisor never estimates plan costs itself. It asks a cost-based planner (the
//! Cost Oracle) to plan the query, once as-is and once with hypothetical indexes
//! visible, and compares the two answers.
//!
//! ## Visibility of Hypothetical Indexes
//!
//! Materializing a hypothetical index only registers its definition. The planner
//! sees it only through an `IndexOverlay` passed to a single `plan()` call: whenever
//! the planner looks at a relation's index list it also asks the overlay. Because the
//! overlay is a borrowed argument it cannot outlive that call, which makes the
//! "install hook / re-plan / remove hook" sequence impossible to get wrong.
//!
//! ## Transactional Scope
//!
//! All metadata written while evaluating hypothetical indexes happens inside a
//! nested scope opened with `begin()` and always closed with `rollback()`. A backend
//! must undo every write made since the matching `begin()`.

use crate::catalog::RelationInfo;
use crate::plan::PlannedQuery;
use crate::query::{AttrNumber, CollationId, Expr, IndexId, OpClassId, Query, RelId};
use serde::{Deserialize, Serialize};

/// Definition of an index with no physical storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypotheticalIndexDef {
    pub rel_id: RelId,
    /// Key attribute numbers in key order; `0` marks an expression key taken from
    /// `expressions` in order.
    pub columns: Vec<AttrNumber>,
    pub op_classes: Vec<OpClassId>,
    pub collations: Vec<Option<CollationId>>,
    /// Expression keys, with column references rebased to the indexed relation.
    pub expressions: Vec<Expr>,
    /// Partial-index predicate (implicitly AND-ed); empty for a full index.
    pub predicate: Vec<Expr>,
}

/// A materialized hypothetical index as presented to the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypotheticalIndex {
    pub index_id: IndexId,
    pub def: HypotheticalIndexDef,
    pub pages: u64,
    pub tuples: f64,
}

/// Supplies hypothetical indexes to the planner for the duration of one `plan()` call.
pub trait IndexOverlay {
    /// Hypothetical indexes to consider on `relation`, in addition to its real ones.
    fn hypothetical_indexes(&mut self, relation: &RelationInfo) -> Vec<HypotheticalIndex>;
}

/// Errors raised by a Cost Oracle or Transactional Scope backend.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("planning failed: {0}")]
    Planning(String),
    #[error("could not materialize hypothetical index: {0}")]
    Materialization(String),
    #[error("unknown index {0}")]
    UnknownIndex(IndexId),
    #[error("unknown relation {0}")]
    UnknownRelation(RelId),
    #[error("transactional scope error: {0}")]
    Scope(String),
}

/// The external cost-based planner.
pub trait CostOracle {
    fn plan(
        &self,
        query: &Query,
        overlay: Option<&mut dyn IndexOverlay>,
    ) -> Result<PlannedQuery, OracleError>;

    fn materialize_hypothetical_index(
        &self,
        def: &HypotheticalIndexDef,
    ) -> Result<IndexId, OracleError>;

    fn drop_hypothetical_index(&self, index_id: IndexId) -> Result<(), OracleError>;
}

/// Opaque handle for an open nested scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeHandle(pub u64);

/// A rollback-only nested transaction.
pub trait TransactionScope {
    fn begin(&self) -> Result<ScopeHandle, OracleError>;
    /// Undo every metadata write made since the `begin()` that returned `handle`.
    fn rollback(&self, handle: ScopeHandle) -> Result<(), OracleError>;
}

/// Everything the advisor needs from its host.
pub trait WhatIfBackend: CostOracle + TransactionScope {}

impl<T: CostOracle + TransactionScope> WhatIfBackend for T {}
