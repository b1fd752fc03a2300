//! # Index Candidates
//!
//! An `IndexCandidate` is a proposed index derived from the shape of a query. It
//! starts out as a bare list of key columns on one relation (as seen through one
//! range-table alias) and is enriched as the analysis pass moves along:
//!
//! 1. The scanner creates it with its key columns (or a placeholder column plus an
//!    expression for a functional candidate).
//! 2. The evaluator resolves operator classes and collations, attaches the partial
//!    predicate collected for its relation, and materializes it as a hypothetical
//!    index, which assigns `index_id`.
//! 3. While the oracle re-plans, page and tuple estimates are filled in.
//! 4. The plan usage marker sets `used`; scoring sets `benefit`.
//!
//! Candidates never outlive the analysis pass that produced them.
//!
//! ## Relation Clauses
//!
//! Comparisons on allowlisted columns (soft-delete flags, type discriminators) are
//! not turned into candidates. They are collected per (relation, alias) as
//! `RelationClause`s and become the `WHERE` clause of partial indexes on that
//! relation.

use crate::query::{AttrNumber, CollationId, Expr, IndexId, OpClassId, RelId, TypeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard upper bound on the number of key columns of one index.
pub const INDEX_MAX_KEYS: usize = 32;

/// One key column of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Attribute number; `0` is the placeholder of an expression key.
    pub attno: AttrNumber,
    pub type_id: TypeId,
    pub name: String,
}

impl IndexColumn {
    pub fn new(attno: AttrNumber, type_id: TypeId, name: impl Into<String>) -> Self {
        Self {
            attno,
            type_id,
            name: name.into(),
        }
    }

    pub fn is_expression(&self) -> bool {
        self.attno == 0
    }
}

/// A proposed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexCandidate {
    pub rel_id: RelId,
    /// Range-table alias the relation was referenced under.
    pub alias: String,
    /// Key columns, leading column first.
    pub columns: Vec<IndexColumn>,
    /// Expressions behind the placeholder columns, in key order.
    pub expressions: Vec<Expr>,
    /// Partial-index predicate (implicitly AND-ed).
    pub predicate: Vec<Expr>,
    pub op_classes: Vec<OpClassId>,
    pub collations: Vec<Option<CollationId>>,
    /// The relation was referenced including its inheritance children.
    pub inherit: bool,
    /// For a clone made for an inheritance child, the relation it was cloned from.
    pub parent: Option<RelId>,
    /// Hypothetical index id, once materialized.
    pub index_id: Option<IndexId>,
    pub pages: u64,
    pub tuples: f64,
    pub used: bool,
    pub benefit: f64,
}

impl IndexCandidate {
    fn with_columns(
        rel_id: RelId,
        alias: impl Into<String>,
        columns: Vec<IndexColumn>,
        expressions: Vec<Expr>,
        inherit: bool,
    ) -> Self {
        Self {
            rel_id,
            alias: alias.into(),
            columns,
            expressions,
            predicate: Vec::new(),
            op_classes: Vec::new(),
            collations: Vec::new(),
            inherit,
            parent: None,
            index_id: None,
            pages: 0,
            tuples: 0.0,
            used: false,
            benefit: 0.0,
        }
    }

    /// Single-column candidate.
    pub fn column(rel_id: RelId, alias: impl Into<String>, column: IndexColumn, inherit: bool) -> Self {
        Self::with_columns(rel_id, alias, vec![column], Vec::new(), inherit)
    }

    /// Functional candidate over `expr`, whose result has type `type_id`. `expr` must
    /// already be rebased to the indexed relation.
    pub fn expression(
        rel_id: RelId,
        alias: impl Into<String>,
        type_id: TypeId,
        name: impl Into<String>,
        expr: Expr,
        inherit: bool,
    ) -> Self {
        Self::with_columns(
            rel_id,
            alias,
            vec![IndexColumn::new(0, type_id, name)],
            vec![expr],
            inherit,
        )
    }

    /// Candidate keyed on the columns of `first` followed by those of `second`.
    pub fn composite(first: &IndexCandidate, second: &IndexCandidate) -> Self {
        let columns = first
            .columns
            .iter()
            .chain(second.columns.iter())
            .cloned()
            .collect();
        let mut expressions = first.expressions.clone();
        for e in &second.expressions {
            if !expressions.contains(e) {
                expressions.push(e.clone());
            }
        }
        Self::with_columns(
            first.rel_id,
            first.alias.clone(),
            columns,
            expressions,
            first.inherit || second.inherit,
        )
    }

    /// Copy of this candidate for an inheritance child of its relation.
    pub fn for_child(&self, child: RelId) -> Self {
        let mut clone = Self::with_columns(
            child,
            self.alias.clone(),
            self.columns.clone(),
            self.expressions.clone(),
            false,
        );
        clone.parent = Some(self.rel_id);
        clone
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn attnos(&self) -> Vec<AttrNumber> {
        self.columns.iter().map(|c| c.attno).collect()
    }

    pub fn is_functional(&self) -> bool {
        !self.expressions.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.predicate.is_empty()
    }

    /// Whether the two candidates share a key column.
    pub fn overlaps(&self, other: &IndexCandidate) -> bool {
        self.columns
            .iter()
            .any(|a| other.columns.iter().any(|b| a.attno == b.attno))
    }
}

/// Compact `relid_(att,att)` form used in logs.
impl fmt::Display for IndexCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_(", self.rel_id)?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", c.attno)?;
        }
        write!(f, ")")
    }
}

/// Space-separated compact form of a candidate list.
pub fn format_candidates(candidates: &[IndexCandidate]) -> String {
    candidates
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Predicate fragments collected for one relation as referenced under one alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationClause {
    pub rel_id: RelId,
    pub alias: String,
    /// Comparisons normalised to `column op constant`, rebased to the relation.
    pub predicate: Vec<Expr>,
}

/// All relation clauses of one analysis pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationClauses {
    clauses: Vec<RelationClause>,
}

impl RelationClauses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `clause` to the predicate of (`rel_id`, `alias`), creating the entry on
    /// first use. A clause already recorded is not added twice.
    pub fn append(&mut self, rel_id: RelId, alias: &str, clause: Expr) {
        match self
            .clauses
            .iter_mut()
            .find(|rc| rc.rel_id == rel_id && rc.alias == alias)
        {
            Some(rc) => {
                if !rc.predicate.contains(&clause) {
                    rc.predicate.push(clause);
                }
            }
            None => self.clauses.push(RelationClause {
                rel_id,
                alias: alias.to_string(),
                predicate: vec![clause],
            }),
        }
    }

    pub fn get(&self, rel_id: RelId, alias: &str) -> Option<&RelationClause> {
        self.clauses
            .iter()
            .find(|rc| rc.rel_id == rel_id && rc.alias == alias)
    }

    /// Predicate for (`rel_id`, `alias`); empty when nothing was collected.
    pub fn predicate(&self, rel_id: RelId, alias: &str) -> &[Expr] {
        self.get(rel_id, alias)
            .map(|rc| rc.predicate.as_slice())
            .unwrap_or(&[])
    }

    pub fn push(&mut self, clause: RelationClause) {
        self.clauses.push(clause);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelationClause> {
        self.clauses.iter()
    }

    pub fn len(&self) -> usize {
        self.clauses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clear(&mut self) {
        self.clauses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{types, BinaryOp};

    #[test]
    fn test_display_is_compact() {
        let a = IndexCandidate::column(16384, "t", IndexColumn::new(1, types::INT4, "a"), false);
        let c = IndexCandidate::column(16384, "t", IndexColumn::new(3, types::INT4, "c"), false);
        let ac = IndexCandidate::composite(&a, &c);
        assert_eq!(ac.to_string(), "16384_(1,3)");
        assert_eq!(format_candidates(&[a, ac]), "16384_(1) 16384_(1,3)");
    }

    #[test]
    fn test_relation_clauses_append_per_alias() {
        let deleted = Expr::binary(BinaryOp::Eq, Expr::column(1, 4, types::BOOL), Expr::boolean(false));
        let kind = Expr::binary(BinaryOp::Eq, Expr::column(1, 5, types::INT4), Expr::int(3));

        let mut clauses = RelationClauses::new();
        clauses.append(7, "o", deleted.clone());
        clauses.append(7, "o", kind.clone());
        clauses.append(7, "o", deleted.clone());
        clauses.append(7, "o2", deleted.clone());

        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses.predicate(7, "o"), &[deleted.clone(), kind][..]);
        assert_eq!(clauses.predicate(7, "o2"), &[deleted][..]);
        assert!(clauses.predicate(8, "o").is_empty());
    }

    #[test]
    fn test_child_clone_records_parent() {
        let mut a = IndexCandidate::column(1, "p", IndexColumn::new(2, types::INT4, "a"), true);
        a.used = true;
        let child = a.for_child(11);
        assert_eq!(child.rel_id, 11);
        assert_eq!(child.parent, Some(1));
        assert_eq!(child.columns, a.columns);
        assert!(!child.used);
    }
}
