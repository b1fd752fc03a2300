//! # Inheritance Expander
//!
//! A relation referenced with its inheritance children is really a scan of the
//! parent plus every child, so an index on the parent alone helps only part of it.
//! Each candidate on such a relation is cloned for every direct child, keeping the
//! alias, the key columns and the expressions, and recording the parent. A candidate
//! whose relation turns out to have no children loses its inheritance flag.
//!
//! Partial-index predicates follow the same path: every relation clause is copied
//! to each child of its relation under the same alias, and the copies are expanded
//! again for grandchildren.

use ixadv_core::algebra::{compare_candidates, merge_candidates};
use ixadv_core::candidate::{format_candidates, IndexCandidate, RelationClause, RelationClauses};
use ixadv_core::catalog::Catalog;
use ixadv_core::query::RelId;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// `candidates` plus a clone per inheritance child. The result is ascending.
pub fn expand_inherited_candidates(
    mut candidates: Vec<IndexCandidate>,
    catalog: &dyn Catalog,
) -> Vec<IndexCandidate> {
    let mut clones: Vec<IndexCandidate> = Vec::new();
    for cand in candidates.iter_mut().filter(|c| c.inherit) {
        let children = catalog.child_relations(cand.rel_id);
        if children.is_empty() {
            cand.inherit = false;
            continue;
        }
        clones.extend(children.into_iter().map(|child| cand.for_child(child)));
    }
    if clones.is_empty() {
        return candidates;
    }

    clones.sort_by(compare_candidates);
    clones.dedup_by(|a, b| compare_candidates(a, b).is_eq());
    debug!("Inherited candidates: {}", format_candidates(&clones));
    merge_candidates(candidates, clones)
}

/// Copy every relation clause to the children of its relation. Copies are
/// expanded in turn, so predicates reach every level of the hierarchy.
pub fn expand_inherited_rel_clauses(clauses: &mut RelationClauses, catalog: &dyn Catalog) {
    let mut pending: VecDeque<RelationClause> = clauses.iter().cloned().collect();
    // (relation, alias) pairs already queued as copies; bounds a cyclic hierarchy
    let mut expanded: HashSet<(RelId, String)> = HashSet::new();
    while let Some(parent) = pending.pop_front() {
        for child in catalog.child_relations(parent.rel_id) {
            debug!(parent = parent.rel_id, child, alias = %parent.alias, "Inherited relation clause");
            for clause in &parent.predicate {
                clauses.append(child, &parent.alias, clause.clone());
            }
            if expanded.insert((child, parent.alias.clone())) {
                pending.push_back(RelationClause {
                    rel_id: child,
                    ..parent.clone()
                });
            }
        }
    }
}
