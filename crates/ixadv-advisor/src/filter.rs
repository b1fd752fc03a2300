//! # Irrelevance Filter
//!
//! Drops candidates that cannot or need not become indexes:
//!
//! - every candidate on a relation that is not durable (temporary or unlogged) or is
//!   a system catalog;
//! - every candidate whose key columns are exactly those of an existing valid,
//!   non-partial, non-expression index on the same relation.

use crate::error::AdvisorError;
use ixadv_core::candidate::IndexCandidate;
use ixadv_core::catalog::Catalog;
use ixadv_core::query::{AttrNumber, RelId};
use std::collections::HashMap;
use tracing::debug;

/// What the filter knows about one relation.
enum Verdict {
    Unsupported(AdvisorError),
    Indexed(Vec<Vec<AttrNumber>>),
}

fn inspect(catalog: &dyn Catalog, rel_id: RelId) -> Verdict {
    if !catalog.is_durable(rel_id) || catalog.is_system(rel_id) {
        return Verdict::Unsupported(AdvisorError::UnsupportedRelation(rel_id));
    }
    let existing = catalog
        .indexes(rel_id)
        .into_iter()
        .filter(|ix| ix.valid && !ix.has_expressions && !ix.has_predicate)
        .map(|ix| ix.columns)
        .collect();
    Verdict::Indexed(existing)
}

/// The candidates worth evaluating, in their original order.
pub fn remove_irrelevant_candidates(
    candidates: Vec<IndexCandidate>,
    catalog: &dyn Catalog,
) -> Vec<IndexCandidate> {
    let mut verdicts: HashMap<RelId, Verdict> = HashMap::new();
    candidates
        .into_iter()
        .filter(|cand| {
            let verdict = verdicts
                .entry(cand.rel_id)
                .or_insert_with(|| inspect(catalog, cand.rel_id));
            match verdict {
                Verdict::Unsupported(reason) => {
                    debug!("Dropped candidate {}: {}", cand, reason);
                    false
                }
                Verdict::Indexed(existing) => {
                    let attnos = cand.attnos();
                    let covered = existing.iter().any(|cols| *cols == attnos);
                    if covered {
                        debug!("Dropped candidate {}: matches an existing index", cand);
                    }
                    !covered
                }
            }
        })
        .collect()
}
