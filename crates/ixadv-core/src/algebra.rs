//! # Candidate Algebra
//!
//! Candidate lists are kept sorted in one canonical order so that combining them is a
//! linear merge and duplicates are adjacent:
//!
//! 1. relation id
//! 2. alias (lexicographic)
//! 3. number of key columns
//! 4. key attribute numbers, position by position
//!
//! Two candidates that tie on all four are structurally the same index and only one
//! of them survives a merge. Functional candidates key on the placeholder attribute
//! `0`, so two functional candidates of the same width on the same relation collapse
//! into the first one seen.
//!
//! ## Composite Candidates
//!
//! `build_composite_candidates` pairs up candidates on the same relation and alias
//! whose key columns are disjoint, and emits both column orders: for an ordered index
//! the leading column decides which predicates it can serve.

use crate::candidate::{IndexCandidate, INDEX_MAX_KEYS};
use std::cmp::Ordering;
use tracing::trace;

/// Canonical order of candidates.
pub fn compare_candidates(c1: &IndexCandidate, c2: &IndexCandidate) -> Ordering {
    c1.rel_id
        .cmp(&c2.rel_id)
        .then_with(|| c1.alias.cmp(&c2.alias))
        .then_with(|| c1.ncols().cmp(&c2.ncols()))
        .then_with(|| {
            c1.columns
                .iter()
                .map(|c| c.attno)
                .cmp(c2.columns.iter().map(|c| c.attno))
        })
}

/// Sorted merge of two ascending lists. On a tie the element of `list1` is kept.
/// An empty input returns the other list as is.
pub fn merge_candidates(
    list1: Vec<IndexCandidate>,
    list2: Vec<IndexCandidate>,
) -> Vec<IndexCandidate> {
    if list1.is_empty() {
        return list2;
    }
    if list2.is_empty() {
        return list1;
    }

    let mut out = Vec::with_capacity(list1.len() + list2.len());
    let mut left = list1.into_iter().peekable();
    let mut right = list2.into_iter().peekable();
    loop {
        let ord = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => compare_candidates(a, b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match ord {
            Ordering::Less => out.extend(left.next()),
            Ordering::Greater => out.extend(right.next()),
            Ordering::Equal => {
                if let Some(dup) = right.next() {
                    trace!("Dropped duplicate candidate {}", dup);
                }
                out.extend(left.next());
            }
        }
    }
    out
}

/// Composite candidates for every pair of `list1` x `list2` on the same relation and
/// alias with disjoint key columns, whose combined width stays within
/// `min(INDEX_MAX_KEYS, max_cols)`. Both inputs must be ascending; so is the result.
pub fn build_composite_candidates(
    list1: &[IndexCandidate],
    list2: &[IndexCandidate],
    max_cols: usize,
) -> Vec<IndexCandidate> {
    let limit = INDEX_MAX_KEYS.min(max_cols);
    let mut composites: Vec<IndexCandidate> = Vec::new();
    if list1.is_empty() || list2.is_empty() {
        return composites;
    }

    for c2 in list2 {
        let same_relation = list1
            .iter()
            .filter(|c1| c1.rel_id == c2.rel_id && c1.alias == c2.alias);
        for c1 in same_relation {
            if c1.ncols() + c2.ncols() > limit {
                continue;
            }
            if c1.overlaps(c2) {
                trace!("Skipped composite of {} and {}: common column", c1, c2);
                continue;
            }
            let forward = IndexCandidate::composite(c1, c2);
            let backward = IndexCandidate::composite(c2, c1);
            let pair = match compare_candidates(&forward, &backward) {
                Ordering::Equal => vec![forward],
                Ordering::Less => vec![forward, backward],
                Ordering::Greater => vec![backward, forward],
            };
            composites = merge_candidates(pair, composites);
        }
    }
    trace!(count = composites.len(), "Built composite candidates");
    composites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{format_candidates, IndexColumn};
    use crate::query::types;

    fn cand(rel_id: u32, alias: &str, attnos: &[i16]) -> IndexCandidate {
        let mut columns = attnos
            .iter()
            .map(|a| IndexColumn::new(*a, types::INT4, format!("c{}", a)));
        let mut c = IndexCandidate::column(rel_id, alias, columns.next().unwrap(), false);
        c.columns.extend(columns);
        c
    }

    fn sorted(mut list: Vec<IndexCandidate>) -> Vec<IndexCandidate> {
        list.sort_by(compare_candidates);
        list
    }

    fn is_ascending(list: &[IndexCandidate]) -> bool {
        list.windows(2)
            .all(|w| compare_candidates(&w[0], &w[1]) == Ordering::Less)
    }

    #[test]
    fn test_compare_priority() {
        assert_eq!(compare_candidates(&cand(1, "z", &[9]), &cand(2, "a", &[1])), Ordering::Less);
        assert_eq!(compare_candidates(&cand(1, "a", &[9]), &cand(1, "b", &[1])), Ordering::Less);
        assert_eq!(compare_candidates(&cand(1, "a", &[9]), &cand(1, "a", &[1, 2])), Ordering::Less);
        assert_eq!(compare_candidates(&cand(1, "a", &[1, 3]), &cand(1, "a", &[2, 1])), Ordering::Less);
        assert_eq!(compare_candidates(&cand(1, "a", &[1, 3]), &cand(1, "a", &[1, 3])), Ordering::Equal);
    }

    #[test]
    fn test_merge_is_sorted_union() {
        let a = sorted(vec![cand(1, "t", &[1]), cand(1, "t", &[3]), cand(2, "u", &[1])]);
        let b = sorted(vec![cand(1, "t", &[2]), cand(1, "t", &[3]), cand(1, "t", &[1, 2])]);

        let ab = merge_candidates(a.clone(), b.clone());
        let ba = merge_candidates(b, a);
        assert!(is_ascending(&ab));
        assert_eq!(ab.len(), 5);
        assert_eq!(format_candidates(&ab), format_candidates(&ba));
    }

    #[test]
    fn test_merge_keeps_first_on_tie() {
        let mut first = cand(1, "t", &[1]);
        first.used = true;
        let merged = merge_candidates(vec![first], vec![cand(1, "t", &[1])]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].used);
    }

    #[test]
    fn test_merge_with_empty() {
        let a = sorted(vec![cand(1, "t", &[2]), cand(1, "t", &[1])]);
        assert_eq!(merge_candidates(a.clone(), Vec::new()), a);
        assert_eq!(merge_candidates(Vec::new(), a.clone()), a);
    }

    #[test]
    fn test_composite_emits_both_orders() {
        let a = vec![cand(1, "t", &[1])];
        let c = vec![cand(1, "t", &[3])];
        let out = build_composite_candidates(&a, &c, 3);
        assert_eq!(format_candidates(&out), "1_(1,3) 1_(3,1)");
    }

    #[test]
    fn test_composite_skips_overlap_and_other_relations() {
        let l1 = sorted(vec![cand(1, "t", &[1]), cand(1, "t", &[1, 2]), cand(2, "u", &[1])]);
        let l2 = sorted(vec![cand(1, "t", &[2]), cand(1, "s", &[5])]);
        let out = build_composite_candidates(&l1, &l2, 3);
        assert_eq!(format_candidates(&out), "1_(1,2) 1_(2,1)");
    }

    #[test]
    fn test_composite_width_limit() {
        let l1 = vec![cand(1, "t", &[1, 2])];
        let l2 = vec![cand(1, "t", &[3, 4])];
        assert!(build_composite_candidates(&l1, &l2, 3).is_empty());
        let out = build_composite_candidates(&l1, &l2, 4);
        assert!(out.iter().all(|c| c.ncols() == 4));
        assert_eq!(out.len(), 2);
        assert!(build_composite_candidates(&l1, &l2, 100).len() == 2);
    }

    #[test]
    fn test_composite_never_repeats_a_column() {
        let l1 = sorted(vec![cand(1, "t", &[1]), cand(1, "t", &[2]), cand(1, "t", &[3])]);
        let out = build_composite_candidates(&l1, &l1, 3);
        assert!(is_ascending(&out));
        assert_eq!(out.len(), 6);
        for c in &out {
            let mut attnos = c.attnos();
            attnos.sort();
            attnos.dedup();
            assert_eq!(attnos.len(), c.ncols());
        }
    }
}
