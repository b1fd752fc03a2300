//! # Selectivity and Index Size Estimation
//!
//! Formulas shared by the reference planner and the advisor's size estimates for
//! hypothetical indexes.
//!
//! ## Selectivity Estimation
//!
//! - **Equality**: 1 / NDV (uniform distribution assumption).
//! - **Inequality** (`<>`): 1 - 1 / NDV.
//! - **Range**: fixed 1/3 heuristic.
//! - **Default**: 0.1 (10%) when no better estimate is available.
//!
//! Conjunctions multiply (independence assumption).
//!
//! ## Index Size
//!
//! A hypothetical index has no storage, so its page count is derived from the heap:
//!
//! ```text
//! pages = tuples * (index_tuple_width + item_id) / ((BLOCK_SIZE - page_header - btree_special) * fillfactor)
//! ```
//!
//! where `index_tuple_width` is the tuple header plus the maximally-aligned widths of
//! the key columns.

use crate::catalog::RelationInfo;
use crate::query::{BinaryOp, Expr, UnaryOp};

/// Page size in bytes.
pub const BLOCK_SIZE: f64 = 8192.0;
const PAGE_HEADER_SIZE: f64 = 24.0;
const ITEM_ID_SIZE: f64 = 4.0;
const BTREE_SPECIAL_SIZE: f64 = 16.0;
const INDEX_TUPLE_HEADER_SIZE: f64 = 8.0;
const MAX_ALIGN: f64 = 8.0;
const BTREE_DEFAULT_FILLFACTOR: f64 = 90.0;

/// Selectivity used when nothing better is known.
pub const DEFAULT_FILTER_SELECTIVITY: f64 = 0.1;
/// Equality selectivity for keys without column statistics (expression keys).
pub const DEFAULT_EQUALITY_SELECTIVITY: f64 = 0.005;
/// Selectivity of a single range comparison.
pub const RANGE_SELECTIVITY: f64 = 1.0 / 3.0;

fn column_ndv(expr: &Expr, rel: &RelationInfo) -> Option<f64> {
    match expr {
        Expr::Var(v) => rel.column(v.attno).map(|c| c.distinct.max(1.0)),
        Expr::Coerce { arg, .. } => column_ndv(arg, rel),
        _ => None,
    }
}

/// Estimate the fraction of `rel`'s rows satisfying `clause`. Column references are
/// assumed to belong to `rel`.
pub fn clause_selectivity(clause: &Expr, rel: &RelationInfo) -> f64 {
    match clause {
        Expr::And(args) => args.iter().map(|a| clause_selectivity(a, rel)).product(),
        Expr::Or(args) => {
            // P(a or b) = 1 - P(!a)P(!b)
            1.0 - args
                .iter()
                .map(|a| 1.0 - clause_selectivity(a, rel))
                .product::<f64>()
        }
        Expr::UnaryOp {
            op: UnaryOp::Not,
            operand,
        } => 1.0 - clause_selectivity(operand, rel),
        Expr::BinaryOp { op, left, right } => {
            let ndv = column_ndv(left, rel).or_else(|| column_ndv(right, rel));
            match (op, ndv) {
                (BinaryOp::Eq, Some(ndv)) => 1.0 / ndv,
                (BinaryOp::NotEq, Some(ndv)) => 1.0 - 1.0 / ndv,
                (BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq, _) => {
                    RANGE_SELECTIVITY
                }
                _ => DEFAULT_FILTER_SELECTIVITY,
            }
        }
        _ => DEFAULT_FILTER_SELECTIVITY,
    }
}

/// Selectivity of an implicitly AND-ed predicate list; 1.0 for an empty list.
pub fn predicate_selectivity(predicate: &[Expr], rel: &RelationInfo) -> f64 {
    predicate
        .iter()
        .map(|clause| clause_selectivity(clause, rel))
        .product::<f64>()
        .clamp(0.0, 1.0)
}

fn max_align(len: f64) -> f64 {
    (len / MAX_ALIGN).ceil() * MAX_ALIGN
}

/// Estimated leaf pages of a B-tree over every row of `rel` with keys of the given
/// average widths.
pub fn estimate_index_pages(rel: &RelationInfo, key_widths: &[f64]) -> f64 {
    let data_length: f64 = key_widths.iter().map(|w| max_align(*w)).sum();
    let tuple_width = INDEX_TUPLE_HEADER_SIZE + data_length;
    let usable = (BLOCK_SIZE - PAGE_HEADER_SIZE - BTREE_SPECIAL_SIZE)
        * (BTREE_DEFAULT_FILLFACTOR / 100.0);
    (rel.tuples * (tuple_width + ITEM_ID_SIZE) / usable).round()
}

/// Size of an index covering only the fraction `selectivity` of `rel`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexSize {
    pub pages: u64,
    pub tuples: f64,
}

/// Estimate the size of a (possibly partial) index on `rel`.
///
/// Pages never drop below one so that every materialized index carries some weight
/// when cost savings are apportioned by size.
pub fn estimate_index_size(rel: &RelationInfo, key_widths: &[f64], selectivity: f64) -> IndexSize {
    let full = estimate_index_pages(rel, key_widths);
    let pages = (selectivity * full).round().max(1.0) as u64;
    let tuples = (selectivity * rel.tuples).ceil();
    IndexSize { pages, tuples }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnDef;
    use crate::query::types;

    fn orders() -> RelationInfo {
        RelationInfo::new(1, "orders", 1000.0, 100_000.0)
            .with_column(ColumnDef::new(1, "id", types::INT4).with_stats(4.0, 100_000.0))
            .with_column(ColumnDef::new(2, "status", types::INT4).with_stats(4.0, 4.0))
    }

    #[test]
    fn test_equality_selectivity_uses_ndv() {
        let rel = orders();
        let eq = Expr::binary(BinaryOp::Eq, Expr::column(1, 2, types::INT4), Expr::int(1));
        assert!((clause_selectivity(&eq, &rel) - 0.25).abs() < 1e-9);
        let reversed = Expr::binary(BinaryOp::Eq, Expr::int(1), Expr::column(1, 2, types::INT4));
        assert!((clause_selectivity(&reversed, &rel) - 0.25).abs() < 1e-9);
        let range = Expr::binary(BinaryOp::Lt, Expr::column(1, 1, types::INT4), Expr::int(10));
        assert!((clause_selectivity(&range, &rel) - RANGE_SELECTIVITY).abs() < 1e-9);
        assert_eq!(predicate_selectivity(&[], &rel), 1.0);
    }

    #[test]
    fn test_index_pages_scale_with_tuples_and_width() {
        let rel = orders();
        let narrow = estimate_index_pages(&rel, &[4.0]);
        let wide = estimate_index_pages(&rel, &[4.0, 32.0]);
        // (8 + 8 + 4) bytes per entry over ~7337 usable bytes per page
        assert_eq!(narrow, 273.0);
        assert!(wide > narrow);

        let partial = estimate_index_size(&rel, &[4.0], 0.25);
        assert_eq!(partial.pages, 68);
        assert_eq!(partial.tuples, 25_000.0);

        let empty = RelationInfo::new(2, "empty", 0.0, 0.0);
        assert_eq!(estimate_index_size(&empty, &[4.0], 1.0).pages, 1);
    }
}
