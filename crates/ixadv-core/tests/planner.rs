//! Reference planner scenarios: join strategy, sub-plans and partial indexes.
//!
//! The join scenario loads its query from a JSON fixture, the shape a host would
//! hand over after binding a statement.

use ixadv_core::catalog::{Catalog, ColumnDef, IndexDescriptor, InMemoryCatalog, RelationInfo};
use ixadv_core::oracle::{CostOracle, HypotheticalIndex, HypotheticalIndexDef, IndexOverlay};
use ixadv_core::plan::{JoinKind, PlanExpr, PlanOp};
use ixadv_core::planner::SimplePlanner;
use ixadv_core::query::{
    types, BinaryOp, Expr, Query, RangeTableEntry, TargetEntry, Var,
};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn shop_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::with_builtin_opclasses();
    catalog.add_relation(
        RelationInfo::new(1, "customers", 100.0, 10_000.0)
            .with_column(ColumnDef::new(1, "id", types::INT4).with_stats(4.0, 10_000.0))
            .with_column(ColumnDef::new(2, "region", types::INT4).with_stats(4.0, 10_000.0)),
    );
    catalog.add_relation(
        RelationInfo::new(2, "orders", 10_000.0, 1_000_000.0)
            .with_column(ColumnDef::new(1, "id", types::INT4).with_stats(4.0, 1_000_000.0))
            .with_column(ColumnDef::new(2, "cust_id", types::INT4).with_stats(4.0, 10_000.0))
            .with_column(ColumnDef::new(3, "amount", types::FLOAT8).with_stats(8.0, 50_000.0)),
    );
    catalog
}

fn orders_by_region() -> Query {
    serde_json::from_str(include_str!("fixtures/orders_by_region.json")).unwrap()
}

fn items_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::with_builtin_opclasses();
    catalog.add_relation(
        RelationInfo::new(3, "items", 1000.0, 100_000.0)
            .with_column(ColumnDef::new(1, "a", types::INT4).with_stats(4.0, 1000.0))
            .with_column(ColumnDef::new(2, "b", types::INT4).with_stats(4.0, 10.0))
            .with_column(ColumnDef::new(3, "x", types::INT4).with_stats(4.0, 100_000.0))
            .with_column(ColumnDef::new(4, "is_deleted", types::BOOL).with_stats(1.0, 2.0)),
    );
    catalog.add_relation(
        RelationInfo::new(4, "prices", 50.0, 5_000.0)
            .with_column(ColumnDef::new(1, "x", types::INT4).with_stats(4.0, 5_000.0))
            .with_column(ColumnDef::new(2, "y", types::INT4).with_stats(4.0, 100.0)),
    );
    catalog
}

fn planner(catalog: InMemoryCatalog) -> SimplePlanner {
    let catalog: Arc<dyn Catalog> = Arc::new(catalog);
    SimplePlanner::new(catalog)
}

fn eq(l: Expr, r: Expr) -> Expr {
    Expr::binary(BinaryOp::Eq, l, r)
}

fn items_query(quals: Expr) -> Query {
    Query {
        range_table: vec![RangeTableEntry::relation("i", 3)],
        quals: Some(quals),
        target_list: vec![TargetEntry {
            expr: Expr::column(1, 2, types::INT4),
            name: Some("b".into()),
        }],
        ..Query::default()
    }
}

struct FixedOverlay(Vec<HypotheticalIndex>);

impl IndexOverlay for FixedOverlay {
    fn hypothetical_indexes(&mut self, relation: &RelationInfo) -> Vec<HypotheticalIndex> {
        self.0
            .iter()
            .filter(|h| h.def.rel_id == relation.rel_id)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

#[test]
fn test_index_nested_loop_join() {
    let mut catalog = shop_catalog();
    catalog.add_index(IndexDescriptor::new(5, 2, vec![2]));
    let planned = planner(catalog).plan(&orders_by_region(), None).unwrap();

    assert!(matches!(
        planned.plan.op,
        PlanOp::Join {
            kind: JoinKind::NestedLoop,
            ..
        }
    ));
    let inner = planned.plan.right.as_ref().unwrap();
    assert_eq!(inner.op, PlanOp::IndexScan { rel_id: 2, index_id: 5 });
    // the join clause is answered by the index probe
    if let PlanOp::Join { join_qual, .. } = &planned.plan.op {
        assert!(join_qual.is_empty());
    }
}

#[test]
fn test_hash_join_without_index() {
    let planned = planner(shop_catalog()).plan(&orders_by_region(), None).unwrap();
    match &planned.plan.op {
        PlanOp::Join { kind, join_qual } => {
            assert_eq!(*kind, JoinKind::Hash);
            assert_eq!(join_qual.len(), 1);
        }
        other => panic!("expected a join, got {:?}", other),
    }
    let outer = planned.plan.left.as_ref().unwrap();
    assert_eq!(outer.op, PlanOp::SeqScan { rel_id: 1 });
}

// ---------------------------------------------------------------------------
// Sub-links
// ---------------------------------------------------------------------------

fn max_price(quals: Option<Expr>) -> Expr {
    Expr::SubLink(Box::new(Query {
        range_table: vec![RangeTableEntry::relation("p", 4)],
        quals,
        target_list: vec![TargetEntry {
            expr: Expr::Aggregate {
                name: "max".into(),
                args: vec![Expr::column(1, 1, types::INT4)],
            },
            name: None,
        }],
        ..Query::default()
    }))
}

#[test]
fn test_uncorrelated_sublink_becomes_init_plan() {
    let query = items_query(eq(Expr::column(1, 1, types::INT4), max_price(None)));
    let planned = planner(items_catalog()).plan(&query, None).unwrap();

    assert_eq!(planned.subplans.len(), 1);
    assert_eq!(planned.plan.init_plans, vec![0]);
    assert_eq!(planned.subplans[0].op, PlanOp::Aggregate);
}

#[test]
fn test_correlated_sublink_is_referenced_from_qual() {
    let outer_b = Expr::Var(Var {
        varno: 1,
        attno: 2,
        type_id: types::INT4,
        levels_up: 1,
    });
    let correlated = max_price(Some(eq(Expr::column(1, 2, types::INT4), outer_b)));
    let query = items_query(eq(Expr::column(1, 1, types::INT4), correlated));
    let planned = planner(items_catalog()).plan(&query, None).unwrap();

    assert_eq!(planned.subplans.len(), 1);
    assert!(planned.plan.init_plans.is_empty());
    let refs_subplan = planned.plan.qual.iter().any(|q| match q {
        PlanExpr::Op { args, .. } => args.contains(&PlanExpr::SubPlan { plan_id: 0 }),
        _ => false,
    });
    assert!(refs_subplan);
}

// ---------------------------------------------------------------------------
// Partial indexes
// ---------------------------------------------------------------------------

#[test]
fn test_partial_index_needs_its_predicate() {
    let not_deleted = eq(Expr::column(1, 4, types::BOOL), Expr::boolean(false));
    let point = eq(Expr::column(1, 3, types::INT4), Expr::int(5));
    let hypothetical = HypotheticalIndex {
        index_id: 900_000,
        def: HypotheticalIndexDef {
            rel_id: 3,
            columns: vec![3],
            op_classes: vec![1978],
            collations: vec![None],
            expressions: vec![],
            predicate: vec![not_deleted.clone()],
        },
        pages: 140,
        tuples: 50_000.0,
    };
    let planner = planner(items_catalog());

    let mut overlay = FixedOverlay(vec![hypothetical.clone()]);
    let without = planner
        .plan(&items_query(point.clone()), Some(&mut overlay as &mut dyn IndexOverlay))
        .unwrap();
    assert_eq!(without.plan.op, PlanOp::SeqScan { rel_id: 3 });

    // predicate written constant-first still implies the index predicate
    let flipped = eq(Expr::boolean(false), Expr::column(1, 4, types::BOOL));
    let mut overlay = FixedOverlay(vec![hypothetical]);
    let with = planner
        .plan(
            &items_query(Expr::And(vec![flipped, point])),
            Some(&mut overlay as &mut dyn IndexOverlay),
        )
        .unwrap();
    assert_eq!(with.plan.op.index_id(), Some(900_000));
    assert!(with.total_cost() < without.total_cost());
}
