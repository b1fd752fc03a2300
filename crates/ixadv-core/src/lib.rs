//! # ixadv-core: Hypothetical Index Advisor Core
//!
//! This crate holds the data model the index advisor works on and the contracts of
//! the collaborators it depends on. The analysis pipeline itself lives in
//! `ixadv-advisor`.
//!
//! ## Module Overview
//!
//! - **`query`**: The catalog-bound query tree (range tables, expressions, target
//!   lists, sort/group clauses) and the `RangeTableStack` used to resolve columns.
//! - **`plan`**: Physical plan tree returned by the Cost Oracle.
//! - **`catalog`**: Catalog trait for relation, index and operator-class metadata.
//! - **`stats`**: Selectivity heuristics and index size estimation.
//! - **`oracle`**: Cost Oracle, Transactional Scope and index overlay contracts.
//! - **`planner`**: `SimplePlanner`, an in-memory reference Cost Oracle.
//! - **`candidate`**: Index candidates and partial-index relation clauses.
//! - **`algebra`**: Sorted merge and composite construction over candidate lists.

pub mod algebra;
pub mod candidate;
pub mod catalog;
pub mod oracle;
pub mod plan;
pub mod planner;
pub mod query;
pub mod stats;
