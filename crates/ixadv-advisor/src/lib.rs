//! # Hypothetical Index Advisor
//!
//! This crate implements the analysis pass that turns a planned statement into index
//! advice. It proposes candidate indexes from the statement's shape, shows them to
//! the Cost Oracle as hypothetical indexes, and keeps the ones the re-planned
//! statement actually reads.
//!
//! ## Pipeline
//!
//! - **`scanner`**: Walks the bound query and proposes single-column, composite and
//!   functional candidates; collects partial-index predicates.
//! - **`filter`**: Drops candidates on unsupported relations and candidates that
//!   duplicate an existing index.
//! - **`inherit`**: Copies candidates and predicates to inheritance children.
//! - **`evaluator`**: `IndexAdvisor`, which materializes, re-plans, marks and
//!   scores inside a rollback-only scope.
//! - **`marker`**: Finds the hypothetical indexes a plan reads.
//! - **`deparse`**: Renders expressions and `create index` statements.
//! - **`sink`**: Where advice records go.
//!
//! ## Example
//!
//! ```ignore
//! let advisor = IndexAdvisor::new(catalog.clone(), AdvisorConfig::default());
//! let planner = SimplePlanner::new(catalog);
//! let mut sink = MemorySink::new();
//! let advised = advisor.plan_with_advice(&query, "select b from t where a = 1", &planner, &mut sink)?;
//! ```

pub mod config;
pub mod deparse;
pub mod error;
pub mod evaluator;
pub mod filter;
pub mod inherit;
pub mod marker;
pub mod scanner;
pub mod sink;

pub use config::AdvisorConfig;
pub use error::AdvisorError;
pub use evaluator::{AdvisedPlan, AdvisorPhase, Analysis, IndexAdvisor};
pub use sink::{AdviceRecord, AdviceSink, JsonLinesSink, LogSink, MemorySink, SinkError};
