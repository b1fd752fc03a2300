//! Errors raised by the analysis pipeline.
//!
//! Only a few of these ever leave the crate. Per-candidate kinds are absorbed by
//! filtering, and pass-wide kinds are turned into warnings on the `Analysis` result
//! once the nested scope has been rolled back.

use crate::sink::SinkError;
use ixadv_core::oracle::OracleError;
use ixadv_core::query::{AttrNumber, RelId, TypeId};

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    /// The relation is temporary, unlogged or a system catalog.
    #[error("relation {0} does not support index advice")]
    UnsupportedRelation(RelId),
    /// No operator class exists for a key column's type.
    #[error("no usable operator class for key {attno} (type {type_id}) on relation {rel_id}")]
    NoUsableOperatorClass {
        rel_id: RelId,
        attno: AttrNumber,
        type_id: TypeId,
    },
    /// The original query could not be planned.
    #[error("planning failed: {0}")]
    Planning(#[source] OracleError),
    #[error("could not materialize hypothetical indexes: {0}")]
    Materialization(#[source] OracleError),
    #[error("re-planning with hypothetical indexes failed: {0}")]
    Replan(#[source] OracleError),
    #[error("nested scope failure: {0}")]
    Scope(#[source] OracleError),
    #[error("could not persist advice: {0}")]
    AdvicePersistence(#[from] SinkError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
