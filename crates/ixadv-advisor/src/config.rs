//! Advisor configuration.

use crate::error::AdvisorError;
use serde::{Deserialize, Serialize};

/// Columns whose comparisons become partial-index predicates by default.
pub const DEFAULT_PARTIAL_INDEX_COLUMNS: &[&str] = &["entity_type_id", "is_deleted"];

/// Settings of one `IndexAdvisor`.
///
/// Every field has a default, so a JSON document only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Columns whose comparisons are collected as partial-index predicates instead
    /// of becoming candidates.
    pub partial_index_columns: Vec<String>,
    /// Use the pattern-matching operator class for text-like key columns, so the
    /// suggested index also serves `LIKE 'prefix%'`.
    pub text_pattern_ops: bool,
    /// Widest composite candidate to build. Never more than `INDEX_MAX_KEYS`.
    pub composite_max_cols: usize,
    /// Compute and log advice without handing it to the sink.
    pub read_only: bool,
    /// Schema label carried on every advice record.
    pub advice_schema: String,
    /// Render the hypothetical plan into the analysis result.
    pub explain: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            partial_index_columns: DEFAULT_PARTIAL_INDEX_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            text_pattern_ops: true,
            composite_max_cols: 3,
            read_only: false,
            advice_schema: "public".to_string(),
            explain: false,
        }
    }
}

impl AdvisorConfig {
    /// Parse a (partial) JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self, AdvisorError> {
        let config: AdvisorConfig = serde_json::from_str(json)
            .map_err(|e| AdvisorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the partial-index allowlist with a comma-separated column list.
    /// Blank entries are ignored.
    pub fn with_partial_columns_csv(mut self, csv: &str) -> Self {
        self.partial_index_columns = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self
    }

    pub fn validate(&self) -> Result<(), AdvisorError> {
        if self.composite_max_cols == 0 {
            return Err(AdvisorError::InvalidConfig(
                "composite_max_cols must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_partial_index_column(&self, name: &str) -> bool {
        self.partial_index_columns.iter().any(|c| c == name)
    }
}
