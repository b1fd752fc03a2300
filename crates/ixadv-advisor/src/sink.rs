//! # Advice Sink
//!
//! Where finished advice goes. Each used candidate becomes one `AdviceRecord`,
//! handed to an `AdviceSink` after the nested scope has been rolled back, so
//! whatever a sink writes is not undone with the hypothetical indexes.
//!
//! Implementations shipped here:
//!
//! - `MemorySink` keeps records in a vector (tests, embedding).
//! - `JsonLinesSink` writes one JSON object per line to any writer.
//! - `LogSink` emits each record as a structured `info` event.

use ixadv_core::query::{AttrNumber, CollationId, OpClassId, RelId};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::info;

/// Size of one index page in bytes.
pub const PAGE_SIZE: u64 = 8192;

/// One piece of index advice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceRecord {
    pub rel_id: RelId,
    pub relation: String,
    /// Key attribute numbers; `0` marks an expression key.
    pub attnos: Vec<AttrNumber>,
    pub columns: Vec<String>,
    /// Share of the total cost saving credited to this index.
    pub benefit: f64,
    /// Estimated index size in KiB.
    pub size_kb: u64,
    pub op_classes: Vec<OpClassId>,
    pub collations: Vec<Option<CollationId>>,
    /// Expression keys as SQL text.
    pub expressions: Vec<String>,
    /// Partial-index predicate as SQL text.
    pub predicate: Option<String>,
    /// The analysed statement, without a leading `EXPLAIN`.
    pub query: String,
    pub schema: String,
    /// `create index` statement for the advised index.
    pub definition: String,
    /// Relation the advice was derived from when it targets an inheritance child.
    pub inherited_from: Option<RelId>,
}

impl AdviceRecord {
    pub fn size_kb_for_pages(pages: u64) -> u64 {
        pages * PAGE_SIZE / 1024
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("advice rejected: {0}")]
    Rejected(String),
}

/// Receives advice records.
pub trait AdviceSink {
    fn record(&mut self, advice: &AdviceRecord) -> Result<(), SinkError>;
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<AdviceRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdviceSink for MemorySink {
    fn record(&mut self, advice: &AdviceRecord) -> Result<(), SinkError> {
        self.records.push(advice.clone());
        Ok(())
    }
}

/// Writes records as newline-delimited JSON.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> AdviceSink for JsonLinesSink<W> {
    fn record(&mut self, advice: &AdviceRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, advice)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits records as log events.
#[derive(Debug, Default)]
pub struct LogSink;

impl AdviceSink for LogSink {
    fn record(&mut self, advice: &AdviceRecord) -> Result<(), SinkError> {
        info!(
            relation = %advice.relation,
            benefit = advice.benefit,
            size_kb = advice.size_kb,
            definition = %advice.definition,
            "Index advice"
        );
        Ok(())
    }
}

/// The statement text as stored with advice: a leading `EXPLAIN` keyword (any case)
/// and surrounding whitespace are removed.
pub fn statement_text(query_text: &str) -> &str {
    let trimmed = query_text.trim();
    match trimmed.get(..8) {
        Some(prefix) if prefix.eq_ignore_ascii_case("explain ") => trimmed[8..].trim_start(),
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AdviceRecord {
        AdviceRecord {
            rel_id: 5,
            relation: "orders".into(),
            attnos: vec![2],
            columns: vec!["status".into()],
            benefit: 12.5,
            size_kb: AdviceRecord::size_kb_for_pages(3),
            op_classes: vec![1978],
            collations: vec![None],
            expressions: vec![],
            predicate: Some("is_deleted = false".into()),
            query: "select * from orders where status = 1".into(),
            schema: "public".into(),
            definition: "create index on orders(status) where is_deleted = false".into(),
            inherited_from: None,
        }
    }

    #[test]
    fn test_statement_text() {
        assert_eq!(statement_text("EXPLAIN select 1"), "select 1");
        assert_eq!(statement_text("  explain   select 1 "), "select 1");
        assert_eq!(statement_text("explained"), "explained");
        assert_eq!(statement_text("select 1"), "select 1");
        assert_eq!(statement_text("explain"), "explain");
    }

    #[test]
    fn test_json_lines() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.record(&record()).unwrap();
        sink.record(&record()).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AdviceRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record());
        assert_eq!(parsed.size_kb, 24);
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.record(&record()).unwrap();
        assert_eq!(sink.records.len(), 1);
    }
}
