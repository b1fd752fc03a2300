//! # Catalog Interface
//!
//! The catalog answers metadata questions about relations: their columns and
//! statistics, whether they are durable user tables, their inheritance children,
//! their existing indexes, and which operator class an index key of a given type
//! would use.
//!
//! ## Trait Design
//!
//! `Catalog` is used behind `Arc<dyn Catalog>` so the advisor does not care which
//! backend supplies metadata. `InMemoryCatalog` is a HashMap-based implementation
//! populated programmatically, used for development and tests and by the
//! reference planner.

use crate::query::{AttrNumber, IndexId, OpClassId, RelId, TypeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index access methods an operator class can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMethod {
    BTree,
    Hash,
}

/// A column of a relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub attno: AttrNumber,
    pub name: String,
    pub type_id: TypeId,
    /// Average stored width in bytes.
    pub avg_width: f64,
    /// Number of distinct values. Used for equality selectivity.
    pub distinct: f64,
}

impl ColumnDef {
    pub fn new(attno: AttrNumber, name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            attno,
            name: name.into(),
            type_id,
            avg_width: 4.0,
            distinct: 100.0,
        }
    }

    pub fn with_stats(mut self, avg_width: f64, distinct: f64) -> Self {
        self.avg_width = avg_width;
        self.distinct = distinct;
        self
    }
}

/// Relation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub rel_id: RelId,
    pub name: String,
    /// Write-ahead logged; unlogged and temporary relations are not durable.
    pub durable: bool,
    /// A system catalog relation.
    pub system: bool,
    pub pages: f64,
    pub tuples: f64,
    pub columns: Vec<ColumnDef>,
}

impl RelationInfo {
    pub fn new(rel_id: RelId, name: impl Into<String>, pages: f64, tuples: f64) -> Self {
        Self {
            rel_id,
            name: name.into(),
            durable: true,
            system: false,
            pages,
            tuples,
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn column(&self, attno: AttrNumber) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.attno == attno)
    }
}

/// An existing physical index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub index_id: IndexId,
    pub rel_id: RelId,
    /// Key attribute numbers in key order; `0` marks an expression key.
    pub columns: Vec<AttrNumber>,
    pub valid: bool,
    pub has_expressions: bool,
    pub has_predicate: bool,
}

impl IndexDescriptor {
    pub fn new(index_id: IndexId, rel_id: RelId, columns: Vec<AttrNumber>) -> Self {
        Self {
            index_id,
            rel_id,
            columns,
            valid: true,
            has_expressions: false,
            has_predicate: false,
        }
    }
}

/// Catalog provides relation, index and operator-class metadata.
pub trait Catalog: Send + Sync {
    fn relation(&self, rel: RelId) -> Option<RelationInfo>;
    fn child_relations(&self, rel: RelId) -> Vec<RelId>;
    fn indexes(&self, rel: RelId) -> Vec<IndexDescriptor>;
    fn default_operator_class(&self, type_id: TypeId, am: AccessMethod) -> Option<OpClassId>;
    /// Operator class supporting pattern matching on a text-like type, if any.
    fn pattern_operator_class(&self, type_id: TypeId) -> Option<OpClassId>;
    fn operator_class_name(&self, opclass: OpClassId) -> Option<String>;

    fn column_name(&self, rel: RelId, attno: AttrNumber) -> Option<String> {
        self.relation(rel)
            .and_then(|r| r.column(attno).map(|c| c.name.clone()))
    }

    fn is_durable(&self, rel: RelId) -> bool {
        self.relation(rel).map(|r| r.durable).unwrap_or(false)
    }

    fn is_system(&self, rel: RelId) -> bool {
        self.relation(rel).map(|r| r.system).unwrap_or(false)
    }

    /// The host is still initializing its own catalog; analysis must not run.
    fn bootstrap_mode(&self) -> bool {
        false
    }
}

/// In-memory catalog for testing and development.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    pub relations: HashMap<RelId, RelationInfo>,
    /// Direct inheritance children keyed by parent.
    pub children: HashMap<RelId, Vec<RelId>>,
    pub indexes: HashMap<RelId, Vec<IndexDescriptor>>,
    pub default_opclasses: HashMap<(TypeId, AccessMethod), OpClassId>,
    pub pattern_opclasses: HashMap<TypeId, OpClassId>,
    pub opclass_names: HashMap<OpClassId, String>,
    pub bootstrapping: bool,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with B-tree operator classes for the common scalar types.
    pub fn with_builtin_opclasses() -> Self {
        use crate::query::types;

        let mut catalog = Self::new();
        for (type_id, opclass, name) in [
            (types::BOOL, 424, "bool_ops"),
            (types::INT8, 3124, "int8_ops"),
            (types::INT4, 1978, "int4_ops"),
            (types::TEXT, 3126, "text_ops"),
            (types::FLOAT8, 3123, "float8_ops"),
            (types::BPCHAR, 426, "bpchar_ops"),
            (types::VARCHAR, 3126, "text_ops"),
            (types::DATE, 3122, "date_ops"),
            (types::TIMESTAMP, 3128, "timestamp_ops"),
        ] {
            catalog.add_operator_class(type_id, AccessMethod::BTree, opclass, name);
        }
        catalog.add_pattern_operator_class(types::TEXT, 10049, "text_pattern_ops");
        catalog.add_pattern_operator_class(types::VARCHAR, 10049, "text_pattern_ops");
        catalog.add_pattern_operator_class(types::BPCHAR, 10050, "bpchar_pattern_ops");
        catalog
    }

    pub fn add_relation(&mut self, info: RelationInfo) {
        self.relations.insert(info.rel_id, info);
    }

    pub fn add_child(&mut self, parent: RelId, child: RelId) {
        self.children.entry(parent).or_default().push(child);
    }

    pub fn add_index(&mut self, index: IndexDescriptor) {
        self.indexes.entry(index.rel_id).or_default().push(index);
    }

    pub fn add_operator_class(
        &mut self,
        type_id: TypeId,
        am: AccessMethod,
        opclass: OpClassId,
        name: &str,
    ) {
        self.default_opclasses.insert((type_id, am), opclass);
        self.opclass_names.insert(opclass, name.to_string());
    }

    pub fn add_pattern_operator_class(&mut self, type_id: TypeId, opclass: OpClassId, name: &str) {
        self.pattern_opclasses.insert(type_id, opclass);
        self.opclass_names.insert(opclass, name.to_string());
    }
}

impl Catalog for InMemoryCatalog {
    fn relation(&self, rel: RelId) -> Option<RelationInfo> {
        self.relations.get(&rel).cloned()
    }

    fn child_relations(&self, rel: RelId) -> Vec<RelId> {
        self.children.get(&rel).cloned().unwrap_or_default()
    }

    fn indexes(&self, rel: RelId) -> Vec<IndexDescriptor> {
        self.indexes.get(&rel).cloned().unwrap_or_default()
    }

    fn default_operator_class(&self, type_id: TypeId, am: AccessMethod) -> Option<OpClassId> {
        self.default_opclasses.get(&(type_id, am)).copied()
    }

    fn pattern_operator_class(&self, type_id: TypeId) -> Option<OpClassId> {
        self.pattern_opclasses.get(&type_id).copied()
    }

    fn operator_class_name(&self, opclass: OpClassId) -> Option<String> {
        self.opclass_names.get(&opclass).cloned()
    }

    fn bootstrap_mode(&self) -> bool {
        self.bootstrapping
    }
}
