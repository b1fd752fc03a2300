//! Renders expressions and index definitions back to SQL text.
//!
//! Expressions handed to the deparser are always stored against a single relation,
//! so every column reference is resolved by attribute number on that relation.

use ixadv_core::candidate::IndexCandidate;
use ixadv_core::catalog::{AccessMethod, Catalog};
use ixadv_core::query::{Expr, RelId, UnaryOp};

pub struct Deparser<'a> {
    catalog: &'a dyn Catalog,
    rel_id: RelId,
}

impl<'a> Deparser<'a> {
    pub fn new(catalog: &'a dyn Catalog, rel_id: RelId) -> Self {
        Self { catalog, rel_id }
    }

    pub fn expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Var(v) => self
                .catalog
                .column_name(self.rel_id, v.attno)
                .unwrap_or_else(|| format!("att{}", v.attno)),
            Expr::Const(c) => c.value.to_string(),
            Expr::BinaryOp { op, left, right } => {
                format!("{} {} {}", self.operand(left), op, self.operand(right))
            }
            Expr::UnaryOp { op, operand } => match op {
                UnaryOp::Not => format!("NOT {}", self.operand(operand)),
                UnaryOp::Neg => format!("-{}", self.operand(operand)),
                UnaryOp::IsNull => format!("{} IS NULL", self.operand(operand)),
                UnaryOp::IsNotNull => format!("{} IS NOT NULL", self.operand(operand)),
            },
            Expr::Function { name, args, .. } | Expr::Aggregate { name, args } => {
                format!("{}({})", name, self.list(args, ", "))
            }
            Expr::Coerce { arg, .. } => self.expr(arg),
            Expr::And(args) => self.list(args, " AND "),
            Expr::Or(args) => format!("({})", self.list(args, " OR ")),
            Expr::SubLink(_) => "(SubLink)".to_string(),
            Expr::Case { arms, default } => {
                let mut out = String::from("CASE");
                for arm in arms {
                    out.push_str(&format!(
                        " WHEN {} THEN {}",
                        self.expr(&arm.condition),
                        self.expr(&arm.result)
                    ));
                }
                if let Some(d) = default {
                    out.push_str(&format!(" ELSE {}", self.expr(d)));
                }
                out.push_str(" END");
                out
            }
            Expr::Array(items) => format!("ARRAY[{}]", self.list(items, ", ")),
        }
    }

    /// Operands that are themselves operators or connectives get parentheses.
    fn operand(&self, expr: &Expr) -> String {
        match expr {
            Expr::BinaryOp { .. } | Expr::And(_) => format!("({})", self.expr(expr)),
            _ => self.expr(expr),
        }
    }

    fn list(&self, exprs: &[Expr], sep: &str) -> String {
        exprs
            .iter()
            .map(|e| self.expr(e))
            .collect::<Vec<_>>()
            .join(sep)
    }

    /// The implicitly AND-ed clauses of a partial-index predicate, or `None` when there
    /// are none.
    pub fn predicate(&self, clauses: &[Expr]) -> Option<String> {
        if clauses.is_empty() {
            return None;
        }
        Some(self.list(clauses, " AND "))
    }

    /// `create index on rel(keys) [where predicate]`.
    ///
    /// A key is followed by its operator class name only when that class is not the
    /// type's default B-tree class.
    pub fn index_definition(&self, cand: &IndexCandidate) -> String {
        let relname = self
            .catalog
            .relation(self.rel_id)
            .map(|r| r.name)
            .unwrap_or_else(|| self.rel_id.to_string());

        let mut exprs = cand.expressions.iter();
        let keys: Vec<String> = cand
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let mut key = if col.is_expression() {
                    match exprs.next() {
                        Some(e @ Expr::Function { .. }) => self.expr(e),
                        Some(e) => format!("({})", self.expr(e)),
                        None => col.name.clone(),
                    }
                } else {
                    col.name.clone()
                };
                if let Some(opclass) = cand.op_classes.get(i).copied() {
                    let default = self
                        .catalog
                        .default_operator_class(col.type_id, AccessMethod::BTree);
                    if default != Some(opclass) {
                        if let Some(name) = self.catalog.operator_class_name(opclass) {
                            key.push(' ');
                            key.push_str(&name);
                        }
                    }
                }
                key
            })
            .collect();

        let mut def = format!("create index on {}({})", relname, keys.join(","));
        if let Some(pred) = self.predicate(&cand.predicate) {
            def.push_str(" where ");
            def.push_str(&pred);
        }
        def
    }
}
