//! Filter expression trees and their compilation into SQL predicates.
//!
//! Compilation is best-effort by contract: malformed or disallowed clauses
//! are skipped with a diagnostic and the remaining clauses still compile,
//! so an end-user-supplied query never turns into a hard failure.

use crate::catalog::{EntityKind, FieldCatalog, FieldStorage, ValueType, Visibility};
use crate::coerce::{coerce, CoerceTarget, Coerced};

/// How the children of a filter group are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combinator {
    #[default]
    And,
    Or,
}

impl Combinator {
    fn sql(self) -> &'static str {
        match self {
            Combinator::And => " AND ",
            Combinator::Or => " OR ",
        }
    }
}

/// Leaf operators of the filter DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    EqCi,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Between,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    StartsWith,
    EndsWith,
    Contains,
}

impl FilterOp {
    /// Operators only meaningful against string-typed fields.
    fn string_only(self) -> bool {
        matches!(
            self,
            FilterOp::EqCi | FilterOp::StartsWith | FilterOp::EndsWith | FilterOp::Contains
        )
    }

    /// Operators that need an ordered value type on attribute storage,
    /// where values are text and must be cast before comparing.
    fn needs_ordering(self) -> bool {
        matches!(
            self,
            FilterOp::Lt
                | FilterOp::Lte
                | FilterOp::Gt
                | FilterOp::Gte
                | FilterOp::Between
                | FilterOp::In
                | FilterOp::NotIn
        )
    }

    fn comparator(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            _ => unreachable!("comparator() called for non-comparison operator"),
        }
    }
}

/// A filter expression: nested AND/OR groups over `(field, op, operand)`
/// conditions. Operands are untyped JSON; coercion happens at compile time.
#[derive(Debug, Clone)]
pub enum Filter {
    Group {
        combinator: Combinator,
        nodes: Vec<Filter>,
    },
    Cond {
        field: String,
        op: FilterOp,
        operand: serde_json::Value,
    },
}

impl Filter {
    pub fn and(nodes: Vec<Filter>) -> Filter {
        Filter::Group {
            combinator: Combinator::And,
            nodes,
        }
    }

    pub fn or(nodes: Vec<Filter>) -> Filter {
        Filter::Group {
            combinator: Combinator::Or,
            nodes,
        }
    }

    pub fn cond(field: impl Into<String>, op: FilterOp, operand: serde_json::Value) -> Filter {
        Filter::Cond {
            field: field.into(),
            op,
            operand,
        }
    }
}

/// Output of predicate compilation: a WHERE fragment (if any clause
/// survived), its bind parameters, and the accumulated diagnostics.
#[derive(Debug, Default)]
pub struct CompiledPredicate {
    pub sql: Option<String>,
    pub params: Vec<rusqlite::types::Value>,
    pub diagnostics: Vec<String>,
}

struct Compiler<'a> {
    kind: EntityKind,
    catalog: &'a FieldCatalog,
    params: Vec<rusqlite::types::Value>,
    diagnostics: Vec<String>,
}

/// Compile a filter tree into a SQL predicate against `kind`'s tables.
pub fn compile(kind: EntityKind, catalog: &FieldCatalog, filter: &Filter) -> CompiledPredicate {
    let mut compiler = Compiler {
        kind,
        catalog,
        params: Vec::new(),
        diagnostics: Vec::new(),
    };
    let sql = compiler.node(filter);

    let mut seen = std::collections::HashSet::new();
    compiler.diagnostics.retain(|d| seen.insert(d.clone()));

    CompiledPredicate {
        sql,
        params: compiler.params,
        diagnostics: compiler.diagnostics,
    }
}

impl Compiler<'_> {
    fn node(&mut self, filter: &Filter) -> Option<String> {
        match filter {
            Filter::Group { combinator, nodes } => {
                let parts: Vec<String> = nodes.iter().filter_map(|n| self.node(n)).collect();
                match parts.len() {
                    0 => None,
                    1 => Some(parts.into_iter().next().unwrap()),
                    _ => Some(format!("({})", parts.join(combinator.sql()))),
                }
            }
            Filter::Cond { field, op, operand } => self.cond(field, *op, operand),
        }
    }

    fn skip(&mut self, message: String) -> Option<String> {
        log::warn!("filter clause skipped: {message}");
        self.diagnostics.push(message);
        None
    }

    fn cond(
        &mut self,
        field: &str,
        op: FilterOp,
        operand: &serde_json::Value,
    ) -> Option<String> {
        let spec = match self.catalog.classify(field) {
            Some(spec) => spec.clone(),
            None => return self.skip(format!("Field '{field}' does not exist")),
        };
        if self.catalog.is_filterable(field) != Visibility::Allowed {
            return self.skip(format!("Cannot filter by field '{field}'"));
        }
        if op.string_only() && spec.value_type != ValueType::String {
            return self.skip(format!(
                "Operator requires a string-typed field: '{field}'"
            ));
        }
        if spec.storage == FieldStorage::Attribute
            && op.needs_ordering()
            && !spec.value_type.is_ordered()
        {
            return self.skip(format!(
                "Operator requires a numeric or date-typed field: '{field}'"
            ));
        }

        let target = match spec.storage {
            FieldStorage::Column => CoerceTarget::Column,
            FieldStorage::Attribute => CoerceTarget::Attribute,
        };

        match spec.storage {
            FieldStorage::Column => self.column_cond(field, op, operand, spec.value_type, target),
            FieldStorage::Attribute => {
                self.attribute_cond(field, op, operand, spec.value_type, target)
            }
        }
    }

    fn coerce_or_skip(
        &mut self,
        field: &str,
        raw: &serde_json::Value,
        value_type: ValueType,
        target: CoerceTarget,
    ) -> Result<Coerced, ()> {
        match coerce(raw, value_type, target) {
            Some(v) => Ok(v),
            None => {
                self.diagnostics
                    .push(format!("Invalid value for field '{field}'"));
                Err(())
            }
        }
    }

    /// Coerce every element of a list operand, failing the whole clause if
    /// any element refuses to convert.
    fn coerce_list(
        &mut self,
        field: &str,
        op_name: &str,
        operand: &serde_json::Value,
        value_type: ValueType,
        target: CoerceTarget,
        expect: Option<usize>,
    ) -> Result<Vec<Coerced>, ()> {
        let items = match operand.as_array() {
            Some(items) if !items.is_empty() => items,
            _ => {
                self.diagnostics.push(format!(
                    "Operator '{op_name}' expects a non-empty list for field '{field}'"
                ));
                return Err(());
            }
        };
        if let Some(n) = expect {
            if items.len() != n {
                self.diagnostics.push(format!(
                    "Operator '{op_name}' expects exactly {n} values for field '{field}'"
                ));
                return Err(());
            }
        }
        items
            .iter()
            .map(|item| self.coerce_or_skip(field, item, value_type, target))
            .collect()
    }

    fn push(&mut self, value: Coerced) {
        self.params.push(value.to_sql());
    }

    // ── Fixed columns ────────────────────────────────────────────────

    fn column_cond(
        &mut self,
        field: &str,
        op: FilterOp,
        operand: &serde_json::Value,
        value_type: ValueType,
        target: CoerceTarget,
    ) -> Option<String> {
        match op {
            FilterOp::IsNull => Some(format!("{field} IS NULL")),
            FilterOp::IsNotNull => Some(format!("{field} IS NOT NULL")),
            FilterOp::Eq | FilterOp::Ne | FilterOp::Lt | FilterOp::Lte | FilterOp::Gt
            | FilterOp::Gte => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.push(v);
                Some(format!("{field} {} ?", op.comparator()))
            }
            FilterOp::EqCi => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.push(v);
                Some(format!("lower({field}) = lower(?)"))
            }
            FilterOp::Between => {
                let bounds = self
                    .coerce_list(field, "between", operand, value_type, target, Some(2))
                    .ok()?;
                for b in bounds {
                    self.push(b);
                }
                Some(format!("{field} BETWEEN ? AND ?"))
            }
            FilterOp::In | FilterOp::NotIn => {
                let items = self
                    .coerce_list(field, "in", operand, value_type, target, None)
                    .ok()?;
                let placeholders = vec!["?"; items.len()].join(", ");
                for item in items {
                    self.push(item);
                }
                let not = if op == FilterOp::NotIn { "NOT " } else { "" };
                Some(format!("{field} {not}IN ({placeholders})"))
            }
            FilterOp::StartsWith | FilterOp::EndsWith | FilterOp::Contains => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.push(Coerced::Text(like_pattern(&v, op)));
                Some(format!("{field} LIKE ? ESCAPE '\\'"))
            }
        }
    }

    // ── Attribute rows ───────────────────────────────────────────────

    /// Attribute predicates compile to correlated EXISTS subqueries against
    /// the kind's attribute table, casting the text value per valueType.
    fn attribute_cond(
        &mut self,
        field: &str,
        op: FilterOp,
        operand: &serde_json::Value,
        value_type: ValueType,
        target: CoerceTarget,
    ) -> Option<String> {
        let table = self.kind.table();
        let attrs = self.kind.attr_table();
        let base = format!("SELECT 1 FROM {attrs} a WHERE a.record_id = {table}.id AND a.key = ?");
        let value_expr = if value_type.is_ordered() {
            "CAST(a.value AS REAL)"
        } else {
            "a.value"
        };

        // null checks bind only the key
        match op {
            FilterOp::IsNull => {
                self.params.push(rusqlite::types::Value::Text(field.into()));
                return Some(format!("NOT EXISTS ({base} AND a.value IS NOT NULL)"));
            }
            FilterOp::IsNotNull => {
                self.params.push(rusqlite::types::Value::Text(field.into()));
                return Some(format!("EXISTS ({base} AND a.value IS NOT NULL)"));
            }
            _ => {}
        }

        // coerce first so a bad operand never leaves a dangling key param
        let clause = match op {
            FilterOp::Eq | FilterOp::Ne | FilterOp::Lt | FilterOp::Lte | FilterOp::Gt
            | FilterOp::Gte => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.params.push(rusqlite::types::Value::Text(field.into()));
                self.push(v);
                format!("EXISTS ({base} AND {value_expr} {} ?)", op.comparator())
            }
            FilterOp::EqCi => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.params.push(rusqlite::types::Value::Text(field.into()));
                self.push(v);
                format!("EXISTS ({base} AND lower(a.value) = lower(?))")
            }
            FilterOp::Between => {
                let bounds = self
                    .coerce_list(field, "between", operand, value_type, target, Some(2))
                    .ok()?;
                self.params.push(rusqlite::types::Value::Text(field.into()));
                for b in bounds {
                    self.push(b);
                }
                format!("EXISTS ({base} AND {value_expr} BETWEEN ? AND ?)")
            }
            FilterOp::In | FilterOp::NotIn => {
                let items = self
                    .coerce_list(field, "in", operand, value_type, target, None)
                    .ok()?;
                let placeholders = vec!["?"; items.len()].join(", ");
                self.params.push(rusqlite::types::Value::Text(field.into()));
                for item in items {
                    self.push(item);
                }
                let prefix = if op == FilterOp::NotIn { "NOT EXISTS" } else { "EXISTS" };
                format!("{prefix} ({base} AND {value_expr} IN ({placeholders}))")
            }
            FilterOp::StartsWith | FilterOp::EndsWith | FilterOp::Contains => {
                let v = self.coerce_or_skip(field, operand, value_type, target).ok()?;
                self.params.push(rusqlite::types::Value::Text(field.into()));
                self.push(Coerced::Text(like_pattern(&v, op)));
                format!("EXISTS ({base} AND a.value LIKE ? ESCAPE '\\')")
            }
            FilterOp::IsNull | FilterOp::IsNotNull => unreachable!(),
        };
        Some(clause)
    }
}

fn like_pattern(value: &Coerced, op: FilterOp) -> String {
    let escaped = escape_like(&value.to_attr_text());
    match op {
        FilterOp::StartsWith => format!("{escaped}%"),
        FilterOp::EndsWith => format!("%{escaped}"),
        FilterOp::Contains => format!("%{escaped}%"),
        _ => escaped,
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{builtin, FieldSpec};
    use serde_json::json;

    fn post_catalog() -> FieldCatalog {
        let mut cat = builtin(EntityKind::Post);
        cat.push("rating", FieldSpec::attribute(ValueType::Number));
        cat.push("subtitle", FieldSpec::attribute(ValueType::String));
        cat.push("meta", FieldSpec::attribute(ValueType::Json));
        cat
    }

    #[test]
    fn test_simple_equality() {
        let cat = post_catalog();
        let f = Filter::cond("title", FilterOp::Eq, json!("Hello"));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(compiled.sql.as_deref(), Some("title = ?"));
        assert_eq!(compiled.params.len(), 1);
        assert!(compiled.diagnostics.is_empty());
    }

    #[test]
    fn test_nested_groups() {
        let cat = post_catalog();
        let f = Filter::and(vec![
            Filter::cond("visible", FilterOp::Eq, json!(true)),
            Filter::or(vec![
                Filter::cond("title", FilterOp::StartsWith, json!("A")),
                Filter::cond("title", FilterOp::StartsWith, json!("B")),
            ]),
        ]);
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(
            compiled.sql.as_deref(),
            Some("(visible = ? AND (title LIKE ? ESCAPE '\\' OR title LIKE ? ESCAPE '\\'))")
        );
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn test_unknown_field_skipped_with_diagnostic() {
        let cat = post_catalog();
        let f = Filter::and(vec![
            Filter::cond("badfield", FilterOp::Eq, json!(1)),
            Filter::cond("title", FilterOp::Eq, json!("x")),
        ]);
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(compiled.sql.as_deref(), Some("title = ?"));
        assert_eq!(
            compiled.diagnostics,
            vec!["Field 'badfield' does not exist".to_string()]
        );
    }

    #[test]
    fn test_json_field_always_diagnosed() {
        let cat = post_catalog();
        for op in [FilterOp::Eq, FilterOp::IsNull, FilterOp::Contains] {
            let f = Filter::cond("meta", op, json!("x"));
            let compiled = compile(EntityKind::Post, &cat, &f);
            assert!(compiled.sql.is_none());
            assert_eq!(
                compiled.diagnostics,
                vec!["Cannot filter by field 'meta'".to_string()]
            );
        }
    }

    #[test]
    fn test_string_op_on_non_string_column() {
        let cat = post_catalog();
        let f = Filter::cond("visible", FilterOp::Contains, json!("tr"));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert!(compiled.sql.is_none());
        assert_eq!(compiled.diagnostics.len(), 1);
        assert!(compiled.diagnostics[0].contains("string-typed"));
    }

    #[test]
    fn test_coercion_failure_drops_clause() {
        let cat = post_catalog();
        let f = Filter::and(vec![
            Filter::cond("published_at", FilterOp::Gt, json!("not a date")),
            Filter::cond("title", FilterOp::Eq, json!("kept")),
        ]);
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(compiled.sql.as_deref(), Some("title = ?"));
        assert_eq!(compiled.params.len(), 1);
        assert_eq!(
            compiled.diagnostics,
            vec!["Invalid value for field 'published_at'".to_string()]
        );
    }

    #[test]
    fn test_attribute_predicate_uses_exists() {
        let cat = post_catalog();
        let f = Filter::cond("rating", FilterOp::Gte, json!(4));
        let compiled = compile(EntityKind::Post, &cat, &f);
        let sql = compiled.sql.unwrap();
        assert!(sql.starts_with("EXISTS (SELECT 1 FROM post_attrs"));
        assert!(sql.contains("CAST(a.value AS REAL) >= ?"));
        // key + value
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_attribute_null_check() {
        let cat = post_catalog();
        let f = Filter::cond("rating", FilterOp::IsNull, json!(null));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert!(compiled.sql.unwrap().starts_with("NOT EXISTS"));
        assert_eq!(compiled.params.len(), 1);
    }

    #[test]
    fn test_between_requires_two_values() {
        let cat = post_catalog();
        let f = Filter::cond("rating", FilterOp::Between, json!([1, 2, 3]));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert!(compiled.sql.is_none());
        assert!(compiled.diagnostics[0].contains("exactly 2"));
    }

    #[test]
    fn test_in_set_on_column() {
        let cat = post_catalog();
        let f = Filter::cond("title", FilterOp::In, json!(["a", "b", "c"]));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(compiled.sql.as_deref(), Some("title IN (?, ?, ?)"));
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn test_comparison_on_string_attribute_diagnosed() {
        let cat = post_catalog();
        for op in [FilterOp::Gt, FilterOp::Between, FilterOp::In] {
            let f = Filter::cond("subtitle", op, json!(["m", "n"]));
            let compiled = compile(EntityKind::Post, &cat, &f);
            assert!(compiled.sql.is_none(), "{op:?} compiled");
            assert!(compiled.diagnostics[0].contains("numeric or date"));
        }
        // equality and pattern matching remain allowed on string attributes
        let f = Filter::cond("subtitle", FilterOp::Contains, json!("m"));
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert!(compiled.sql.is_some());
        assert!(compiled.diagnostics.is_empty());
    }

    #[test]
    fn test_diagnostics_deduplicated() {
        let cat = post_catalog();
        let f = Filter::and(vec![
            Filter::cond("nope", FilterOp::Eq, json!(1)),
            Filter::cond("nope", FilterOp::Eq, json!(2)),
        ]);
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert_eq!(compiled.diagnostics.len(), 1);
    }

    #[test]
    fn test_like_escaping() {
        let cat = post_catalog();
        let f = Filter::cond("title", FilterOp::Contains, json!("50%_off"));
        let compiled = compile(EntityKind::Post, &cat, &f);
        match &compiled.params[0] {
            rusqlite::types::Value::Text(p) => assert_eq!(p, "%50\\%\\_off%"),
            other => panic!("unexpected param {other:?}"),
        }
    }

    #[test]
    fn test_empty_group_compiles_to_nothing() {
        let cat = post_catalog();
        let f = Filter::and(vec![]);
        let compiled = compile(EntityKind::Post, &cat, &f);
        assert!(compiled.sql.is_none());
        assert!(compiled.diagnostics.is_empty());
    }
}
