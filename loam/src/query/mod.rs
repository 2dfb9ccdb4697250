//! The fluent query builder: accumulates select/filter/sort/group/paginate
//! state for one entity kind, prepares itself exactly once, and executes
//! read operations against the storage layer.
//!
//! Malformed clauses never abort a query; they accumulate as diagnostics
//! and the valid remainder still runs.

use crate::catalog::{EntityKind, FieldStorage, ValueType, Visibility};
use crate::db::quote_ident;
use crate::error::Result;
use crate::filter::{self, Filter};
use crate::serialize;
use crate::store::Backend;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// One page of results plus its pagination metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub data: Vec<serde_json::Value>,
    pub meta: PageMeta,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub current_page: u64,
    pub first_page: u64,
    pub last_page: u64,
    pub per_page: u64,
    pub total: u64,
}

/// Request-scoped query accumulator. Not shared across threads; built,
/// prepared once, then executed any number of times.
pub struct Query<'a> {
    backend: &'a Backend,
    kind: EntityKind,
    selected: Vec<String>,
    where_sql: Vec<String>,
    where_params: Vec<rusqlite::types::Value>,
    order_sql: Vec<String>,
    group_sql: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    language: Option<String>,
    populate: bool,
    diagnostics: Vec<String>,
    prepared: bool,
}

impl<'a> Query<'a> {
    pub(crate) fn new(backend: &'a Backend, kind: EntityKind) -> Self {
        Query {
            backend,
            kind,
            selected: Vec::new(),
            where_sql: Vec::new(),
            where_params: Vec::new(),
            order_sql: Vec::new(),
            group_sql: Vec::new(),
            limit: None,
            offset: None,
            language: None,
            populate: false,
            diagnostics: Vec::new(),
            prepared: false,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Select fields by name. `"*"` expands to every catalog field.
    /// Unknown or non-selectable names are diagnostics, not errors.
    pub fn select<S: AsRef<str>>(&mut self, fields: &[S]) -> &mut Self {
        let catalog = self.backend.catalog(self.kind);
        for field in fields {
            let field = field.as_ref();
            if field == "*" {
                for name in catalog.field_names() {
                    if catalog.is_selectable(name) == Visibility::Allowed
                        && !self.selected.iter().any(|s| s == name)
                    {
                        self.selected.push(name.to_string());
                    }
                }
                continue;
            }
            match catalog.is_selectable(field) {
                Visibility::Allowed => {
                    if !self.selected.iter().any(|s| s == field) {
                        self.selected.push(field.to_string());
                    }
                }
                Visibility::Denied => {
                    self.diagnose(format!("Cannot select field '{field}'"));
                }
                Visibility::Unknown => {
                    self.diagnose(format!("Field '{field}' does not exist"));
                }
            }
        }
        self
    }

    /// Apply a filter tree; compiles it immediately, accumulating any
    /// diagnostics from skipped clauses.
    pub fn filter(&mut self, tree: &Filter) -> &mut Self {
        let catalog = self.backend.catalog(self.kind);
        let compiled = filter::compile(self.kind, catalog, tree);
        if let Some(sql) = compiled.sql {
            self.where_sql.push(sql);
            self.where_params.extend(compiled.params);
        }
        for d in compiled.diagnostics {
            self.diagnose(d);
        }
        self
    }

    /// Order by a field. String columns sort case-insensitively; nulls sort
    /// last regardless of direction; json fields are rejected.
    pub fn order_by(&mut self, field: &str, dir: SortDir) -> &mut Self {
        let catalog = self.backend.catalog(self.kind);
        let spec = match catalog.classify(field) {
            Some(spec) => spec.clone(),
            None => {
                self.diagnose(format!("Field '{field}' does not exist"));
                return self;
            }
        };
        if catalog.is_sortable(field) != Visibility::Allowed {
            self.diagnose(format!("Cannot sort by field '{field}'"));
            return self;
        }

        let fragment = match spec.storage {
            FieldStorage::Column => {
                let collate = if spec.value_type == ValueType::String {
                    " COLLATE NOCASE"
                } else {
                    ""
                };
                format!("({field} IS NULL), {field}{collate} {}", dir.sql())
            }
            FieldStorage::Attribute => {
                // field names come from the catalog, safe to inline
                let sub = format!(
                    "(SELECT a.value FROM {} a WHERE a.record_id = {}.id AND a.key = '{field}')",
                    self.kind.attr_table(),
                    self.kind.table()
                );
                let expr = if spec.value_type.is_ordered() {
                    format!("CAST({sub} AS REAL)")
                } else {
                    format!("{sub} COLLATE NOCASE")
                };
                format!("({sub} IS NULL), {expr} {}", dir.sql())
            }
        };
        self.order_sql.push(fragment);
        self
    }

    /// Group by fixed, non-json columns only.
    pub fn group_by<S: AsRef<str>>(&mut self, fields: &[S]) -> &mut Self {
        let catalog = self.backend.catalog(self.kind);
        for field in fields {
            let field = field.as_ref();
            match catalog.classify(field) {
                None => self.diagnose(format!("Field '{field}' does not exist")),
                Some(spec)
                    if spec.storage != FieldStorage::Column
                        || spec.value_type == ValueType::Json =>
                {
                    self.diagnose(format!("Cannot group by field '{field}'"));
                }
                Some(_) => self.group_sql.push(field.to_string()),
            }
        }
        self
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(&mut self, n: u64) -> &mut Self {
        self.offset = Some(n);
        self
    }

    pub fn clear_limit(&mut self) -> &mut Self {
        self.limit = None;
        self
    }

    pub fn clear_offset(&mut self) -> &mut Self {
        self.offset = None;
        self
    }

    /// Request a specific language scope. `"*"` disables language scoping
    /// and returns every variant.
    pub fn language(&mut self, lang: &str) -> &mut Self {
        self.language = Some(lang.to_string());
        self
    }

    /// Resolve entity references inside returned records.
    pub fn populated(&mut self, yes: bool) -> &mut Self {
        self.populate = yes;
        self
    }

    /// Accumulated non-fatal diagnostics, inspectable before or after
    /// execution.
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    fn diagnose(&mut self, message: String) {
        if !self.diagnostics.contains(&message) {
            log::warn!("query diagnostic ({}): {message}", self.kind);
            self.diagnostics.push(message);
        }
    }

    // ── Preparation & execution ──────────────────────────────────────

    /// Inject the base predicate (language scoping) exactly once. Safe to
    /// call repeatedly; the guard flag makes it idempotent.
    pub fn prepare(&mut self) -> &mut Self {
        if self.prepared {
            return self;
        }
        self.prepared = true;

        if self.kind.is_translatable() {
            let lang = self
                .language
                .clone()
                .unwrap_or_else(|| self.backend.config().default_language.clone());
            if lang != "*" {
                self.where_sql.push("language = ?".to_string());
                self.where_params.push(rusqlite::types::Value::Text(lang));
            }
        }
        self
    }

    fn build_sql(&self, count: bool) -> String {
        let table = self.kind.table();

        let mut predicate = String::new();
        if !self.where_sql.is_empty() {
            predicate.push_str(" WHERE ");
            predicate.push_str(&self.where_sql.join(" AND "));
        }
        let group = if self.group_sql.is_empty() {
            String::new()
        } else {
            let names: Vec<String> = self.group_sql.iter().map(|g| quote_ident(g)).collect();
            format!(" GROUP BY {}", names.join(", "))
        };

        if count {
            // with grouping, all() returns one row per group, so count those
            return if group.is_empty() {
                format!("SELECT COUNT(*) FROM {table}{predicate}")
            } else {
                format!("SELECT COUNT(*) FROM (SELECT 1 FROM {table}{predicate}{group})")
            };
        }

        let catalog = self.backend.catalog(self.kind);
        let mut columns = vec![quote_ident("id")];
        let wanted: Vec<&str> = if self.selected.is_empty() {
            catalog.column_names()
        } else {
            self.selected.iter().map(String::as_str).collect()
        };
        for name in wanted {
            if name == "id" {
                continue;
            }
            if let Some(spec) = catalog.classify(name) {
                if spec.storage == FieldStorage::Column {
                    columns.push(quote_ident(name));
                }
            }
        }

        let mut sql = format!("SELECT {} FROM {table}{predicate}{group}", columns.join(", "));
        if !self.order_sql.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_sql.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Count matching rows: the current predicate with sorting and paging
    /// stripped.
    pub fn count(&mut self) -> Result<u64> {
        self.prepare();
        let sql = self.build_sql(true);
        let n = self.backend.db().select_scalar(&sql, &self.where_params)?;
        Ok(n.max(0) as u64)
    }

    /// Execute and serialize every matching row.
    pub fn all(&mut self) -> Result<Vec<serde_json::Value>> {
        self.prepare();
        let sql = self.build_sql(false);
        let rows = self.backend.db().select(&sql, &self.where_params)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(serialize::serialize_row(
                self.backend,
                self.kind,
                row,
                &self.selected,
                self.populate,
            )?);
        }
        Ok(records)
    }

    /// Execute and return the first matching row, if any.
    pub fn first(&mut self) -> Result<Option<serde_json::Value>> {
        let saved = self.limit;
        self.limit = Some(1);
        let mut results = self.all()?;
        self.limit = saved;
        Ok(if results.is_empty() {
            None
        } else {
            Some(results.remove(0))
        })
    }

    /// Execute with a pagination window. `page` clamps to at least 1,
    /// `per_page` to `1..=` the kind's configured ceiling.
    pub fn paginate(&mut self, page: u64, per_page: u64) -> Result<Page> {
        let ceiling = self.backend.config().per_page_limit(self.kind);
        let per_page = per_page.clamp(1, ceiling);
        let page = page.max(1);

        let total = self.count()?;
        let last_page = if total == 0 {
            1
        } else {
            total.div_ceil(per_page)
        };

        self.limit = Some(per_page);
        self.offset = Some((page - 1) * per_page);
        let data = self.all()?;

        Ok(Page {
            data,
            meta: PageMeta {
                current_page: page,
                first_page: 1,
                last_page,
                per_page,
                total,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOp;
    use crate::store::Backend;
    use serde_json::json;

    fn backend() -> Backend {
        Backend::open_in_memory(Default::default()).unwrap()
    }

    fn insert_post(backend: &Backend, title: &str, visible: bool) -> i64 {
        backend
            .create(
                EntityKind::Post,
                json!({ "title": title, "visible": visible })
                    .as_object()
                    .unwrap()
                    .clone(),
            )
            .unwrap()
    }

    #[test]
    fn test_select_star_and_bad_field() {
        let backend = backend();
        insert_post(&backend, "One", true);

        let mut q = Query::new(&backend, EntityKind::Post);
        q.select(&["title", "badfield"]);
        let rows = q.all().unwrap();

        assert_eq!(
            q.diagnostics(),
            &["Field 'badfield' does not exist".to_string()]
        );
        assert_eq!(rows.len(), 1);
        // title and id survive
        assert_eq!(rows[0]["title"], json!("One"));
        assert!(rows[0]["id"].is_number());
        assert!(rows[0].get("visible").is_none());
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let backend = backend();
        insert_post(&backend, "One", true);

        let mut q = Query::new(&backend, EntityKind::Post);
        q.prepare();
        q.prepare();
        // language predicate injected exactly once
        assert_eq!(
            q.where_sql
                .iter()
                .filter(|w| w.contains("language"))
                .count(),
            1
        );
        assert_eq!(q.all().unwrap().len(), 1);
    }

    #[test]
    fn test_language_wildcard_disables_scoping() {
        let backend = backend();
        let id = insert_post(&backend, "One", true);
        backend
            .create_translation(EntityKind::Post, id, "de", Default::default())
            .unwrap();

        let mut scoped = Query::new(&backend, EntityKind::Post);
        assert_eq!(scoped.all().unwrap().len(), 1);

        let mut all = Query::new(&backend, EntityKind::Post);
        all.language("*");
        assert_eq!(all.all().unwrap().len(), 2);
    }

    #[test]
    fn test_order_by_string_case_insensitive_nulls_last() {
        let backend = backend();
        insert_post(&backend, "banana", true);
        insert_post(&backend, "Apple", true);
        backend
            .create(
                EntityKind::Post,
                json!({ "visible": true }).as_object().unwrap().clone(),
            )
            .unwrap();

        let mut q = Query::new(&backend, EntityKind::Post);
        q.order_by("title", SortDir::Asc);
        let rows = q.all().unwrap();
        assert_eq!(rows[0]["title"], json!("Apple"));
        assert_eq!(rows[1]["title"], json!("banana"));
        assert_eq!(rows[2]["title"], json!(null));
    }

    #[test]
    fn test_order_by_json_rejected() {
        let backend = backend();
        let mut q = Query::new(&backend, EntityKind::Post);
        q.order_by("blocks", SortDir::Asc);
        assert_eq!(q.diagnostics(), &["Cannot sort by field 'blocks'".to_string()]);
    }

    #[test]
    fn test_count_ignores_paging() {
        let backend = backend();
        for i in 0..5 {
            insert_post(&backend, &format!("p{i}"), true);
        }
        let mut q = Query::new(&backend, EntityKind::Post);
        q.limit(2);
        assert_eq!(q.count().unwrap(), 5);
        assert_eq!(q.all().unwrap().len(), 2);
    }

    #[test]
    fn test_paginate_clamps_and_meta() {
        let backend = backend();
        for i in 0..7 {
            insert_post(&backend, &format!("p{i}"), true);
        }

        let mut q = Query::new(&backend, EntityKind::Post);
        // page 0 clamps to 1, per_page 0 clamps to 1
        let page = q.paginate(0, 0).unwrap();
        assert_eq!(page.meta.current_page, 1);
        assert_eq!(page.meta.per_page, 1);
        assert_eq!(page.meta.total, 7);
        assert_eq!(page.meta.last_page, 7);

        // per_page above the ceiling clamps to the ceiling
        let mut q = Query::new(&backend, EntityKind::Post);
        let page = q.paginate(1, 10_000).unwrap();
        assert_eq!(
            page.meta.per_page,
            backend.config().per_page_limit(EntityKind::Post)
        );
    }

    #[test]
    fn test_paginate_empty_has_last_page_one() {
        let backend = backend();
        let mut q = Query::new(&backend, EntityKind::Post);
        let page = q.paginate(1, 10).unwrap();
        assert_eq!(page.meta.total, 0);
        assert_eq!(page.meta.last_page, 1);
        assert!(page.data.is_empty());
    }

    #[test]
    fn test_filter_with_only_diagnostics_still_executes() {
        let backend = backend();
        insert_post(&backend, "kept", true);

        let mut q = Query::new(&backend, EntityKind::Post);
        q.filter(&Filter::cond("nope", FilterOp::Eq, json!(1)));
        let rows = q.all().unwrap();
        // degenerates to an unfiltered query
        assert_eq!(rows.len(), 1);
        assert_eq!(q.diagnostics().len(), 1);
    }

    #[test]
    fn test_startswith_filter_with_ordered_pagination() {
        let backend = backend();
        for i in 0..25 {
            backend
                .create(
                    EntityKind::Document,
                    json!({
                        "title": format!("Article {i:02}"),
                        "path": format!("/articles/{i:02}"),
                        "visible": true
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                )
                .unwrap();
        }
        for i in 0..5 {
            backend
                .create(
                    EntityKind::Document,
                    json!({
                        "title": format!("Page {i}"),
                        "path": format!("/pages/{i}"),
                        "visible": true
                    })
                    .as_object()
                    .unwrap()
                    .clone(),
                )
                .unwrap();
        }

        let mut q = Query::new(&backend, EntityKind::Document);
        q.filter(&Filter::cond(
            "path",
            FilterOp::StartsWith,
            json!("/articles/"),
        ));
        q.order_by("created_at", SortDir::Desc);
        let page = q.paginate(1, 10).unwrap();

        assert_eq!(page.data.len(), 10);
        assert_eq!(page.meta.total, 25);
        assert_eq!(page.meta.last_page, 3);
    }

    #[test]
    fn test_count_with_grouping_counts_groups() {
        let backend = backend();
        insert_post(&backend, "a", true);
        insert_post(&backend, "b", true);
        insert_post(&backend, "c", false);

        let mut q = Query::new(&backend, EntityKind::Post);
        q.group_by(&["visible"]);
        assert_eq!(q.count().unwrap(), 2);
        assert_eq!(q.all().unwrap().len(), 2);

        // grouping over an empty table counts zero, not an error
        let empty = Backend::open_in_memory(Default::default()).unwrap();
        let mut q = Query::new(&empty, EntityKind::Post);
        q.group_by(&["visible"]);
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn test_group_by_only_columns() {
        let backend = backend();
        let mut q = Query::new(&backend, EntityKind::Post);
        q.group_by(&["visible", "blocks"]);
        assert_eq!(q.diagnostics(), &["Cannot group by field 'blocks'".to_string()]);
        assert_eq!(q.group_sql, vec!["visible".to_string()]);
    }
}
