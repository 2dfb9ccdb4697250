//! The backend façade: owns the configuration, the per-kind field
//! catalogs, the storage layer, and the hook registry, and exposes the
//! public read/write surface.
//!
//! Writes are transactional: validation and coercion failures roll the
//! whole operation back, so a record is never half-persisted.

use crate::catalog::{builtin, EntityKind, FieldCatalog, FieldStorage, ValueType};
use crate::coerce::{coerce, CoerceTarget, TIMESTAMP_FORMAT};
use crate::config::BackendConfig;
use crate::db::ContentDb;
use crate::error::{FieldError, LoamError, Result};
use crate::filter::{Filter, FilterOp};
use crate::hooks::{EntityHooks, HookRegistry, RecordMap};
use crate::populate::{self, IconSource, NoIcons, SubsetOverrides};
use crate::query::Query;
use crate::translate::{self, TranslationRef};
use crate::validate::validate_values;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

const CONFIG_FILE: &str = "config.yaml";
const DB_FILE: &str = "content.db";

pub struct Backend {
    config: BackendConfig,
    catalogs: HashMap<EntityKind, FieldCatalog>,
    db: ContentDb,
    hooks: HookRegistry,
    icons: Box<dyn IconSource>,
}

impl Backend {
    /// Open a backend rooted at a data directory. `config.yaml` is optional;
    /// the content database is created on first open.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;

        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.exists() {
            BackendConfig::load(&config_path)?
        } else {
            BackendConfig::default()
        };

        let db = ContentDb::open(&root.join(DB_FILE))?;
        Self::build(config, db)
    }

    /// In-memory backend for testing.
    pub fn open_in_memory(config: BackendConfig) -> Result<Self> {
        Self::build(config, ContentDb::open_in_memory()?)
    }

    fn build(config: BackendConfig, db: ContentDb) -> Result<Self> {
        let mut catalogs: HashMap<EntityKind, FieldCatalog> = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, builtin(kind)))
            .collect();

        // custom fields are attribute-stored and layer over the built-ins
        for (kind_name, fields) in &config.custom_fields {
            if let Some(kind) = EntityKind::from_name(kind_name) {
                let catalog = catalogs.get_mut(&kind).expect("all kinds present");
                for (name, def) in fields {
                    catalog.push(name.clone(), def.to_spec());
                }
            }
        }

        db.initialize(&catalogs)?;

        Ok(Backend {
            config,
            catalogs,
            db,
            hooks: HookRegistry::new(),
            icons: Box::new(NoIcons),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn catalog(&self, kind: EntityKind) -> &FieldCatalog {
        &self.catalogs[&kind]
    }

    pub(crate) fn db(&self) -> &ContentDb {
        &self.db
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub(crate) fn icons(&self) -> &dyn IconSource {
        self.icons.as_ref()
    }

    pub fn register_hooks(&mut self, kind: EntityKind, hooks: Box<dyn EntityHooks>) {
        self.hooks.register(kind, hooks);
    }

    pub fn set_icon_source(&mut self, icons: Box<dyn IconSource>) {
        self.icons = icons;
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Start a query against one entity kind.
    pub fn query(&self, kind: EntityKind) -> Query<'_> {
        Query::new(self, kind)
    }

    /// Fetch one record by id, ignoring language scoping.
    pub fn find(&self, kind: EntityKind, id: i64) -> Result<Option<Value>> {
        let mut q = self.query(kind);
        q.language("*");
        q.filter(&Filter::cond("id", FilterOp::Eq, json!(id)));
        q.first()
    }

    /// Fetch the first record matching a single equality condition, within
    /// the default language scope.
    pub fn find_by(&self, kind: EntityKind, field: &str, value: Value) -> Result<Option<Value>> {
        let mut q = self.query(kind);
        q.filter(&Filter::cond(field, FilterOp::Eq, value));
        q.first()
    }

    /// Fetch a subset of one record's fields by id, as a plain map. Used by
    /// population, which pulls targets regardless of language.
    pub(crate) fn fetch_fields(
        &self,
        kind: EntityKind,
        id: i64,
        fields: &[&str],
    ) -> Result<Option<RecordMap>> {
        let mut q = self.query(kind);
        q.language("*");
        q.select(fields);
        q.filter(&Filter::cond("id", FilterOp::Eq, json!(id)));
        Ok(q.first()?.and_then(|v| v.as_object().cloned()))
    }

    /// Resolve entity references in a record in place, starting a fresh
    /// population pass with the default per-kind field subsets.
    pub fn populate(&self, kind: EntityKind, record: &mut RecordMap) -> Result<()> {
        self.populate_with(kind, record, &SubsetOverrides::new())
    }

    /// Like [`Backend::populate`], with caller-chosen field subsets for
    /// some or all target kinds.
    pub fn populate_with(
        &self,
        kind: EntityKind,
        record: &mut RecordMap,
        subsets: &SubsetOverrides,
    ) -> Result<()> {
        let id = record.get("id").and_then(Value::as_i64).unwrap_or_default();
        let mut skip = HashSet::new();
        populate::populate_record(self, kind, id, record, subsets, &mut skip)
    }

    /// Per-language sibling map for one record.
    pub fn resolve_translations(
        &self,
        kind: EntityKind,
        id: i64,
        public_only: bool,
    ) -> Result<BTreeMap<String, Option<TranslationRef>>> {
        translate::resolve_translations(self, kind, id, public_only)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Create a record and return its assigned id. Translatable kinds get a
    /// fresh translation group and the default language unless one is given.
    pub fn create(&self, kind: EntityKind, mut values: RecordMap) -> Result<i64> {
        self.check_valid(kind, &values)?;
        self.hooks.on_create(kind, &mut values);
        self.derive_slug(kind, &mut values);
        self.insert_record(kind, values, None)
    }

    /// Create a sibling of an existing record in another language, joining
    /// its translation group.
    pub fn create_translation(
        &self,
        kind: EntityKind,
        source_id: i64,
        language: &str,
        mut values: RecordMap,
    ) -> Result<i64> {
        if !kind.is_translatable() {
            return Err(LoamError::Other(format!(
                "Entity kind '{kind}' is not translatable"
            )));
        }

        let rows = self.db.select(
            &format!("SELECT group_id FROM {} WHERE id = ?", kind.table()),
            &[rusqlite::types::Value::Integer(source_id)],
        )?;
        let group_id = rows
            .first()
            .ok_or(LoamError::NotFound { kind, id: source_id })?
            .get("group_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                LoamError::Other(format!(
                    "Record {kind}/{source_id} has no translation group"
                ))
            })?;

        let siblings = self.db.select_scalar(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE group_id = ? AND language = ?",
                kind.table()
            ),
            &[
                rusqlite::types::Value::Integer(group_id),
                rusqlite::types::Value::Text(language.to_string()),
            ],
        )?;
        if siblings > 0 {
            return Err(LoamError::Validation {
                errors: vec![FieldError::new(
                    "language",
                    format!("Translation already exists for language '{language}'"),
                )],
            });
        }

        values.remove("language");
        self.check_valid(kind, &values)?;
        self.hooks.on_create(kind, &mut values);
        self.derive_slug(kind, &mut values);
        self.insert_record(kind, values, Some((group_id, language.to_string())))
    }

    /// Apply a partial update. Only the supplied fields change;
    /// `modified_at` is stamped when the kind tracks it.
    pub fn update(&self, kind: EntityKind, id: i64, mut values: RecordMap) -> Result<()> {
        if !self.db.row_exists(kind, id)? {
            return Err(LoamError::NotFound { kind, id });
        }
        self.check_valid(kind, &values)?;
        self.hooks.on_update(kind, id, &mut values);
        self.check_language_change(kind, id, &values)?;

        let catalog = self.catalog(kind);
        let (mut columns, attrs) = split_values(catalog, &values)?;
        if has_column(catalog, "modified_at") {
            columns.push(("modified_at".into(), rusqlite::types::Value::Text(now())));
        }

        self.db.begin_transaction()?;
        let result = (|| {
            self.db.update_row(kind, id, &columns)?;
            for (key, value) in &attrs {
                self.db.set_attr(kind, id, key, value.as_deref())?;
            }
            Ok(())
        })();
        self.finish_transaction(result)
    }

    /// Delete a record and its attribute rows. Deleting the last member of a
    /// translation group deletes the group as well.
    pub fn delete(&self, kind: EntityKind, id: i64) -> Result<()> {
        let group_id = if kind.is_translatable() {
            let rows = self.db.select(
                &format!("SELECT group_id FROM {} WHERE id = ?", kind.table()),
                &[rusqlite::types::Value::Integer(id)],
            )?;
            let row = rows.first().ok_or(LoamError::NotFound { kind, id })?;
            row.get("group_id").and_then(Value::as_i64)
        } else {
            if !self.db.row_exists(kind, id)? {
                return Err(LoamError::NotFound { kind, id });
            }
            None
        };

        self.hooks.on_delete(kind, id);

        self.db.begin_transaction()?;
        let result = (|| {
            self.db.delete_attrs(kind, id)?;
            self.db.delete_row(kind, id)?;
            if let Some(group_id) = group_id {
                if self.db.count_group_members(kind, group_id)? == 0 {
                    self.db.delete_translation_group(group_id)?;
                }
            }
            Ok(())
        })();
        self.finish_transaction(result)
    }

    // ── Write-path internals ─────────────────────────────────────────

    fn check_valid(&self, kind: EntityKind, values: &RecordMap) -> Result<()> {
        let errors = validate_values(self.catalog(kind), values);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LoamError::Validation { errors })
        }
    }

    /// A language change on a translatable record must not land on a
    /// language already held by a sibling in its translation group.
    fn check_language_change(&self, kind: EntityKind, id: i64, values: &RecordMap) -> Result<()> {
        if !kind.is_translatable() {
            return Ok(());
        }
        let Some(new_language) = values.get("language").and_then(Value::as_str) else {
            return Ok(());
        };

        let rows = self.db.select(
            &format!("SELECT group_id, language FROM {} WHERE id = ?", kind.table()),
            &[rusqlite::types::Value::Integer(id)],
        )?;
        let row = rows.first().ok_or(LoamError::NotFound { kind, id })?;
        if row.get("language").and_then(Value::as_str) == Some(new_language) {
            return Ok(());
        }
        let Some(group_id) = row.get("group_id").and_then(Value::as_i64) else {
            return Ok(());
        };

        let taken = self.db.select_scalar(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE group_id = ? AND language = ? AND id <> ?",
                kind.table()
            ),
            &[
                rusqlite::types::Value::Integer(group_id),
                rusqlite::types::Value::Text(new_language.to_string()),
                rusqlite::types::Value::Integer(id),
            ],
        )?;
        if taken > 0 {
            return Err(LoamError::Validation {
                errors: vec![FieldError::new(
                    "language",
                    format!("Translation already exists for language '{new_language}'"),
                )],
            });
        }
        Ok(())
    }

    /// Derive a slug from the title when the kind has a slug column and
    /// none was supplied.
    fn derive_slug(&self, kind: EntityKind, values: &mut RecordMap) {
        let catalog = self.catalog(kind);
        if !has_column(catalog, "slug") || values.contains_key("slug") {
            return;
        }
        if let Some(title) = values.get("title").and_then(Value::as_str) {
            values.insert("slug".into(), Value::String(slug::slugify(title)));
        }
    }

    fn insert_record(
        &self,
        kind: EntityKind,
        values: RecordMap,
        group: Option<(i64, String)>,
    ) -> Result<i64> {
        let catalog = self.catalog(kind);
        let (mut columns, attrs) = split_values(catalog, &values)?;

        for stamp in ["created_at", "modified_at"] {
            if has_column(catalog, stamp) {
                columns.push((stamp.into(), rusqlite::types::Value::Text(now())));
            }
        }

        self.db.begin_transaction()?;
        let result = (|| {
            if kind.is_translatable() {
                let (group_id, language) = match group {
                    Some((group_id, language)) => (group_id, language),
                    None => {
                        let language = values
                            .get("language")
                            .and_then(Value::as_str)
                            .unwrap_or(&self.config.default_language)
                            .to_string();
                        (self.db.create_translation_group()?, language)
                    }
                };
                columns.retain(|(name, _)| name != "language");
                columns.push(("group_id".into(), rusqlite::types::Value::Integer(group_id)));
                columns.push(("language".into(), rusqlite::types::Value::Text(language)));
            }

            let id = self.db.insert_row(kind, &columns)?;
            for (key, value) in &attrs {
                self.db.set_attr(kind, id, key, value.as_deref())?;
            }
            Ok(id)
        })();
        self.finish_transaction(result)
    }

    fn finish_transaction<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.db.commit_transaction()?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.db.rollback_transaction();
                Err(err)
            }
        }
    }
}

fn has_column(catalog: &FieldCatalog, name: &str) -> bool {
    catalog
        .classify(name)
        .map(|s| s.storage == FieldStorage::Column)
        .unwrap_or(false)
}

fn now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

type ColumnValues = Vec<(String, rusqlite::types::Value)>;
type AttrValues = Vec<(String, Option<String>)>;

/// Split validated input values into column binds and attribute-row texts,
/// coercing each to its declared type. A value the coercer rejects fails
/// the write with a field error.
fn split_values(catalog: &FieldCatalog, values: &RecordMap) -> Result<(ColumnValues, AttrValues)> {
    let mut columns = Vec::new();
    let mut attrs = Vec::new();

    for (name, value) in values {
        let Some(spec) = catalog.classify(name) else {
            continue;
        };
        match spec.storage {
            FieldStorage::Column => {
                let bound = if value.is_null() {
                    rusqlite::types::Value::Null
                } else if spec.value_type == ValueType::Json {
                    rusqlite::types::Value::Text(serde_json::to_string(value)?)
                } else {
                    coerce(value, spec.value_type, CoerceTarget::Column)
                        .map(|c| c.to_sql())
                        .ok_or_else(|| invalid_value(name))?
                };
                columns.push((name.clone(), bound));
            }
            FieldStorage::Attribute => {
                let text = if value.is_null() {
                    None
                } else if spec.value_type == ValueType::Json {
                    Some(serde_json::to_string(value)?)
                } else {
                    Some(
                        coerce(value, spec.value_type, CoerceTarget::Attribute)
                            .map(|c| c.to_attr_text())
                            .ok_or_else(|| invalid_value(name))?,
                    )
                };
                attrs.push((name.clone(), text));
            }
        }
    }

    Ok((columns, attrs))
}

fn invalid_value(field: &str) -> LoamError {
    LoamError::Validation {
        errors: vec![FieldError::new(field, "Invalid value")],
    }
}
