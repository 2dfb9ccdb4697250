//! Per-kind field catalogs: what each field is, where it lives, and what
//! callers are allowed to do with it.

use serde::{Deserialize, Serialize};

/// The fixed set of entity kinds managed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Post,
    Preset,
    File,
    Role,
    Account,
    SettingsGroup,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Document,
        EntityKind::Post,
        EntityKind::Preset,
        EntityKind::File,
        EntityKind::Role,
        EntityKind::Account,
        EntityKind::SettingsGroup,
    ];

    /// Canonical lowercase name, used in config files and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Post => "post",
            EntityKind::Preset => "preset",
            EntityKind::File => "file",
            EntityKind::Role => "role",
            EntityKind::Account => "account",
            EntityKind::SettingsGroup => "settings_group",
        }
    }

    pub fn from_name(name: &str) -> Option<EntityKind> {
        EntityKind::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Name of the primary row table for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Document => "documents",
            EntityKind::Post => "posts",
            EntityKind::Preset => "presets",
            EntityKind::File => "files",
            EntityKind::Role => "roles",
            EntityKind::Account => "accounts",
            EntityKind::SettingsGroup => "settings_groups",
        }
    }

    /// Name of the attribute (custom field) side table for this kind.
    pub fn attr_table(&self) -> &'static str {
        match self {
            EntityKind::Document => "document_attrs",
            EntityKind::Post => "post_attrs",
            EntityKind::Preset => "preset_attrs",
            EntityKind::File => "file_attrs",
            EntityKind::Role => "role_attrs",
            EntityKind::Account => "account_attrs",
            EntityKind::SettingsGroup => "settings_group_attrs",
        }
    }

    /// Kinds that carry per-language variants grouped by `group_id`.
    pub fn is_translatable(&self) -> bool {
        matches!(
            self,
            EntityKind::Document | EntityKind::Post | EntityKind::Preset
        )
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed set of field value types. The predicate compiler and value
/// coercion match exhaustively on this, so adding a variant is a compile
/// error until every call site handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    DateTime,
    Date,
    Time,
    Json,
}

impl ValueType {
    pub fn is_temporal(&self) -> bool {
        matches!(self, ValueType::DateTime | ValueType::Date | ValueType::Time)
    }

    /// Types with a meaningful ordering for range/comparison operators
    /// against attribute storage.
    pub fn is_ordered(&self) -> bool {
        matches!(self, ValueType::Number) || self.is_temporal()
    }
}

/// Where a field's value physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldStorage {
    /// A column on the kind's primary row table.
    Column,
    /// A `(record_id, key, value)` row in the kind's attribute table.
    Attribute,
}

/// Declaration of a single field of an entity kind.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub value_type: ValueType,
    pub storage: FieldStorage,
    pub selectable: bool,
    pub sortable: bool,
    pub filterable: bool,
    pub read_only: bool,
    /// Target kind when this field holds a numeric reference to another entity.
    pub reference: Option<EntityKind>,
}

impl FieldSpec {
    pub fn column(value_type: ValueType) -> Self {
        FieldSpec {
            value_type,
            storage: FieldStorage::Column,
            selectable: true,
            sortable: true,
            filterable: true,
            read_only: false,
            reference: None,
        }
    }

    pub fn attribute(value_type: ValueType) -> Self {
        FieldSpec {
            storage: FieldStorage::Attribute,
            ..FieldSpec::column(value_type)
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn references(mut self, kind: EntityKind) -> Self {
        self.reference = Some(kind);
        self
    }
}

/// Tri-state answer to "may the caller select/sort/filter on this field",
/// distinguishing "forbidden" from "no such field".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Allowed,
    Denied,
    Unknown,
}

/// Ordered `fieldName -> FieldSpec` mapping for one entity kind.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    fields: Vec<(String, FieldSpec)>,
}

impl FieldCatalog {
    pub fn new() -> Self {
        FieldCatalog { fields: Vec::new() }
    }

    /// Add a field. Re-declaring a name replaces the earlier spec in place.
    pub fn push(&mut self, name: impl Into<String>, spec: FieldSpec) {
        let name = name.into();
        if let Some(slot) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = spec;
        } else {
            self.fields.push((name, spec));
        }
    }

    pub fn classify(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(n, s)| (n.as_str(), s))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// Names of fields stored as fixed columns, in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, s)| s.storage == FieldStorage::Column)
            .map(|(n, _)| n)
            .collect()
    }

    pub fn is_selectable(&self, name: &str) -> Visibility {
        self.project(name, |s| s.selectable)
    }

    pub fn is_sortable(&self, name: &str) -> Visibility {
        // json values have no usable ordering, whatever the declared flag says
        self.project(name, |s| s.sortable && s.value_type != ValueType::Json)
    }

    pub fn is_filterable(&self, name: &str) -> Visibility {
        self.project(name, |s| s.filterable && s.value_type != ValueType::Json)
    }

    fn project(&self, name: &str, allowed: impl Fn(&FieldSpec) -> bool) -> Visibility {
        match self.classify(name) {
            None => Visibility::Unknown,
            Some(spec) if allowed(spec) => Visibility::Allowed,
            Some(_) => Visibility::Denied,
        }
    }
}

/// Built-in catalog for an entity kind. Custom (attribute) fields from the
/// backend config are merged on top by `Backend::open`.
pub fn builtin(kind: EntityKind) -> FieldCatalog {
    let mut cat = FieldCatalog::new();
    cat.push("id", FieldSpec::column(ValueType::Number).read_only());

    if kind.is_translatable() {
        cat.push("group_id", FieldSpec::column(ValueType::Number).read_only());
        cat.push("language", FieldSpec::column(ValueType::String));
    }

    match kind {
        EntityKind::Document => {
            cat.push("title", FieldSpec::column(ValueType::String));
            cat.push("path", FieldSpec::column(ValueType::String));
            cat.push("slug", FieldSpec::column(ValueType::String));
            cat.push("template", FieldSpec::column(ValueType::String));
            cat.push("visible", FieldSpec::column(ValueType::Boolean));
            cat.push("position", FieldSpec::column(ValueType::Number));
            cat.push("blocks", FieldSpec::column(ValueType::Json));
        }
        EntityKind::Post => {
            cat.push("title", FieldSpec::column(ValueType::String));
            cat.push("slug", FieldSpec::column(ValueType::String));
            cat.push("excerpt", FieldSpec::column(ValueType::String));
            cat.push("published_at", FieldSpec::column(ValueType::DateTime));
            cat.push("visible", FieldSpec::column(ValueType::Boolean));
            cat.push("blocks", FieldSpec::column(ValueType::Json));
        }
        EntityKind::Preset => {
            cat.push("title", FieldSpec::column(ValueType::String));
            cat.push("blocks", FieldSpec::column(ValueType::Json));
        }
        EntityKind::File => {
            cat.push("title", FieldSpec::column(ValueType::String));
            cat.push("url", FieldSpec::column(ValueType::String));
            cat.push("mime", FieldSpec::column(ValueType::String));
            cat.push("size", FieldSpec::column(ValueType::Number));
        }
        EntityKind::Role => {
            cat.push("name", FieldSpec::column(ValueType::String));
            cat.push("permissions", FieldSpec::column(ValueType::Json));
        }
        EntityKind::Account => {
            cat.push("name", FieldSpec::column(ValueType::String));
            cat.push("email", FieldSpec::column(ValueType::String));
            cat.push(
                "role_id",
                FieldSpec::column(ValueType::Number).references(EntityKind::Role),
            );
            cat.push("language", FieldSpec::column(ValueType::String));
            cat.push("active", FieldSpec::column(ValueType::Boolean));
        }
        EntityKind::SettingsGroup => {
            cat.push("name", FieldSpec::column(ValueType::String));
            cat.push("values", FieldSpec::column(ValueType::Json));
        }
    }

    if kind != EntityKind::SettingsGroup && kind != EntityKind::Role {
        cat.push("created_at", FieldSpec::column(ValueType::DateTime).read_only());
        cat.push("modified_at", FieldSpec::column(ValueType::DateTime).read_only());
    }
    if kind == EntityKind::Role {
        cat.push("created_at", FieldSpec::column(ValueType::DateTime).read_only());
    }

    cat
}
