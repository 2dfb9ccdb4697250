use crate::catalog::{EntityKind, FieldSpec, ValueType};
use crate::error::{LoamError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Backend configuration, loaded from `config.yaml` in the data directory.
/// Everything defaults so an empty file (or no file) works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Configured language codes, first one included.
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Per-kind pagination ceiling, keyed by kind name.
    #[serde(default)]
    pub per_page: HashMap<String, u64>,
    /// Custom (attribute-stored) fields per kind, merged on top of the
    /// built-in catalogs.
    #[serde(default)]
    pub custom_fields: HashMap<String, HashMap<String, CustomFieldDef>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            languages: default_languages(),
            default_language: default_language(),
            per_page: HashMap::new(),
            custom_fields: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFieldDef {
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default = "default_true")]
    pub selectable: bool,
    #[serde(default = "default_true")]
    pub sortable: bool,
    #[serde(default = "default_true")]
    pub filterable: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl CustomFieldDef {
    pub fn to_spec(&self) -> FieldSpec {
        let mut spec = FieldSpec::attribute(self.value_type);
        spec.selectable = self.selectable;
        spec.sortable = self.sortable;
        spec.filterable = self.filterable;
        spec.read_only = self.read_only;
        spec
    }
}

pub const DEFAULT_PER_PAGE_LIMIT: u64 = 100;

impl BackendConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: BackendConfig = serde_yaml::from_str(content)?;
        if !config.languages.contains(&config.default_language) {
            return Err(LoamError::Config(format!(
                "Default language '{}' is not in the configured languages",
                config.default_language
            )));
        }
        for kind_name in config.custom_fields.keys() {
            if EntityKind::from_name(kind_name).is_none() {
                return Err(LoamError::Config(format!(
                    "Unknown entity kind '{kind_name}' in custom_fields"
                )));
            }
        }
        Ok(config)
    }

    /// Pagination ceiling for a kind.
    pub fn per_page_limit(&self, kind: EntityKind) -> u64 {
        self.per_page
            .get(kind.name())
            .copied()
            .unwrap_or(DEFAULT_PER_PAGE_LIMIT)
    }
}

fn default_languages() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}
