//! Translation-group resolution: map a record to its per-language siblings.

use crate::catalog::EntityKind;
use crate::error::{LoamError, Result};
use crate::store::Backend;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Lightweight reference to a sibling record in another language. The
/// translatable kinds have no canonical URL column, so a sibling is
/// addressed by its path when it has one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationRef {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Resolve the per-language sibling map for one record. Every configured
/// language other than the record's own gets an entry: a reference when a
/// sibling exists, `null` otherwise. `public_only` restricts siblings to
/// publicly visible ones. Non-translatable kinds return an empty map.
pub fn resolve_translations(
    backend: &Backend,
    kind: EntityKind,
    record_id: i64,
    public_only: bool,
) -> Result<BTreeMap<String, Option<TranslationRef>>> {
    if !kind.is_translatable() {
        return Ok(BTreeMap::new());
    }

    let table = kind.table();
    let rows = backend.db().select(
        &format!("SELECT group_id, language FROM {table} WHERE id = ?"),
        &[rusqlite::types::Value::Integer(record_id)],
    )?;
    let row = rows
        .first()
        .ok_or(LoamError::NotFound { kind, id: record_id })?;
    let group_id = row.get("group_id").and_then(Value::as_i64);
    let own_language = row
        .get("language")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let catalog = backend.catalog(kind);
    let has_path = catalog.classify("path").is_some();
    let has_visible = catalog.classify("visible").is_some();

    let mut map = BTreeMap::new();
    for language in &backend.config().languages {
        if *language == own_language {
            continue;
        }
        let Some(group_id) = group_id else {
            map.insert(language.clone(), None);
            continue;
        };

        let path_col = if has_path { ", path" } else { "" };
        let visibility = if public_only && has_visible {
            " AND visible = 1"
        } else {
            ""
        };
        let siblings = backend.db().select(
            &format!(
                "SELECT id, title{path_col} FROM {table} \
                 WHERE group_id = ? AND language = ?{visibility} LIMIT 1"
            ),
            &[
                rusqlite::types::Value::Integer(group_id),
                rusqlite::types::Value::Text(language.clone()),
            ],
        )?;

        let entry = siblings.first().and_then(|s| {
            Some(TranslationRef {
                id: s.get("id")?.as_i64()?,
                title: s
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                path: s
                    .get("path")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        });
        map.insert(language.clone(), entry);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use serde_json::json;

    fn backend() -> Backend {
        let config = BackendConfig::parse("languages: [en, de, fr]\ndefault_language: en\n")
            .unwrap();
        Backend::open_in_memory(config).unwrap()
    }

    fn record(v: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_siblings_mapped_per_language() {
        let backend = backend();
        let en = backend
            .create(
                EntityKind::Document,
                record(json!({ "title": "Home", "path": "/home", "visible": true })),
            )
            .unwrap();
        let de = backend
            .create_translation(
                EntityKind::Document,
                en,
                "de",
                record(json!({ "title": "Start", "path": "/de/start", "visible": true })),
            )
            .unwrap();

        let map = resolve_translations(&backend, EntityKind::Document, en, false).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map["de"],
            Some(TranslationRef {
                id: de,
                title: Some("Start".into()),
                path: Some("/de/start".into()),
            })
        );
        assert_eq!(map["fr"], None);
    }

    #[test]
    fn test_public_only_hides_invisible_siblings() {
        let backend = backend();
        let en = backend
            .create(
                EntityKind::Document,
                record(json!({ "title": "Home", "path": "/home", "visible": true })),
            )
            .unwrap();
        backend
            .create_translation(
                EntityKind::Document,
                en,
                "de",
                record(json!({ "title": "Entwurf", "path": "/de/entwurf", "visible": false })),
            )
            .unwrap();

        let public = resolve_translations(&backend, EntityKind::Document, en, true).unwrap();
        assert_eq!(public["de"], None);

        let all = resolve_translations(&backend, EntityKind::Document, en, false).unwrap();
        assert!(all["de"].is_some());
    }

    #[test]
    fn test_non_translatable_kind_is_empty() {
        let backend = backend();
        let id = backend
            .create(EntityKind::File, record(json!({ "title": "f", "url": "/f" })))
            .unwrap();
        let map = resolve_translations(&backend, EntityKind::File, id, false).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let backend = backend();
        let result = resolve_translations(&backend, EntityKind::Document, 999, false);
        assert!(matches!(result, Err(LoamError::NotFound { .. })));
    }
}
