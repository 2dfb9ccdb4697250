//! Relation population: replaces numeric entity references inside a record
//! (top-level fields and nested block-tree properties) with a small object
//! holding the target's own fields.
//!
//! Termination on cyclic reference graphs is guaranteed by an explicit
//! skip-set threaded through every recursive call: the current record's
//! `(kind, id)` is added before recursing, so a revisited target gets its
//! shallow reference instead of another recursion.

use crate::blocks::{BlockTree, Slot};
use crate::catalog::{EntityKind, FieldCatalog, ValueType};
use crate::coerce::{DATE_FORMAT, TIMESTAMP_FORMAT};
use crate::error::Result;
use crate::store::Backend;
use chrono::NaiveDateTime;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub type RecordMap = serde_json::Map<String, Value>;

/// Caller-chosen replacement for the default per-kind return subsets.
pub type SubsetOverrides = HashMap<EntityKind, Vec<String>>;

/// Display formats applied to temporal fields during population.
pub const DISPLAY_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const DISPLAY_TIME_FORMAT: &str = "%H:%M";

/// Where a reference lives and what it targets. Slots are index/name
/// based, never live pointers, so write-back is position-stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefLocation {
    pub slot: Slot,
    pub kind: EntityKind,
    pub id: i64,
}

/// Source of inline icon assets. Resolving inline content is a
/// collaborator concern; the default keeps the icon name untouched.
pub trait IconSource: Send + Sync {
    fn inline(&self, _name: &str) -> Option<String> {
        None
    }
}

pub struct NoIcons;

impl IconSource for NoIcons {}

/// Extract a reference id, tolerating integral floats from JSON input.
fn ref_id(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// Block property keys that carry entity references.
fn prop_reference_kind(key: &str) -> Option<EntityKind> {
    match key {
        "page" | "link" => Some(EntityKind::Document),
        "file" | "image" => Some(EntityKind::File),
        "user" | "author" => Some(EntityKind::Account),
        "role" => Some(EntityKind::Role),
        "post" => Some(EntityKind::Post),
        "preset" => Some(EntityKind::Preset),
        _ => None,
    }
}

/// Effective return subset for a target kind: the caller's override when
/// given, the built-in default otherwise.
fn subset_for(overrides: &SubsetOverrides, kind: EntityKind) -> Vec<&str> {
    match overrides.get(&kind) {
        Some(fields) => fields.iter().map(String::as_str).collect(),
        None => default_subset(kind).to_vec(),
    }
}

/// The default subset of target fields copied back per reference kind.
pub fn default_subset(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Document => &["id", "title", "path"],
        EntityKind::Post => &["id", "title", "slug"],
        // presets carry nested content, which drives selective recursion
        EntityKind::Preset => &["id", "title", "blocks"],
        EntityKind::File => &["id", "url"],
        EntityKind::Role => &["id", "name"],
        EntityKind::Account => &["id", "name", "email"],
        EntityKind::SettingsGroup => &["id", "name"],
    }
}

/// Scan a record's fields and block tree for reference locations.
pub fn scan(
    catalog: &FieldCatalog,
    record: &RecordMap,
    tree: Option<&BlockTree>,
) -> Vec<RefLocation> {
    let mut locations = Vec::new();

    for (name, spec) in catalog.iter() {
        if let Some(target_kind) = spec.reference {
            if let Some(id) = record.get(name).and_then(ref_id) {
                locations.push(RefLocation {
                    slot: Slot::Field(name.to_string()),
                    kind: target_kind,
                    id,
                });
            }
        }
    }

    if let Some(tree) = tree {
        for (node, key, value) in tree.props() {
            if let Some(target_kind) = prop_reference_kind(key) {
                if let Some(id) = ref_id(value) {
                    locations.push(RefLocation {
                        slot: Slot::BlockProp {
                            node,
                            key: key.to_string(),
                        },
                        kind: target_kind,
                        id,
                    });
                }
            }
        }
    }

    locations
}

/// Populate one record in place. `skip` is the set of `(kind, id)` pairs
/// already being populated in the active call chain.
pub fn populate_record(
    backend: &Backend,
    kind: EntityKind,
    id: i64,
    record: &mut RecordMap,
    subsets: &SubsetOverrides,
    skip: &mut HashSet<(EntityKind, i64)>,
) -> Result<()> {
    skip.insert((kind, id));

    let mut tree = record.get("blocks").and_then(BlockTree::parse);
    let locations = scan(backend.catalog(kind), record, tree.as_ref());

    // one fetch per distinct target, not one per location
    let mut grouped: HashMap<(EntityKind, i64), Vec<Slot>> = HashMap::new();
    for loc in locations {
        grouped
            .entry((loc.kind, loc.id))
            .or_default()
            .push(loc.slot);
    }

    for ((target_kind, target_id), slots) in grouped {
        let subset = subset_for(subsets, target_kind);
        let resolved = match backend.fetch_fields(target_kind, target_id, &subset)? {
            Some(mut target) => {
                let wants_nested = subset.contains(&"blocks");
                if wants_nested && !skip.contains(&(target_kind, target_id)) {
                    populate_record(backend, target_kind, target_id, &mut target, subsets, skip)?;
                }
                Some(Value::Object(target))
            }
            None => {
                log::warn!(
                    "dangling reference: {target_kind}/{target_id} no longer exists"
                );
                None
            }
        };

        for slot in slots {
            write_back(record, tree.as_mut(), &slot, target_kind, resolved.clone());
        }
    }

    postprocess(backend, kind, record, tree.as_mut());

    if let Some(tree) = tree {
        record.insert("blocks".into(), tree.to_value());
    }
    Ok(())
}

/// Write a resolved reference into its exact slot. A missing target clears
/// the slot: plain fields become `null`, block properties are removed.
fn write_back(
    record: &mut RecordMap,
    tree: Option<&mut BlockTree>,
    slot: &Slot,
    target_kind: EntityKind,
    resolved: Option<Value>,
) {
    match slot {
        Slot::Field(name) => {
            record.insert(name.clone(), resolved.unwrap_or(Value::Null));
        }
        Slot::BlockProp { node, key } => {
            let Some(tree) = tree else { return };
            let props = &mut tree.nodes[*node].props;
            match resolved {
                Some(value) => {
                    // link properties collapse to the target's canonical path
                    let value = if key == "link" && target_kind == EntityKind::Document {
                        value.get("path").cloned().unwrap_or(value)
                    } else {
                        value
                    };
                    props.insert(key.clone(), value);
                }
                None => {
                    props.remove(key);
                }
            }
        }
    }
}

/// Same-pass handling of non-relational field types: temporal display
/// formatting and icon substitution.
fn postprocess(
    backend: &Backend,
    kind: EntityKind,
    record: &mut RecordMap,
    tree: Option<&mut BlockTree>,
) {
    let catalog = backend.catalog(kind);
    for (name, spec) in catalog.iter() {
        if !spec.value_type.is_temporal() {
            continue;
        }
        if let Some(Value::String(text)) = record.get(name) {
            if let Some(display) = display_format(text, spec.value_type) {
                record.insert(name.to_string(), Value::String(display));
            }
        }
    }

    let Some(tree) = tree else { return };
    for node in &mut tree.nodes {
        let wants_name = node
            .props
            .get("icon_format")
            .and_then(Value::as_str)
            .map(|f| f == "name")
            .unwrap_or(false);
        if wants_name {
            continue;
        }
        if let Some(Value::String(name)) = node.props.get("icon") {
            if let Some(content) = backend.icons().inline(name) {
                node.props.insert("icon".into(), Value::String(content));
            }
        }
    }
}

fn display_format(text: &str, value_type: ValueType) -> Option<String> {
    match value_type {
        ValueType::DateTime => NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
            .ok()
            .map(|dt| dt.format(DISPLAY_DATETIME_FORMAT).to_string()),
        // date columns already hold their display form
        ValueType::Date => {
            chrono::NaiveDate::parse_from_str(text, DATE_FORMAT).ok()?;
            None
        }
        ValueType::Time => chrono::NaiveTime::parse_from_str(text, "%H:%M:%S")
            .ok()
            .map(|t| t.format(DISPLAY_TIME_FORMAT).to_string()),
        _ => None,
    }
}
