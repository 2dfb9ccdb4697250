//! Per-kind lifecycle callbacks, invoked by the serializer and the write
//! path at documented points.

use crate::catalog::EntityKind;
use crate::error::Result;
use std::collections::HashMap;

pub type RecordMap = serde_json::Map<String, serde_json::Value>;

/// Optional callbacks for one entity kind. Every method defaults to a
/// no-op; implementors override what they need.
pub trait EntityHooks: Send + Sync {
    /// Integrity self-check run on the raw row before materializing a
    /// record. An error here fails the read.
    fn check(&self, _row: &RecordMap) -> Result<()> {
        Ok(())
    }

    fn on_create(&self, _values: &mut RecordMap) {}

    fn on_read(&self, _record: &mut RecordMap) {}

    fn on_populate(&self, _record: &mut RecordMap) {}

    fn on_update(&self, _id: i64, _values: &mut RecordMap) {}

    fn on_delete(&self, _id: i64) {}
}

/// Registry of hooks per entity kind.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<EntityKind, Box<dyn EntityHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry {
            hooks: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: EntityKind, hooks: Box<dyn EntityHooks>) {
        self.hooks.insert(kind, hooks);
    }

    pub fn check(&self, kind: EntityKind, row: &RecordMap) -> Result<()> {
        match self.hooks.get(&kind) {
            Some(h) => h.check(row),
            None => Ok(()),
        }
    }

    pub fn on_create(&self, kind: EntityKind, values: &mut RecordMap) {
        if let Some(h) = self.hooks.get(&kind) {
            h.on_create(values);
        }
    }

    pub fn on_read(&self, kind: EntityKind, record: &mut RecordMap) {
        if let Some(h) = self.hooks.get(&kind) {
            h.on_read(record);
        }
    }

    pub fn on_populate(&self, kind: EntityKind, record: &mut RecordMap) {
        if let Some(h) = self.hooks.get(&kind) {
            h.on_populate(record);
        }
    }

    pub fn on_update(&self, kind: EntityKind, id: i64, values: &mut RecordMap) {
        if let Some(h) = self.hooks.get(&kind) {
            h.on_update(id, values);
        }
    }

    pub fn on_delete(&self, kind: EntityKind, id: i64) {
        if let Some(h) = self.hooks.get(&kind) {
            h.on_delete(id);
        }
    }
}
