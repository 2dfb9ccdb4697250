//! Content-management backend core: a field-catalog-driven query engine,
//! record serializer, relation population, and translation resolution over
//! mixed column/attribute storage in SQLite.
//!
//! The [`Backend`] is the entry point: open one over a data directory (or
//! in memory), then read through [`Backend::query`] and write through
//! [`Backend::create`] / [`Backend::update`] / [`Backend::delete`].

pub mod blocks;
pub mod catalog;
pub mod coerce;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod populate;
pub mod query;
pub mod serialize;
pub mod store;
pub mod translate;
pub mod validate;

pub use catalog::{EntityKind, FieldCatalog, FieldSpec, FieldStorage, ValueType, Visibility};
pub use config::{BackendConfig, CustomFieldDef};
pub use error::{FieldError, LoamError, Result};
pub use filter::{Combinator, Filter, FilterOp};
pub use hooks::{EntityHooks, RecordMap};
pub use populate::{IconSource, SubsetOverrides};
pub use query::{Page, PageMeta, Query, SortDir};
pub use store::Backend;
pub use translate::TranslationRef;
