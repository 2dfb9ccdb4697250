//! SQLite storage layer: one table per entity kind for fixed columns, one
//! attribute side table per kind for custom fields, and a translation-group
//! table. The rest of the core only sees row-oriented read/write.

use crate::catalog::{EntityKind, FieldCatalog, FieldStorage, ValueType};
use crate::error::Result;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// A raw fetched row as a JSON object keyed by column name.
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Quote an identifier for interpolation into generated SQL. Catalog field
/// names can collide with reserved words (`values`).
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub struct ContentDb {
    conn: Connection,
}

impl ContentDb {
    /// Open or create the content database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(ContentDb {
            conn: Connection::open(path)?,
        })
    }

    /// Open an in-memory content database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(ContentDb {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Create the per-kind tables from the field catalogs.
    pub fn initialize(&self, catalogs: &HashMap<EntityKind, FieldCatalog>) -> Result<()> {
        for kind in EntityKind::ALL {
            let catalog = &catalogs[&kind];
            let mut columns = vec!["id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];
            for (name, spec) in catalog.iter() {
                if name == "id" || spec.storage != FieldStorage::Column {
                    continue;
                }
                columns.push(format!("{} {}", quote_ident(name), sql_type(spec.value_type)));
            }
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({});
                 CREATE TABLE IF NOT EXISTS {} (
                     record_id INTEGER NOT NULL,
                     key TEXT NOT NULL,
                     value TEXT,
                     PRIMARY KEY (record_id, key)
                 );",
                kind.table(),
                columns.join(", "),
                kind.attr_table(),
            ))?;
        }
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_groups (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );",
        )?;
        Ok(())
    }

    // ── Rows ─────────────────────────────────────────────────────────

    /// Insert a row and return its assigned id.
    pub fn insert_row(
        &self,
        kind: EntityKind,
        columns: &[(String, rusqlite::types::Value)],
    ) -> Result<i64> {
        if columns.is_empty() {
            self.conn
                .execute(&format!("INSERT INTO {} DEFAULT VALUES", kind.table()), [])?;
        } else {
            let names: Vec<String> = columns.iter().map(|(n, _)| quote_ident(n)).collect();
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                kind.table(),
                names.join(", "),
                placeholders
            );
            self.conn
                .execute(&sql, params_from_iter(columns.iter().map(|(_, v)| v)))?;
        }
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_row(
        &self,
        kind: EntityKind,
        id: i64,
        columns: &[(String, rusqlite::types::Value)],
    ) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let assignments: Vec<String> = columns
            .iter()
            .map(|(n, _)| format!("{} = ?", quote_ident(n)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            kind.table(),
            assignments.join(", ")
        );
        let mut values: Vec<rusqlite::types::Value> =
            columns.iter().map(|(_, v)| v.clone()).collect();
        values.push(rusqlite::types::Value::Integer(id));
        self.conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    pub fn delete_row(&self, kind: EntityKind, id: i64) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
            params![id],
        )?;
        Ok(())
    }

    pub fn row_exists(&self, kind: EntityKind, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT id FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Generic reads ────────────────────────────────────────────────

    /// Execute an arbitrary SELECT, materializing each row as a JSON object.
    pub fn select(
        &self,
        sql: &str,
        bind: &[rusqlite::types::Value],
    ) -> Result<Vec<RawRow>> {
        log::debug!("select: {sql}");
        let mut stmt = self.conn.prepare(sql)?;
        let column_names: Vec<String> = (0..stmt.column_count())
            .map(|i| stmt.column_name(i).unwrap_or("?").to_string())
            .collect();

        let rows = stmt.query_map(params_from_iter(bind.iter()), |row| {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let val: rusqlite::types::Value = row.get(i)?;
                obj.insert(name.clone(), sql_value_to_json(val));
            }
            Ok(obj)
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Execute a scalar SELECT (COUNT and friends).
    pub fn select_scalar(&self, sql: &str, bind: &[rusqlite::types::Value]) -> Result<i64> {
        let value =
            self.conn
                .query_row(sql, params_from_iter(bind.iter()), |row| row.get(0))?;
        Ok(value)
    }

    // ── Attributes ───────────────────────────────────────────────────

    /// Upsert one attribute value. The `(record_id, key)` primary key keeps
    /// at most one row per pair.
    pub fn set_attr(&self, kind: EntityKind, id: i64, key: &str, value: Option<&str>) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (record_id, key, value) VALUES (?1, ?2, ?3)",
                kind.attr_table()
            ),
            params![id, key, value],
        )?;
        Ok(())
    }

    /// All attribute rows for one record.
    pub fn get_attrs(&self, kind: EntityKind, id: i64) -> Result<HashMap<String, Option<String>>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT key, value FROM {} WHERE record_id = ?1",
            kind.attr_table()
        ))?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut attrs = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            attrs.insert(key, value);
        }
        Ok(attrs)
    }

    pub fn delete_attrs(&self, kind: EntityKind, id: i64) -> Result<()> {
        self.conn.execute(
            &format!("DELETE FROM {} WHERE record_id = ?1", kind.attr_table()),
            params![id],
        )?;
        Ok(())
    }

    // ── Translation groups ───────────────────────────────────────────

    pub fn create_translation_group(&self) -> Result<i64> {
        self.conn
            .execute("INSERT INTO translation_groups DEFAULT VALUES", [])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn delete_translation_group(&self, group_id: i64) -> Result<()> {
        self.conn.execute(
            "DELETE FROM translation_groups WHERE id = ?1",
            params![group_id],
        )?;
        Ok(())
    }

    pub fn translation_group_exists(&self, group_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM translation_groups WHERE id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remaining members of a translation group across one kind's table.
    pub fn count_group_members(&self, kind: EntityKind, group_id: i64) -> Result<i64> {
        let count = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE group_id = ?1",
                kind.table()
            ),
            params![group_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── Transactions ─────────────────────────────────────────────────

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        Ok(())
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

fn sql_type(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::String => "TEXT",
        // NUMERIC keeps integral values (ids, positions) stored as integers
        ValueType::Number => "NUMERIC",
        ValueType::Boolean => "INTEGER",
        ValueType::DateTime | ValueType::Date | ValueType::Time => "TEXT",
        ValueType::Json => "TEXT",
    }
}

fn sql_value_to_json(val: rusqlite::types::Value) -> serde_json::Value {
    match val {
        rusqlite::types::Value::Null => serde_json::Value::Null,
        rusqlite::types::Value::Integer(n) => serde_json::Value::Number(n.into()),
        rusqlite::types::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        rusqlite::types::Value::Text(s) => serde_json::Value::String(s),
        rusqlite::types::Value::Blob(b) => {
            serde_json::Value::String(String::from_utf8_lossy(&b).into())
        }
    }
}
