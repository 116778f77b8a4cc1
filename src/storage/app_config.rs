//! Key/value application configuration with declared value types.
//!
//! Each key is a singleton (upsert on key). Compound values are stored as
//! JSON text, booleans as `"0"`/`"1"`, everything else as its string form.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as Json;

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::now_iso;

/// Key under which the schema version is stored.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Tagged configuration value with explicit codecs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Json),
    Dict(Json),
}

impl ConfigValue {
    /// Type tag persisted alongside the value.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ConfigValue::Str(_) => "str",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::List(_) => "list",
            ConfigValue::Dict(_) => "dict",
        }
    }

    /// Serializes the value to its stored string form.
    pub fn encode(&self) -> String {
        match self {
            ConfigValue::Str(s) => s.clone(),
            ConfigValue::Int(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            ConfigValue::List(v) | ConfigValue::Dict(v) => v.to_string(),
        }
    }

    /// Decodes a stored string according to its type tag.
    pub fn decode(raw: &str, type_tag: &str) -> ConfigValue {
        match type_tag {
            "int" => raw
                .parse::<i64>()
                .map(ConfigValue::Int)
                .unwrap_or_else(|_| ConfigValue::Str(raw.to_string())),
            "float" => raw
                .parse::<f64>()
                .map(ConfigValue::Float)
                .unwrap_or_else(|_| ConfigValue::Str(raw.to_string())),
            "bool" => ConfigValue::Bool(raw == "1" || raw.eq_ignore_ascii_case("true")),
            "list" => serde_json::from_str::<Json>(raw)
                .map(ConfigValue::List)
                .unwrap_or_else(|_| ConfigValue::Str(raw.to_string())),
            "dict" => serde_json::from_str::<Json>(raw)
                .map(ConfigValue::Dict)
                .unwrap_or_else(|_| ConfigValue::Str(raw.to_string())),
            _ => ConfigValue::Str(raw.to_string()),
        }
    }
}

/// Reads one typed value by key.
pub fn get(pool: &DbPool, key: &str) -> AppResult<Option<ConfigValue>> {
    let conn = get_connection(pool)?;
    get_with_conn(&conn, key)
}

pub fn get_with_conn(conn: &Connection, key: &str) -> AppResult<Option<ConfigValue>> {
    let row = conn
        .query_row(
            "SELECT value, value_type FROM app_config WHERE key = ?1",
            [key],
            |row| {
                let raw: String = row.get(0)?;
                let tag: String = row.get(1)?;
                Ok((raw, tag))
            },
        )
        .optional()?;
    Ok(row.map(|(raw, tag)| ConfigValue::decode(&raw, &tag)))
}

/// Upserts a typed value under a key.
pub fn set(pool: &DbPool, key: &str, value: &ConfigValue, description: Option<&str>) -> AppResult<()> {
    let conn = get_connection(pool)?;
    set_with_conn(&conn, key, value, description)
}

pub fn set_with_conn(
    conn: &Connection,
    key: &str,
    value: &ConfigValue,
    description: Option<&str>,
) -> AppResult<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO app_config (key, value, value_type, description, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             value_type = excluded.value_type,
             description = COALESCE(excluded.description, app_config.description),
             updated_at = excluded.updated_at",
        params![key, value.encode(), value.type_tag(), description, now],
    )?;
    Ok(())
}

/// Deletes a key. Missing keys are a no-op.
pub fn delete(pool: &DbPool, key: &str) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    Ok(conn.execute("DELETE FROM app_config WHERE key = ?1", [key])?)
}

/// Returns every key with its decoded value.
pub fn all(pool: &DbPool) -> AppResult<Vec<(String, ConfigValue)>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare("SELECT key, value, value_type FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| {
        let key: String = row.get(0)?;
        let raw: String = row.get(1)?;
        let tag: String = row.get(2)?;
        Ok((key, raw, tag))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (key, raw, tag) = row?;
        out.push((key, ConfigValue::decode(&raw, &tag)));
    }
    Ok(out)
}
