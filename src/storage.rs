use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::now_ts;

/// Last-known-value store used to mirror engine state for inspection.
pub trait StateStore: Send + Sync {
    fn set_state(&self, key: &str, value: &Value) -> Result<()>;
    fn get_state(&self, key: &str) -> Result<Option<Value>>;
}

impl<T: StateStore + ?Sized> StateStore for std::sync::Arc<T> {
    fn set_state(&self, key: &str, value: &Value) -> Result<()> {
        (**self).set_state(key, value)
    }

    fn get_state(&self, key: &str) -> Result<Option<Value>> {
        (**self).get_state(key)
    }
}

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_ts INTEGER NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        let mut stmt = conn.prepare("SELECT key FROM state ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Value plus the unix second it was written.
    pub fn get_with_ts(&self, key: &str) -> Result<Option<(Value, u64)>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, updated_ts FROM state WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((raw, ts)) => Ok(Some((serde_json::from_str(&raw)?, ts as u64))),
            None => Ok(None),
        }
    }
}

impl StateStore for SqliteStateStore {
    fn set_state(&self, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.conn.lock().map_err(|_| anyhow!("state store lock poisoned"))?;
        conn.execute(
            "INSERT INTO state (key, value, updated_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ts = excluded.updated_ts",
            params![key, raw, now_ts() as i64],
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_with_ts(key)?.map(|(v, _)| v))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
    writes: Mutex<Vec<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys in the order they were written, repeats included.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStateStore {
    fn set_state(&self, key: &str, value: &Value) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .insert(key.to_string(), value.clone());
        self.writes
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .push(key.to_string());
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .values
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?
            .get(key)
            .cloned())
    }
}
