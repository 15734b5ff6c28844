use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{parse_id, EventLog, Fields, StreamMessage};
use crate::config::now_ts;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Event log persisted in sqlite. Survives restarts, including pending lists.
pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let log = Self { conn: Mutex::new(conn) };
        log.init()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self> {
        let log = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        log.init()?;
        Ok(log)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite event log lock poisoned"))
    }

    fn init(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS stream_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                fields TEXT NOT NULL,
                ts INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stream_topic ON stream_entries (topic, id);
            CREATE TABLE IF NOT EXISTS consumer_groups (
                topic TEXT NOT NULL,
                group_name TEXT NOT NULL,
                last_delivered INTEGER NOT NULL,
                PRIMARY KEY (topic, group_name)
            );
            CREATE TABLE IF NOT EXISTS pending_entries (
                topic TEXT NOT NULL,
                group_name TEXT NOT NULL,
                id INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                deliveries INTEGER NOT NULL,
                delivered_ts INTEGER NOT NULL,
                PRIMARY KEY (topic, group_name, id)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Number of unacked entries for a group, across consumers.
    pub fn pending_count(&self, topic: &str, group: &str) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_entries WHERE topic = ?1 AND group_name = ?2",
            params![topic, group],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn messages(&self, topic: &str) -> Result<Vec<StreamMessage>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, fields FROM stream_entries WHERE topic = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![topic], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, raw) = row?;
            out.push(to_message(id, &raw)?);
        }
        Ok(out)
    }

    fn take_new(
        conn: &mut Connection,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let tx = conn.transaction()?;
        let last: i64 = tx
            .query_row(
                "SELECT last_delivered FROM consumer_groups WHERE topic = ?1 AND group_name = ?2",
                params![topic, group],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| anyhow!("no consumer group {} on {}", group, topic))?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, fields FROM stream_entries
                 WHERE topic = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
            )?;
            let mapped = stmt.query_map(params![topic, last, count as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let ts = now_ts() as i64;
        let mut out = Vec::with_capacity(rows.len());
        for (id, raw) in &rows {
            tx.execute(
                "INSERT OR REPLACE INTO pending_entries
                 (topic, group_name, id, consumer, deliveries, delivered_ts)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![topic, group, id, consumer, ts],
            )?;
            out.push(to_message(*id, raw)?);
        }
        if let Some((max_id, _)) = rows.last() {
            tx.execute(
                "UPDATE consumer_groups SET last_delivered = ?3 WHERE topic = ?1 AND group_name = ?2",
                params![topic, group, max_id],
            )?;
        }
        tx.commit()?;
        Ok(out)
    }
}

fn to_message(id: i64, raw: &str) -> Result<StreamMessage> {
    let data: Fields = serde_json::from_str(raw)?;
    Ok(StreamMessage {
        message_id: id.to_string(),
        data,
    })
}

impl EventLog for SqliteEventLog {
    fn create_consumer_group(&self, topic: &str, group: &str) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO consumer_groups (topic, group_name, last_delivered)
             VALUES (?1, ?2, 0)",
            params![topic, group],
        )?;
        Ok(())
    }

    fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = {
                let mut conn = self.lock()?;
                Self::take_new(&mut conn, topic, group, consumer, count)?
            };
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let after = after.and_then(parse_id).map(|id| id as i64).unwrap_or(0);
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT p.id, s.fields FROM pending_entries p
                 JOIN stream_entries s ON s.id = p.id
                 WHERE p.topic = ?1 AND p.group_name = ?2 AND p.consumer = ?3 AND p.id > ?4
                 ORDER BY p.id LIMIT ?5",
            )?;
            let mapped = stmt.query_map(
                params![topic, group, consumer, after, count as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            mapped.collect::<rusqlite::Result<_>>()?
        };
        for (id, _) in &rows {
            tx.execute(
                "UPDATE pending_entries SET deliveries = deliveries + 1
                 WHERE topic = ?1 AND group_name = ?2 AND id = ?3",
                params![topic, group, id],
            )?;
        }
        tx.commit()?;
        rows.iter().map(|(id, raw)| to_message(*id, raw)).collect()
    }

    fn ack(&self, topic: &str, group: &str, message_id: &str) -> Result<()> {
        let id = parse_id(message_id).ok_or_else(|| anyhow!("bad message id {}", message_id))?;
        self.lock()?.execute(
            "DELETE FROM pending_entries WHERE topic = ?1 AND group_name = ?2 AND id = ?3",
            params![topic, group, id as i64],
        )?;
        Ok(())
    }

    fn publish(&self, topic: &str, data: &Fields) -> Result<Option<String>> {
        let raw = serde_json::to_string(data)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stream_entries (topic, fields, ts) VALUES (?1, ?2, ?3)",
            params![topic, raw, now_ts() as i64],
        )?;
        Ok(Some(conn.last_insert_rowid().to_string()))
    }
}
