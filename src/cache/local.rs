//! SQLite-backed report cache.
//!
//! Stored in `~/.reportage/cache.db` by default, or in memory for tests.
//!
//! # Schema
//!
//! ```text
//! instances            one row per instance; doubles as the write lock
//!   report_id, instance_id, created_ts, expires_ts (unix ms),
//!   finished, row_count, columns (JSON names), footer (JSON row)
//! "rows:{report}:{instance}"
//!   _row_id, _data (JSON row), c0..cN (sortable projection per column)
//! ```
//!
//! Versioned: a schema version mismatch drops every cached instance.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::{
    expiry, CacheError, CacheResult, CachedRow, InstanceInfo, ReportCache, RowQuery, RowStream,
};
use crate::database::quote_ident;
use crate::row::Row;

/// Current cache schema version. Bump this when the cache format changes.
const CACHE_VERSION: i32 = 1;

/// Rows inserted per transaction while an instance is written.
const INSERT_BATCH: usize = 250;

/// A finished instance's metadata.
struct Finished {
    created: i64,
    row_count: usize,
    columns: Vec<String>,
    footer: Option<String>,
}

/// SQLite-based report cache.
pub struct LocalCache {
    conn: Mutex<Connection>,
}

impl LocalCache {
    /// Open or create the cache at the default location.
    pub fn open() -> CacheResult<Self> {
        Self::open_at(Self::cache_path()?)
    }

    /// Open or create the cache database at `path`, creating parent
    /// directories as needed.
    pub fn open_at(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        cache.init()?;
        Ok(cache)
    }

    /// Open an in-memory cache (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        cache.init()?;
        Ok(cache)
    }

    /// Get the path to the default cache database.
    pub fn cache_path() -> CacheResult<PathBuf> {
        let base = dirs::home_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(base.join(".reportage").join("cache.db"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the cache schema and check version.
    fn init(&self) -> CacheResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                report_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                created_ts INTEGER NOT NULL,
                expires_ts INTEGER NOT NULL,
                finished INTEGER NOT NULL DEFAULT 0,
                row_count INTEGER NOT NULL DEFAULT 0,
                columns TEXT NOT NULL,
                footer TEXT,
                PRIMARY KEY (report_id, instance_id)
            );
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == CACHE_VERSION => {}
            Some(v) => {
                tracing::info!(stored = v, current = CACHE_VERSION, "cache version changed, clearing");
                let all = instance_ids(&conn, None)?;
                for (report_id, instance_id) in &all {
                    drop_instance(&conn, report_id, instance_id)?;
                }
                set_version(&conn)?;
            }
            None => set_version(&conn)?,
        }
        Ok(())
    }

    /// Takes the write lock for an instance and creates its row table.
    fn lock_instance(
        &self,
        report_id: &str,
        instance_id: &str,
        columns: &[String],
        ttl: Duration,
    ) -> CacheResult<()> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(bool, i64)> = tx
            .query_row(
                "SELECT finished, expires_ts FROM instances WHERE report_id = ?1 AND instance_id = ?2",
                params![report_id, instance_id],
                |row| Ok((row.get::<_, i64>(0)? != 0, row.get(1)?)),
            )
            .optional()?;
        match existing {
            Some((false, _)) => {
                tracing::warn!(report_id, instance_id, "cache instance is locked");
                return Err(CacheError::locked(report_id, instance_id));
            }
            Some((true, expires)) if expires > now.timestamp_millis() => {
                tracing::warn!(report_id, instance_id, "cache instance already exists");
                return Err(CacheError::exists(report_id, instance_id));
            }
            Some((true, _)) => drop_instance(&tx, report_id, instance_id)?,
            None => {}
        }

        tx.execute(
            "INSERT INTO instances (report_id, instance_id, created_ts, expires_ts, columns)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report_id,
                instance_id,
                now.timestamp_millis(),
                expiry(now, ttl).timestamp_millis(),
                serde_json::to_string(columns)?,
            ],
        )?;

        let table = table_name(report_id, instance_id);
        let projections: String = (0..columns.len()).map(|i| format!(", c{i}")).collect();
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (_row_id INTEGER PRIMARY KEY, _data TEXT NOT NULL{projections});"
        ))?;
        tx.commit()?;
        Ok(())
    }

    /// Pulls rows in batches and inserts each batch in one transaction.
    fn write_rows(
        &self,
        report_id: &str,
        instance_id: &str,
        rows: &mut dyn RowStream,
        columns: &[String],
    ) -> CacheResult<usize> {
        let table = table_name(report_id, instance_id);
        let placeholders: String = (0..columns.len() + 2)
            .map(|i| format!("?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let projections: String = (0..columns.len()).map(|i| format!(", c{i}")).collect();
        let sql = format!("INSERT INTO {table} (_row_id, _data{projections}) VALUES ({placeholders})");

        let mut count = 0usize;
        let mut batch: Vec<Row> = Vec::with_capacity(INSERT_BATCH);
        loop {
            batch.clear();
            while batch.len() < INSERT_BATCH {
                match rows.next() {
                    Some(row) => batch.push(row?),
                    None => break,
                }
            }
            if batch.is_empty() {
                return Ok(count);
            }

            let mut conn = self.conn();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in &batch {
                    count += 1;
                    let mut values = vec![
                        SqlValue::Integer(count as i64),
                        SqlValue::Text(serde_json::to_string(row)?),
                    ];
                    values.extend(
                        columns
                            .iter()
                            .map(|name| row.get(name).map_or(SqlValue::Null, |v| v.to_sql())),
                    );
                    stmt.execute(params_from_iter(values))?;
                }
            }
            tx.commit()?;
        }
    }

    fn finish_instance(
        &self,
        report_id: &str,
        instance_id: &str,
        row_count: usize,
        footer: &Row,
    ) -> CacheResult<()> {
        self.conn().execute(
            "UPDATE instances SET finished = 1, row_count = ?3, footer = ?4
             WHERE report_id = ?1 AND instance_id = ?2",
            params![
                report_id,
                instance_id,
                row_count as i64,
                serde_json::to_string(footer)?
            ],
        )?;
        Ok(())
    }

    fn finished(&self, conn: &Connection, report_id: &str, instance_id: &str) -> CacheResult<Finished> {
        conn.query_row(
            "SELECT created_ts, row_count, columns, footer FROM instances
             WHERE report_id = ?1 AND instance_id = ?2 AND finished = 1 AND expires_ts > ?3",
            params![report_id, instance_id, Utc::now().timestamp_millis()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?
        .map(|(created, row_count, columns, footer)| -> CacheResult<Finished> {
            Ok(Finished {
                created,
                row_count: usize::try_from(row_count).unwrap_or(0),
                columns: serde_json::from_str(&columns)?,
                footer,
            })
        })
        .unwrap_or_else(|| Err(CacheError::incomplete(report_id, instance_id)))
    }
}

impl ReportCache for LocalCache {
    fn create_instance(
        &self,
        report_id: &str,
        instance_id: &str,
        rows: &mut dyn RowStream,
        ttl: Duration,
    ) -> CacheResult<()> {
        let columns = rows.column_names();
        self.lock_instance(report_id, instance_id, &columns, ttl)?;

        let written = self
            .write_rows(report_id, instance_id, rows, &columns)
            .and_then(|count| Ok((count, rows.finalize_footer()?)));
        match written {
            Ok((count, footer)) => {
                self.finish_instance(report_id, instance_id, count, &footer)?;
                tracing::debug!(report_id, instance_id, rows = count, "cache instance written");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(report_id, instance_id, error = %e, "cache write failed, unlocking");
                drop_instance(&self.conn(), report_id, instance_id)?;
                Err(e)
            }
        }
    }

    fn kill_instance_cache(&self, report_id: &str, instance_id: &str) -> CacheResult<()> {
        drop_instance(&self.conn(), report_id, instance_id)
    }

    fn kill_report_cache(&self, report_id: &str) -> CacheResult<()> {
        let conn = self.conn();
        for (report_id, instance_id) in instance_ids(&conn, Some(report_id))? {
            drop_instance(&conn, &report_id, &instance_id)?;
        }
        Ok(())
    }

    fn is_instance_started(&self, report_id: &str, instance_id: &str) -> CacheResult<bool> {
        let started: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM instances
                 WHERE report_id = ?1 AND instance_id = ?2 AND (finished = 0 OR expires_ts > ?3)",
                params![report_id, instance_id, Utc::now().timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(started.is_some())
    }

    fn is_instance_finished(&self, report_id: &str, instance_id: &str) -> CacheResult<bool> {
        match self.finished(&self.conn(), report_id, instance_id) {
            Ok(_) => Ok(true),
            Err(e) if e.is_incomplete() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn instance_row_count(&self, report_id: &str, instance_id: &str) -> CacheResult<usize> {
        Ok(self.finished(&self.conn(), report_id, instance_id)?.row_count)
    }

    fn instance_timestamp(&self, report_id: &str, instance_id: &str) -> CacheResult<DateTime<Utc>> {
        let created = self.finished(&self.conn(), report_id, instance_id)?.created;
        Ok(DateTime::from_timestamp_millis(created).unwrap_or_default())
    }

    fn instance_rows(
        &self,
        report_id: &str,
        instance_id: &str,
        query: &RowQuery,
    ) -> CacheResult<Vec<CachedRow>> {
        let conn = self.conn();
        let finished = self.finished(&conn, report_id, instance_id)?;

        let mut sql = format!("SELECT _row_id, _data FROM {}", table_name(report_id, instance_id));
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(ids) = &query.selected {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" WHERE _row_id IN ({placeholders})"));
            params.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
        }
        match &query.sort {
            Some(sort) => {
                let index = finished
                    .columns
                    .iter()
                    .position(|name| *name == sort.column)
                    .ok_or_else(|| CacheError::UnknownColumn(sort.column.clone()))?;
                let cast = if query.alpha { "TEXT" } else { "REAL" };
                sql.push_str(&format!(
                    " ORDER BY CAST(c{index} AS {cast}) {}, _row_id ASC",
                    sort.direction.as_sql()
                ));
            }
            None => sql.push_str(" ORDER BY _row_id ASC"),
        }
        let limit = query.limit.map_or(-1, |l| l as i64);
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", query.offset));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, data)| {
                Ok(CachedRow {
                    id,
                    row: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    fn instance_footer(&self, report_id: &str, instance_id: &str) -> CacheResult<Row> {
        let footer = self.finished(&self.conn(), report_id, instance_id)?.footer;
        match footer {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Row::new()),
        }
    }

    fn purge_expired(&self) -> CacheResult<usize> {
        let conn = self.conn();
        let expired: Vec<(String, String)> = {
            let mut stmt = conn.prepare(
                "SELECT report_id, instance_id FROM instances WHERE finished = 1 AND expires_ts <= ?1",
            )?;
            let rows = stmt
                .query_map(params![Utc::now().timestamp_millis()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (report_id, instance_id) in &expired {
            drop_instance(&conn, report_id, instance_id)?;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "purged expired cache instances");
        }
        Ok(expired.len())
    }

    fn list_instances(&self) -> CacheResult<Vec<InstanceInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT report_id, instance_id, created_ts, expires_ts, finished, row_count
             FROM instances ORDER BY report_id, created_ts",
        )?;
        let instances = stmt
            .query_map([], |row| {
                Ok(InstanceInfo {
                    report_id: row.get(0)?,
                    instance_id: row.get(1)?,
                    created: DateTime::from_timestamp_millis(row.get(2)?).unwrap_or_default(),
                    expires: DateTime::from_timestamp_millis(row.get(3)?).unwrap_or_default(),
                    finished: row.get::<_, i64>(4)? != 0,
                    row_count: usize::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }
}

fn table_name(report_id: &str, instance_id: &str) -> String {
    quote_ident(&format!("rows:{report_id}:{instance_id}"))
}

fn set_version(conn: &Connection) -> CacheResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
        params![CACHE_VERSION.to_string()],
    )?;
    Ok(())
}

fn instance_ids(conn: &Connection, report_id: Option<&str>) -> CacheResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT report_id, instance_id FROM instances WHERE ?1 IS NULL OR report_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![report_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn drop_instance(conn: &Connection, report_id: &str, instance_id: &str) -> CacheResult<()> {
    conn.execute(
        "DELETE FROM instances WHERE report_id = ?1 AND instance_id = ?2",
        params![report_id, instance_id],
    )?;
    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {}",
        table_name(report_id, instance_id)
    ))?;
    Ok(())
}
