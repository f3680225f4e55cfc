use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use super::CacheError;

// Rows fetched per round trip while walking expired keys
const EXPIRED_PAGE_SIZE: usize = 256;

// SQLite's default variable limit is well above this
const DELETE_CHUNK_SIZE: usize = 500;

/// What the index knows about a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Unseen,
    Succeeded { last_access: i64 },
    Failed { count: u32, last_attempt: i64 },
}

impl CacheState {
    pub fn is_cached(&self) -> bool {
        matches!(self, CacheState::Succeeded { .. })
    }
}

/// A raw `image_cache` row.
#[derive(Debug, Clone)]
struct CacheEntry {
    log_time: i64,
    num_fail: i64,
}

impl From<CacheEntry> for CacheState {
    fn from(entry: CacheEntry) -> Self {
        if entry.num_fail <= 0 {
            CacheState::Succeeded {
                last_access: entry.log_time,
            }
        } else {
            CacheState::Failed {
                count: u32::try_from(entry.num_fail).unwrap_or(u32::MAX),
                last_attempt: entry.log_time,
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IndexStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub abandoned: u64,
}

/// Persistent record of fetch state, one row per requested image.
///
/// Every cross-request decision goes through a single SQL statement so
/// several workers (or processes sharing the database file) stay consistent
/// without in-process locking beyond the connection mutex.
pub struct CacheIndex {
    conn: Mutex<Connection>,
}

impl CacheIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS image_cache (
                filename TEXT PRIMARY KEY NOT NULL,
                log_time INTEGER NOT NULL DEFAULT 0,
                num_fail INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS image_cache_log_time ON image_cache (log_time);
            CREATE TABLE IF NOT EXISTS settings (
                variable TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn lookup(&self, key: &str) -> Result<CacheState, CacheError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT log_time, num_fail FROM image_cache WHERE filename = ?1",
                [key],
                |row| {
                    Ok(CacheEntry {
                        log_time: row.get(0)?,
                        num_fail: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(entry.map(CacheState::from).unwrap_or(CacheState::Unseen))
    }

    /// Records a successful fetch, replacing whatever was there.
    pub fn upsert_success(&self, key: &str, now: i64) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO image_cache (filename, log_time, num_fail)
            VALUES (?1, ?2, 0)
            ON CONFLICT(filename) DO UPDATE SET
                log_time = excluded.log_time,
                num_fail = 0
            "#,
            params![key, now],
        )?;

        Ok(())
    }

    /// Seeds a first failed attempt. Returns false if a row already existed.
    pub fn insert_failure_if_absent(&self, key: &str, now: i64) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO image_cache (filename, log_time, num_fail) VALUES (?1, ?2, 1)",
            params![key, now],
        )?;

        Ok(inserted == 1)
    }

    /// Bumps the failure count only if nobody else bumped it first.
    ///
    /// The caller that gets `true` owns the next retry for this key.
    pub fn increment_failure_if_matches(
        &self,
        key: &str,
        expected_count: u32,
    ) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE image_cache
            SET num_fail = num_fail + 1
            WHERE filename = ?1 AND num_fail = ?2
            "#,
            params![key, expected_count],
        )?;

        Ok(updated == 1)
    }

    pub fn touch_success_if_stale(
        &self,
        key: &str,
        now: i64,
        stale_window_secs: i64,
    ) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE image_cache
            SET log_time = ?2
            WHERE filename = ?1 AND num_fail = 0 AND log_time + ?3 < ?2
            "#,
            params![key, now, stale_window_secs],
        )?;

        Ok(updated == 1)
    }

    pub fn delete_entry(&self, key: &str) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM image_cache WHERE filename = ?1", [key])?;

        Ok(deleted == 1)
    }

    /// Deletes all of `keys` in one transaction.
    pub fn delete_entries(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;

        for chunk in keys.chunks(DELETE_CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("DELETE FROM image_cache WHERE filename IN ({})", placeholders);
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }

        tx.commit()?;
        Ok(deleted)
    }

    pub fn truncate_all(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM image_cache", [])?)
    }

    /// Keys whose `log_time` is strictly older than `cutoff`, fetched lazily.
    pub fn select_older_than(&self, cutoff: i64) -> ExpiredKeys<'_> {
        ExpiredKeys::new(self, cutoff)
    }

    fn expired_page(&self, cutoff: i64, after: &str, limit: usize) -> Result<Vec<String>, CacheError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT filename FROM image_cache
            WHERE log_time < ?1 AND filename > ?2
            ORDER BY filename
            LIMIT ?3
            "#,
        )?;

        let keys = stmt
            .query_map(params![cutoff, after, limit as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(keys)
    }

    pub fn stats(&self, max_retry: u32) -> Result<IndexStats, CacheError> {
        let conn = self.conn.lock();
        let (total, succeeded, abandoned): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN num_fail = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN num_fail > ?1 THEN 1 ELSE 0 END), 0)
            FROM image_cache
            "#,
            [max_retry],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(IndexStats {
            total: total as u64,
            succeeded: succeeded as u64,
            failed: (total - succeeded - abandoned) as u64,
            abandoned: abandoned as u64,
        })
    }

    pub fn get_setting(&self, variable: &str) -> Result<Option<String>, CacheError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE variable = ?1",
                [variable],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    pub fn set_setting(&self, variable: &str, value: &str) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO settings (variable, value) VALUES (?1, ?2)
            ON CONFLICT(variable) DO UPDATE SET value = excluded.value
            "#,
            params![variable, value],
        )?;

        Ok(())
    }

    pub fn insert_setting_if_absent(&self, variable: &str, value: &str) -> Result<bool, CacheError> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO settings (variable, value) VALUES (?1, ?2)",
            params![variable, value],
        )?;

        Ok(inserted == 1)
    }
}

/// Lazy, finite walk over expired keys.
///
/// Pages through the table in key order, so rows deleted or touched while
/// iterating never cause a key to be yielded twice.
pub struct ExpiredKeys<'a> {
    index: &'a CacheIndex,
    cutoff: i64,
    last: String,
    page: VecDeque<String>,
    exhausted: bool,
}

impl<'a> ExpiredKeys<'a> {
    fn new(index: &'a CacheIndex, cutoff: i64) -> Self {
        Self {
            index,
            cutoff,
            last: String::new(),
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    /// A fresh walk from the beginning with the same cutoff.
    pub fn restart(&self) -> ExpiredKeys<'a> {
        ExpiredKeys::new(self.index, self.cutoff)
    }
}

impl Iterator for ExpiredKeys<'_> {
    type Item = Result<String, CacheError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.index.expired_page(self.cutoff, &self.last, EXPIRED_PAGE_SIZE) {
                Ok(keys) => {
                    if keys.len() < EXPIRED_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    self.page.extend(keys);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let key = self.page.pop_front()?;
        self.last.clone_from(&key);
        Some(Ok(key))
    }
}
