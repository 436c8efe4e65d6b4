//! SQLite handle shared by the schedule store, dispatch queue and directory.
//! One connection behind a mutex; callers never hold it across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use followup_core::error::{FollowUpError, Result};
use rusqlite::Connection;

/// Cloneable handle to the scheduler database.
#[derive(Clone)]
pub struct SchedulerDb {
    conn: Arc<Mutex<Connection>>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            -- Durable follow-up records
            CREATE TABLE IF NOT EXISTS follow_ups (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                scheduled_time TEXT NOT NULL,
                kind TEXT NOT NULL,
                message_template TEXT NOT NULL,
                tone TEXT NOT NULL DEFAULT 'friendly',
                context_hints TEXT NOT NULL DEFAULT '{}',   -- JSON object
                personalize INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'scheduled',   -- scheduled, sent, cancelled
                skip_if_linked_work_done INTEGER NOT NULL DEFAULT 1,
                linked_work_id TEXT,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                recurrence_interval_days INTEGER,
                next_occurrence_id TEXT,
                sent_at TEXT,
                sent_by TEXT,
                response_text TEXT,
                response_received_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_follow_ups_due ON follow_ups(status, scheduled_time);
            CREATE INDEX IF NOT EXISTS idx_follow_ups_subject ON follow_ups(subject_id);
            CREATE INDEX IF NOT EXISTS idx_follow_ups_linked ON follow_ups(linked_work_id);

            -- Delay queue, one row per follow-up id
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                follow_up_id TEXT PRIMARY KEY,
                run_at TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 10,
                state TEXT NOT NULL DEFAULT 'pending',      -- pending, running, completed, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 4,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_ready ON dispatch_jobs(state, run_at);

            -- Subject contact directory
            CREATE TABLE IF NOT EXISTS subjects (
                subject_id TEXT PRIMARY KEY,
                contact TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                timezone TEXT
            );

            -- External work items follow-ups may be linked to
            CREATE TABLE IF NOT EXISTS linked_work_items (
                id TEXT PRIMARY KEY,
                complete INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            -- Engagement history (logins, clicks, inbound messages)
            CREATE TABLE IF NOT EXISTS engagement_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_engagement_subject ON engagement_events(subject_id, occurred_at);
         ",
            )?;
            Ok(())
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| FollowUpError::Database("connection mutex poisoned".into()))?;
        f(&mut guard)
    }
}

/// Fixed-width UTC timestamp so that text comparison in SQL matches time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_open_and_migrate() {
        let dir = std::env::temp_dir().join(format!("followup-db-{}", uuid::Uuid::new_v4()));
        let db = SchedulerDb::open(&dir.join("test.db")).unwrap();
        let n: i64 = db
            .with_conn(|c| {
                Ok(c.query_row("SELECT COUNT(*) FROM follow_ups", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(n, 0);
        // Reopening runs the migrations again without error.
        drop(db);
        assert!(SchedulerDb::open(&dir.join("test.db")).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_timestamp_text_order() {
        let a = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(0, &ts(b)).unwrap(), b);
    }
}
