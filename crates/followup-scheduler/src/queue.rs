//! Dispatch Queue: durable delay queue on SQLite, keyed by follow-up id.
//!
//! A job is claimed with a conditional `UPDATE ... WHERE state = 'pending'` so two
//! workers can never run the same row. Workers park on a [`Notify`] between polls.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use followup_core::config::QueueConfig;
use followup_core::error::{FollowUpError, Result};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tokio::sync::Notify;

use crate::db::{SchedulerDb, parse_opt_ts, parse_ts, ts};
use followup_core::types::FollowUp;

use crate::jobs::{DispatchJob, FailureOutcome, JobState, RetryPolicy, priority_for_kind};

const JOB_COLUMNS: &str = "follow_up_id, run_at, priority, state, attempts, max_attempts, \
    last_error, created_at, updated_at, finished_at";

/// Count/age caps for finished job rows.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub completed_keep_count: usize,
    pub completed_keep_age: ChronoDuration,
    pub failed_keep_count: usize,
    pub failed_keep_age: ChronoDuration,
}

impl Retention {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            completed_keep_count: config.completed_keep_count,
            completed_keep_age: ChronoDuration::try_hours(config.completed_keep_hours)
                .unwrap_or(ChronoDuration::MAX),
            failed_keep_count: config.failed_keep_count,
            failed_keep_age: ChronoDuration::try_days(config.failed_keep_days)
                .unwrap_or(ChronoDuration::MAX),
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Result of the sweeper asking for a follow-up's queue row.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepClaim {
    /// The sweeper now owns the row in `running` state.
    Claimed(DispatchJob),
    /// A worker is executing it right now.
    Running,
    /// Pending but not runnable until `run_at` (future schedule or retry backoff).
    Waiting(DateTime<Utc>),
    /// Terminally failed; waits for an operator.
    Failed,
}

/// Job counts by state.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

pub struct DispatchQueue {
    db: SchedulerDb,
    policy: RetryPolicy,
    retention: Retention,
    wakeup: Notify,
}

impl DispatchQueue {
    pub fn new(db: SchedulerDb, policy: RetryPolicy, retention: Retention) -> Self {
        Self {
            db,
            policy,
            retention,
            wakeup: Notify::new(),
        }
    }

    pub fn from_config(db: SchedulerDb, config: &QueueConfig) -> Self {
        Self::new(db, RetryPolicy::from_config(config), Retention::from_config(config))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedule `follow_up_id` to run at or after `run_at`.
    ///
    /// A pending job for the same id is replaced; a running one is rejected.
    /// Finished rows are reset to a fresh pending job.
    pub fn enqueue(&self, follow_up_id: &str, run_at: DateTime<Utc>, priority: i32) -> Result<()> {
        let now = ts(Utc::now());
        self.db.with_conn(|conn| {
            let state: Option<String> = conn
                .query_row(
                    "SELECT state FROM dispatch_jobs WHERE follow_up_id = ?1",
                    [follow_up_id],
                    |r| r.get(0),
                )
                .optional()?;
            if state.as_deref() == Some("running") {
                return Err(FollowUpError::Queue(format!(
                    "job {follow_up_id} is running; cannot re-enqueue"
                )));
            }
            conn.execute(
                "INSERT INTO dispatch_jobs
                 (follow_up_id, run_at, priority, state, attempts, max_attempts, last_error,
                  created_at, updated_at, finished_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, NULL, ?5, ?5, NULL)
                 ON CONFLICT(follow_up_id) DO UPDATE SET
                    run_at = excluded.run_at,
                    priority = excluded.priority,
                    state = 'pending',
                    attempts = 0,
                    max_attempts = excluded.max_attempts,
                    last_error = NULL,
                    updated_at = excluded.updated_at,
                    finished_at = NULL
                 WHERE dispatch_jobs.state != 'running'",
                params![follow_up_id, ts(run_at), priority, self.policy.max_attempts(), now],
            )?;
            Ok(())
        })?;
        tracing::debug!(
            "📥 Queue enqueue: {} at {} (priority {})",
            follow_up_id,
            run_at,
            priority
        );
        self.wakeup.notify_waiters();
        Ok(())
    }

    /// Enqueue a record at its scheduled time with its kind's priority.
    pub fn enqueue_follow_up(&self, record: &FollowUp) -> Result<()> {
        self.enqueue(&record.id, record.scheduled_time, priority_for_kind(&record.kind))
    }

    /// Remove a pending job. Returns false if it was running, finished or absent.
    pub fn cancel(&self, follow_up_id: &str) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM dispatch_jobs WHERE follow_up_id = ?1 AND state = 'pending'",
                [follow_up_id],
            )?)
        })?;
        if removed > 0 {
            tracing::debug!("🗑️ Queue job removed: {}", follow_up_id);
        }
        Ok(removed > 0)
    }

    /// Claim the most urgent runnable job, moving it to `running`.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<DispatchJob>> {
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs
                 WHERE state = 'pending' AND run_at <= ?1
                 ORDER BY priority ASC, run_at ASC LIMIT 1"
            );
            let Some(mut job) = tx.query_row(&sql, [ts(now)], row_to_job).optional()? else {
                return Ok(None);
            };
            let claimed = tx.execute(
                "UPDATE dispatch_jobs SET state = 'running', attempts = attempts + 1, updated_at = ?1
                 WHERE follow_up_id = ?2 AND state = 'pending'",
                params![ts(now), job.follow_up_id],
            )?;
            tx.commit()?;
            if claimed == 0 {
                return Ok(None);
            }
            job.state = JobState::Running;
            job.attempts += 1;
            job.updated_at = now;
            Ok(Some(job))
        })
    }

    /// Take the row for `follow_up_id` on behalf of the sweeper.
    ///
    /// A pending job that is runnable, a finished one, or no row at all becomes
    /// `running` under the sweeper, so workers cannot claim it concurrently.
    pub fn claim_for_sweep(&self, follow_up_id: &str, now: DateTime<Utc>) -> Result<SweepClaim> {
        let max_attempts = self.policy.max_attempts();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE follow_up_id = ?1");
            let existing = tx.query_row(&sql, [follow_up_id], row_to_job).optional()?;
            let claimed = match &existing {
                None => tx.execute(
                    "INSERT INTO dispatch_jobs
                     (follow_up_id, run_at, priority, state, attempts, max_attempts, last_error,
                      created_at, updated_at, finished_at)
                     VALUES (?1, ?2, 10, 'running', 1, ?3, NULL, ?2, ?2, NULL)
                     ON CONFLICT(follow_up_id) DO NOTHING",
                    params![follow_up_id, ts(now), max_attempts],
                )?,
                Some(job) => match job.state {
                    JobState::Running => return Ok(SweepClaim::Running),
                    JobState::Failed => return Ok(SweepClaim::Failed),
                    JobState::Pending if job.run_at > now => {
                        return Ok(SweepClaim::Waiting(job.run_at));
                    }
                    JobState::Pending => tx.execute(
                        "UPDATE dispatch_jobs SET state = 'running', attempts = attempts + 1, updated_at = ?1
                         WHERE follow_up_id = ?2 AND state = 'pending'",
                        params![ts(now), follow_up_id],
                    )?,
                    JobState::Completed => tx.execute(
                        "UPDATE dispatch_jobs SET state = 'running', attempts = 1, last_error = NULL,
                            finished_at = NULL, updated_at = ?1
                         WHERE follow_up_id = ?2 AND state = 'completed'",
                        params![ts(now), follow_up_id],
                    )?,
                },
            };
            if claimed == 0 {
                return Ok(SweepClaim::Running);
            }
            let job = tx.query_row(&sql, [follow_up_id], row_to_job)?;
            tx.commit()?;
            Ok(SweepClaim::Claimed(job))
        })
    }

    /// The execution succeeded (or resolved to a no-op).
    pub fn complete(&self, follow_up_id: &str) -> Result<()> {
        let now = ts(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE dispatch_jobs SET state = 'completed', finished_at = ?1, updated_at = ?1
                 WHERE follow_up_id = ?2",
                params![now, follow_up_id],
            )?;
            Ok(())
        })
    }

    /// Settle a failed execution: back off and retry, or fail terminally.
    pub fn fail(
        &self,
        job: &DispatchJob,
        error: &FollowUpError,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let message = error.to_string();
        if self.policy.should_retry(job.attempts, error) {
            let delay = ChronoDuration::from_std(self.policy.backoff_for(job.attempts))
                .unwrap_or_else(|_| ChronoDuration::seconds(5));
            let next_run_at = now + delay;
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE dispatch_jobs SET state = 'pending', run_at = ?1, last_error = ?2, updated_at = ?3
                     WHERE follow_up_id = ?4",
                    params![ts(next_run_at), message, ts(now), job.follow_up_id],
                )?;
                Ok(())
            })?;
            tracing::warn!(
                "🔄 Job {} failed (attempt {}/{}): {}; retrying at {}",
                job.follow_up_id,
                job.attempts,
                job.max_attempts,
                message,
                next_run_at
            );
            Ok(FailureOutcome::Retrying {
                attempt: job.attempts,
                next_run_at,
            })
        } else {
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE dispatch_jobs SET state = 'failed', last_error = ?1, finished_at = ?2, updated_at = ?2
                     WHERE follow_up_id = ?3",
                    params![message, ts(now), job.follow_up_id],
                )?;
                Ok(())
            })?;
            tracing::error!(
                "❌ Job {} failed permanently after {} attempt(s): {}",
                job.follow_up_id,
                job.attempts,
                message
            );
            Ok(FailureOutcome::Exhausted {
                attempts: job.attempts,
            })
        }
    }

    /// Earliest `run_at` among pending jobs.
    pub fn next_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn.query_row(
                "SELECT MIN(run_at) FROM dispatch_jobs WHERE state = 'pending'",
                [],
                |r| r.get(0),
            )?;
            Ok(parse_opt_ts(0, raw)?)
        })
    }

    /// Wait until something is enqueued.
    pub async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }

    /// Jobs left `running` by a crashed process go back to `pending`.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let now = ts(Utc::now());
        let n = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE dispatch_jobs SET state = 'pending', updated_at = ?1 WHERE state = 'running'",
                [now],
            )?)
        })?;
        if n > 0 {
            tracing::info!("♻️ Recovered {} interrupted job(s)", n);
            self.wakeup.notify_waiters();
        }
        Ok(n)
    }

    /// Apply count and age caps to finished jobs. Returns rows deleted.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let r = self.retention;
        let deleted = self.db.with_conn(|conn| {
            let mut deleted = 0;
            // A failed row is the only thing keeping the sweeper away from a
            // still-scheduled follow-up, so those rows are never pruned.
            const PRUNABLE: &str = "(state = 'completed' OR follow_up_id NOT IN
                (SELECT id FROM follow_ups WHERE status = 'scheduled'))";
            for (state, keep, age) in [
                ("completed", r.completed_keep_count, r.completed_keep_age),
                ("failed", r.failed_keep_count, r.failed_keep_age),
            ] {
                let cutoff = now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC);
                deleted += conn.execute(
                    &format!(
                        "DELETE FROM dispatch_jobs WHERE state = ?1 AND finished_at < ?2 AND {PRUNABLE}"
                    ),
                    params![state, ts(cutoff)],
                )?;
                deleted += conn.execute(
                    &format!(
                        "DELETE FROM dispatch_jobs WHERE {PRUNABLE} AND follow_up_id IN (
                            SELECT follow_up_id FROM dispatch_jobs WHERE state = ?1
                            ORDER BY finished_at DESC LIMIT -1 OFFSET ?2)"
                    ),
                    params![state, keep as i64],
                )?;
            }
            Ok(deleted)
        })?;
        if deleted > 0 {
            tracing::debug!("🧹 Pruned {} finished job(s)", deleted);
        }
        Ok(deleted)
    }

    pub fn job(&self, follow_up_id: &str) -> Result<Option<DispatchJob>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE follow_up_id = ?1");
            Ok(conn.query_row(&sql, [follow_up_id], row_to_job).optional()?)
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with_conn(|conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM dispatch_jobs GROUP BY state")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (state, n) = row?;
                match JobState::parse(&state) {
                    Some(JobState::Pending) => stats.pending = n as u64,
                    Some(JobState::Running) => stats.running = n as u64,
                    Some(JobState::Completed) => stats.completed = n as u64,
                    Some(JobState::Failed) => stats.failed = n as u64,
                    None => {}
                }
            }
            Ok(stats)
        })
    }

    /// Pending jobs due within `within` of `now`, soonest first.
    pub fn upcoming(&self, now: DateTime<Utc>, within: ChronoDuration) -> Result<Vec<DispatchJob>> {
        let horizon = now.checked_add_signed(within).ok_or_else(|| {
            FollowUpError::InvalidSchedule(format!("look-ahead {within} is out of range"))
        })?;
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs
                 WHERE state = 'pending' AND run_at <= ?1
                 ORDER BY run_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([ts(horizon)], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Terminally failed jobs, most recent first.
    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<DispatchJob>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE state = 'failed'
                 ORDER BY finished_at DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([limit as i64], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<DispatchJob> {
    let run_at: String = row.get(1)?;
    let state: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(DispatchJob {
        follow_up_id: row.get(0)?,
        run_at: parse_ts(1, &run_at)?,
        priority: row.get(2)?,
        state: JobState::parse(&state).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown job state '{state}'").into(),
            )
        })?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        last_error: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        updated_at: parse_ts(8, &updated_at)?,
        finished_at: parse_opt_ts(9, row.get(9)?)?,
    })
}
