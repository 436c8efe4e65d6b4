//! SQLite-backed directory: subject contact details, linked work state and
//! the history the timing predictor reads. Same database as the schedule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::{HistorySource, LinkedWorkLookup, SubjectDirectory};
use followup_core::types::{EngagementSample, LinkedWorkStatus, ResponseSample, SubjectProfile};
use rusqlite::{OptionalExtension, params};

use crate::db::{SchedulerDb, parse_opt_ts, parse_ts, ts};

#[derive(Clone)]
pub struct SqliteDirectory {
    db: SchedulerDb,
}

impl SqliteDirectory {
    pub fn new(db: SchedulerDb) -> Self {
        Self { db }
    }

    pub fn upsert_subject(&self, profile: &SubjectProfile) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subjects (subject_id, contact, first_name, last_name, timezone)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(subject_id) DO UPDATE SET
                    contact = excluded.contact,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    timezone = excluded.timezone",
                params![
                    profile.subject_id,
                    profile.contact,
                    profile.first_name,
                    profile.last_name,
                    profile.timezone
                ],
            )?;
            Ok(())
        })
    }

    pub fn set_work_complete(&self, linked_work_id: &str, complete: bool) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO linked_work_items (id, complete, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET complete = excluded.complete, updated_at = excluded.updated_at",
                params![linked_work_id, complete, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn record_engagement(
        &self,
        subject_id: &str,
        event_type: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO engagement_events (subject_id, event_type, occurred_at) VALUES (?1, ?2, ?3)",
                params![subject_id, event_type, ts(occurred_at)],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl SubjectDirectory for SqliteDirectory {
    async fn profile(&self, subject_id: &str) -> Result<SubjectProfile> {
        self.db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT subject_id, contact, first_name, last_name, timezone
                         FROM subjects WHERE subject_id = ?1",
                        [subject_id],
                        |r| {
                            Ok(SubjectProfile {
                                subject_id: r.get(0)?,
                                contact: r.get(1)?,
                                first_name: r.get(2)?,
                                last_name: r.get(3)?,
                                timezone: r.get(4)?,
                            })
                        },
                    )
                    .optional()?)
            })?
            .ok_or_else(|| FollowUpError::NotFound(format!("subject {subject_id}")))
    }
}

#[async_trait]
impl LinkedWorkLookup for SqliteDirectory {
    async fn status(&self, linked_work_id: &str) -> Result<LinkedWorkStatus> {
        let complete: Option<bool> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT complete FROM linked_work_items WHERE id = ?1",
                    [linked_work_id],
                    |r| r.get(0),
                )
                .optional()?)
        })?;
        complete
            .map(|complete| LinkedWorkStatus { complete })
            .ok_or_else(|| FollowUpError::NotFound(format!("linked work {linked_work_id}")))
    }
}

#[async_trait]
impl HistorySource for SqliteDirectory {
    async fn response_samples(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ResponseSample>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sent_at, response_received_at FROM follow_ups
                 WHERE subject_id = ?1 AND status = 'sent' AND sent_at IS NOT NULL AND sent_at >= ?2
                 ORDER BY sent_at ASC",
            )?;
            let rows = stmt
                .query_map(params![subject_id, ts(since)], |r| {
                    let sent: String = r.get(0)?;
                    Ok(ResponseSample {
                        sent_at: parse_ts(0, &sent)?,
                        response_received_at: parse_opt_ts(1, r.get(1)?)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn engagement_samples(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EngagementSample>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT occurred_at FROM engagement_events
                 WHERE subject_id = ?1 AND occurred_at >= ?2
                 ORDER BY occurred_at ASC",
            )?;
            let rows = stmt
                .query_map(params![subject_id, ts(since)], |r| {
                    let at: String = r.get(0)?;
                    Ok(EngagementSample {
                        occurred_at: parse_ts(0, &at)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
