//! Schedule Store: SQLite-backed source of truth for follow-up status.
//!
//! Every status change is a single conditional `UPDATE ... WHERE status = 'scheduled'`,
//! so concurrent senders race on the row and exactly one wins.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::LinkedWorkLookup;
use followup_core::types::{FollowUp, FollowUpSpec, FollowUpStatus};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::db::{SchedulerDb, parse_opt_ts, parse_ts, ts};

const SELECT_COLUMNS: &str = "id, subject_id, scheduled_time, kind, message_template, tone, \
    context_hints, personalize, status, skip_if_linked_work_done, linked_work_id, is_recurring, \
    recurrence_interval_days, next_occurrence_id, sent_at, sent_by, response_text, \
    response_received_at, created_at, updated_at";

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleCounts {
    pub scheduled_count: u64,
    pub sent_count: u64,
    pub cancelled_count: u64,
    /// Scheduled and already past their time.
    pub overdue_count: u64,
    pub next_scheduled_time: Option<DateTime<Utc>>,
}

/// Durable follow-up records plus the shared "is it due" predicate.
pub struct ScheduleStore {
    db: SchedulerDb,
    linked_work: Arc<dyn LinkedWorkLookup>,
}

impl ScheduleStore {
    pub fn new(db: SchedulerDb, linked_work: Arc<dyn LinkedWorkLookup>) -> Self {
        Self { db, linked_work }
    }

    pub fn db(&self) -> &SchedulerDb {
        &self.db
    }

    /// Insert a new scheduled record. The caller enqueues it afterwards.
    pub fn create(&self, spec: &FollowUpSpec) -> Result<FollowUp> {
        let draft = FollowUp::from_spec(spec, Utc::now())?;
        // Read back so callers see the stored (microsecond) timestamps.
        let record = self.db.with_conn(|conn| {
            insert(conn, &draft)?;
            select_one(conn, &draft.id)?.ok_or_else(|| FollowUpError::NotFound(draft.id.clone()))
        })?;
        tracing::info!(
            "📅 Follow-up created: {} ({} for {}) at {}",
            record.id,
            record.kind,
            record.subject_id,
            record.scheduled_time
        );
        Ok(record)
    }

    pub fn find(&self, id: &str) -> Result<Option<FollowUp>> {
        self.db.with_conn(|conn| select_one(conn, id))
    }

    pub fn get(&self, id: &str) -> Result<FollowUp> {
        self.find(id)?
            .ok_or_else(|| FollowUpError::NotFound(id.to_string()))
    }

    /// Due records as of now. See [`ScheduleStore::list_due_at`].
    pub async fn list_due(&self, limit: usize) -> Result<Vec<FollowUp>> {
        self.list_due_at(Utc::now(), limit).await
    }

    /// Scheduled records with `scheduled_time <= now`, oldest first, excluding
    /// those suppressed by completed linked work.
    pub async fn list_due_at(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUp>> {
        self.collect_due(now, limit, "").await
    }

    /// Due records the sweeper may still act on: those whose dispatch job
    /// failed terminally are left for an operator.
    pub async fn list_sweepable_at(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<FollowUp>> {
        self.collect_due(
            now,
            limit,
            "AND NOT EXISTS (SELECT 1 FROM dispatch_jobs j
                 WHERE j.follow_up_id = follow_ups.id AND j.state = 'failed')",
        )
        .await
    }

    async fn collect_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        extra_filter: &str,
    ) -> Result<Vec<FollowUp>> {
        let mut due = Vec::new();
        if limit == 0 {
            return Ok(due);
        }
        let page_size = limit.max(50);
        let mut offset = 0;
        loop {
            let page = self.db.with_conn(|conn| {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM follow_ups
                     WHERE status = 'scheduled' AND scheduled_time <= ?1 {extra_filter}
                     ORDER BY scheduled_time ASC, id ASC LIMIT ?2 OFFSET ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![ts(now), page_size as i64, offset as i64], row_to_follow_up)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })?;
            let fetched = page.len();
            for record in page {
                if self.suppressed_by_linked_work(&record).await {
                    continue;
                }
                due.push(record);
                if due.len() == limit {
                    return Ok(due);
                }
            }
            if fetched < page_size {
                return Ok(due);
            }
            offset += fetched;
        }
    }

    /// True when `skip_if_linked_work_done` applies and the work is complete.
    /// Unknown or unreachable work counts as not complete.
    pub async fn suppressed_by_linked_work(&self, record: &FollowUp) -> bool {
        if !record.skip_if_linked_work_done {
            return false;
        }
        let Some(work_id) = record.linked_work_id.as_deref() else {
            return false;
        };
        match self.linked_work.status(work_id).await {
            Ok(status) => status.complete,
            Err(FollowUpError::NotFound(_)) => false,
            Err(e) => {
                tracing::warn!(
                    "⚠️ Linked work lookup failed for {} ({}): {e}; treating as not complete",
                    record.id,
                    work_id
                );
                false
            }
        }
    }

    /// Transition to sent. Returns the current record and whether this call won
    /// the transition. A recurring record gets its successor in the same transaction.
    pub fn mark_sent(&self, id: &str, sent_by: &str) -> Result<(FollowUp, bool)> {
        self.mark_sent_at(id, sent_by, Utc::now())
    }

    pub fn mark_sent_at(
        &self,
        id: &str,
        sent_by: &str,
        now: DateTime<Utc>,
    ) -> Result<(FollowUp, bool)> {
        let (record, won, successor) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE follow_ups SET status = 'sent', sent_at = ?1, sent_by = ?2, updated_at = ?1
                 WHERE id = ?3 AND status = 'scheduled'",
                params![ts(now), sent_by, id],
            )?;
            if changed == 0 {
                let current = select_one(&tx, id)?
                    .ok_or_else(|| FollowUpError::NotFound(id.to_string()))?;
                return Ok((current, false, None));
            }

            let mut record = select_one(&tx, id)?
                .ok_or_else(|| FollowUpError::NotFound(id.to_string()))?;
            let successor = record.successor(now);
            if let Some(next) = &successor {
                insert(&tx, next)?;
                tx.execute(
                    "UPDATE follow_ups SET next_occurrence_id = ?1 WHERE id = ?2",
                    params![next.id, id],
                )?;
                record.next_occurrence_id = Some(next.id.clone());
            }
            tx.commit()?;
            Ok((record, true, successor))
        })?;

        if won {
            tracing::info!("✅ Follow-up {} marked sent by {}", id, sent_by);
            if let Some(next) = successor {
                tracing::info!(
                    "🔁 Recurring follow-up {} chained to {} at {}",
                    id,
                    next.id,
                    next.scheduled_time
                );
            }
        } else {
            tracing::debug!("Follow-up {} already {}, mark_sent is a no-op", id, record.status);
        }
        Ok((record, won))
    }

    /// The successor created for `record`, if any.
    pub fn next_occurrence(&self, record: &FollowUp) -> Result<Option<FollowUp>> {
        match record.next_occurrence_id.as_deref() {
            Some(next_id) => self.find(next_id),
            None => Ok(None),
        }
    }

    /// Cancel a scheduled record. No-op on terminal records.
    pub fn cancel(&self, id: &str) -> Result<FollowUp> {
        let (record, changed) = self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE follow_ups SET status = 'cancelled', updated_at = ?1
                 WHERE id = ?2 AND status = 'scheduled'",
                params![ts(Utc::now()), id],
            )?;
            let record = select_one(conn, id)?
                .ok_or_else(|| FollowUpError::NotFound(id.to_string()))?;
            Ok((record, changed > 0))
        })?;
        if changed {
            tracing::info!("🚫 Follow-up cancelled: {}", id);
        }
        Ok(record)
    }

    /// Store a reply. Allowed in any status; replies arrive after the send.
    pub fn record_response(&self, id: &str, text: &str) -> Result<FollowUp> {
        self.record_response_at(id, text, Utc::now())
    }

    pub fn record_response_at(&self, id: &str, text: &str, at: DateTime<Utc>) -> Result<FollowUp> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE follow_ups SET response_text = ?1, response_received_at = ?2, updated_at = ?2
                 WHERE id = ?3",
                params![text, ts(at), id],
            )?;
            if changed == 0 {
                return Err(FollowUpError::NotFound(id.to_string()));
            }
            select_one(conn, id)?.ok_or_else(|| FollowUpError::NotFound(id.to_string()))
        })
    }

    /// Records for a subject, newest `scheduled_time` first.
    pub fn list_for_subject(
        &self,
        subject_id: &str,
        status: Option<FollowUpStatus>,
        limit: usize,
    ) -> Result<Vec<FollowUp>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM follow_ups
                 WHERE subject_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY scheduled_time DESC LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![subject_id, status.map(|s| s.as_str()), limit as i64],
                    row_to_follow_up,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Scheduled records that should be dropped once `linked_work_id` completes.
    pub fn scheduled_for_linked_work(&self, linked_work_id: &str) -> Result<Vec<FollowUp>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM follow_ups
                 WHERE linked_work_id = ?1 AND status = 'scheduled' AND skip_if_linked_work_done = 1
                 ORDER BY scheduled_time ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([linked_work_id], row_to_follow_up)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Scheduled records without any row in the dispatch queue.
    pub fn scheduled_without_job(&self) -> Result<Vec<FollowUp>> {
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM follow_ups f
                 WHERE f.status = 'scheduled'
                   AND NOT EXISTS (SELECT 1 FROM dispatch_jobs j WHERE j.follow_up_id = f.id)
                 ORDER BY f.scheduled_time ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_follow_up)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn counts(&self, now: DateTime<Utc>) -> Result<ScheduleCounts> {
        self.db.with_conn(|conn| {
            let (scheduled, sent, cancelled, overdue, next): (i64, i64, i64, i64, Option<String>) =
                conn.query_row(
                    "SELECT
                        COALESCE(SUM(status = 'scheduled'), 0),
                        COALESCE(SUM(status = 'sent'), 0),
                        COALESCE(SUM(status = 'cancelled'), 0),
                        COALESCE(SUM(status = 'scheduled' AND scheduled_time <= ?1), 0),
                        MIN(CASE WHEN status = 'scheduled' AND scheduled_time > ?1 THEN scheduled_time END)
                     FROM follow_ups",
                    [ts(now)],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )?;
            Ok(ScheduleCounts {
                scheduled_count: scheduled as u64,
                sent_count: sent as u64,
                cancelled_count: cancelled as u64,
                overdue_count: overdue as u64,
                next_scheduled_time: parse_opt_ts(4, next)?,
            })
        })
    }
}

fn insert(conn: &rusqlite::Connection, f: &FollowUp) -> Result<()> {
    conn.execute(
        "INSERT INTO follow_ups
         (id, subject_id, scheduled_time, kind, message_template, tone, context_hints, personalize,
          status, skip_if_linked_work_done, linked_work_id, is_recurring, recurrence_interval_days,
          next_occurrence_id, sent_at, sent_by, response_text, response_received_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            f.id,
            f.subject_id,
            ts(f.scheduled_time),
            f.kind,
            f.message_template,
            f.tone,
            f.context_hints.to_string(),
            f.personalize as i32,
            f.status.as_str(),
            f.skip_if_linked_work_done as i32,
            f.linked_work_id,
            f.is_recurring as i32,
            f.recurrence_interval_days,
            f.next_occurrence_id,
            f.sent_at.map(ts),
            f.sent_by,
            f.response_text,
            f.response_received_at.map(ts),
            ts(f.created_at),
            ts(f.updated_at),
        ],
    )?;
    Ok(())
}

fn select_one(conn: &rusqlite::Connection, id: &str) -> Result<Option<FollowUp>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM follow_ups WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_follow_up).optional()?)
}

fn row_to_follow_up(row: &rusqlite::Row<'_>) -> rusqlite::Result<FollowUp> {
    let scheduled_time: String = row.get(2)?;
    let hints: String = row.get(6)?;
    let status: String = row.get(8)?;
    let created_at: String = row.get(18)?;
    let updated_at: String = row.get(19)?;

    Ok(FollowUp {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        scheduled_time: parse_ts(2, &scheduled_time)?,
        kind: row.get(3)?,
        message_template: row.get(4)?,
        tone: row.get(5)?,
        context_hints: serde_json::from_str(&hints).unwrap_or_else(|_| serde_json::json!({})),
        personalize: row.get::<_, i32>(7)? != 0,
        status: FollowUpStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
        skip_if_linked_work_done: row.get::<_, i32>(9)? != 0,
        linked_work_id: row.get(10)?,
        is_recurring: row.get::<_, i32>(11)? != 0,
        recurrence_interval_days: row.get(12)?,
        next_occurrence_id: row.get(13)?,
        sent_at: parse_opt_ts(14, row.get(14)?)?,
        sent_by: row.get(15)?,
        response_text: row.get(16)?,
        response_received_at: parse_opt_ts(17, row.get(17)?)?,
        created_at: parse_ts(18, &created_at)?,
        updated_at: parse_ts(19, &updated_at)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use followup_core::types::LinkedWorkStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Linked-work lookup backed by a map; unknown ids are NotFound.
    #[derive(Default)]
    pub(crate) struct StaticWork(pub Mutex<HashMap<String, bool>>);

    impl StaticWork {
        pub(crate) fn set(&self, id: &str, complete: bool) {
            self.0.lock().unwrap().insert(id.to_string(), complete);
        }
    }

    #[async_trait]
    impl LinkedWorkLookup for StaticWork {
        async fn status(&self, linked_work_id: &str) -> Result<LinkedWorkStatus> {
            self.0
                .lock()
                .unwrap()
                .get(linked_work_id)
                .map(|c| LinkedWorkStatus { complete: *c })
                .ok_or_else(|| FollowUpError::NotFound(linked_work_id.to_string()))
        }
    }

    fn store() -> (ScheduleStore, Arc<StaticWork>) {
        let work = Arc::new(StaticWork::default());
        let db = SchedulerDb::open_in_memory().unwrap();
        (ScheduleStore::new(db, work.clone()), work)
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (store, _) = store();
        let spec = FollowUpSpec::at("sub-1", "check_in", "Hi {first_name}", base())
            .with_hints(serde_json::json!({"topic": "onboarding"}));
        let created = store.create(&spec).unwrap();
        let loaded = store.get(&created.id).unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.status, FollowUpStatus::Scheduled);
        assert_eq!(loaded.context_hints["topic"], "onboarding");
        assert!(matches!(store.get("nope"), Err(FollowUpError::NotFound(_))));
    }

    #[test]
    fn test_mark_sent_is_idempotent() {
        let (store, _) = store();
        let f = store.create(&FollowUpSpec::at("sub-1", "check_in", "Hi", base())).unwrap();

        let (first, won) = store.mark_sent_at(&f.id, "scheduler", base()).unwrap();
        assert!(won);
        assert_eq!(first.status, FollowUpStatus::Sent);
        assert_eq!(first.sent_by.as_deref(), Some("scheduler"));

        let (second, won_again) = store
            .mark_sent_at(&f.id, "queue_worker", base() + Duration::minutes(1))
            .unwrap();
        assert!(!won_again);
        assert_eq!(second, first);
    }

    #[test]
    fn test_recurring_chain_single_successor() {
        let (store, _) = store();
        let f = store
            .create(&FollowUpSpec::at("sub-1", "check_in", "Weekly", base()).recurring(7))
            .unwrap();

        let (sent, _) = store.mark_sent_at(&f.id, "scheduler", base()).unwrap();
        let next = store.next_occurrence(&sent).unwrap().unwrap();
        assert_eq!(next.scheduled_time, base() + Duration::days(7));
        assert_eq!(next.status, FollowUpStatus::Scheduled);
        assert!(next.next_occurrence_id.is_none());

        store.mark_sent_at(&f.id, "scheduler", base()).unwrap();
        let scheduled = store
            .list_for_subject("sub-1", Some(FollowUpStatus::Scheduled), 10)
            .unwrap();
        assert_eq!(scheduled.len(), 1);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (store, _) = store();
        let f = store.create(&FollowUpSpec::at("sub-1", "check_in", "Hi", base())).unwrap();
        let cancelled = store.cancel(&f.id).unwrap();
        assert_eq!(cancelled.status, FollowUpStatus::Cancelled);

        let (after, won) = store.mark_sent(&f.id, "scheduler").unwrap();
        assert!(!won);
        assert_eq!(after.status, FollowUpStatus::Cancelled);
        assert!(after.sent_at.is_none());

        let g = store.create(&FollowUpSpec::at("sub-1", "check_in", "Hi", base())).unwrap();
        store.mark_sent(&g.id, "scheduler").unwrap();
        assert_eq!(store.cancel(&g.id).unwrap().status, FollowUpStatus::Sent);
    }

    #[tokio::test]
    async fn test_list_due_predicate() {
        let (store, work) = store();
        let now = base();
        let past = store
            .create(&FollowUpSpec::at("sub-1", "check_in", "a", now - Duration::minutes(5)))
            .unwrap();
        let older = store
            .create(&FollowUpSpec::at("sub-1", "check_in", "b", now - Duration::hours(1)))
            .unwrap();
        store
            .create(&FollowUpSpec::at("sub-1", "check_in", "future", now + Duration::minutes(5)))
            .unwrap();
        let done = store
            .create(
                &FollowUpSpec::at("sub-1", "reminder", "c", now - Duration::minutes(1))
                    .linked_to("task-1", true),
            )
            .unwrap();
        let unknown = store
            .create(
                &FollowUpSpec::at("sub-1", "reminder", "d", now - Duration::minutes(2))
                    .linked_to("task-missing", true),
            )
            .unwrap();
        let not_skipping = store
            .create(
                &FollowUpSpec::at("sub-1", "reminder", "e", now - Duration::minutes(3))
                    .linked_to("task-1", false),
            )
            .unwrap();
        work.set("task-1", true);

        let due = store.list_due_at(now, 10).await.unwrap();
        let ids: Vec<_> = due.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec![older.id.as_str(), past.id.as_str(), not_skipping.id.as_str(), unknown.id.as_str()]);
        assert!(!ids.contains(&done.id.as_str()));
        assert!(due.iter().all(|f| f.scheduled_time <= now));

        let limited = store.list_due_at(now, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_record_response_any_status() {
        let (store, _) = store();
        let f = store.create(&FollowUpSpec::at("sub-1", "check_in", "Hi", base())).unwrap();
        store.mark_sent_at(&f.id, "scheduler", base()).unwrap();
        let r = store
            .record_response_at(&f.id, "thanks!", base() + Duration::minutes(3))
            .unwrap();
        assert_eq!(r.response_text.as_deref(), Some("thanks!"));
        assert_eq!(r.status, FollowUpStatus::Sent);
        assert!(store.record_response("missing", "x").is_err());
    }

    #[test]
    fn test_counts() {
        let (store, _) = store();
        let now = base();
        store.create(&FollowUpSpec::at("s", "check_in", "a", now - Duration::minutes(1))).unwrap();
        let later = now + Duration::hours(2);
        store.create(&FollowUpSpec::at("s", "check_in", "b", later)).unwrap();
        let c = store.create(&FollowUpSpec::at("s", "check_in", "c", now)).unwrap();
        store.cancel(&c.id).unwrap();

        let counts = store.counts(now).unwrap();
        assert_eq!(counts.scheduled_count, 2);
        assert_eq!(counts.cancelled_count, 1);
        assert_eq!(counts.sent_count, 0);
        assert_eq!(counts.overdue_count, 1);
        assert_eq!(counts.next_scheduled_time, Some(later));
    }
}
