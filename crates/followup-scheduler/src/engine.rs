//! Follow-up scheduler: composes store, queue, predictor, send operation,
//! worker pool and sweeper behind one handle, and owns their background tasks.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use followup_core::config::FollowUpConfig;
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::{
    DeliveryChannel, HistorySource, LinkedWorkLookup, Personalizer, SubjectDirectory,
};
use followup_core::types::{
    FollowUp, FollowUpSpec, FollowUpStatus, ScheduleTime, SendSource, TimingPrediction,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::SchedulerDb;
use crate::directory::SqliteDirectory;
use crate::jobs::{DispatchJob, FailureOutcome};
use crate::notify::{AlertLog, OperatorAlert};
use crate::persistence::{ScheduleCounts, ScheduleStore};
use crate::queue::{DispatchQueue, QueueStats, SweepClaim};
use crate::send::{SendOperation, SendOutcome, SendTimeouts};
use crate::sweeper::{ProactiveSweeper, SweepReport};
use crate::throttle::DeliveryThrottle;
use crate::timing::{self, HourlyResponseStats};
use crate::worker::{WorkerPool, WorkerStats};

const RECENT_ALERTS: usize = 20;

/// Start of a `days`-long history window ending at `now`.
fn look_back(now: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    ChronoDuration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| FollowUpError::Config(format!("history window of {days} days is out of range")))
}

/// External collaborators the scheduler needs.
pub struct Collaborators {
    pub subjects: Arc<dyn SubjectDirectory>,
    pub linked_work: Arc<dyn LinkedWorkLookup>,
    pub history: Arc<dyn HistorySource>,
    pub personalizer: Arc<dyn Personalizer>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

impl Collaborators {
    /// Subjects, linked work and history from the scheduler's own database.
    pub fn sqlite(
        db: &SchedulerDb,
        personalizer: Arc<dyn Personalizer>,
        delivery: Arc<dyn DeliveryChannel>,
    ) -> Self {
        let directory = Arc::new(SqliteDirectory::new(db.clone()));
        Self {
            subjects: directory.clone(),
            linked_work: directory.clone(),
            history: directory,
            personalizer,
            delivery,
        }
    }
}

/// Snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    #[serde(flatten)]
    pub counts: ScheduleCounts,
    pub queue: QueueStats,
    pub workers: WorkerStats,
    pub alert_count: usize,
    pub recent_alerts: Vec<OperatorAlert>,
}

/// Learned contact-time profile for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct TimingProfile {
    pub subject_id: String,
    pub prediction: TimingPrediction,
    /// morning / afternoon / evening / night
    pub preferred_period: &'static str,
    pub next_slot: DateTime<Utc>,
    pub hourly: Vec<HourlyResponseStats>,
}

pub struct FollowUpScheduler {
    config: FollowUpConfig,
    store: Arc<ScheduleStore>,
    queue: Arc<DispatchQueue>,
    send: Arc<SendOperation>,
    workers: Arc<WorkerPool>,
    sweeper: Arc<ProactiveSweeper>,
    history: Arc<dyn HistorySource>,
    alerts: Arc<AlertLog>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FollowUpScheduler {
    pub fn new(config: FollowUpConfig, db: SchedulerDb, collaborators: Collaborators) -> Self {
        let store = Arc::new(ScheduleStore::new(db.clone(), collaborators.linked_work));
        let queue = Arc::new(DispatchQueue::from_config(db, &config.queue));
        let alerts = Arc::new(AlertLog::new());
        let send = Arc::new(SendOperation::new(
            store.clone(),
            collaborators.subjects,
            collaborators.personalizer,
            collaborators.delivery,
            Arc::new(DeliveryThrottle::per_minute(config.delivery.max_per_minute)),
            alerts.clone(),
            SendTimeouts {
                personalize: Duration::from_millis(config.personalization.timeout_ms),
                deliver: Duration::from_millis(config.delivery.timeout_ms),
            },
        ));
        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            send.clone(),
            alerts.clone(),
            config.worker.concurrency,
            Duration::from_millis(config.worker.poll_interval_ms),
        ));
        let sweeper = Arc::new(ProactiveSweeper::new(
            send.clone(),
            queue.clone(),
            config.sweeper.batch_limit,
            Duration::from_millis(config.sweeper.inter_send_delay_ms),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            queue,
            send,
            workers,
            sweeper,
            history: collaborators.history,
            alerts,
            shutdown,
            started: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn send_operation(&self) -> &Arc<SendOperation> {
        &self.send
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    // ── Scheduling ─────────────────────────────────────────

    /// Create a follow-up and register it with the dispatch queue.
    ///
    /// `ScheduleTime::Optimal` is resolved through the timing predictor first.
    /// A failed enqueue is logged, not returned: the sweeper and startup
    /// reconciliation still pick the record up.
    pub async fn schedule(&self, spec: FollowUpSpec) -> Result<FollowUp> {
        spec.validate()?;
        let mut spec = spec;
        if matches!(spec.scheduled_time, ScheduleTime::Optimal) {
            let now = Utc::now();
            let prediction = match self.predict_at(&spec.subject_id, now).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(
                        "⚠️ History unavailable for {}: {e}; using default send time",
                        spec.subject_id
                    );
                    timing::predict(&[], &[], now, &self.config.predictor)
                }
            };
            let at = timing::slot_for(&prediction, now);
            tracing::info!(
                "🔮 Optimal time for {}: {} ({}, confidence {})",
                spec.subject_id,
                at,
                prediction.source.as_str(),
                prediction.confidence
            );
            spec.scheduled_time = ScheduleTime::At(at);
        }

        let record = self.store.create(&spec)?;
        if let Err(e) = self.queue.enqueue_follow_up(&record) {
            tracing::warn!("⚠️ Enqueue failed for {}: {e}; sweeper will pick it up", record.id);
        }
        Ok(record)
    }

    /// Cancel a follow-up and drop its pending job. A job already running
    /// finishes its attempt and sees the cancelled status.
    pub fn cancel(&self, id: &str) -> Result<FollowUp> {
        let record = self.store.cancel(id)?;
        self.queue.cancel(id)?;
        Ok(record)
    }

    /// Cancel `id` and schedule a copy of it (new id) at `at`.
    pub fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<FollowUp> {
        let current = self.store.get(id)?;
        if !current.is_scheduled() {
            return Err(FollowUpError::InvalidSchedule(format!(
                "follow-up {id} is {} and cannot be rescheduled",
                current.status
            )));
        }
        self.cancel(id)?;
        let record = self.store.create(&current.to_spec(at))?;
        if let Err(e) = self.queue.enqueue_follow_up(&record) {
            tracing::warn!("⚠️ Enqueue failed for {}: {e}; sweeper will pick it up", record.id);
        }
        tracing::info!("🔁 Follow-up {} rescheduled as {} at {}", id, record.id, at);
        Ok(record)
    }

    pub fn record_response(&self, id: &str, text: &str) -> Result<FollowUp> {
        self.store.record_response(id, text)
    }

    /// Cancel every pending follow-up waiting on `linked_work_id`.
    pub fn cancel_for_completed_work(&self, linked_work_id: &str) -> Result<usize> {
        let pending = self.store.scheduled_for_linked_work(linked_work_id)?;
        let mut cancelled = 0;
        for record in &pending {
            if self.cancel(&record.id)?.status == FollowUpStatus::Cancelled {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!(
                "🚫 {} follow-up(s) cancelled: linked work {} complete",
                cancelled,
                linked_work_id
            );
        }
        Ok(cancelled)
    }

    // ── Queries ────────────────────────────────────────────

    pub async fn list_due(&self, limit: usize) -> Result<Vec<FollowUp>> {
        self.store.list_due(limit).await
    }

    pub fn for_subject(
        &self,
        subject_id: &str,
        status: Option<FollowUpStatus>,
        limit: usize,
    ) -> Result<Vec<FollowUp>> {
        self.store.list_for_subject(subject_id, status, limit)
    }

    pub fn stats(&self) -> Result<SchedulerStats> {
        Ok(SchedulerStats {
            counts: self.store.counts(Utc::now())?,
            queue: self.queue.stats()?,
            workers: self.workers.stats(),
            alert_count: self.alerts.len(),
            recent_alerts: self.alerts.recent(RECENT_ALERTS),
        })
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats()
    }

    /// Jobs due within `within` (24h when `None`).
    pub fn upcoming_jobs(&self, within: Option<ChronoDuration>) -> Result<Vec<DispatchJob>> {
        self.queue
            .upcoming(Utc::now(), within.unwrap_or_else(|| ChronoDuration::hours(24)))
    }

    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<DispatchJob>> {
        self.queue.failed_jobs(limit)
    }

    /// Best send time for a subject from its response and engagement history.
    pub async fn predict(&self, subject_id: &str) -> Result<TimingPrediction> {
        self.predict_at(subject_id, Utc::now()).await
    }

    /// Prediction plus the per-hour response history behind it.
    pub async fn timing_profile(&self, subject_id: &str) -> Result<TimingProfile> {
        let now = Utc::now();
        let since = look_back(now, self.config.predictor.response_window_days)?;
        let responses = self.history.response_samples(subject_id, since).await?;
        let prediction = self.predict_at(subject_id, now).await?;
        Ok(TimingProfile {
            subject_id: subject_id.to_string(),
            preferred_period: timing::time_period(prediction.hour),
            next_slot: timing::slot_for(&prediction, now),
            hourly: timing::hourly_response_stats(&responses),
            prediction,
        })
    }

    async fn predict_at(&self, subject_id: &str, now: DateTime<Utc>) -> Result<TimingPrediction> {
        let cfg = &self.config.predictor;
        let responses = self
            .history
            .response_samples(subject_id, look_back(now, cfg.response_window_days)?)
            .await?;
        let engagements = self
            .history
            .engagement_samples(subject_id, look_back(now, cfg.engagement_window_days)?)
            .await?;
        Ok(timing::predict(&responses, &engagements, now, cfg))
    }

    // ── Dispatch ───────────────────────────────────────────

    /// One synchronous sweeper pass.
    pub async fn process_due(&self) -> Result<SweepReport> {
        self.sweeper.run_once().await
    }

    /// Operator-triggered send that ignores the scheduled time. Refused while a
    /// worker or the sweeper holds the follow-up's queue job.
    pub async fn send_now(&self, id: &str) -> Result<SendOutcome> {
        let claim = self.queue.claim_for_sweep(id, Utc::now())?;
        if claim == SweepClaim::Running {
            return Err(FollowUpError::Queue(format!(
                "follow-up {id} is already being sent"
            )));
        }
        let result = self.send.execute(id, SendSource::Manual).await;
        match (&result, claim) {
            (Ok(outcome), claim) => {
                if let SendOutcome::Sent(sent) = outcome {
                    self.send.enqueue_successor(&self.queue, sent);
                }
                if matches!(claim, SweepClaim::Claimed(_)) {
                    self.queue.complete(id)?;
                } else {
                    self.queue.cancel(id)?;
                }
            }
            (Err(e), SweepClaim::Claimed(job)) => {
                if let FailureOutcome::Exhausted { attempts } = self.queue.fail(&job, e, Utc::now())? {
                    self.alerts.raise_for_failure(id, e, attempts);
                }
            }
            (Err(_), _) => {}
        }
        result
    }

    /// Recover jobs a crashed process left running and enqueue scheduled
    /// records that have no job. Returns how many were enqueued.
    pub fn reconcile(&self) -> Result<usize> {
        let recovered = self.queue.recover_interrupted()?;
        let orphans = self.store.scheduled_without_job()?;
        let mut enqueued = 0;
        for record in &orphans {
            match self.queue.enqueue_follow_up(record) {
                Ok(()) => enqueued += 1,
                Err(e) => tracing::warn!("⚠️ Reconcile could not enqueue {}: {e}", record.id),
            }
        }
        tracing::info!(
            "🔄 Queue reconciled: {} interrupted job(s) recovered, {} record(s) enqueued",
            recovered,
            enqueued
        );
        Ok(enqueued)
    }

    /// Reconcile, then start workers, the periodic sweeper and queue pruning.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FollowUpError::Queue("scheduler already started".into()));
        }
        self.reconcile()?;

        let mut handles = self.workers.clone().spawn(self.shutdown.subscribe());
        if self.config.sweeper.enabled {
            handles.push(self.sweeper.clone().spawn(
                Duration::from_secs(self.config.sweeper.interval_secs.max(1)),
                self.shutdown.subscribe(),
            ));
        }
        handles.push(spawn_pruner(
            self.queue.clone(),
            Duration::from_secs(self.config.queue.prune_interval_secs.max(1)),
            self.shutdown.subscribe(),
        ));

        if let Ok(mut slot) = self.handles.lock() {
            slot.extend(handles);
        }
        tracing::info!("🚀 Follow-up scheduler started");
        Ok(())
    }

    /// Signal every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles = match self.handles.lock() {
            Ok(mut slot) => std::mem::take(&mut *slot),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Background task ended abnormally: {e}");
            }
        }
        self.started.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(false);
        tracing::info!("🛑 Follow-up scheduler stopped");
    }
}

fn spawn_pruner(
    queue: Arc<DispatchQueue>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue.prune(Utc::now()) {
                        Ok(0) => {}
                        Ok(n) => tracing::debug!("🧽 Pruned {} finished job(s)", n),
                        Err(e) => tracing::warn!("⚠️ Queue prune failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::StaticWork;
    use crate::send::tests::{Directory, Echo, RecordingChannel};
    use chrono::{Datelike, SubsecRound, Timelike};
    use followup_core::types::{EngagementSample, ResponseSample};

    struct History {
        responses: Vec<ResponseSample>,
        engagements: Vec<EngagementSample>,
    }

    #[async_trait::async_trait]
    impl HistorySource for History {
        async fn response_samples(
            &self,
            _subject_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<ResponseSample>> {
            Ok(self.responses.clone())
        }
        async fn engagement_samples(
            &self,
            _subject_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<EngagementSample>> {
            Ok(self.engagements.clone())
        }
    }

    fn scheduler(
        history: History,
        channel: Arc<RecordingChannel>,
    ) -> (FollowUpScheduler, Arc<StaticWork>) {
        let work = Arc::new(StaticWork::default());
        let mut config = FollowUpConfig::default();
        config.worker.poll_interval_ms = 20;
        config.sweeper.inter_send_delay_ms = 0;
        config.sweeper.enabled = false;
        let sched = FollowUpScheduler::new(
            config,
            SchedulerDb::open_in_memory().unwrap(),
            Collaborators {
                subjects: Arc::new(Directory),
                linked_work: work.clone(),
                history: Arc::new(history),
                personalizer: Arc::new(Echo),
                delivery: channel,
            },
        );
        (sched, work)
    }

    fn empty() -> History {
        History {
            responses: vec![],
            engagements: vec![],
        }
    }

    #[test]
    fn test_look_back_rejects_out_of_range_windows() {
        let now = Utc::now();
        assert_eq!(look_back(now, 90).unwrap(), now - ChronoDuration::days(90));
        assert!(matches!(look_back(now, i64::MAX), Err(FollowUpError::Config(_))));
    }

    #[tokio::test]
    async fn test_schedule_enqueues_with_kind_priority() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let at = (Utc::now() + ChronoDuration::hours(2)).trunc_subsecs(6);
        let f = s.schedule(FollowUpSpec::at("sub-1", "survey", "Rate us", at)).await.unwrap();

        let job = s.queue().job(&f.id).unwrap().unwrap();
        assert_eq!(job.priority, 8);
        assert_eq!(job.run_at, at);
        assert_eq!(s.upcoming_jobs(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_optimal_schedule_uses_default_hour_without_history() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let f = s
            .schedule(FollowUpSpec::optimal("sub-1", "check_in", "Hi"))
            .await
            .unwrap();
        assert_eq!(f.scheduled_time.hour(), 10);
        assert_eq!(f.scheduled_time.minute(), 0);
        assert!(f.scheduled_time > Utc::now());
    }

    #[tokio::test]
    async fn test_optimal_schedule_learns_from_responses() {
        let base = Utc::now() - ChronoDuration::days(7);
        let base = base.date_naive().and_hms_opt(15, 0, 0).unwrap().and_utc();
        let responses = (0..6)
            .map(|i| ResponseSample {
                sent_at: base - ChronoDuration::days(7 * i),
                response_received_at: Some(base - ChronoDuration::days(7 * i) + ChronoDuration::minutes(5)),
            })
            .collect();
        let history = History {
            responses,
            engagements: vec![],
        };
        let (s, _) = scheduler(history, Arc::new(RecordingChannel::default()));

        let prediction = s.predict("sub-1").await.unwrap();
        assert_eq!(prediction.hour, 15);
        assert_eq!(prediction.day_of_week, Some(base.weekday().num_days_from_sunday()));

        let profile = s.timing_profile("sub-1").await.unwrap();
        assert_eq!(profile.preferred_period, "afternoon");
        assert_eq!(profile.hourly.len(), 1);
        assert_eq!(profile.hourly[0].hour, 15);
        assert_eq!(profile.hourly[0].responded, 6);

        let f = s
            .schedule(FollowUpSpec::optimal("sub-1", "check_in", "Hi"))
            .await
            .unwrap();
        assert_eq!(f.scheduled_time.hour(), 15);
        assert_eq!(f.scheduled_time.weekday(), base.weekday());
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_job() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let f = s
            .schedule(FollowUpSpec::at("sub-1", "check_in", "Hi", Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();
        let cancelled = s.cancel(&f.id).unwrap();
        assert_eq!(cancelled.status, FollowUpStatus::Cancelled);
        assert!(s.queue().job(&f.id).unwrap().is_none());
        // Second cancel is a no-op.
        assert_eq!(s.cancel(&f.id).unwrap().status, FollowUpStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_record() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let f = s
            .schedule(
                FollowUpSpec::at("sub-1", "reminder", "Hi", Utc::now() + ChronoDuration::hours(1))
                    .with_tone("warm"),
            )
            .await
            .unwrap();
        let at = (Utc::now() + ChronoDuration::days(2)).trunc_subsecs(6);
        let moved = s.reschedule(&f.id, at).unwrap();

        assert_ne!(moved.id, f.id);
        assert_eq!(moved.scheduled_time, at);
        assert_eq!(moved.tone, "warm");
        assert_eq!(s.store().get(&f.id).unwrap().status, FollowUpStatus::Cancelled);
        assert!(s.queue().job(&moved.id).unwrap().is_some());
        assert!(matches!(
            s.reschedule(&f.id, at),
            Err(FollowUpError::InvalidSchedule(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_for_completed_work() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let later = Utc::now() + ChronoDuration::hours(3);
        s.schedule(FollowUpSpec::at("sub-1", "reminder", "a", later).linked_to("w1", true))
            .await
            .unwrap();
        s.schedule(FollowUpSpec::at("sub-1", "reminder", "b", later).linked_to("w1", true))
            .await
            .unwrap();
        let keep = s
            .schedule(FollowUpSpec::at("sub-1", "reminder", "c", later).linked_to("w1", false))
            .await
            .unwrap();

        assert_eq!(s.cancel_for_completed_work("w1").unwrap(), 2);
        assert_eq!(s.queue_stats().unwrap().pending, 1);
        assert!(s.store().get(&keep.id).unwrap().is_scheduled());
    }

    #[tokio::test]
    async fn test_send_now_refuses_job_a_worker_holds() {
        let channel = Arc::new(RecordingChannel::default());
        let (s, _) = scheduler(empty(), channel.clone());
        let f = s
            .schedule(FollowUpSpec::at("sub-1", "check_in", "Hi", Utc::now() - ChronoDuration::minutes(1)))
            .await
            .unwrap();
        s.queue().claim_next(Utc::now()).unwrap().unwrap();

        assert!(matches!(s.send_now(&f.id).await, Err(FollowUpError::Queue(_))));
        assert_eq!(channel.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_now_ahead_of_schedule() {
        let channel = Arc::new(RecordingChannel::default());
        let (s, _) = scheduler(empty(), channel.clone());
        let f = s
            .schedule(FollowUpSpec::at("sub-1", "check_in", "Hi", Utc::now() + ChronoDuration::days(2)))
            .await
            .unwrap();

        let outcome = s.send_now(&f.id).await.unwrap();
        assert_eq!(outcome.label(), "sent");
        assert_eq!(s.store().get(&f.id).unwrap().sent_by.as_deref(), Some("manual_admin"));
        assert!(s.queue().job(&f.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_enqueues_orphans() {
        let (s, _) = scheduler(empty(), Arc::new(RecordingChannel::default()));
        let orphan = s
            .store()
            .create(&FollowUpSpec::at("sub-1", "check_in", "x", Utc::now()))
            .unwrap();
        assert!(s.queue().job(&orphan.id).unwrap().is_none());
        assert_eq!(s.reconcile().unwrap(), 1);
        assert!(s.queue().job(&orphan.id).unwrap().is_some());
        assert_eq!(s.reconcile().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_delivers_and_chains_recurrence() {
        let channel = Arc::new(RecordingChannel::default());
        let (s, _) = scheduler(empty(), channel.clone());
        let f = s
            .schedule(
                FollowUpSpec::at("sub-1", "check_in", "Weekly", Utc::now() - ChronoDuration::seconds(1))
                    .recurring(7),
            )
            .await
            .unwrap();

        s.start().unwrap();
        assert!(s.start().is_err());
        for _ in 0..100 {
            if s.store().get(&f.id).unwrap().status == FollowUpStatus::Sent {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.shutdown().await;

        let sent = s.store().get(&f.id).unwrap();
        assert_eq!(sent.status, FollowUpStatus::Sent);
        let next_id = sent.next_occurrence_id.unwrap();
        let job = s.queue().job(&next_id).unwrap().unwrap();
        assert_eq!(job.run_at, f.scheduled_time + ChronoDuration::days(7));

        let stats = s.stats().unwrap();
        assert_eq!(stats.counts.sent_count, 1);
        assert_eq!(stats.counts.scheduled_count, 1);
        assert_eq!(stats.workers.sent, 1);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }
}
