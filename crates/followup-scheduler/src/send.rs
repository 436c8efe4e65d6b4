//! Send operation: the single path both the worker pool and the sweeper use
//! to turn a scheduled follow-up into a delivered one.
//!
//! Status is always re-read from the store. Callers hold the follow-up's queue
//! job while sending; the conditional transition in [`ScheduleStore::mark_sent`]
//! decides which sender records the send.

use std::sync::Arc;
use std::time::Duration;

use followup_core::error::{FollowUpError, Result};
use followup_core::template::fill_placeholders;
use followup_core::traits::{DeliveryChannel, PersonalizationRequest, Personalizer, SubjectDirectory};
use followup_core::types::{FollowUp, SendSource, SubjectProfile};
use serde::Serialize;

use crate::notify::{AlertKind, AlertLog};
use crate::persistence::ScheduleStore;
use crate::queue::DispatchQueue;
use crate::throttle::DeliveryThrottle;

const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How a send attempt ended when it did not fail.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", content = "follow_up", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Delivered and transitioned to sent by this call.
    Sent(FollowUp),
    /// Already sent or cancelled; nothing was done.
    AlreadyResolved(FollowUp),
    /// Linked work was complete, so the follow-up was cancelled instead.
    Skipped(FollowUp),
}

impl SendOutcome {
    pub fn follow_up(&self) -> &FollowUp {
        match self {
            SendOutcome::Sent(f) | SendOutcome::AlreadyResolved(f) | SendOutcome::Skipped(f) => f,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Sent(_) => "sent",
            SendOutcome::AlreadyResolved(_) => "already_resolved",
            SendOutcome::Skipped(_) => "skipped",
        }
    }
}

/// Per-call timeouts for the two external collaborators.
#[derive(Debug, Clone, Copy)]
pub struct SendTimeouts {
    pub personalize: Duration,
    pub deliver: Duration,
}

impl Default for SendTimeouts {
    fn default() -> Self {
        Self {
            personalize: Duration::from_millis(15_000),
            deliver: Duration::from_millis(10_000),
        }
    }
}

pub struct SendOperation {
    store: Arc<ScheduleStore>,
    subjects: Arc<dyn SubjectDirectory>,
    personalizer: Arc<dyn Personalizer>,
    delivery: Arc<dyn DeliveryChannel>,
    throttle: Arc<DeliveryThrottle>,
    alerts: Arc<AlertLog>,
    timeouts: SendTimeouts,
}

impl SendOperation {
    pub fn new(
        store: Arc<ScheduleStore>,
        subjects: Arc<dyn SubjectDirectory>,
        personalizer: Arc<dyn Personalizer>,
        delivery: Arc<dyn DeliveryChannel>,
        throttle: Arc<DeliveryThrottle>,
        alerts: Arc<AlertLog>,
        timeouts: SendTimeouts,
    ) -> Self {
        Self {
            store,
            subjects,
            personalizer,
            delivery,
            throttle,
            alerts,
            timeouts,
        }
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<AlertLog> {
        &self.alerts
    }

    /// Drive one follow-up through render + deliver + mark sent.
    ///
    /// Errors are delivery-side failures; `is_retryable()` tells the queue
    /// whether another attempt makes sense.
    pub async fn execute(&self, id: &str, source: SendSource) -> Result<SendOutcome> {
        let record = match self.store.find(id)? {
            Some(r) => r,
            None => {
                self.alerts.raise(
                    AlertKind::MissingRecord,
                    id,
                    "follow-up not found at send time",
                    0,
                );
                return Err(FollowUpError::NotFound(id.to_string()));
            }
        };

        if !record.is_scheduled() {
            tracing::debug!("Follow-up {} already {}, nothing to send", id, record.status);
            return Ok(SendOutcome::AlreadyResolved(record));
        }

        if self.store.suppressed_by_linked_work(&record).await {
            let cancelled = self.store.cancel(id)?;
            tracing::info!(
                "⏭️ Follow-up {} skipped: linked work {} is complete",
                id,
                record.linked_work_id.as_deref().unwrap_or("-")
            );
            return Ok(SendOutcome::Skipped(cancelled));
        }

        let profile = match self.subjects.profile(&record.subject_id).await {
            Ok(p) => p,
            Err(FollowUpError::NotFound(_)) => {
                return Err(FollowUpError::permanent(format!(
                    "no contact details for subject {}",
                    record.subject_id
                )));
            }
            Err(e) => return Err(e),
        };
        if profile.contact.trim().is_empty() {
            return Err(FollowUpError::permanent(format!(
                "subject {} has an empty contact",
                record.subject_id
            )));
        }

        let text = self.render(&record, &profile).await;

        self.throttle.acquire().await;
        let after_ms = self.timeouts.deliver.as_millis() as u64;
        let receipt = match tokio::time::timeout(
            self.timeouts.deliver,
            self.delivery.deliver(&profile, &text, id),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(FollowUpError::Timeout {
                    operation: format!("deliver via {}", self.delivery.name()),
                    after_ms,
                });
            }
        };
        tracing::info!(
            "📤 Follow-up {} delivered via {}{}",
            id,
            self.delivery.name(),
            receipt
                .external_id
                .as_deref()
                .map(|x| format!(" (ref {x})"))
                .unwrap_or_default()
        );

        let (current, won) = self.record_sent(id, source).await?;
        if won {
            Ok(SendOutcome::Sent(current))
        } else {
            tracing::warn!(
                "⚠️ Follow-up {} was resolved by another sender during delivery",
                id
            );
            Ok(SendOutcome::AlreadyResolved(current))
        }
    }

    /// Mark a delivered follow-up sent, retrying only the store write. A write
    /// that keeps failing is reported as permanent: the message already went out.
    async fn record_sent(&self, id: &str, source: SendSource) -> Result<(FollowUp, bool)> {
        let mut attempt = 1;
        loop {
            match self.store.mark_sent(id, source.label()) {
                Ok(done) => return Ok(done),
                Err(e @ FollowUpError::Database(_)) if attempt < RECORD_ATTEMPTS => {
                    tracing::warn!(
                        "⚠️ Recording sent state of {} failed (attempt {}/{}): {e}",
                        id,
                        attempt,
                        RECORD_ATTEMPTS
                    );
                    tokio::time::sleep(RECORD_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Follow-up {} was delivered but its sent state was not recorded: {e}",
                        id
                    );
                    return Err(FollowUpError::permanent(format!(
                        "delivered but sent state not recorded: {e}"
                    )));
                }
            }
        }
    }

    /// Queue the successor a recurring send just created.
    pub fn enqueue_successor(&self, queue: &DispatchQueue, sent: &FollowUp) {
        match self.store.next_occurrence(sent) {
            Ok(Some(next)) => {
                if let Err(e) = queue.enqueue_follow_up(&next) {
                    tracing::warn!("⚠️ Could not enqueue next occurrence {}: {e}", next.id);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ Could not load next occurrence of {}: {e}", sent.id),
        }
    }

    /// Personalized text, or the raw template if personalization is off, fails or hangs.
    async fn render(&self, record: &FollowUp, profile: &SubjectProfile) -> String {
        let mut text = record.message_template.clone();
        if record.personalize {
            let request = PersonalizationRequest {
                follow_up_id: record.id.clone(),
                kind: record.kind.clone(),
                template: record.message_template.clone(),
                tone: record.tone.clone(),
                context_hints: record.context_hints.clone(),
                profile: profile.clone(),
            };
            match tokio::time::timeout(
                self.timeouts.personalize,
                self.personalizer.personalize(&request),
            )
            .await
            {
                Ok(Ok(rendered)) if !rendered.trim().is_empty() => text = rendered,
                Ok(Ok(_)) => {
                    tracing::warn!(
                        "⚠️ {} returned empty text for {}; using template",
                        self.personalizer.name(),
                        record.id
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        "⚠️ Personalization failed for {}: {e}; using template",
                        record.id
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        "⚠️ Personalization timed out for {} after {:?}; using template",
                        record.id,
                        self.timeouts.personalize
                    );
                }
            }
        }
        fill_placeholders(&text, profile)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::SchedulerDb;
    use crate::persistence::tests::StaticWork;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use followup_core::traits::DeliveryReceipt;
    use followup_core::types::{FollowUpSpec, FollowUpStatus};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Directory;

    #[async_trait]
    impl SubjectDirectory for Directory {
        async fn profile(&self, subject_id: &str) -> Result<SubjectProfile> {
            if subject_id == "ghost" {
                return Err(FollowUpError::NotFound(subject_id.into()));
            }
            Ok(SubjectProfile {
                subject_id: subject_id.to_string(),
                contact: "+15550100".into(),
                first_name: Some("Dana".into()),
                last_name: None,
                timezone: None,
            })
        }
    }

    /// Records every delivery; fails the first `fail_first` calls.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub sent: Mutex<Vec<(String, String)>>,
        pub calls: AtomicUsize,
        pub fail_first: usize,
        pub permanent: bool,
        pub delay: Option<Duration>,
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(
            &self,
            profile: &SubjectProfile,
            text: &str,
            _follow_up_id: &str,
        ) -> Result<DeliveryReceipt> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if n < self.fail_first {
                return Err(if self.permanent {
                    FollowUpError::permanent("invalid number")
                } else {
                    FollowUpError::transient("gateway 503")
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((profile.contact.clone(), text.to_string()));
            Ok(DeliveryReceipt::default())
        }
    }

    pub(crate) struct Echo;

    #[async_trait]
    impl Personalizer for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn personalize(&self, request: &PersonalizationRequest) -> Result<String> {
            Ok(format!("[{}] {}", request.tone, request.template))
        }
    }

    struct Broken;

    #[async_trait]
    impl Personalizer for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn personalize(&self, _request: &PersonalizationRequest) -> Result<String> {
            Err(FollowUpError::Personalization("model offline".into()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl Personalizer for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn personalize(&self, _request: &PersonalizationRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".into())
        }
    }

    pub(crate) fn build(
        personalizer: Arc<dyn Personalizer>,
        channel: Arc<RecordingChannel>,
    ) -> (SendOperation, Arc<StaticWork>) {
        build_on(SchedulerDb::open_in_memory().unwrap(), personalizer, channel)
    }

    fn build_on(
        db: SchedulerDb,
        personalizer: Arc<dyn Personalizer>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> (SendOperation, Arc<StaticWork>) {
        let work = Arc::new(StaticWork::default());
        let store = Arc::new(ScheduleStore::new(db, work.clone()));
        let op = SendOperation::new(
            store,
            Arc::new(Directory),
            personalizer,
            channel,
            Arc::new(DeliveryThrottle::per_minute(100)),
            Arc::new(AlertLog::new()),
            SendTimeouts {
                personalize: Duration::from_millis(50),
                deliver: Duration::from_millis(200),
            },
        );
        (op, work)
    }

    fn due(subject: &str, template: &str) -> FollowUpSpec {
        FollowUpSpec::at(subject, "check_in", template, Utc::now() - ChronoDuration::minutes(1))
    }

    #[tokio::test]
    async fn test_send_personalizes_and_marks_sent() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Echo), channel.clone());
        let f = op.store().create(&due("sub-1", "Hi {first_name}").with_tone("warm")).unwrap();

        let outcome = op.execute(&f.id, SendSource::Queue).await.unwrap();
        assert_eq!(outcome.label(), "sent");
        assert_eq!(outcome.follow_up().sent_by.as_deref(), Some("queue_worker"));
        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent[0], ("+15550100".to_string(), "[warm] Hi Dana".to_string()));
    }

    #[tokio::test]
    async fn test_personalization_failure_falls_back_to_template() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Broken), channel.clone());
        let f = op.store().create(&due("sub-1", "Hi {first_name}")).unwrap();
        assert_eq!(op.execute(&f.id, SendSource::Sweeper).await.unwrap().label(), "sent");
        assert_eq!(channel.sent.lock().unwrap()[0].1, "Hi Dana");
    }

    #[tokio::test]
    async fn test_personalization_timeout_falls_back() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Hanging), channel.clone());
        let f = op.store().create(&due("sub-1", "Plain")).unwrap();
        assert_eq!(op.execute(&f.id, SendSource::Sweeper).await.unwrap().label(), "sent");
        assert_eq!(channel.sent.lock().unwrap()[0].1, "Plain");
    }

    #[tokio::test]
    async fn test_personalize_flag_off_skips_collaborator() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Echo), channel.clone());
        let f = op
            .store()
            .create(&due("sub-1", "Exact text").without_personalization())
            .unwrap();
        op.execute(&f.id, SendSource::Manual).await.unwrap();
        assert_eq!(channel.sent.lock().unwrap()[0].1, "Exact text");
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_mark_sent() {
        let channel = Arc::new(RecordingChannel {
            fail_first: 1,
            ..Default::default()
        });
        let (op, _) = build(Arc::new(Echo), channel.clone());
        let f = op.store().create(&due("sub-1", "Hi")).unwrap();
        let err = op.execute(&f.id, SendSource::Queue).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(op.store().get(&f.id).unwrap().status, FollowUpStatus::Scheduled);
        // Next attempt goes through.
        assert_eq!(op.execute(&f.id, SendSource::Queue).await.unwrap().label(), "sent");
    }

    /// Delivers, then takes the follow-up table offline so recording the send
    /// fails; brings it back after `restore_after` when set.
    struct StoreOutageChannel {
        db: SchedulerDb,
        calls: AtomicUsize,
        restore_after: Option<Duration>,
    }

    fn rename_table(db: &SchedulerDb, from: &str, to: &str) {
        db.with_conn(|conn| {
            conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}"))?;
            Ok(())
        })
        .unwrap();
    }

    #[async_trait]
    impl DeliveryChannel for StoreOutageChannel {
        fn name(&self) -> &str {
            "outage"
        }

        async fn deliver(
            &self,
            _profile: &SubjectProfile,
            _text: &str,
            _follow_up_id: &str,
        ) -> Result<DeliveryReceipt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            rename_table(&self.db, "follow_ups", "follow_ups_offline");
            if let Some(after) = self.restore_after {
                let db = self.db.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    rename_table(&db, "follow_ups_offline", "follow_ups");
                });
            }
            Ok(DeliveryReceipt::default())
        }
    }

    fn outage(restore_after: Option<Duration>) -> (SendOperation, Arc<StoreOutageChannel>) {
        let db = SchedulerDb::open_in_memory().unwrap();
        let channel = Arc::new(StoreOutageChannel {
            db: db.clone(),
            calls: AtomicUsize::new(0),
            restore_after,
        });
        let (op, _) = build_on(db, Arc::new(Echo), channel.clone());
        (op, channel)
    }

    #[tokio::test]
    async fn test_unrecorded_delivery_is_not_retried() {
        let (op, channel) = outage(None);
        let f = op.store().create(&due("sub-1", "Hi")).unwrap();

        let err = op.execute(&f.id, SendSource::Queue).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("delivered but sent state not recorded"));
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);

        rename_table(op.store().db(), "follow_ups_offline", "follow_ups");
        assert_eq!(op.store().get(&f.id).unwrap().status, FollowUpStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_sent_state_write_is_retried_after_delivery() {
        let (op, channel) = outage(Some(Duration::from_millis(20)));
        let f = op.store().create(&due("sub-1", "Hi")).unwrap();

        let outcome = op.execute(&f.id, SendSource::Queue).await.unwrap();
        assert_eq!(outcome.label(), "sent");
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        assert_eq!(op.store().get(&f.id).unwrap().status, FollowUpStatus::Sent);
    }

    #[tokio::test]
    async fn test_delivery_timeout_is_retryable() {
        let channel = Arc::new(RecordingChannel {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let (op, _) = build(Arc::new(Echo), channel);
        let f = op.store().create(&due("sub-1", "Hi")).unwrap();
        let err = op.execute(&f.id, SendSource::Queue).await.unwrap_err();
        assert!(matches!(err, FollowUpError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_record_is_not_retryable() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Echo), channel);
        let err = op.execute("does-not-exist", SendSource::Queue).await.unwrap_err();
        assert!(matches!(err, FollowUpError::NotFound(_)));
        assert!(!err.is_retryable());
        assert_eq!(op.alerts().recent(1)[0].kind, AlertKind::MissingRecord);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_permanent() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Echo), channel.clone());
        let f = op.store().create(&due("ghost", "Hi")).unwrap();
        let err = op.execute(&f.id, SendSource::Queue).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_linked_work_complete_cancels() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, work) = build(Arc::new(Echo), channel.clone());
        let f = op
            .store()
            .create(&due("sub-1", "Did you finish?").linked_to("task-9", true))
            .unwrap();
        work.set("task-9", true);
        let outcome = op.execute(&f.id, SendSource::Queue).await.unwrap();
        assert_eq!(outcome.label(), "skipped");
        assert_eq!(outcome.follow_up().status, FollowUpStatus::Cancelled);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_already_resolved_is_noop() {
        let channel = Arc::new(RecordingChannel::default());
        let (op, _) = build(Arc::new(Echo), channel.clone());
        let f = op.store().create(&due("sub-1", "Hi")).unwrap();
        op.store().cancel(&f.id).unwrap();
        let outcome = op.execute(&f.id, SendSource::Sweeper).await.unwrap();
        assert_eq!(outcome.label(), "already_resolved");
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);
    }
}
