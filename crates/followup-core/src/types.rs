//! Domain types: the follow-up record, scheduling requests and timing samples.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FollowUpError, Result};

/// Generate a new follow-up id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle of a follow-up. `Scheduled` is the only non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Scheduled,
    Sent,
    Cancelled,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Scheduled => "scheduled",
            FollowUpStatus::Sent => "sent",
            FollowUpStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(FollowUpStatus::Scheduled),
            "sent" => Ok(FollowUpStatus::Sent),
            "cancelled" => Ok(FollowUpStatus::Cancelled),
            other => Err(FollowUpError::Database(format!(
                "unknown follow-up status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FollowUpStatus::Scheduled)
    }
}

impl std::fmt::Display for FollowUpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scheduled, trackable outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUp {
    /// Unique id; doubles as the dispatch-queue key.
    pub id: String,
    /// The user this follow-up targets.
    pub subject_id: String,
    pub scheduled_time: DateTime<Utc>,
    /// Caller-defined category ("check_in", "reminder", ...).
    pub kind: String,
    pub message_template: String,
    pub tone: String,
    /// Opaque hints handed to the personalization collaborator.
    pub context_hints: serde_json::Value,
    /// When false the template is sent as-is.
    pub personalize: bool,
    pub status: FollowUpStatus,
    pub skip_if_linked_work_done: bool,
    pub linked_work_id: Option<String>,
    pub is_recurring: bool,
    pub recurrence_interval_days: Option<u32>,
    /// Set once this occurrence is sent and its successor exists.
    pub next_occurrence_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub sent_by: Option<String>,
    pub response_text: Option<String>,
    pub response_received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowUp {
    /// Build a fresh scheduled record from a request with a concrete time.
    pub fn from_spec(spec: &FollowUpSpec, now: DateTime<Utc>) -> Result<Self> {
        spec.validate()?;
        let scheduled_time = match spec.scheduled_time {
            ScheduleTime::At(at) => at,
            ScheduleTime::Optimal => {
                return Err(FollowUpError::InvalidSchedule(
                    "scheduled_time must be resolved before the record is created".into(),
                ));
            }
        };
        Ok(Self {
            id: new_id(),
            subject_id: spec.subject_id.clone(),
            scheduled_time,
            kind: spec.kind.clone(),
            message_template: spec.message_template.clone(),
            tone: spec.tone.clone(),
            context_hints: spec.context_hints.clone(),
            personalize: spec.personalize,
            status: FollowUpStatus::Scheduled,
            skip_if_linked_work_done: spec.skip_if_linked_work_done,
            linked_work_id: spec.linked_work_id.clone(),
            is_recurring: spec.is_recurring,
            recurrence_interval_days: spec.recurrence_interval_days,
            next_occurrence_id: None,
            sent_at: None,
            sent_by: None,
            response_text: None,
            response_received_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// The next occurrence of a recurring follow-up, or `None` if it does not recur.
    pub fn successor(&self, now: DateTime<Utc>) -> Option<FollowUp> {
        if !self.is_recurring {
            return None;
        }
        let days = self.recurrence_interval_days.filter(|d| *d > 0)?;
        Some(FollowUp {
            id: new_id(),
            scheduled_time: self.scheduled_time + Duration::days(i64::from(days)),
            status: FollowUpStatus::Scheduled,
            next_occurrence_id: None,
            sent_at: None,
            sent_by: None,
            response_text: None,
            response_received_at: None,
            created_at: now,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Copy of this record's payload as a new scheduling request at `at`.
    pub fn to_spec(&self, at: DateTime<Utc>) -> FollowUpSpec {
        FollowUpSpec {
            subject_id: self.subject_id.clone(),
            kind: self.kind.clone(),
            message_template: self.message_template.clone(),
            tone: self.tone.clone(),
            context_hints: self.context_hints.clone(),
            personalize: self.personalize,
            skip_if_linked_work_done: self.skip_if_linked_work_done,
            linked_work_id: self.linked_work_id.clone(),
            is_recurring: self.is_recurring,
            recurrence_interval_days: self.recurrence_interval_days,
            scheduled_time: ScheduleTime::At(at),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.status == FollowUpStatus::Scheduled
    }
}

/// When a follow-up should go out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "mode", content = "at")]
pub enum ScheduleTime {
    /// Explicit instant chosen by the caller.
    At(DateTime<Utc>),
    /// Let the timing predictor choose.
    Optimal,
}

/// A request to schedule a follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpSpec {
    pub subject_id: String,
    pub kind: String,
    pub message_template: String,
    #[serde(default = "default_tone")]
    pub tone: String,
    #[serde(default = "empty_hints")]
    pub context_hints: serde_json::Value,
    #[serde(default = "bool_true")]
    pub personalize: bool,
    #[serde(default = "bool_true")]
    pub skip_if_linked_work_done: bool,
    #[serde(default)]
    pub linked_work_id: Option<String>,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurrence_interval_days: Option<u32>,
    pub scheduled_time: ScheduleTime,
}

fn default_tone() -> String { "friendly".into() }
fn empty_hints() -> serde_json::Value { serde_json::json!({}) }
fn bool_true() -> bool { true }

impl FollowUpSpec {
    /// Follow-up at an explicit time.
    pub fn at(subject_id: &str, kind: &str, template: &str, at: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            kind: kind.to_string(),
            message_template: template.to_string(),
            tone: default_tone(),
            context_hints: empty_hints(),
            personalize: true,
            skip_if_linked_work_done: true,
            linked_work_id: None,
            is_recurring: false,
            recurrence_interval_days: None,
            scheduled_time: ScheduleTime::At(at),
        }
    }

    /// Follow-up whose time is picked by the timing predictor.
    pub fn optimal(subject_id: &str, kind: &str, template: &str) -> Self {
        Self {
            scheduled_time: ScheduleTime::Optimal,
            ..Self::at(subject_id, kind, template, Utc::now())
        }
    }

    pub fn recurring(mut self, interval_days: u32) -> Self {
        self.is_recurring = true;
        self.recurrence_interval_days = Some(interval_days);
        self
    }

    pub fn linked_to(mut self, linked_work_id: &str, skip_if_done: bool) -> Self {
        self.linked_work_id = Some(linked_work_id.to_string());
        self.skip_if_linked_work_done = skip_if_done;
        self
    }

    pub fn with_tone(mut self, tone: &str) -> Self {
        self.tone = tone.to_string();
        self
    }

    pub fn with_hints(mut self, hints: serde_json::Value) -> Self {
        self.context_hints = hints;
        self
    }

    pub fn without_personalization(mut self) -> Self {
        self.personalize = false;
        self
    }

    /// Reject requests that could never produce a sane record.
    pub fn validate(&self) -> Result<()> {
        if self.subject_id.trim().is_empty() {
            return Err(FollowUpError::InvalidSchedule("subject_id is empty".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(FollowUpError::InvalidSchedule("kind is empty".into()));
        }
        if self.is_recurring && self.recurrence_interval_days.unwrap_or(0) == 0 {
            return Err(FollowUpError::InvalidSchedule(
                "recurring follow-ups need recurrence_interval_days >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Who drove a follow-up through the send path; recorded as `sent_by`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SendSource {
    /// The worker pool consuming a dispatch-queue job.
    Queue,
    /// The proactive sweeper backstop.
    Sweeper,
    /// An operator triggering a send by hand.
    Manual,
}

impl SendSource {
    pub fn label(&self) -> &'static str {
        match self {
            SendSource::Queue => "queue_worker",
            SendSource::Sweeper => "scheduler",
            SendSource::Manual => "manual_admin",
        }
    }
}

/// Contact details and naming for the user a follow-up targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubjectProfile {
    pub subject_id: String,
    /// Phone number, chat id or address understood by the delivery channel.
    pub contact: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub timezone: Option<String>,
}

impl SubjectProfile {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => "there".to_string(),
        }
    }
}

/// Completion state of an external unit of work a follow-up is linked to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedWorkStatus {
    pub complete: bool,
}

/// One delivered follow-up and (maybe) the reply it got.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResponseSample {
    pub sent_at: DateTime<Utc>,
    pub response_received_at: Option<DateTime<Utc>>,
}

impl ResponseSample {
    pub fn response_minutes(&self) -> Option<f64> {
        self.response_received_at
            .map(|r| (r - self.sent_at).num_seconds() as f64 / 60.0)
    }
}

/// A timestamped engagement event (login, click, message...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EngagementSample {
    pub occurred_at: DateTime<Utc>,
}

/// Which signal a timing prediction came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    Combined,
    Response,
    Engagement,
    Default,
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::Combined => "combined",
            PredictionSource::Response => "response",
            PredictionSource::Engagement => "engagement",
            PredictionSource::Default => "default",
        }
    }
}

/// Recommended send hour (UTC) with an optional day-of-week constraint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingPrediction {
    /// Hour of day, 0-23.
    pub hour: u32,
    /// 0 = Sunday .. 6 = Saturday; `None` means any day.
    pub day_of_week: Option<u32>,
    /// 0.0 - 0.95.
    pub confidence: f64,
    pub source: PredictionSource,
    pub score: f64,
    pub reason: String,
}
