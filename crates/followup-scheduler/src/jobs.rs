//! Dispatch job definitions: the queue-side view of a follow-up.

use chrono::{DateTime, Utc};
use followup_core::config::QueueConfig;
use followup_core::error::FollowUpError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A queued dispatch for exactly one follow-up id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchJob {
    /// Follow-up id; also the job key.
    pub follow_up_id: String,
    /// Not runnable before this instant.
    pub run_at: DateTime<Utc>,
    /// Lower runs first among jobs that are due together.
    pub priority: i32,
    pub state: JobState,
    /// Executions started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Job status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Exponential backoff: `base`, `2*base`, `4*base`, ... for `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(config.backoff_base_secs),
        }
    }

    /// First attempt plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before the next execution once `attempts` executions have failed.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        self.backoff_base * 2u32.pow(exp)
    }

    /// Whether a job that just failed its `attempts`-th execution runs again.
    pub fn should_retry(&self, attempts: u32, error: &FollowUpError) -> bool {
        error.is_retryable() && attempts < self.max_attempts()
    }
}

/// How a failed execution was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to pending, runnable again at `next_run_at`.
    Retrying { attempt: u32, next_run_at: DateTime<Utc> },
    /// Terminally failed; kept for operator attention.
    Exhausted { attempts: u32 },
}

/// Queue priority for a follow-up kind (1 = most urgent, unknown kinds 10).
pub fn priority_for_kind(kind: &str) -> i32 {
    match kind {
        "check_in" => 1,
        "reminder" => 2,
        "action_item" | "deadline" => 3,
        "status_update" => 4,
        "recommendation" => 5,
        "resource" => 6,
        "feedback" => 7,
        "survey" => 8,
        _ => 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_for(1), Duration::from_secs(5));
        assert_eq!(p.backoff_for(2), Duration::from_secs(10));
        assert_eq!(p.backoff_for(3), Duration::from_secs(20));
        assert_eq!(p.max_attempts(), 4);
    }

    #[test]
    fn test_should_retry() {
        let p = RetryPolicy::default();
        let transient = FollowUpError::transient("503");
        assert!(p.should_retry(1, &transient));
        assert!(p.should_retry(3, &transient));
        assert!(!p.should_retry(4, &transient));
        assert!(!p.should_retry(1, &FollowUpError::permanent("bad contact")));
        assert!(!p.should_retry(1, &FollowUpError::NotFound("x".into())));
    }

    #[test]
    fn test_priority_for_kind() {
        assert_eq!(priority_for_kind("check_in"), 1);
        assert!(priority_for_kind("reminder") < priority_for_kind("survey"));
        assert_eq!(priority_for_kind("something_new"), 10);
    }

    #[test]
    fn test_state_round_trip() {
        for s in [JobState::Pending, JobState::Running, JobState::Completed, JobState::Failed] {
            assert_eq!(JobState::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobState::parse("paused"), None);
    }
}
