//! Operator alerts: terminal failures that need a human.
//! In-memory ring buffer (last 100), surfaced through scheduler stats.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use followup_core::error::FollowUpError;
use serde::{Deserialize, Serialize};

const MAX_ALERTS: usize = 100;

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Retries used up on a transient failure.
    RetriesExhausted,
    /// Delivery channel refused the message outright.
    PermanentFailure,
    /// Queue or sweeper referenced an id the store does not know.
    MissingRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    pub follow_up_id: String,
    pub message: String,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

pub struct AlertLog {
    alerts: Mutex<VecDeque<OperatorAlert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(VecDeque::with_capacity(MAX_ALERTS)),
        }
    }

    pub fn raise(&self, kind: AlertKind, follow_up_id: &str, message: &str, attempts: u32) {
        tracing::error!(
            "🚨 Operator alert [{:?}] follow-up {}: {} ({} attempt(s))",
            kind,
            follow_up_id,
            message,
            attempts
        );
        let alert = OperatorAlert {
            kind,
            follow_up_id: follow_up_id.to_string(),
            message: message.to_string(),
            attempts,
            timestamp: Utc::now(),
        };
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push_back(alert);
            while alerts.len() > MAX_ALERTS {
                alerts.pop_front();
            }
        }
    }

    /// Alert for a dispatch that failed for good. Missing records are
    /// reported by the send operation itself, so they are not repeated here.
    pub fn raise_for_failure(&self, follow_up_id: &str, error: &FollowUpError, attempts: u32) {
        if matches!(error, FollowUpError::NotFound(_)) {
            return;
        }
        let kind = if error.is_retryable() {
            AlertKind::RetriesExhausted
        } else {
            AlertKind::PermanentFailure
        };
        self.raise(kind, follow_up_id, &error.to_string(), attempts);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<OperatorAlert> {
        self.alerts
            .lock()
            .map(|a| a.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new()
    }
}
