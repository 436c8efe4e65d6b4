//! Proactive sweeper: periodic backstop that finds due follow-ups straight
//! from the store (lost queue jobs, out-of-band inserts) and sends them
//! through the same send operation as the worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use followup_core::error::Result;
use followup_core::types::SendSource;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::jobs::FailureOutcome;
use crate::queue::{DispatchQueue, SweepClaim};
use crate::send::{SendOperation, SendOutcome};

/// Counts from one sweep pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    /// Cancelled for completed linked work, already resolved elsewhere, or
    /// held by the dispatch queue (running in a worker, or not yet runnable).
    pub skipped: u32,
}

pub struct ProactiveSweeper {
    send: Arc<SendOperation>,
    queue: Arc<DispatchQueue>,
    batch_limit: usize,
    inter_send_delay: Duration,
}

impl ProactiveSweeper {
    pub fn new(
        send: Arc<SendOperation>,
        queue: Arc<DispatchQueue>,
        batch_limit: usize,
        inter_send_delay: Duration,
    ) -> Self {
        Self {
            send,
            queue,
            batch_limit,
            inter_send_delay,
        }
    }

    /// One pass over due follow-ups, oldest first, one at a time.
    ///
    /// Each record's queue row is claimed first, so a follow-up a worker is
    /// already sending is skipped rather than delivered twice. Failures settle
    /// through the queue's retry policy like any worker attempt.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let due = self
            .send
            .store()
            .list_sweepable_at(Utc::now(), self.batch_limit)
            .await?;
        let mut report = SweepReport::default();
        if due.is_empty() {
            tracing::debug!("🧹 Sweep: nothing due");
            return Ok(report);
        }
        tracing::info!("🧹 Sweep: {} follow-up(s) due", due.len());

        let mut delivered_any = false;
        for record in &due {
            report.processed += 1;
            let job = match self.queue.claim_for_sweep(&record.id, Utc::now()) {
                Ok(SweepClaim::Claimed(job)) => job,
                Ok(other) => {
                    tracing::debug!("🧹 Sweep skips {}: queue job is {:?}", record.id, other);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Sweep could not claim {}: {e}", record.id);
                    report.failed += 1;
                    continue;
                }
            };

            if delivered_any && !self.inter_send_delay.is_zero() {
                tokio::time::sleep(self.inter_send_delay).await;
            }
            delivered_any = true;

            match self.send.execute(&record.id, SendSource::Sweeper).await {
                Ok(outcome) => {
                    match outcome {
                        SendOutcome::Sent(sent) => {
                            report.sent += 1;
                            self.send.enqueue_successor(&self.queue, &sent);
                        }
                        SendOutcome::Skipped(_) | SendOutcome::AlreadyResolved(_) => {
                            report.skipped += 1
                        }
                    }
                    if let Err(e) = self.queue.complete(&record.id) {
                        tracing::warn!("⚠️ Failed to complete job {}: {e}", record.id);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("⚠️ Sweep send failed for {}: {e}", record.id);
                    match self.queue.fail(&job, &e, Utc::now()) {
                        Ok(FailureOutcome::Exhausted { attempts }) => {
                            self.send.alerts().raise_for_failure(&record.id, &e, attempts)
                        }
                        Ok(FailureOutcome::Retrying { .. }) => {}
                        Err(qe) => tracing::error!(
                            "❌ Could not record failure for job {}: {qe} (original error: {e})",
                            record.id
                        ),
                    }
                }
            }
        }

        tracing::info!(
            "🧹 Sweep done: {} processed, {} sent, {} skipped, {} failed",
            report.processed,
            report.sent,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Run a pass every `every` until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("⏰ Sweeper started (every {:?})", every);
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::warn!("⚠️ Sweep pass failed: {e}");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("⏰ Sweeper stopped");
        })
    }
}
