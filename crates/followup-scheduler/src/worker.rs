//! Worker pool: N tokio tasks pulling runnable jobs from the dispatch queue.
//!
//! Each worker claims one job at a time, runs the shared send operation and
//! settles the job (complete, back off, or fail terminally). Idle workers wait
//! for an enqueue, the next `run_at`, or the poll interval, whichever is first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use followup_core::types::SendSource;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::jobs::{DispatchJob, FailureOutcome};
use crate::notify::AlertLog;
use crate::queue::DispatchQueue;
use crate::send::{SendOperation, SendOutcome};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Completed(&'static str),
    Retrying,
    Failed,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    sent: AtomicU64,
    skipped: AtomicU64,
    already_resolved: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Worker pool totals since start.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct WorkerStats {
    pub concurrency: usize,
    pub processed: u64,
    pub sent: u64,
    pub skipped: u64,
    pub already_resolved: u64,
    pub retried: u64,
    pub failed: u64,
}

pub struct WorkerPool {
    queue: Arc<DispatchQueue>,
    send: Arc<SendOperation>,
    alerts: Arc<AlertLog>,
    concurrency: usize,
    poll_interval: Duration,
    counters: Counters,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<DispatchQueue>,
        send: Arc<SendOperation>,
        alerts: Arc<AlertLog>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            send,
            alerts,
            concurrency: concurrency.max(1),
            poll_interval,
            counters: Counters::default(),
        }
    }

    /// Claim and process at most one runnable job.
    pub async fn run_once(&self) -> Option<(String, JobResult)> {
        let job = match self.queue.claim_next(Utc::now()) {
            Ok(Some(job)) => job,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("⚠️ Failed to claim job: {e}");
                return None;
            }
        };
        let id = job.follow_up_id.clone();
        let result = self.process(job).await;
        Some((id, result))
    }

    async fn process(&self, job: DispatchJob) -> JobResult {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "⚙️ Processing job {} (attempt {}/{})",
            job.follow_up_id,
            job.attempts,
            job.max_attempts
        );

        match self.send.execute(&job.follow_up_id, SendSource::Queue).await {
            Ok(outcome) => {
                let counter = match &outcome {
                    SendOutcome::Sent(sent) => {
                        self.send.enqueue_successor(&self.queue, sent);
                        &self.counters.sent
                    }
                    SendOutcome::Skipped(_) => &self.counters.skipped,
                    SendOutcome::AlreadyResolved(_) => &self.counters.already_resolved,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.queue.complete(&job.follow_up_id) {
                    tracing::warn!("⚠️ Failed to complete job {}: {e}", job.follow_up_id);
                }
                JobResult::Completed(outcome.label())
            }
            Err(err) => match self.queue.fail(&job, &err, Utc::now()) {
                Ok(FailureOutcome::Retrying { .. }) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    JobResult::Retrying
                }
                Ok(FailureOutcome::Exhausted { attempts }) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    self.alerts.raise_for_failure(&job.follow_up_id, &err, attempts);
                    JobResult::Failed
                }
                Err(e) => {
                    tracing::error!(
                        "❌ Could not record failure for job {}: {e} (original error: {err})",
                        job.follow_up_id
                    );
                    JobResult::Failed
                }
            },
        }
    }

    /// Start `concurrency` workers. They stop once `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "👷 Worker pool started ({} workers, poll every {:?})",
            self.concurrency,
            self.poll_interval
        );
        (0..self.concurrency)
            .map(|idx| {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(idx, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, idx: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.run_once().await.is_some() {
                continue;
            }

            let wait = match self.queue.next_run_at() {
                Ok(Some(next)) => (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.poll_interval),
                _ => self.poll_interval,
            };

            tokio::select! {
                _ = self.queue.wait_for_work() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("👷 Worker {} stopped", idx);
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            concurrency: self.concurrency,
            processed: self.counters.processed.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            already_resolved: self.counters.already_resolved.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
