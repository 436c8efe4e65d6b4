//! # Follow-up Scheduler
//!
//! Schedules outbound follow-up messages, delivers each one at most once, and
//! learns when a subject is most likely to answer.
//!
//! ## Design Principles
//! - SQLite is the source of truth for follow-up status and the delay queue
//! - One send operation shared by both dispatch paths
//! - `markSent` is a single conditional UPDATE, so no in-process locks
//! - Tokio timers and `Notify` only, nothing polls hot
//!
//! ## Architecture
//! ```text
//! schedule(spec) ── Optimal? ── TimingPredictor (history) ──┐
//!                                                           ▼
//!                                     ScheduleStore.create + DispatchQueue.enqueue
//!
//! WorkerPool (N tasks) ── claim_next ──┐
//!                                      ├── SendOperation
//! ProactiveSweeper (interval) ─ list_due ┘     ├── re-read status / linked work
//!                                              ├── Personalizer (timeout, fallback)
//!                                              ├── DeliveryThrottle → DeliveryChannel
//!                                              └── ScheduleStore.mark_sent (+ successor)
//! ```

pub mod db;
pub mod directory;
pub mod engine;
pub mod jobs;
pub mod notify;
pub mod persistence;
pub mod queue;
pub mod send;
pub mod sweeper;
pub mod throttle;
pub mod timing;
pub mod worker;

pub use db::SchedulerDb;
pub use directory::SqliteDirectory;
pub use engine::{Collaborators, FollowUpScheduler, SchedulerStats, TimingProfile};
pub use jobs::{DispatchJob, JobState, RetryPolicy};
pub use notify::{AlertKind, AlertLog, OperatorAlert};
pub use persistence::{ScheduleCounts, ScheduleStore};
pub use queue::{DispatchQueue, QueueStats};
pub use send::{SendOperation, SendOutcome, SendTimeouts};
pub use sweeper::{ProactiveSweeper, SweepReport};
pub use throttle::DeliveryThrottle;
pub use worker::{WorkerPool, WorkerStats};
