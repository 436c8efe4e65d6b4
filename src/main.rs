//! # followupd: Follow-up Scheduler Daemon & Operator CLI
//!
//! Usage:
//!   followupd run                                   # Workers + sweeper until Ctrl-C
//!   followupd sweep                                 # One sweeper pass, print the report
//!   followupd stats                                 # Counts, queue, workers, alerts
//!   followupd schedule --subject s1 --kind check_in --template "Hi {first_name}" --optimal
//!   followupd cancel <id> | reschedule <id> <at> | respond <id> <text>
//!
//! Every command prints JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use followup_channels::{delivery_from_config, personalizer_from_config};
use followup_core::config::FollowUpConfig;
use followup_core::error::FollowUpError;
use followup_core::traits::{DeliveryChannel, DeliveryReceipt};
use followup_core::types::{FollowUpSpec, FollowUpStatus, SubjectProfile};
use followup_scheduler::{Collaborators, FollowUpScheduler, SchedulerDb, SqliteDirectory};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "followupd",
    version,
    about = "📬 Follow-up Scheduler: durable, at-most-once follow-up delivery"
)]
struct Cli {
    /// Config file (default ~/.followup/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool, periodic sweeper and queue pruning until Ctrl-C
    Run,
    /// Run one proactive sweeper pass
    Sweep,
    /// Scheduler statistics
    Stats,
    /// Follow-ups that are due now
    Due {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Schedule a follow-up
    Schedule {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        template: String,
        /// RFC 3339 send time
        #[arg(long, conflicts_with = "optimal", required_unless_present = "optimal")]
        at: Option<DateTime<Utc>>,
        /// Let the timing predictor pick the send time
        #[arg(long)]
        optimal: bool,
        #[arg(long, default_value = "friendly")]
        tone: String,
        #[arg(long)]
        recurring_days: Option<u32>,
        #[arg(long)]
        linked_work: Option<String>,
        /// Send even if the linked work is complete
        #[arg(long)]
        no_skip: bool,
        /// Send the template as-is
        #[arg(long)]
        no_personalize: bool,
    },
    /// Cancel a follow-up
    Cancel { id: String },
    /// Move a follow-up to a new time (creates a new record)
    Reschedule { id: String, at: DateTime<Utc> },
    /// Record a reply to a follow-up
    Respond { id: String, text: String },
    /// Send one follow-up now, bypassing its schedule
    Send { id: String },
    /// Predicted best send time for a subject
    Predict {
        #[arg(long)]
        subject: String,
    },
    /// Follow-ups for one subject, newest first
    List {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Jobs due within the next N hours
    Upcoming {
        #[arg(long, default_value = "24")]
        hours: i64,
    },
    /// Terminally failed jobs awaiting operator attention
    Failed {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Add or update a subject's contact details
    Subject {
        #[arg(long)]
        id: String,
        #[arg(long)]
        contact: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
    },
    /// Record a subject activity event for the timing predictor
    Engage {
        #[arg(long)]
        subject: String,
        #[arg(long = "type", default_value = "activity")]
        event_type: String,
        /// When it happened (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Mark linked work complete and cancel follow-ups waiting on it
    WorkDone { linked_work_id: String },
    /// Write the effective config to the config path
    InitConfig,
}

impl Command {
    fn delivers(&self) -> bool {
        matches!(self, Command::Run | Command::Sweep | Command::Send { .. })
    }
}

/// Stand-in channel for commands that never deliver.
struct Unconfigured(String);

#[async_trait]
impl DeliveryChannel for Unconfigured {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn deliver(
        &self,
        _profile: &SubjectProfile,
        _text: &str,
        _follow_up_id: &str,
    ) -> followup_core::Result<DeliveryReceipt> {
        Err(FollowUpError::permanent(self.0.clone()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<FollowUpConfig> {
    let config = match path {
        Some(p) if !p.exists() => {
            let mut config = FollowUpConfig::default();
            config.apply_env_overrides(|k| std::env::var(k).ok());
            config
        }
        Some(p) => {
            let mut config = FollowUpConfig::load_from(p)
                .with_context(|| format!("loading {}", p.display()))?;
            config.apply_env_overrides(|k| std::env::var(k).ok());
            config
        }
        None => FollowUpConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &FollowUpConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let directives = format!(
        "followupd={level},followup_core={level},followup_scheduler={level},followup_channels={level}"
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.verbose);

    if let Command::InitConfig = cli.command {
        let path = cli.config.clone().unwrap_or_else(FollowUpConfig::default_path);
        config.save_to(&path)?;
        println!("✅ Config written to {}", path.display());
        return Ok(());
    }

    let db_path = config.resolved_database_path();
    let db = SchedulerDb::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    tracing::debug!("🗄️ Database: {}", db_path.display());

    let delivery: Arc<dyn DeliveryChannel> = match delivery_from_config(&config.delivery) {
        Ok(channel) => channel,
        Err(e) if !cli.command.delivers() => Arc::new(Unconfigured(e.to_string())),
        Err(e) => return Err(e).context("delivery channel is not configured"),
    };
    let personalizer = personalizer_from_config(&config.personalization);
    let directory = SqliteDirectory::new(db.clone());
    let scheduler = FollowUpScheduler::new(
        config,
        db.clone(),
        Collaborators::sqlite(&db, personalizer, delivery),
    );

    match cli.command {
        Command::Run => {
            scheduler.start()?;
            println!("📬 followupd v{} running, Ctrl-C to stop", env!("CARGO_PKG_VERSION"));
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await;
        }
        Command::Sweep => print_json(&scheduler.process_due().await?)?,
        Command::Stats => print_json(&scheduler.stats()?)?,
        Command::Due { limit } => print_json(&scheduler.list_due(limit).await?)?,
        Command::Schedule {
            subject,
            kind,
            template,
            at,
            optimal,
            tone,
            recurring_days,
            linked_work,
            no_skip,
            no_personalize,
        } => {
            let mut spec = match (at, optimal) {
                (Some(at), false) => FollowUpSpec::at(&subject, &kind, &template, at),
                _ => FollowUpSpec::optimal(&subject, &kind, &template),
            }
            .with_tone(&tone);
            if let Some(days) = recurring_days {
                spec = spec.recurring(days);
            }
            if let Some(work) = linked_work {
                spec = spec.linked_to(&work, !no_skip);
            }
            if no_personalize {
                spec = spec.without_personalization();
            }
            print_json(&scheduler.schedule(spec).await?)?;
        }
        Command::Cancel { id } => print_json(&scheduler.cancel(&id)?)?,
        Command::Reschedule { id, at } => print_json(&scheduler.reschedule(&id, at)?)?,
        Command::Respond { id, text } => print_json(&scheduler.record_response(&id, &text)?)?,
        Command::Send { id } => print_json(&scheduler.send_now(&id).await?)?,
        Command::Predict { subject } => print_json(&scheduler.timing_profile(&subject).await?)?,
        Command::List {
            subject,
            status,
            limit,
        } => {
            let status = status.as_deref().map(FollowUpStatus::parse).transpose()?;
            print_json(&scheduler.for_subject(&subject, status, limit)?)?;
        }
        Command::Upcoming { hours } => {
            let within = ChronoDuration::try_hours(hours)
                .filter(|w| *w > ChronoDuration::zero())
                .with_context(|| format!("--hours {hours} is out of range"))?;
            print_json(&scheduler.upcoming_jobs(Some(within))?)?
        }
        Command::Failed { limit } => print_json(&scheduler.failed_jobs(limit)?)?,
        Command::Subject {
            id,
            contact,
            first_name,
            last_name,
        } => {
            let profile = SubjectProfile {
                subject_id: id,
                contact,
                first_name,
                last_name,
                timezone: None,
            };
            directory.upsert_subject(&profile)?;
            print_json(&profile)?;
        }
        Command::Engage {
            subject,
            event_type,
            at,
        } => {
            let at = at.unwrap_or_else(Utc::now);
            directory.record_engagement(&subject, &event_type, at)?;
            print_json(&serde_json::json!({
                "subject_id": subject,
                "event_type": event_type,
                "occurred_at": at,
            }))?;
        }
        Command::WorkDone { linked_work_id } => {
            directory.set_work_complete(&linked_work_id, true)?;
            let cancelled = scheduler.cancel_for_completed_work(&linked_work_id)?;
            print_json(&serde_json::json!({
                "linked_work_id": linked_work_id,
                "cancelled": cancelled,
            }))?;
        }
        Command::InitConfig => {}
    }

    Ok(())
}
