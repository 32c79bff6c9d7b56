//! cadence - recurring-session scheduler
//!
//! Command-line entry point. It wires together:
//! - Configuration loading
//! - Store initialization
//! - The scheduler, on the system clock
//! - Countdown display for `watch`

use anyhow::{bail, Context, Result};
use cadence_api::{Classification, OccurrenceState, ScheduleInstance};
use cadence_config::{load_config, RawDays, RawScheduleRule, Settings};
use cadence_core::{
    enumerate_occurrences, upcoming, CancelOutcome, CancelTarget, Countdown, CoreError,
    JoinOutcome, Scheduler,
};
use cadence_store::{AuditEvent, ScheduleStore, SqliteStore};
use cadence_util::{
    default_config_path, format_countdown, format_duration, is_mock_time_active, Clock,
    OccurrenceId, ScheduleId, SystemClock, UserId, CADENCE_CONFIG_ENV, CADENCE_DATA_DIR_ENV,
    DATABASE_FILENAME, MOCK_TIME_ENV_VAR,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// cadence - recurring-session scheduler
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(about = "Schedule, join and cancel recurring sessions", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/cadence/config.toml)
    #[arg(short, long, env = CADENCE_CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(short, long, env = CADENCE_DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the next occurrences of a rule without storing anything
    Next {
        #[command(flatten)]
        rule: RuleArgs,

        /// Exclusive lower bound (RFC 3339, default: now)
        #[arg(long)]
        after: Option<DateTime<Utc>>,

        /// How many occurrences to print
        #[arg(long, default_value_t = 5)]
        count: usize,

        /// List every occurrence up to this instant instead of `count`
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Classify an occurrence against the join window
    Classify {
        /// A stored occurrence
        #[arg(long, conflicts_with = "at", required_unless_present = "at")]
        occurrence: Option<OccurrenceId>,

        /// An arbitrary start time (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Classify as of this instant instead of now
        #[arg(long, requires = "at")]
        now: Option<DateTime<Utc>>,
    },

    /// Create a recurring schedule
    Create {
        #[arg(long)]
        user: String,

        #[command(flatten)]
        rule: RuleArgs,
    },

    /// Show a user's schedule
    Show {
        #[arg(long)]
        user: String,

        /// Also list this many upcoming occurrences
        #[arg(long, default_value_t = 0)]
        upcoming: usize,
    },

    /// Start an ad-hoc session now, outside any schedule
    Instant {
        #[arg(long)]
        user: String,
    },

    /// Join an occurrence (idempotent)
    Join { occurrence: OccurrenceId },

    /// Cancel a schedule or one of its occurrences
    Cancel {
        #[arg(long, conflicts_with = "occurrence", required_unless_present = "occurrence")]
        schedule: Option<ScheduleId>,

        #[arg(long)]
        occurrence: Option<OccurrenceId>,
    },

    /// Finish a joined session and record its summary
    Complete {
        occurrence: OccurrenceId,

        /// Opaque JSON summary to store on the schedule
        #[arg(long, default_value = "null")]
        summary: String,
    },

    /// Count down to a user's next occurrence
    Watch {
        #[arg(long)]
        user: String,

        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
    },

    /// Create the schedules declared in the config file
    Apply,

    /// Roll expired occurrences forward
    Sweep,

    /// Show recent audit events
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Recurrence rule flags, validated the same way as config file schedules
#[derive(clap::Args, Debug, Clone)]
struct RuleArgs {
    /// daily, weekly or monthly
    #[arg(long)]
    frequency: String,

    /// Local start time, HH:MM
    #[arg(long)]
    time: String,

    /// Weekly days: comma-separated names, or weekdays/weekends/all
    #[arg(long)]
    days: Option<String>,

    /// Monthly day-of-month (default: today)
    #[arg(long)]
    anchor_day: Option<u32>,

    /// IANA timezone (default: from config)
    #[arg(long)]
    timezone: Option<String>,
}

impl RuleArgs {
    fn to_raw(&self) -> RawScheduleRule {
        let days = self.days.as_deref().map(|days| {
            let list: Vec<String> = days.split(',').map(|d| d.trim().to_string()).collect();
            match list.as_slice() {
                [preset] if matches!(
                    preset.to_lowercase().as_str(),
                    "weekdays" | "weekends" | "all" | "every" | "daily"
                ) =>
                {
                    RawDays::Preset(preset.clone())
                }
                _ => RawDays::List(list),
            }
        });

        RawScheduleRule {
            frequency: self.frequency.clone(),
            time: Some(self.time.clone()),
            days,
            anchor_day: self.anchor_day,
            timezone: self.timezone.clone(),
        }
    }
}

/// Everything a command needs
struct App {
    settings: Settings,
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    json: bool,
}

impl App {
    fn new(args: &Args) -> Result<Self> {
        let settings = load_settings(args.config.as_ref())?;

        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.service.data_dir());
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;

        let db_path = data_dir.join(DATABASE_FILENAME);
        let store = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        debug!(db_path = %db_path.display(), "Store initialized");

        if is_mock_time_active() {
            warn!(
                env = MOCK_TIME_ENV_VAR,
                "Mock time is active; the clock is offset"
            );
        }
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let scheduler =
            Scheduler::new(store.clone(), store.clone(), clock.clone()).with_settings(&settings);

        Ok(Self {
            settings,
            store,
            clock,
            scheduler,
            json: args.json,
        })
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Next {
                rule,
                after,
                count,
                until,
            } => self.next(&rule, after, count, until),
            Command::Classify { occurrence, at, now } => self.classify(occurrence, at, now),
            Command::Create { user, rule } => self.create(user, &rule),
            Command::Show { user, upcoming } => self.show(user, upcoming),
            Command::Instant { user } => self.instant(user),
            Command::Join { occurrence } => self.join(&occurrence),
            Command::Cancel {
                schedule,
                occurrence,
            } => self.cancel(schedule, occurrence),
            Command::Complete {
                occurrence,
                summary,
            } => self.complete(&occurrence, &summary),
            Command::Watch { user, tick_ms } => self.watch(user, tick_ms).await,
            Command::Apply => self.apply(),
            Command::Sweep => self.sweep(),
            Command::Audit { limit } => self.audit(limit),
        }
    }

    fn next(
        &self,
        rule: &RuleArgs,
        after: Option<DateTime<Utc>>,
        count: usize,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let rule = rule
            .to_raw()
            .to_rule(self.settings.service.default_timezone)?;
        let after = after.unwrap_or_else(|| self.clock.now());
        let cap = self.settings.recurrence.enumeration_cap;

        let occurrences = match until {
            Some(until) => match enumerate_occurrences(&rule, after, until, cap) {
                Ok(all) => all,
                Err(overflow) => {
                    warn!(cap = overflow.cap, "Stopped at the enumeration cap");
                    overflow.partial
                }
            },
            None => upcoming(&rule, after, count, cap),
        };

        if self.json {
            return print_json(&occurrences);
        }
        for occurrence in &occurrences {
            println!("{}", format_local(occurrence));
        }
        Ok(())
    }

    fn classify(
        &self,
        occurrence: Option<OccurrenceId>,
        at: Option<DateTime<Utc>>,
        now: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let classification = match (occurrence, at) {
            (Some(id), _) => self.scheduler.classify_occurrence(&id)?,
            (None, Some(at)) => {
                let now = now.unwrap_or_else(|| self.clock.now());
                self.scheduler.policy().classify(at, now)
            }
            (None, None) => bail!("Either --occurrence or --at is required"),
        };

        if self.json {
            return print_json(&classification);
        }
        println!("{}", describe(&classification));
        Ok(())
    }

    fn create(&self, user: String, rule: &RuleArgs) -> Result<()> {
        let rule = rule
            .to_raw()
            .to_rule(self.settings.service.default_timezone)?;
        let schedule = self.scheduler.create_schedule(UserId::new(user), rule)?;

        if self.json {
            return print_json(&schedule);
        }
        println!("Created schedule {}", schedule.id);
        print_schedule(&schedule, &self.scheduler);
        Ok(())
    }

    fn show(&self, user: String, count: usize) -> Result<()> {
        let user_id = UserId::new(user);
        let Some(schedule) = self.scheduler.current_schedule(&user_id)? else {
            if self.json {
                return print_json(&serde_json::Value::Null);
            }
            println!("No schedule for {}", user_id);
            return Ok(());
        };

        let occurrences = if count > 0 {
            match self.scheduler.upcoming_occurrences(&schedule.id, count) {
                Ok(all) => all,
                Err(CoreError::RecurrenceOverflow(overflow)) => overflow.partial,
                Err(e) => return Err(e.into()),
            }
        } else {
            Vec::new()
        };

        if self.json {
            #[derive(Serialize)]
            struct ShowOutput<'a> {
                schedule: &'a ScheduleInstance,
                classification: Classification,
                upcoming: Vec<DateTime<Tz>>,
            }
            let classification = self
                .scheduler
                .classify_occurrence(&schedule.next_occurrence.id)?;
            return print_json(&ShowOutput {
                schedule: &schedule,
                classification,
                upcoming: occurrences,
            });
        }

        print_schedule(&schedule, &self.scheduler);
        if !occurrences.is_empty() {
            println!("  Upcoming:");
            for occurrence in &occurrences {
                println!("    {}", format_local(occurrence));
            }
        }
        Ok(())
    }

    fn instant(&self, user: String) -> Result<()> {
        let session = self.scheduler.create_instant_session(UserId::new(user))?;

        if self.json {
            return print_json(&serde_json::json!({
                "occurrence": session.occurrence,
                "context": session.context,
                "state": session.state,
            }));
        }
        println!(
            "Instant session {} started ({}); session context {}",
            session.occurrence.id, session.state, session.context.id
        );
        Ok(())
    }

    fn join(&self, occurrence: &OccurrenceId) -> Result<()> {
        let outcome = self.scheduler.join(occurrence)?;

        if self.json {
            let (joined, next) = match &outcome {
                JoinOutcome::Joined {
                    next_occurrence, ..
                } => (true, Some(next_occurrence)),
                JoinOutcome::Attached { .. } => (false, None),
            };
            return print_json(&serde_json::json!({
                "created": joined,
                "context": outcome.context(),
                "next_occurrence": next,
            }));
        }

        match &outcome {
            JoinOutcome::Joined {
                context,
                next_occurrence,
            } => {
                println!("Joined; session context {}", context.id);
                println!(
                    "Next occurrence {} at {}",
                    next_occurrence.id, next_occurrence.scheduled_at
                );
            }
            JoinOutcome::Attached { context } => {
                println!("Attached to session context {}", context.id);
            }
        }
        Ok(())
    }

    fn cancel(&self, schedule: Option<ScheduleId>, occurrence: Option<OccurrenceId>) -> Result<()> {
        let target = match (schedule, occurrence) {
            (Some(id), _) => CancelTarget::Schedule(id),
            (None, Some(id)) => CancelTarget::Occurrence(id),
            (None, None) => bail!("Either --schedule or --occurrence is required"),
        };
        let outcome = self.scheduler.cancel(target)?;

        if self.json {
            return match &outcome {
                CancelOutcome::Schedule(schedule) => print_json(schedule),
                CancelOutcome::InstantSession { occurrence_id } => {
                    print_json(&serde_json::json!({ "cancelled": occurrence_id }))
                }
            };
        }
        match outcome {
            CancelOutcome::Schedule(schedule) => {
                println!("Cancelled schedule {} for {}", schedule.id, schedule.user_id)
            }
            CancelOutcome::InstantSession { occurrence_id } => {
                println!("Cancelled instant session {}", occurrence_id)
            }
        }
        Ok(())
    }

    fn complete(&self, occurrence: &OccurrenceId, summary: &str) -> Result<()> {
        let summary: serde_json::Value =
            serde_json::from_str(summary).context("Summary must be valid JSON")?;
        let schedule_id = self.scheduler.complete_session(occurrence, summary)?;

        if self.json {
            return print_json(&serde_json::json!({ "schedule_id": schedule_id }));
        }
        match schedule_id {
            Some(id) => println!("Session completed; summary stored on schedule {}", id),
            None => println!("Session completed"),
        }
        Ok(())
    }

    async fn watch(&self, user: String, tick_ms: u64) -> Result<()> {
        let user_id = UserId::new(user);
        let schedule = self
            .scheduler
            .current_schedule(&user_id)?
            .with_context(|| format!("No schedule for {}", user_id))?;
        let occurrence = schedule.next_occurrence;

        let mut countdown = Countdown::spawn(
            occurrence.scheduled_at,
            *self.scheduler.policy(),
            self.clock.clone(),
            Duration::from_millis(tick_ms.max(1)),
        );
        info!(
            occurrence_id = %occurrence.id,
            scheduled_at = %occurrence.scheduled_at,
            "Watching occurrence"
        );

        self.print_tick(&countdown.current())?;
        loop {
            tokio::select! {
                update = countdown.changed() => match update {
                    Some(classification) => self.print_tick(&classification)?,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupted");
                    break;
                }
            }
        }
        Ok(())
    }

    fn print_tick(&self, classification: &Classification) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(classification)?);
        } else {
            println!("{}", describe(classification));
        }
        Ok(())
    }

    fn apply(&self) -> Result<()> {
        let mut created = Vec::new();
        let mut skipped = Vec::new();

        for seed in &self.settings.schedules {
            match self
                .scheduler
                .create_schedule(seed.user_id.clone(), seed.rule)
            {
                Ok(schedule) => created.push(schedule),
                Err(CoreError::DuplicateSchedule { user_id }) => {
                    info!(user_id = %user_id, "User already has a schedule, skipping");
                    skipped.push(user_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.json {
            return print_json(&serde_json::json!({
                "created": created,
                "skipped": skipped,
            }));
        }
        for schedule in &created {
            println!(
                "Created schedule {} for {}",
                schedule.id, schedule.user_id
            );
        }
        for user_id in &skipped {
            println!("Skipped {} (already scheduled)", user_id);
        }
        Ok(())
    }

    fn sweep(&self) -> Result<()> {
        let advanced = self.scheduler.sweep()?;
        if self.json {
            return print_json(&serde_json::json!({ "advanced": advanced }));
        }
        println!("Rolled {} schedule(s) forward", advanced);
        Ok(())
    }

    fn audit(&self, limit: usize) -> Result<()> {
        let events: Vec<AuditEvent> = self.store.get_recent_audits(limit)?;
        if self.json {
            return print_json(&events);
        }
        for event in &events {
            println!(
                "{} {}",
                event.timestamp.to_rfc3339(),
                serde_json::to_string(&event.event)?
            );
        }
        Ok(())
    }
}

/// Load settings. A missing file at the default location means defaults;
/// a missing file that was asked for explicitly is an error.
fn load_settings(explicit: Option<&PathBuf>) -> Result<Settings> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Settings::default());
            }
            path
        }
    };

    let settings = load_config(&path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    info!(
        config_path = %path.display(),
        schedules = settings.schedules.len(),
        "Configuration loaded"
    );
    Ok(settings)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_local(dt: &DateTime<Tz>) -> String {
    dt.format("%Y-%m-%d %H:%M %Z (%a)").to_string()
}

fn describe(classification: &Classification) -> String {
    let remaining = format_countdown(classification.time_remaining);
    match classification.state {
        OccurrenceState::Upcoming => format!("upcoming, starts in {}", remaining),
        OccurrenceState::StartingSoon => {
            format!("starting soon, starts in {}", remaining)
        }
        OccurrenceState::Ready => {
            format!("ready to join, window closes in {}", remaining)
        }
        state => state.to_string(),
    }
}

fn print_schedule(schedule: &ScheduleInstance, scheduler: &Scheduler) {
    let tz = schedule.rule.timezone();
    let next = schedule.next_occurrence.scheduled_at.with_timezone(&tz);
    let wait = (schedule.next_occurrence.scheduled_at - scheduler.now())
        .to_std()
        .unwrap_or(Duration::ZERO);

    println!("Schedule {} ({})", schedule.id, schedule.status);
    println!("  User:     {}", schedule.user_id);
    println!(
        "  Rule:     {} at {} {}",
        schedule.rule.frequency().name(),
        schedule.rule.time(),
        tz
    );
    println!(
        "  Next:     {} [{}] in {}",
        format_local(&next),
        schedule.next_occurrence.id,
        format_duration(wait)
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging on stderr so stdout stays parseable
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    debug!(version = env!("CARGO_PKG_VERSION"), "cadence starting");

    let app = App::new(&args)?;
    app.run(args.command).await
}
