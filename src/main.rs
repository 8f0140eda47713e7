//! # Chime: recurring reminder daemon
//!
//! Usage:
//!   chime run                                   # Recover missed reminders, then poll
//!   chime add "Water plants" --rule FREQ=DAILY --at 08:00
//!   chime list                                  # Show stored tasks
//!   chime complete <task-id>                    # Mark done, advance due date
//!   chime next "FREQ=WEEKLY;BYDAY=MO" -n 3      # Preview occurrences
//!   chime validate "FREQ=DAILY;UNTIL=20200101"
//!   chime describe "FREQ=MONTHLY;BYDAY=-1FR"

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chime_core::ChimeConfig;
use chime_core::traits::Storage;
use chime_scheduler::store::{self, TASKS_KEY};
use chime_scheduler::{
    BlobWriter, EventKind, PersistenceController, RecurrenceCalculator, RecurrenceRule, Scheduler,
    SchedulerEvent, SchedulerOptions, Task, TimeOfDay,
};

#[derive(Parser)]
#[command(name = "chime", version, about = "⏰ Chime: recurring reminders")]
struct Cli {
    /// Config file (default: ~/.chime/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover missed occurrences, then report due tasks until Ctrl-C
    Run,
    /// Add a recurring task
    Add {
        title: String,
        /// RRULE body or full DTSTART/RRULE block
        #[arg(short, long, default_value = "FREQ=DAILY")]
        rule: String,
        /// Series start (RFC 3339, default now)
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        /// IANA timezone the rule is evaluated in
        #[arg(long, default_value = "UTC")]
        tz: String,
        /// Pin every occurrence to this local time (HH:MM)
        #[arg(long)]
        at: Option<String>,
        /// Schedule from completion time instead of due date
        #[arg(long)]
        when_done: bool,
    },
    /// List stored tasks
    List,
    /// Mark a task's current occurrence done
    Complete { id: String },
    /// Preview the next occurrences of a rule
    Next {
        rule: String,
        /// Reference time (RFC 3339, default now)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Check a rule for syntax, expiry and emptiness
    Validate { rule: String },
    /// Render a rule in English
    Describe { rule: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "chime=debug,chime_scheduler=debug,chime_core=debug"
    } else {
        "chime=info,chime_scheduler=info,chime_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => ChimeConfig::load_from(Path::new(&shellexpand::tilde(path).to_string()))?,
        None => ChimeConfig::load()?,
    };

    match cli.command {
        Command::Run => run(&config).await,
        Command::Add {
            title,
            rule,
            start,
            tz,
            at,
            when_done,
        } => {
            let start = start.unwrap_or_else(Utc::now).trunc_subsecs(0);
            let mut rule = RecurrenceRule::imported(&rule, start)
                .with_timezone(&tz)
                .with_when_done(when_done);
            if let Some(at) = at {
                let time = TimeOfDay::parse(&at).context("--at expects HH:MM")?;
                rule = rule.with_fixed_time(time);
            }
            add(&config, &title, rule).await
        }
        Command::List => list(&config).await,
        Command::Complete { id } => complete(&config, &id).await,
        Command::Next {
            rule,
            from,
            tz,
            count,
        } => {
            let from = from.unwrap_or_else(Utc::now).trunc_subsecs(0);
            let rule = RecurrenceRule::imported(&rule, from).with_timezone(&tz);
            let calc = RecurrenceCalculator::new();
            let mut cursor = from;
            for _ in 0..count {
                match calc.compute_next("cli", &rule, cursor)? {
                    Some(next) => {
                        println!("{}", next.to_rfc3339());
                        cursor = next;
                    }
                    None => {
                        println!("(series ended)");
                        break;
                    }
                }
            }
            Ok(())
        }
        Command::Validate { rule } => {
            let validation = RecurrenceCalculator::new().validate(&rule);
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Describe { rule } => {
            println!("{}", RecurrenceCalculator::new().describe(&rule));
            Ok(())
        }
    }
}

async fn run(config: &ChimeConfig) -> Result<()> {
    config.log_summary();
    let storage = store::open(&config.storage)?;
    let scheduler = Scheduler::new(
        storage,
        Arc::new(RecurrenceCalculator::new()),
        SchedulerOptions::from_config(&config.scheduler),
    );
    scheduler.on(EventKind::Due, |event| {
        if let SchedulerEvent::Due { task_id, due_at } = event {
            tracing::info!("📣 Due: {} (at {})", task_id, due_at);
        }
    });
    scheduler.on(EventKind::Overdue, |event| {
        if let SchedulerEvent::Overdue { task_id, missed_at } = event {
            tracing::info!("📣 Missed while offline: {} (at {})", task_id, missed_at);
        }
    });

    scheduler.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down...");
    scheduler.stop().await;
    Ok(())
}

/// Task-list writer for one-shot commands.
fn task_writer(storage: Arc<dyn Storage>, config: &ChimeConfig) -> PersistenceController<Vec<Task>> {
    PersistenceController::from_config(
        Arc::new(BlobWriter::new(storage, TASKS_KEY)),
        &config.persistence,
    )
}

async fn add(config: &ChimeConfig, title: &str, rule: RecurrenceRule) -> Result<()> {
    let calc = RecurrenceCalculator::new();
    let Some(task) = Task::from_rule(&calc, title, rule)? else {
        anyhow::bail!("Rule produces no occurrences");
    };
    let storage = store::open(&config.storage)?;
    let mut tasks = store::load_tasks(storage.as_ref()).await?;
    println!("✅ Added '{}' ({}), first due {}", task.title, task.id, task.due_at.to_rfc3339());
    tasks.push(task);

    let writer = task_writer(storage, config);
    writer.request_save(tasks);
    writer.flush().await?;
    Ok(())
}

async fn list(config: &ChimeConfig) -> Result<()> {
    let storage = store::open(&config.storage)?;
    let calc = RecurrenceCalculator::new();
    let tasks = store::load_tasks(storage.as_ref()).await?;
    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in &tasks {
        let state = if task.enabled { "⏰" } else { "💤" };
        println!(
            "{} {}  {}  due {}  ({})",
            state,
            task.id,
            task.title,
            task.due_at.to_rfc3339(),
            calc.describe(&task.frequency.rrule_body())
        );
    }
    Ok(())
}

async fn complete(config: &ChimeConfig, id: &str) -> Result<()> {
    let storage = store::open(&config.storage)?;
    let calc = RecurrenceCalculator::new();
    let mut tasks = store::load_tasks(storage.as_ref()).await?;
    let task = tasks
        .iter_mut()
        .find(|t| t.id == id)
        .with_context(|| format!("No task with id {id}"))?;
    match task.complete(&calc, Utc::now())? {
        Some(next) => println!("✅ '{}' done, next due {}", task.title, next.to_rfc3339()),
        None => println!("🏁 '{}' done, series finished", task.title),
    }

    let writer = task_writer(storage, config);
    writer.request_save(tasks);
    writer.flush().await?;
    Ok(())
}
