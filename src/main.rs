//! crony - cron-scheduled shell tasks with live output.
//!
//! Usage:
//!   crony serve               Run the scheduler and the HTTP API
//!   crony list                List all tasks
//!   crony add NAME COMMAND    Create a task
//!   crony edit ID             Change a task
//!   crony remove ID           Delete a task
//!   crony run ID              Run a task in the foreground
//!   crony next EXPR           Preview upcoming triggers of an expression
//!   crony validate EXPR       Check a cron expression

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use crony::api::{create_api_state, start_server};
use crony::config::{EngineConfig, YamlLoader};
use crony::{
    Engine, Event, LastResult, OutputStream, Schedule, ScheduleError, Task, TaskDraft, TaskId,
    TaskSaved,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// crony - cron-scheduled shell tasks with live output
#[derive(Parser)]
#[command(name = "crony")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a crony.yaml configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the task store
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the HTTP API until Ctrl+C
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Run the scheduler without the HTTP API
        #[arg(long)]
        no_api: bool,
    },

    /// List all tasks
    List,

    /// Create a task
    Add {
        /// Display name
        name: String,

        /// Shell command
        command: String,

        #[command(flatten)]
        options: TaskOptions,
    },

    /// Change a task's fields
    Edit {
        /// Task ID
        id: String,

        /// New display name
        #[arg(long)]
        name: Option<String>,

        /// New shell command
        #[arg(long)]
        command: Option<String>,

        /// Remove the schedule; the task becomes manual-only
        #[arg(long, conflicts_with = "schedule")]
        no_schedule: bool,

        /// Enable the task
        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        /// Disable the task
        #[arg(long)]
        disable: bool,

        /// New cron schedule
        #[arg(short, long)]
        schedule: Option<String>,
    },

    /// Delete a task
    Remove {
        /// Task ID
        id: String,
    },

    /// Run a task in the foreground, streaming its output (Ctrl+C stops it)
    Run {
        /// Task ID
        id: String,
    },

    /// Show the next trigger instants of a cron expression
    Next {
        /// Cron expression or shortcut such as @daily
        expression: String,

        /// How many instants to show
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },

    /// Check a cron expression
    Validate {
        /// Cron expression or shortcut such as @daily
        expression: String,
    },
}

#[derive(Args)]
struct TaskOptions {
    /// Cron schedule; omit for a manual-only task
    #[arg(short, long)]
    schedule: Option<String>,

    /// Create the task disabled
    #[arg(long)]
    disabled: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => YamlLoader::load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    match cli.command {
        Commands::Serve { host, port, no_api } => {
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            serve(config, !no_api).await?;
        }
        Commands::List => {
            let engine = open_offline(config).await?;
            list_tasks(&engine).await?;
            engine.shutdown().await;
        }
        Commands::Add {
            name,
            command,
            options,
        } => {
            let engine = open_offline(config).await?;
            let mut draft = TaskDraft::new(name, command).with_enabled(!options.disabled);
            draft.schedule = options.schedule;
            let saved = engine.create_task(draft).await?;
            report_saved("created", &saved);
            engine.shutdown().await;
        }
        Commands::Edit {
            id,
            name,
            command,
            no_schedule,
            enable,
            disable,
            schedule,
        } => {
            let engine = open_offline(config).await?;
            let id = TaskId::from(id);
            let mut draft = engine.get_task(&id).await?.to_draft();
            if let Some(name) = name {
                draft.name = name;
            }
            if let Some(command) = command {
                draft.command = command;
            }
            if no_schedule {
                draft.schedule = None;
            } else if schedule.is_some() {
                draft.schedule = schedule;
            }
            if enable {
                draft.enabled = true;
            } else if disable {
                draft.enabled = false;
            }
            let saved = engine.update_task(&id, draft).await?;
            report_saved("updated", &saved);
            engine.shutdown().await;
        }
        Commands::Remove { id } => {
            let engine = open_offline(config).await?;
            let id = TaskId::from(id);
            engine.delete_task(&id).await?;
            println!("Deleted task {}", id);
            engine.shutdown().await;
        }
        Commands::Run { id } => {
            let engine = open_offline(config).await?;
            let result = run_foreground(&engine, TaskId::from(id)).await;
            engine.shutdown().await;
            if let Some(message) = result? {
                return Err(message.into());
            }
        }
        Commands::Next { expression, count } => {
            let schedule = Schedule::parse(expression)?;
            let instants = match schedule.next_n_after(&Local::now(), count) {
                Ok(instants) => instants,
                Err(ScheduleError::NoMoreOccurrences) => {
                    println!("'{}' never fires", schedule.expression());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            for at in instants {
                println!("{}", at.format("%Y-%m-%d %H:%M %a"));
            }
        }
        Commands::Validate { expression } => {
            let schedule = Schedule::parse(expression)?;
            match schedule.next() {
                Ok(next) => println!(
                    "'{}' is valid; next trigger at {}",
                    schedule.expression(),
                    next.format("%Y-%m-%d %H:%M")
                ),
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

/// Open the engine for a one-shot command. The scheduler loop stays off so a
/// short-lived CLI process never fires scheduled runs.
async fn open_offline(config: EngineConfig) -> Result<Engine, crony::EngineError> {
    Engine::builder(config).without_scheduler().build().await
}

/// Run the scheduler (and optionally the API) until Ctrl+C.
async fn serve(config: EngineConfig, with_api: bool) -> Result<(), Box<dyn std::error::Error>> {
    let api_config = config.api.clone();
    let engine = Arc::new(Engine::open(config).await?);

    let tasks = engine.list_tasks().await;
    info!("Loaded {} task(s)", tasks.len());
    for task in &tasks {
        let schedule_info = task.schedule_expression().unwrap_or("manual only");
        let enabled_info = if task.enabled { "" } else { " (disabled)" };
        info!("  - {} [{}]{}: {}", task.name, schedule_info, enabled_info, task.id);
    }

    let server = if with_api {
        Some(start_server(&api_config, create_api_state(engine.clone())).await?)
    } else {
        None
    };

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(server) = server {
        server.abort();
    }
    engine.shutdown().await;

    info!("Goodbye!");
    Ok(())
}

async fn list_tasks(engine: &Engine) -> Result<(), crony::EngineError> {
    let tasks = engine.list_tasks().await;
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    for task in &tasks {
        print_task(task);
        if let Some(next) = engine.next_trigger(&task.id).await? {
            println!("  Next: {}", next.format("%Y-%m-%d %H:%M"));
        }
        println!();
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("ID: {}", task.id);
    println!("  Name: {}", task.name);
    println!("  Command: {}", task.command);
    println!("  Schedule: {}", task.schedule_expression().unwrap_or("manual only"));
    println!("  Enabled: {}", task.enabled);
    if let Some(at) = task.last_run_at {
        println!("  Last run: {}", at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(result) = &task.last_result {
        match result {
            LastResult::Error { message, .. } => println!("  Last result: error ({})", message),
            other => println!("  Last result: {}", other.label()),
        }
    }
}

fn report_saved(verb: &str, saved: &TaskSaved) {
    println!("Task {} ({})", verb, saved.task.id);
    print_task(&saved.task);
    if let Some(e) = &saved.schedule_error {
        warn!("schedule will never trigger: {}", e);
    }
}

/// Run one task, echoing its output, and return an error message if it did
/// not succeed.
async fn run_foreground(
    engine: &Engine,
    task_id: TaskId,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let mut events = engine.subscribe();
    let run_id = engine.run_task(&task_id).await?;
    let mut stop_requested = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(Some("event stream closed".to_string()));
                };
                if event.run_id() != &run_id {
                    continue;
                }
                match event {
                    Event::TaskOutputChunk { stream, text, .. } => match stream {
                        OutputStream::Stdout => {
                            let mut out = std::io::stdout().lock();
                            out.write_all(text.as_bytes())?;
                            out.flush()?;
                        }
                        OutputStream::Stderr => {
                            let mut err = std::io::stderr().lock();
                            err.write_all(text.as_bytes())?;
                            err.flush()?;
                        }
                    },
                    Event::TaskStateChanged { result, .. } => match result {
                        LastResult::Running => {}
                        LastResult::Success { .. } => return Ok(None),
                        LastResult::Error { message, .. } => return Ok(Some(message)),
                        LastResult::Cancelled { .. } => return Ok(Some("cancelled".to_string())),
                        LastResult::Interrupted => return Ok(Some("interrupted".to_string())),
                    },
                }
            }
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                warn!("stopping task {}", task_id);
                stop_requested = true;
                engine.stop_task(&task_id).await?;
            }
        }
    }
}
