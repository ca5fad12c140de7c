use clap::{Parser, Subcommand};
use liftlog_core::machine::SessionEvent;
use liftlog_core::reconciler::{BackoffPolicy, Reconciler};
use liftlog_core::remote::DirRemoteStore;
use liftlog_core::*;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "liftlog")]
#[command(about = "Live workout session tracker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Target a specific session instead of the current one
    #[arg(long, global = true)]
    session: Option<Uuid>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session
    Start {
        /// Session name (e.g. "push day")
        #[arg(long)]
        name: String,

        /// Owner id
        #[arg(long, default_value = "local")]
        owner: String,

        /// Planned duration in minutes
        #[arg(long)]
        target_minutes: Option<u32>,

        /// Disable automatic adaptive rest after each set
        #[arg(long)]
        no_smart_rest: bool,
    },

    /// Begin warming up (records the session start time)
    Warmup,

    /// Begin an exercise
    Begin {
        /// Exercise id (e.g. bench_press)
        exercise: String,
    },

    /// Log a completed set
    Set {
        #[arg(long)]
        weight: Option<f64>,

        #[arg(long)]
        reps: Option<u32>,

        /// Rate of perceived exertion, 1-10
        #[arg(long)]
        rpe: Option<u8>,
    },

    /// Start a rest period
    Rest {
        /// Rest duration in seconds (omit for an untimed rest)
        #[arg(long)]
        seconds: Option<u32>,
    },

    /// Cut the current rest short
    SkipRest,

    /// Pause the session
    Pause,

    /// Resume a paused session
    Resume,

    /// Complete the session
    Complete,

    /// Emergency-stop the session from any state
    Stop {
        #[arg(long)]
        reason: String,
    },

    /// Show the current session and its metrics
    Status,

    /// Run one sync pass against the remote store
    Sync {
        /// Remote directory (overrides config)
        #[arg(long)]
        remote: Option<PathBuf>,

        /// Keep running, polling for pending events at the configured interval
        #[arg(long)]
        watch: bool,
    },

    /// Roll finished, fully-synced sessions up to CSV
    Rollup {
        /// Clean up processed files after rollup
        #[arg(long)]
        cleanup: bool,
    },

    /// Show archived session history
    History {
        /// How many days back to look
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

fn main() -> Result<()> {
    liftlog_core::logging::init();

    let cli = Cli::parse();

    let config = Config::load()?;
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| config.data.data_dir.clone());
    std::fs::create_dir_all(&data_dir)?;

    match cli.command {
        Commands::Start {
            name,
            owner,
            target_minutes,
            no_smart_rest,
        } => cmd_start(&data_dir, &config, name, owner, target_minutes, no_smart_rest),
        Commands::Warmup => cmd_event(&data_dir, &config, cli.session, SessionEvent::StartWarmup),
        Commands::Begin { exercise } => cmd_event(
            &data_dir,
            &config,
            cli.session,
            SessionEvent::BeginExercise {
                exercise_id: exercise,
            },
        ),
        Commands::Set { weight, reps, rpe } => cmd_event(
            &data_dir,
            &config,
            cli.session,
            SessionEvent::CompleteSet {
                weight_kg: weight,
                reps,
                rpe,
            },
        ),
        Commands::Rest { seconds } => {
            cmd_event(&data_dir, &config, cli.session, SessionEvent::StartRest { seconds })
        }
        Commands::SkipRest => cmd_event(&data_dir, &config, cli.session, SessionEvent::SkipRest),
        Commands::Pause => cmd_event(&data_dir, &config, cli.session, SessionEvent::Pause),
        Commands::Resume => cmd_event(&data_dir, &config, cli.session, SessionEvent::Resume),
        Commands::Complete => cmd_event(&data_dir, &config, cli.session, SessionEvent::Complete),
        Commands::Stop { reason } => cmd_event(
            &data_dir,
            &config,
            cli.session,
            SessionEvent::EmergencyStop { reason },
        ),
        Commands::Status => cmd_status(&data_dir, &config, cli.session),
        Commands::Sync { remote, watch } => cmd_sync(&data_dir, &config, remote, watch),
        Commands::Rollup { cleanup } => cmd_rollup(&data_dir, &config, cleanup),
        Commands::History { days } => cmd_history(&data_dir, days),
    }
}

/// The explicitly targeted session, or the most recent non-terminal one
fn resolve_session(orch: &Orchestrator, explicit: Option<Uuid>) -> Result<Uuid> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    orch.current_session()?
        .map(|s| s.id)
        .ok_or_else(|| Error::Session("no session in progress (run `liftlog start` first)".into()))
}

fn cmd_start(
    data_dir: &Path,
    config: &Config,
    name: String,
    owner: String,
    target_minutes: Option<u32>,
    no_smart_rest: bool,
) -> Result<()> {
    let mut orch = Orchestrator::open(data_dir, config)?;
    let options = SessionOptions {
        target_duration_minutes: target_minutes,
        smart_rest: config.rest.smart_rest && !no_smart_rest,
    };
    let id = orch.start_session(owner, name.clone(), options)?;

    println!("✓ Session started: {}", name);
    println!("  Id: {}", id);
    println!("  Next: `liftlog warmup` when you begin");
    Ok(())
}

fn cmd_event(
    data_dir: &Path,
    config: &Config,
    explicit: Option<Uuid>,
    event: SessionEvent,
) -> Result<()> {
    let mut orch = Orchestrator::open(data_dir, config)?;
    let id = resolve_session(&orch, explicit)?;

    match orch.dispatch(id, event) {
        Ok(session) => {
            println!("✓ Session is now {}", session.status.as_str());
            if session.status == SessionStatus::Resting {
                if let Some(seconds) = session.current_rest_seconds {
                    println!("  Rest target: {} seconds", seconds);
                }
            }
            Ok(())
        }
        Err(Error::InvalidTransition { from, event }) => {
            eprintln!("✗ Cannot {} while the session is {}", event, from);
            Err(Error::InvalidTransition { from, event })
        }
        Err(e) => Err(e),
    }
}

fn cmd_status(data_dir: &Path, config: &Config, explicit: Option<Uuid>) -> Result<()> {
    let mut orch = Orchestrator::open(data_dir, config)?;
    let id = resolve_session(&orch, explicit)?;
    let (session, snap) = orch.snapshot(id)?;
    let indicator = orch.sync_indicator(id)?;

    println!("╭─────────────────────────────────────────╮");
    println!("│  {}", session.name);
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!("  Status: {}", session.status.as_str());
    if let Some(exercise) = &session.current_exercise {
        println!("  Exercise: {}", exercise);
    }
    println!("  Sets: {}", snap.total_sets);
    println!("  Volume: {:.1} kg", snap.total_volume);
    if let Some(rpe) = snap.average_rpe {
        println!("  Average RPE: {:.1}", rpe);
    }
    println!("  Calories: ~{:.0} kcal", snap.estimated_calories);
    println!("  Active: {} min", snap.active_seconds / 60);
    println!("  Paused: {} min", session.total_pause_seconds / 60);

    if indicator.pending > 0 {
        println!();
        println!("  ⟳ {} event(s) pending sync (offline)", indicator.pending);
    }
    if indicator.failed > 0 {
        println!("  ✗ {} event(s) failed to sync", indicator.failed);
    }

    Ok(())
}

fn cmd_sync(
    data_dir: &Path,
    config: &Config,
    remote_override: Option<PathBuf>,
    watch: bool,
) -> Result<()> {
    let remote_dir = remote_override
        .or_else(|| config.sync.remote_dir.clone())
        .ok_or_else(|| {
            Error::Config("no remote configured (set [sync] remote_dir or pass --remote)".into())
        })?;

    let store = SessionStore::open(data_dir)?;
    let remote = DirRemoteStore::new(&remote_dir);
    let policy = BackoffPolicy {
        base: chrono::Duration::milliseconds(config.sync.base_backoff_ms as i64),
        cap: chrono::Duration::milliseconds(config.sync.max_backoff_ms as i64),
        max_attempts: config.sync.max_attempts,
    };
    let reconciler = Reconciler::new(
        data_dir.join("queue"),
        store,
        remote.clone(),
        remote,
        policy,
    );

    if watch {
        let interval = std::time::Duration::from_secs(config.sync.poll_interval_secs);
        println!(
            "Watching for pending events every {}s (Ctrl-C to stop)",
            config.sync.poll_interval_secs
        );
        // Keep the sender alive so the loop polls instead of exiting
        let (_wake_tx, wake_rx) = std::sync::mpsc::channel();
        reconciler.run(wake_rx, interval);
        return Ok(());
    }

    let report = reconciler.drain_once(chrono::Utc::now())?;
    println!("✓ Sync pass finished");
    println!("  Confirmed: {}", report.confirmed);
    println!("  Failed: {}", report.failed.len());
    println!("  Still pending: {}", report.still_pending);
    Ok(())
}

fn cmd_rollup(data_dir: &Path, config: &Config, cleanup: bool) -> Result<()> {
    let store = SessionStore::open(data_dir)?;
    let queue_dir = data_dir.join("queue");
    let csv_path = data_dir.join("sessions.csv");
    let model = CalorieModel::from(&config.calories);

    let count = archive::rollup_finished(&store, &queue_dir, &csv_path, &model)?;
    println!("✓ Rolled up {} session(s) to CSV", count);
    println!("  CSV: {}", csv_path.display());

    if cleanup {
        let cleaned = archive::cleanup_processed(&store, &queue_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed file(s)", cleaned);
        }
    }

    Ok(())
}

fn cmd_history(data_dir: &Path, days: i64) -> Result<()> {
    let csv_path = data_dir.join("sessions.csv");
    let sessions = archive::load_recent(&csv_path, days)?;

    if sessions.is_empty() {
        println!("No archived sessions in the last {} days.", days);
        return Ok(());
    }

    println!("Sessions from the last {} days:", days);
    println!();
    for session in sessions {
        let when = session
            .started_at
            .as_deref()
            .map(|s| s.chars().take(10).collect::<String>())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {}  {:<20} {:>3} sets  {:>8.1} kg  [{}]",
            when, session.name, session.total_sets, session.total_volume, session.status
        );
    }

    Ok(())
}
