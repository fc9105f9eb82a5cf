mod config;
mod db;
mod escalate;
mod events;
mod monitor;
mod pidfile;
mod shell;
mod signals;
mod supervisor;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;

use config::Config;
use events::EventKind;

/// Background daemon that detaches from its launcher, watches a backlight
/// brightness file, and records screen on/off transitions.
#[derive(Parser, Debug)]
#[command(name = "screenlogd", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/screenlogd.toml")]
    config: PathBuf,

    /// Override the pid file path
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Override the watched brightness file
    #[arg(long)]
    watched_file: Option<PathBuf>,

    /// Override the event database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the detached monitoring worker
    ///
    /// Exits 0 when a worker was started, 1 when one is already running,
    /// 2 on failure.
    Start,
    /// Stop the running worker
    Stop,
    /// Show worker and screen state
    Status {
        /// Machine-readable JSON output
        #[arg(long)]
        json: bool,
    },
    /// Print the worker pid, or -1 when not running
    Pid,
    /// Print the current raw value of the watched file, or -1 when unreadable
    Value,
    /// List recorded screen events, newest first
    Events {
        /// Only events from the last N hours
        #[arg(long, default_value_t = 12)]
        hours: i64,
        /// Cap the number of events printed (ignores --hours)
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
struct StatusReport {
    running: bool,
    pid: Option<i32>,
    value: i64,
    screen_on: bool,
    last_screen_on: Option<String>,
    last_screen_off: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .init();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    if let Some(pid_file) = cli.pid_file {
        config.daemon.pid_file = pid_file;
    }
    if let Some(watched_file) = cli.watched_file {
        config.monitor.watched_file = watched_file;
    }
    if let Some(db_path) = cli.db_path {
        config.storage.db_path = db_path;
    }

    let code = match cli.command {
        Commands::Start => cmd_start(&config),
        Commands::Stop => cmd_stop(&config),
        Commands::Status { json } => cmd_status(&config, json),
        Commands::Pid => cmd_pid(&config),
        Commands::Value => cmd_value(&config),
        Commands::Events { hours, limit } => cmd_events(&config, hours, limit),
    };
    std::process::exit(code);
}

fn cmd_start(config: &Config) -> i32 {
    match supervisor::start(config) {
        Ok(outcome) => {
            match outcome {
                supervisor::StartOutcome::Started => println!("started"),
                supervisor::StartOutcome::AlreadyRunning => {
                    println!("already running (pid {})", pid_or_sentinel(config))
                }
            }
            outcome.code()
        }
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    }
}

fn cmd_stop(config: &Config) -> i32 {
    match supervisor::stop(&config.daemon.pid_file) {
        Ok(()) => {
            println!("stopped");
            0
        }
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    }
}

fn cmd_status(config: &Config, json: bool) -> i32 {
    let running = supervisor::is_running(&config.daemon.pid_file);
    let pid = supervisor::get_pid(&config.daemon.pid_file).map(|p| p.as_raw());
    let value = events::read_raw_value(&config.monitor.watched_file);

    let (last_screen_on, last_screen_off) = match db::open_or_create(&config.storage.db_path) {
        Ok(conn) => (
            db::last_event_time(&conn, EventKind::ScreenOn)
                .ok()
                .flatten(),
            db::last_event_time(&conn, EventKind::ScreenOff)
                .ok()
                .flatten(),
        ),
        Err(err) => {
            tracing::debug!(error = %err, "event database unavailable");
            (None, None)
        }
    };

    let report = StatusReport {
        running,
        pid,
        value,
        screen_on: events::screen_on(value),
        last_screen_on,
        last_screen_off,
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(out) => println!("{out}"),
            Err(err) => {
                eprintln!("error: {err}");
                return 2;
            }
        }
    } else {
        println!(
            "worker:          {}",
            if report.running {
                format!("running (pid {})", report.pid.unwrap_or(-1))
            } else {
                "not running".to_string()
            }
        );
        println!(
            "screen:          {} (raw value {})",
            if report.screen_on { "on" } else { "off" },
            report.value
        );
        println!(
            "last screen on:  {}",
            report.last_screen_on.as_deref().unwrap_or("-")
        );
        println!(
            "last screen off: {}",
            report.last_screen_off.as_deref().unwrap_or("-")
        );
    }
    0
}

fn cmd_pid(config: &Config) -> i32 {
    println!("{}", pid_or_sentinel(config));
    0
}

fn cmd_value(config: &Config) -> i32 {
    println!("{}", events::read_raw_value(&config.monitor.watched_file));
    0
}

fn cmd_events(config: &Config, hours: i64, limit: Option<u32>) -> i32 {
    let conn = match db::open_or_create(&config.storage.db_path) {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("error: {err}");
            return 2;
        }
    };

    let rows = match limit {
        Some(limit) => db::recent_events(&conn, limit),
        None => {
            let cutoff = (chrono::Local::now() - chrono::Duration::hours(hours))
                .format(events::TIMESTAMP_FORMAT)
                .to_string();
            db::events_since(&conn, &cutoff)
        }
    };

    match rows {
        Ok(rows) => {
            for event in rows {
                println!("{:>6}  {}  {}", event.id, event.timestamp, event.event_type);
            }
            0
        }
        Err(err) => {
            eprintln!("error: {err}");
            2
        }
    }
}

fn pid_or_sentinel(config: &Config) -> i32 {
    supervisor::get_pid(&config.daemon.pid_file)
        .map(|p| p.as_raw())
        .unwrap_or(-1)
}
