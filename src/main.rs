mod config;
mod controller;
mod data_dir;
mod events;
mod instance;
mod notifier;
mod process;
mod quota;
mod retry;
mod signals;
mod status;

use clap::{Parser, Subcommand};
use config::WardenConfig;
use controller::{Controller, LoopSettings};
use data_dir::DataDir;
use events::TracingEventLog;
use instance::InstanceGuard;
use notifier::DesktopNotifier;
use process::ProcScanner;
use quota::{QuotaPolicy, QuotaState};
use signals::SignalHandler;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Name of the host-wide instance marker.
const INSTANCE_NAME: &str = "playtime-warden-main";

/// How often the running daemon refreshes its instance marker.
const MARKER_REFRESH: Duration = Duration::from_secs(60 * 60);

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Enforces a daily time quota on a set of named processes: accrues time
/// while any of them runs, warns as the quota runs low, and terminates them
/// once it is spent.
#[derive(Parser, Debug)]
#[command(name = "playtime-warden", version, about)]
pub struct Cli {
    /// Config file path (default: config.toml in the data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging (every tick, save, and retry)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enforcement loop until SIGINT or SIGTERM
    Start,
    /// Print today's usage without touching the state file
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate config and print resolved settings, don't run
    Validate,
    /// Create the data directory and a default config
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let data_dir = DataDir::new(DataDir::default_root());
    let config_path = cli.config.clone().unwrap_or_else(|| data_dir.config());

    let result = match cli.command {
        Command::Init => cmd_init(&data_dir),
        Command::Validate => cmd_validate(&config_path, &data_dir),
        Command::Status { json } => cmd_status(&config_path, &data_dir, json),
        Command::Start => cmd_start(&config_path, &data_dir, cli.verbose).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

/// Load and validate config. Nothing runs against a config that fails here.
fn load_checked(config_path: &Path) -> Result<WardenConfig, config::ConfigError> {
    let cfg = config::load_config(config_path)?;
    cfg.validate()?;
    Ok(cfg)
}

fn state_path(cfg: &WardenConfig, data_dir: &DataDir) -> PathBuf {
    cfg.storage
        .state_file
        .clone()
        .unwrap_or_else(|| data_dir.state())
}

fn init_logging(cfg: &WardenConfig, verbose: bool) -> std::io::Result<()> {
    let default_level = if verbose {
        "playtime_warden=debug"
    } else {
        "playtime_warden=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cfg.storage.log_file {
        Some(path) => {
            DataDir::ensure_parent(path)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
    Ok(())
}

async fn cmd_start(config_path: &Path, data_dir: &DataDir, verbose: bool) -> CommandResult {
    let cfg = load_checked(config_path)?;
    init_logging(&cfg, verbose)?;
    let policy = QuotaPolicy::from_config(&cfg)?;
    let mut signals = SignalHandler::install()?;

    let guard = Arc::new(instance::acquire(INSTANCE_NAME)?);
    tracing::debug!(marker = %guard.path().display(), "instance marker held");

    let path = state_path(&cfg, data_dir);
    DataDir::ensure_parent(&path)?;
    let quota = Arc::new(QuotaState::load_or_fresh(policy, path));
    tracing::info!(
        used_mins = quota.accumulated_minutes(),
        remaining_mins = quota.remaining_minutes(),
        reset_in_mins = quota.time_until_next_reset().as_secs() / 60,
        "quota loaded"
    );

    // Nothing fallible runs between here and the release below.
    let refresher = spawn_marker_refresh(Arc::clone(&guard), MARKER_REFRESH);

    let mut controller = Controller::new(
        LoopSettings::from_config(&cfg),
        quota,
        Arc::new(ProcScanner::default()),
        Arc::new(DesktopNotifier::default()),
        Arc::new(TracingEventLog),
    );
    controller
        .run(async {
            let sig = signals.recv().await;
            tracing::info!(signal = %sig, "shutdown requested");
        })
        .await;

    refresher.abort();
    let _ = refresher.await;
    guard.release()?;
    Ok(())
}

/// Rewrite the marker timestamp every `period` until aborted.
fn spawn_marker_refresh(guard: Arc<InstanceGuard>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            if let Err(e) = guard.touch() {
                tracing::warn!(error = %e, "failed to refresh instance marker");
            }
        }
    })
}

fn cmd_status(config_path: &Path, data_dir: &DataDir, json: bool) -> CommandResult {
    let cfg = load_checked(config_path)?;
    let policy = QuotaPolicy::from_config(&cfg)?;
    let path = state_path(&cfg, data_dir);

    let Some(quota) = QuotaState::load(policy, &path)? else {
        return Err(format!(
            "no quota state at {}; run `playtime-warden start` first",
            path.display()
        )
        .into());
    };
    // In memory only; the daemon owns the file.
    if quota.should_reset() {
        quota.reset();
    }

    let controller = Controller::new(
        LoopSettings::from_config(&cfg),
        Arc::new(quota),
        Arc::new(ProcScanner::default()),
        Arc::new(DesktopNotifier::default()),
        Arc::new(TracingEventLog),
    );
    let report = controller.status();

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

fn cmd_validate(config_path: &Path, data_dir: &DataDir) -> CommandResult {
    let cfg = load_checked(config_path)?;
    let settings = LoopSettings::from_config(&cfg);

    println!("Config {} is valid", config_path.display());
    println!("Tracked processes: {}", settings.tracked.join(", "));
    println!("Daily limit:       {} min", cfg.quota.daily_limit_mins);
    println!("Reset time:        {}", cfg.quota.reset_time.trim());
    println!(
        "Warnings at:       {} min and {} min remaining",
        cfg.warning.first_threshold_mins, cfg.warning.final_threshold_mins
    );
    println!("Tick interval:     {}s", settings.tick_interval.as_secs());
    println!("Save interval:     {}s", settings.save_interval.as_secs());
    println!(
        "Terminate:         {} attempts, {}ms apart",
        settings.terminate_attempts,
        settings.terminate_retry_delay.as_millis()
    );
    println!("State file:        {}", state_path(&cfg, data_dir).display());
    match &cfg.storage.log_file {
        Some(p) => println!("Log file:          {}", p.display()),
        None => println!("Log file:          stderr"),
    }
    Ok(())
}

fn cmd_init(data_dir: &DataDir) -> CommandResult {
    if data_dir.init()? {
        println!("Created {}", data_dir.root().display());
    } else {
        println!("{} already exists", data_dir.root().display());
    }
    println!("Config: {}", data_dir.config().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_status_json_with_global_flags() {
        let cli = Cli::parse_from(["playtime-warden", "status", "--json", "-v", "--config", "x.toml"]);
        assert!(matches!(cli.command, Command::Status { json: true }));
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["playtime-warden"]).is_err());
    }

    #[test]
    fn test_state_path_prefers_config() {
        let dd = DataDir::new("/data");
        let mut cfg = WardenConfig::default();
        assert_eq!(state_path(&cfg, &dd), PathBuf::from("/data/state.json"));
        cfg.storage.state_file = Some(PathBuf::from("/elsewhere/q.json"));
        assert_eq!(state_path(&cfg, &dd), PathBuf::from("/elsewhere/q.json"));
    }

    #[test]
    fn test_load_checked_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[quota]\ndaily_limit_mins = 0\n").unwrap();
        assert!(load_checked(&path).is_err());

        std::fs::write(&path, "processes = [\"steam\"]\n").unwrap();
        assert!(load_checked(&path).is_ok());
    }

    #[tokio::test]
    async fn test_marker_refresh_touches_and_lets_go_on_abort() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(instance::acquire_with(dir.path(), "warden", |_| true).unwrap());
        std::fs::write(guard.path(), format!("{}\n1\n", std::process::id())).unwrap();

        let refresher = spawn_marker_refresh(Arc::clone(&guard), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let contents = std::fs::read_to_string(guard.path()).unwrap();
        assert!(!contents.ends_with("\n1\n"), "marker timestamp refreshed");

        refresher.abort();
        assert!(refresher.await.unwrap_err().is_cancelled());
        assert_eq!(Arc::strong_count(&guard), 1);

        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_status_requires_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::new(dir.path());
        let err = cmd_status(&dd.config(), &dd, false).unwrap_err();
        assert!(err.to_string().contains("run `playtime-warden start` first"));
    }

    #[test]
    fn test_status_applies_due_reset_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DataDir::new(dir.path());
        let stale = r#"{"accumulated_secs": 7200, "last_reset": 1000, "next_reset": 2000, "limit_fired": true}"#;
        std::fs::write(dd.state(), stale).unwrap();

        cmd_status(&dd.config(), &dd, true).unwrap();
        assert_eq!(std::fs::read_to_string(dd.state()).unwrap(), stale);
    }
}
