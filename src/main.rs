use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repovault::daemon::is_daemon_running;
use repovault::events::{EventLog, NotificationSink, TraceSink};
use repovault::{
    ChangeDetector, Config, Coordinator, CursorStore, Daemon, RemoteGateway, Shutdown,
    TrackedProject, TrackedSet,
};

#[derive(Parser)]
#[command(name = "repovault")]
#[command(about = "Release and branch artifact mirroring daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration, download directory and tracked-list file
    Init {
        /// Root directory for downloaded artifacts
        #[arg(short, long, default_value = "~/mirror")]
        download_dir: String,
    },

    /// Add a project reference to the tracked list
    Add {
        /// Repository URL or owner/repo pair
        reference: String,
    },

    /// List tracked projects and their sync cursors
    List {
        /// Show cursor details
        #[arg(long)]
        details: bool,
    },

    /// Run one full sweep over the tracked list
    Sync {
        /// Check a single project instead of the whole list
        #[arg(long)]
        project: Option<String>,
    },

    /// Show recent sync events
    Events {
        /// Maximum number of events to show
        #[arg(long, default_value_t = 20)]
        limit: u32,

        /// Only events for this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Run as daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config)?;

    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting repovault v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { download_dir } => cmd_init(download_dir, &config).await,
        Commands::Add { reference } => cmd_add(reference, &config).await,
        Commands::List { details } => cmd_list(details, &config).await,
        Commands::Sync { project } => cmd_sync(project, &config).await,
        Commands::Events { limit, project } => cmd_events(limit, project),
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, &config).await,
    }
}

/// Initialize logging based on verbosity level and configured default
fn init_logging(verbose: bool, configured_level: &str) -> Result<()> {
    let fallback = if verbose {
        "debug".to_string()
    } else {
        configured_level.to_string()
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Config::load_or_default(),
    }
}

/// Initialize repovault: config file, download directory, tracked list
async fn cmd_init(download_dir: String, config: &Config) -> Result<()> {
    info!("Initializing repovault...");

    let expanded_download_dir = shellexpand::full(&download_dir)?;
    std::fs::create_dir_all(expanded_download_dir.as_ref())
        .context("Failed to create download directory")?;

    let mut new_config = config.clone();
    new_config.download_dir = download_dir.clone();
    new_config.tracklist = format!("{}/repositories.txt", download_dir);

    let config_path = Config::default_config_path()?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    new_config.save(&config_path)?;

    // Seed an empty tracked-list file so the daemon has something to watch
    let tracklist_path = format!("{}/repositories.txt", expanded_download_dir);
    if !std::path::Path::new(&tracklist_path).exists() {
        std::fs::write(
            &tracklist_path,
            "# One project per line: owner/repo or https://github.com/owner/repo\n",
        )
        .context("Failed to create tracked-list file")?;
    }

    println!("✅ repovault initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   Download directory: {}", expanded_download_dir);
    println!("   Tracked list: {}", tracklist_path);
    println!("   Next: add projects with 'repovault add owner/repo'");

    Ok(())
}

/// Add a project reference to the tracked-list file
async fn cmd_add(reference: String, config: &Config) -> Result<()> {
    let tracked = TrackedSet::new(&config.tracklist, Arc::new(TraceSink));

    let (project, outcome) = tracked
        .add_to_file(&reference)
        .await
        .with_context(|| format!("Failed to add {:?} to the tracked list", reference))?;

    match outcome {
        repovault::tracklist::AddOutcome::Added => {
            println!("✅ Now tracking {}", project);
            println!("   A running daemon will pick it up automatically");
        }
        repovault::tracklist::AddOutcome::AlreadyTracked => {
            println!("ℹ️  {} is already tracked", project);
        }
    }

    Ok(())
}

/// List tracked projects with their cursor status
async fn cmd_list(details: bool, config: &Config) -> Result<()> {
    let tracked = TrackedSet::new(&config.tracklist, Arc::new(TraceSink));
    let projects = tracked.load_initial().await?;
    let store = CursorStore::new(&config.download_dir);

    println!("Tracked projects ({}):", projects.len());

    for project in projects {
        println!("  📁 {}", project);

        if details {
            match store.load_release(&project).await? {
                Some(cursor) => println!("     release: {} ({})", cursor.tag, cursor.commit),
                None => println!("     release: never synced"),
            }
            match store.load_branch(&project).await? {
                Some(cursor) => println!("     branch:  {} @ {}", cursor.branch, cursor.commit),
                None => println!("     branch:  never synced"),
            }
        }
    }

    Ok(())
}

/// Run one full sweep in the foreground
async fn cmd_sync(project_filter: Option<String>, config: &Config) -> Result<()> {
    info!("Starting mirror sweep...");

    let sink: Arc<dyn NotificationSink> = match EventLog::open_default() {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::warn!("Event log unavailable, falling back to log output: {:#}", e);
            Arc::new(TraceSink)
        }
    };

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .with_context(|| format!("Failed to create download directory: {}", config.download_dir))?;

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.trigger();
        });
    }

    let tracked = TrackedSet::new(&config.tracklist, sink.clone());
    let gateway = Arc::new(RemoteGateway::new(&config.gateway, sink.clone(), shutdown.clone())?);
    let detector = Arc::new(ChangeDetector::new(
        gateway,
        CursorStore::new(&config.download_dir),
        config.branch.clone(),
    ));
    let coordinator = Coordinator::new(
        detector,
        tracked.registry(),
        sink,
        config.sync.max_parallel,
        config.check_timeout(),
        shutdown,
    );

    let summary = match project_filter {
        Some(reference) => {
            let project = TrackedProject::parse(&reference)?;
            println!("🔍 Checking {}", project);
            coordinator.sweep_projects(vec![project]).await
        }
        None => {
            let projects = tracked.load_initial().await?;
            println!("🔍 Checking {} tracked project(s)", projects.len());
            coordinator.sweep().await
        }
    };

    println!("\n🎉 Sweep complete!");
    println!("   📊 Projects checked: {}", summary.projects);
    println!("   ⬇️  Cursors updated: {}", summary.updates);
    println!("   ✅ Already current: {}", summary.unchanged);
    println!("   ❌ Failed checks: {}", summary.failures);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failures > 0 {
        println!("\n💡 See 'repovault events' for failure details");
    }

    Ok(())
}

/// Show recent sync events from the event log
fn cmd_events(limit: u32, project_filter: Option<String>) -> Result<()> {
    let log = EventLog::open_default().context("Failed to open event log")?;

    let events = match &project_filter {
        Some(reference) => {
            let project = TrackedProject::parse(reference)?;
            log.for_project(&project.full_name(), limit)?
        }
        None => log.recent(limit)?,
    };

    if events.is_empty() {
        println!("No sync events recorded yet");
        return Ok(());
    }

    for event in events {
        let icon = match event.severity {
            repovault::events::Severity::Info => "✅",
            repovault::events::Severity::Warning => "⚠️ ",
            repovault::events::Severity::Error => "❌",
        };
        let project = event.project.as_deref().unwrap_or("-");
        println!(
            "{} {} [{}] {}: {}",
            icon,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind.as_str(),
            project,
            event.summary
        );
        if let Some(details) = &event.details {
            println!("     {}", details);
        }
    }

    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: &Config) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { foreground } => {
            println!("🚀 Starting repovault daemon...");

            if is_daemon_running(config)? {
                println!("⚠️  Daemon is already running!");
                println!("   Use 'repovault daemon stop' to stop it first");
                return Ok(());
            }

            let daemon = Daemon::new((*config).clone());

            if foreground {
                println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
                daemon.run().await?;
            } else {
                #[cfg(unix)]
                {
                    daemon.daemonize()?;
                    daemon.run().await?;
                }

                #[cfg(not(unix))]
                {
                    println!("❌ Background daemon mode not supported on this platform");
                    println!("   Use --foreground to run in foreground mode");
                    return Ok(());
                }
            }
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping repovault daemon...");

            if !is_daemon_running(config)? {
                println!("⚠️  No daemon appears to be running");
                return Ok(());
            }

            let daemon = Daemon::new((*config).clone());
            daemon.stop()?;

            println!("✅ Daemon stop signal sent");
        }

        DaemonCommands::Status => {
            println!("📊 repovault Daemon Status");

            if is_daemon_running(config)? {
                println!("   🟢 Status: Running");
                println!("   🔄 Sweep interval: {}", config.sync.interval);
                println!("   📁 Download directory: {}", config.download_dir);
                println!("   📋 Tracked list: {}", config.tracklist);
                if !config.daemon.log_file.is_empty() {
                    println!("   📄 Log file: {}", config.daemon.log_file);
                }
            } else {
                println!("   🔴 Status: Not running");
                println!("   💡 Use 'repovault daemon start' to start the daemon");
            }
        }
    }

    Ok(())
}
