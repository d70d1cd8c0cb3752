//! Daemon Infrastructure - background service for continuous mirroring
//!
//! Owns the long-running wiring: tracked-list manager plus its watcher, the
//! remote gateway, change detector and coordinator, with PID file
//! management and graceful shutdown on SIGINT/SIGTERM. In-flight checks
//! finish their current atomic step before the process exits; rate-limit
//! sleeps are interrupted by the same signal.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::detector::ChangeDetector;
use crate::events::{EventLog, NotificationSink};
use crate::gateway::RemoteGateway;
use crate::shutdown::Shutdown;
use crate::state::CursorStore;
use crate::tracklist::TrackedSet;

/// Recorded sync events older than this are purged at daemon startup
const EVENT_RETENTION_DAYS: u32 = 90;

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    shutdown: Shutdown,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance
    pub fn new(config: Config) -> Self {
        let pid_file_path = if config.daemon.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.daemon.pid_file))
        };

        Self {
            config: Arc::new(config),
            shutdown: Shutdown::new(),
            pid_file_path,
        }
    }

    /// Run the mirroring service until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        info!("Starting repovault daemon");

        self.write_pid_file().context("Failed to write PID file")?;

        let result = self.serve().await;

        self.cleanup().context("Failed to cleanup daemon")?;
        result
    }

    async fn serve(&self) -> Result<()> {
        let event_log = EventLog::open_default().context("Failed to open event log")?;
        match event_log.cleanup_older_than(EVENT_RETENTION_DAYS) {
            Ok(removed) if removed > 0 => debug!("Removed {} old sync event(s)", removed),
            Ok(_) => {}
            Err(e) => warn!("Event log cleanup failed: {:#}", e),
        }
        let sink: Arc<dyn NotificationSink> = Arc::new(event_log);

        // Startup failures reading the tracked list or creating the storage
        // root are fatal; everything after this is contained per project.
        tokio::fs::create_dir_all(&self.config.download_dir)
            .await
            .with_context(|| {
                format!("Failed to create download directory: {}", self.config.download_dir)
            })?;

        let tracked = TrackedSet::new(&self.config.tracklist, sink.clone());
        tracked.load_initial().await?;

        let added_rx = tracked
            .spawn_watcher(self.shutdown.clone())
            .context("Failed to start tracked-list watcher")?;

        let gateway = Arc::new(RemoteGateway::new(
            &self.config.gateway,
            sink.clone(),
            self.shutdown.clone(),
        )?);
        let detector = Arc::new(ChangeDetector::new(
            gateway,
            CursorStore::new(&self.config.download_dir),
            self.config.branch.clone(),
        ));
        let coordinator = Coordinator::new(
            detector,
            tracked.registry(),
            sink,
            self.config.sync.max_parallel,
            self.config.check_timeout(),
            self.shutdown.clone(),
        );

        let sweep_interval = self.config.sweep_interval()?;

        // Signal handler only flips the shutdown switch; the coordinator
        // drains in-flight work itself.
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            shutdown.trigger();
        });

        coordinator.run(added_rx, sweep_interval).await;

        info!("Daemon loop exiting");
        Ok(())
    }

    /// Start the daemon as a background service (Unix platforms)
    #[cfg(unix)]
    pub fn daemonize(&self) -> Result<()> {
        use daemonize::Daemonize;

        let log_file = if !self.config.daemon.log_file.is_empty() {
            if let Some(parent) = PathBuf::from(&self.config.daemon.log_file).parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = fs::File::create(&self.config.daemon.log_file)
                .context("Failed to create log file")?;
            Some(log_file)
        } else {
            None
        };

        let mut daemonize = Daemonize::new();

        if let Some(pid_path) = &self.pid_file_path {
            daemonize = daemonize.pid_file(pid_path);
        }

        if let Some(log_file) = log_file {
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        info!("repovault daemon started as background service");
        Ok(())
    }

    /// Stop a running daemon by sending a shutdown signal
    pub fn stop(&self) -> Result<()> {
        info!("Sending shutdown signal to daemon");

        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                let pid_str = fs::read_to_string(pid_file).context("Failed to read PID file")?;

                let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

                #[cfg(unix)]
                {
                    use nix::sys::signal::{self, Signal};
                    use nix::unistd::Pid;

                    let pid = Pid::from_raw(pid as i32);
                    signal::kill(pid, Signal::SIGTERM)
                        .context("Failed to send SIGTERM to daemon process")?;
                }

                #[cfg(not(unix))]
                {
                    warn!("Daemon stop not implemented for this platform");
                }

                info!("Shutdown signal sent to daemon process {}", pid);
            } else {
                warn!("PID file not found, daemon may not be running");
            }
        } else {
            warn!("No PID file configured, cannot stop daemon");
        }

        Ok(())
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Wait for shutdown signals (SIGTERM from `daemon stop`, or Ctrl+C)
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
            _ = sigterm.recv() => debug!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Ctrl+C received");
    }
}

/// Check if a daemon is currently running by checking the PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    if !config.daemon.pid_file.is_empty() {
        let pid_file = PathBuf::from(&config.daemon.pid_file);

        if pid_file.exists() {
            let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;

            let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

            // Check if the process actually exists
            #[cfg(unix)]
            {
                use nix::errno::Errno;
                use nix::sys::signal;
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                match signal::kill(pid, None) {
                    Ok(_) => return Ok(true),
                    Err(Errno::ESRCH) => {
                        // Stale PID file
                        let _ = fs::remove_file(&pid_file);
                        return Ok(false);
                    }
                    Err(_) => return Ok(true),
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                return Ok(true);
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_daemon_creation_without_pid_file() {
        let mut config = Config::default();
        config.daemon.pid_file = String::new();

        let daemon = Daemon::new(config);
        assert!(daemon.pid_file_path.is_none());
    }

    #[test]
    fn test_pid_file_operations() {
        let temp_dir = tempdir().unwrap();
        let pid_file = temp_dir.path().join("test.pid");

        let mut config = Config::default();
        config.daemon.pid_file = pid_file.to_string_lossy().to_string();

        assert!(!pid_file.exists());

        let is_running = is_daemon_running(&config).unwrap();
        assert!(!is_running);

        let daemon = Daemon::new(config.clone());
        daemon.write_pid_file().unwrap();
        assert!(pid_file.exists());

        // Our own PID is alive, so the daemon reads as running
        assert!(is_daemon_running(&config).unwrap());

        daemon.cleanup().unwrap();
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_stale_pid_file_is_removed() {
        let temp_dir = tempdir().unwrap();
        let pid_file = temp_dir.path().join("stale.pid");

        // PID far outside any plausible live range
        std::fs::write(&pid_file, "999999999").unwrap();

        let mut config = Config::default();
        config.daemon.pid_file = pid_file.to_string_lossy().to_string();

        // Invalid PID parses but the process does not exist
        let result = is_daemon_running(&config);
        if let Ok(running) = result {
            assert!(!running);
            assert!(!pid_file.exists());
        }
    }
}
