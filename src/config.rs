use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for repovault
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root directory for downloaded artifacts and per-project state
    pub download_dir: String,

    /// Path to the tracked-list file (one project reference per line)
    pub tracklist: String,

    /// Primary branch mirrored for every project
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncSettings,

    /// Remote API gateway settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncSettings {
    /// Worker pool size: maximum project checks in flight at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Sweep interval, e.g. "30m", "1h"
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Timeout for one project-and-cursor check in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Remote gateway configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewaySettings {
    /// API root, overridable for self-hosted mirrors and tests
    #[serde(default = "default_api_root")]
    pub api_root: String,

    /// Host serving branch archive downloads
    #[serde(default = "default_archive_root")]
    pub archive_root: String,

    /// API token; falls back to the GITHUB_TOKEN environment variable
    pub token: Option<String>,

    /// Seconds to wait past the reported rate-limit reset time
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u64,

    /// Attempt budget for 5xx/transport retries
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bounded number of transparent rate-limit waits per call
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonSettings {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingSettings {
    /// Log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_branch() -> String {
    "master".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_interval() -> String {
    "30m".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_api_root() -> String {
    "https://api.github.com".to_string()
}
fn default_archive_root() -> String {
    "https://github.com".to_string()
}
fn default_safety_margin() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_rate_limit_waits() -> u32 {
    2
}
fn default_request_timeout() -> u64 {
    30
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/repovault.pid", runtime_dir)
    } else {
        "/tmp/repovault.pid".to_string()
    }
}
fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/repovault/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/repovault/daemon.log", home)
    } else {
        "/tmp/repovault-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations
impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            interval: default_interval(),
            timeout: default_timeout(),
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            api_root: default_api_root(),
            archive_root: default_archive_root(),
            token: None,
            safety_margin: default_safety_margin(),
            max_attempts: default_max_attempts(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "${HOME}/mirror".to_string(),
            tracklist: "${HOME}/mirror/repositories.txt".to_string(),
            branch: default_branch(),
            sync: SyncSettings::default(),
            gateway: GatewaySettings::default(),
            daemon: DaemonSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.download_dir = shellexpand::full(&self.download_dir)
            .context("Failed to expand download_dir path")?
            .into_owned();

        self.tracklist = shellexpand::full(&self.tracklist)
            .context("Failed to expand tracklist path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    /// Sweep interval as a Duration
    pub fn sweep_interval(&self) -> Result<Duration> {
        parse_duration(&self.sync.interval).map(Duration::from_secs)
    }

    /// Per-check timeout as a Duration
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout)
    }
}

/// Parse duration strings like "30s", "30m", "1h", "2d" into seconds.
/// A bare number is taken as seconds.
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .parse::<u64>()
            .map(|v| v * 60)
            .context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .parse::<u64>()
            .map(|v| v * 3600)
            .context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value
            .parse::<u64>()
            .map(|v| v * 86400)
            .context("Invalid days value")
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '2d'")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.download_dir, "${HOME}/mirror");
        assert_eq!(config.branch, "master");
        assert_eq!(config.sync.max_parallel, 4);
        assert_eq!(config.sync.interval, "30m");
        assert_eq!(config.sync.timeout, 300);
        assert_eq!(config.gateway.api_root, "https://api.github.com");
        assert_eq!(config.gateway.safety_margin, 5);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.gateway.max_rate_limit_waits, 2);
        assert!(config.gateway.token.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), 45);
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("2h").unwrap(), 7200);
        assert_eq!(parse_duration("1d").unwrap(), 86400);
        assert_eq!(parse_duration("90").unwrap(), 90);
        assert_eq!(parse_duration(" 10M ").unwrap(), 600);
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_sweep_interval() {
        let mut config = Config::default();
        config.sync.interval = "5m".to_string();
        assert_eq!(config.sweep_interval().unwrap(), Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_REPOVAULT_HOME", "/test/home");

        let mut config = Config::default();
        config.download_dir = "${TEST_REPOVAULT_HOME}/mirror".to_string();
        config.tracklist = "${TEST_REPOVAULT_HOME}/repositories.txt".to_string();

        config.expand_paths().expect("Failed to expand paths");

        assert_eq!(config.download_dir, "/test/home/mirror");
        assert_eq!(config.tracklist, "/test/home/repositories.txt");

        env::remove_var("TEST_REPOVAULT_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let nonexistent_path = Path::new("/nonexistent/path/config.yml");
        let result = Config::load(nonexistent_path);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.yml");

        let mut config = Config::default();
        config.download_dir = "/custom/mirror".to_string();
        config.tracklist = "/custom/repositories.txt".to_string();
        config.branch = "main".to_string();
        config.sync.max_parallel = 8;
        config.gateway.safety_margin = 10;

        config.save(&config_path).expect("Failed to save config");

        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.download_dir, "/custom/mirror");
        assert_eq!(loaded.tracklist, "/custom/repositories.txt");
        assert_eq!(loaded.branch, "main");
        assert_eq!(loaded.sync.max_parallel, 8);
        assert_eq!(loaded.gateway.safety_margin, 10);
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
download_dir: "/srv/mirror"
tracklist: "/srv/mirror/repositories.txt"
branch: "main"
sync:
  max_parallel: 6
  interval: "1h"
  timeout: 120
gateway:
  safety_margin: 15
  max_attempts: 5
  max_rate_limit_waits: 3
  token: "test-token"
logging:
  level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.download_dir, "/srv/mirror");
        assert_eq!(config.branch, "main");
        assert_eq!(config.sync.max_parallel, 6);
        assert_eq!(config.sync.interval, "1h");
        assert_eq!(config.sync.timeout, 120);
        assert_eq!(config.gateway.safety_margin, 15);
        assert_eq!(config.gateway.max_attempts, 5);
        assert_eq!(config.gateway.max_rate_limit_waits, 3);
        assert_eq!(config.gateway.token, Some("test-token".to_string()));
        assert_eq!(config.logging.level, "debug");
        // Unspecified sections keep their defaults
        assert_eq!(config.gateway.api_root, "https://api.github.com");
    }
}
