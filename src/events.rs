//! Sync event reporting - the notification sink and its implementations
//!
//! Every terminal outcome of a sync attempt (success, no-change, or a
//! specific error kind) is reported exactly once through a
//! [`NotificationSink`]. Formatting and delivery are the sink's business;
//! the engine only emits structured events.
//!
//! Two sinks ship in-tree: [`TraceSink`] forwards events to the tracing
//! subscriber, and [`EventLog`] persists them to a SQLite database stored in
//! XDG_DATA_HOME/repovault/events.db for the `events` CLI command.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Event kinds emitted during sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A project check was scheduled and started
    SyncStarted,
    /// Cursor matched the remote descriptor; zero writes
    NoChange,
    /// First sync of a cursor completed; all current artifacts downloaded
    InitialSyncComplete,
    /// Incremental update completed with a commit count
    UpdateComplete,
    /// A rate-limit wait was observed, with its duration
    RateLimited,
    /// A project check failed with a specific error kind
    SyncFailed,
    /// A project was added to the tracked set at runtime
    ProjectAdded,
    /// A malformed tracked-list entry was skipped
    ProjectRejected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SyncStarted => "sync_started",
            EventKind::NoChange => "no_change",
            EventKind::InitialSyncComplete => "initial_sync_complete",
            EventKind::UpdateComplete => "update_complete",
            EventKind::RateLimited => "rate_limited",
            EventKind::SyncFailed => "sync_failed",
            EventKind::ProjectAdded => "project_added",
            EventKind::ProjectRejected => "project_rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_started" => Some(EventKind::SyncStarted),
            "no_change" => Some(EventKind::NoChange),
            "initial_sync_complete" => Some(EventKind::InitialSyncComplete),
            "update_complete" => Some(EventKind::UpdateComplete),
            "rate_limited" => Some(EventKind::RateLimited),
            "sync_failed" => Some(EventKind::SyncFailed),
            "project_added" => Some(EventKind::ProjectAdded),
            "project_rejected" => Some(EventKind::ProjectRejected),
            _ => None,
        }
    }

    /// Get the severity level for this event kind
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::SyncStarted => Severity::Info,
            EventKind::NoChange => Severity::Info,
            EventKind::InitialSyncComplete => Severity::Info,
            EventKind::UpdateComplete => Severity::Info,
            EventKind::RateLimited => Severity::Warning,
            EventKind::SyncFailed => Severity::Error,
            EventKind::ProjectAdded => Severity::Info,
            EventKind::ProjectRejected => Severity::Warning,
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// A structured sync event
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub project: Option<String>,
    pub kind: EventKind,
    pub summary: String,
    pub details: Option<String>,
}

impl SyncEvent {
    pub fn new(kind: EventKind, summary: impl Into<String>) -> Self {
        Self {
            project: None,
            kind,
            summary: summary.into(),
            details: None,
        }
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn details_json<T: serde::Serialize>(mut self, details: &T) -> Self {
        if let Ok(json) = serde_json::to_string(details) {
            self.details = Some(json);
        }
        self
    }
}

/// Narrow interface through which the engine reports outcomes.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: SyncEvent);
}

/// Sink that forwards events to the tracing subscriber.
pub struct TraceSink;

impl NotificationSink for TraceSink {
    fn notify(&self, event: SyncEvent) {
        let project = event.project.as_deref().unwrap_or("-");
        match event.kind.severity() {
            Severity::Info => info!(
                kind = event.kind.as_str(),
                project, "{}", event.summary
            ),
            Severity::Warning => warn!(
                kind = event.kind.as_str(),
                project, "{}", event.summary
            ),
            Severity::Error => error!(
                kind = event.kind.as_str(),
                project,
                details = event.details.as_deref().unwrap_or(""),
                "{}",
                event.summary
            ),
        }
    }
}

/// A persisted event record
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub project: Option<String>,
    pub kind: EventKind,
    pub severity: Severity,
    pub summary: String,
    pub details: Option<String>,
}

/// SQLite-backed event log
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    /// Open or create the event log at the default XDG location
    pub fn open_default() -> Result<Self> {
        Self::open_at(Self::default_path()?)
    }

    /// Open or create the event log at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open event log at {}", path.display()))?;

        let log = Self {
            conn: Mutex::new(conn),
        };
        log.initialize()?;

        debug!("Event log opened at {}", path.display());
        Ok(log)
    }

    /// Open an in-memory event log (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory event log")?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.initialize()?;
        Ok(log)
    }

    /// Get the default event log path
    fn default_path() -> Result<PathBuf> {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        Ok(data_dir.join("repovault").join("events.db"))
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                project TEXT,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                summary TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_project ON events(project, timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind, timestamp);
            "#,
        )
        .context("Failed to initialize event log schema")?;

        Ok(())
    }

    /// Record a sync event
    pub fn record(&self, event: &SyncEvent) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let severity = event.kind.severity();

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            r#"
            INSERT INTO events (timestamp, project, kind, severity, summary, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                now,
                event.project,
                event.kind.as_str(),
                severity.as_str(),
                event.summary,
                event.details,
            ],
        )
        .context("Failed to record event")?;

        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent events, newest first
    pub fn recent(&self, limit: u32) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, timestamp, project, kind, severity, summary, details
             FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Get the most recent events for one project, newest first
    pub fn for_project(&self, project: &str, limit: u32) -> Result<Vec<StoredEvent>> {
        self.query_events(
            "SELECT id, timestamp, project, kind, severity, summary, details
             FROM events WHERE project = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            params![project, limit],
        )
    }

    fn query_events<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(sql)?;

        let events = stmt
            .query_map(params, |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    timestamp: row
                        .get::<_, String>(1)
                        .ok()
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(Utc::now),
                    project: row.get(2)?,
                    kind: EventKind::parse(&row.get::<_, String>(3)?)
                        .unwrap_or(EventKind::SyncFailed),
                    severity: Severity::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(Severity::Info),
                    summary: row.get(5)?,
                    details: row.get(6)?,
                })
            })
            .context("Failed to query events")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(events)
    }

    /// Delete events older than the given number of days
    pub fn cleanup_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count = conn
            .execute(
                "DELETE FROM events WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to cleanup old events")?;
        Ok(count as u64)
    }
}

impl NotificationSink for EventLog {
    fn notify(&self, event: SyncEvent) {
        if let Err(e) = self.record(&event) {
            warn!("Failed to record sync event: {:#}", e);
        }
    }
}
