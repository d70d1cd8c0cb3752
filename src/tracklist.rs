//! Tracked-Set Manager - the live set of mirrored projects
//!
//! Merges the static tracked-list file read at startup with runtime
//! additions observed through a filesystem watcher. The manager is the
//! single writer of the known-project registry; the coordinator reads
//! snapshots for its periodic sweeps and receives runtime additions over a
//! channel, so the watcher thread never touches sync state directly.
//!
//! List file format: one project reference per line, either a full
//! repository URL (`https://github.com/Owner/Repo`) or a bare `owner/repo`
//! pair. Blank lines and `#` comments are ignored; malformed entries are
//! reported and skipped without affecting other entries.

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::events::{EventKind, NotificationSink, SyncEvent};
use crate::shutdown::Shutdown;

/// Identity of a tracked project. Immutable after creation; never removed
/// from the registry automatically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedProject {
    pub owner: String,
    pub name: String,
}

impl TrackedProject {
    /// Parse a project reference into an (owner, name) identity.
    ///
    /// Accepts `https://github.com/Owner/Repo` (extra path segments are
    /// ignored, a `.git` suffix is stripped) or a bare `Owner/Repo`.
    pub fn parse(input: &str) -> Result<Self, SyncError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(SyncError::invalid_reference(input));
        }

        let rest = if let Some((scheme, remainder)) = trimmed.split_once("://") {
            if scheme != "http" && scheme != "https" {
                return Err(SyncError::invalid_reference(input));
            }
            let remainder = remainder.strip_prefix("www.").unwrap_or(remainder);
            match remainder.strip_prefix("github.com/") {
                Some(path) => path,
                None => return Err(SyncError::invalid_reference(input)),
            }
        } else {
            trimmed
        };

        let mut segments = rest.split('/').filter(|s| !s.is_empty());
        let owner = segments
            .next()
            .ok_or_else(|| SyncError::invalid_reference(input))?;
        let name = segments
            .next()
            .ok_or_else(|| SyncError::invalid_reference(input))?;
        let name = name.strip_suffix(".git").unwrap_or(name);

        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return Err(SyncError::invalid_reference(input));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Canonical `owner/name` form, used as the identity key everywhere.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl std::fmt::Display for TrackedProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Result of adding a project reference to the tracked list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Re-adding a known project is a no-op, reported rather than failed
    AlreadyTracked,
}

/// Shared registry of known projects. Written only by the [`TrackedSet`]
/// manager; read concurrently by the coordinator.
pub type ProjectRegistry = Arc<RwLock<HashSet<TrackedProject>>>;

/// Owns the tracked-list file and the known-project registry. Clones share
/// the same registry and sink.
#[derive(Clone)]
pub struct TrackedSet {
    path: PathBuf,
    registry: ProjectRegistry,
    sink: Arc<dyn NotificationSink>,
}

impl TrackedSet {
    pub fn new(path: impl Into<PathBuf>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            path: path.into(),
            registry: Arc::new(RwLock::new(HashSet::new())),
            sink,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle for concurrent read access by the coordinator.
    pub fn registry(&self) -> ProjectRegistry {
        self.registry.clone()
    }

    /// Current known projects.
    pub fn snapshot(&self) -> Vec<TrackedProject> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Read the tracked-list file at startup and populate the registry.
    ///
    /// A missing or unreadable file is fatal here; once running, later
    /// re-reads degrade gracefully (see [`TrackedSet::refresh`]).
    pub async fn load_initial(&self) -> Result<Vec<TrackedProject>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read tracked-list file: {:?}", self.path))?;

        let projects = self.parse_entries(&content);

        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.extend(projects.iter().cloned());
        }

        info!("Loaded {} tracked project(s) from {:?}", projects.len(), self.path);
        Ok(projects)
    }

    /// Re-read the tracked-list file and return projects not seen before.
    ///
    /// Runtime read failures are logged and yield no additions; the known
    /// set is never shrunk.
    pub async fn refresh(&self) -> Vec<TrackedProject> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to re-read tracked-list file {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let parsed = self.parse_entries(&content);

        let mut added = Vec::new();
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            for project in parsed {
                if registry.insert(project.clone()) {
                    added.push(project);
                }
            }
        }

        for project in &added {
            self.sink.notify(
                SyncEvent::new(
                    EventKind::ProjectAdded,
                    format!("now tracking {}", project),
                )
                .project(project.full_name()),
            );
        }

        added
    }

    /// Append a reference to the tracked-list file. Idempotent: a known
    /// project reports [`AddOutcome::AlreadyTracked`] and the file is left
    /// untouched.
    pub async fn add_to_file(&self, reference: &str) -> Result<(TrackedProject, AddOutcome)> {
        let project = TrackedProject::parse(reference)?;

        let mut content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read tracked-list file: {:?}", self.path))
            }
        };

        if self.parse_entries(&content).contains(&project) {
            debug!("{} is already tracked", project);
            return Ok((project, AddOutcome::AlreadyTracked));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create tracked-list directory")?;
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&project.full_name());
        content.push('\n');

        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to update tracked-list file: {:?}", self.path))?;

        Ok((project, AddOutcome::Added))
    }

    /// Start watching the tracked-list file for changes.
    ///
    /// The notify watcher thread only forwards raw events onto a channel; a
    /// tokio task debounces them, re-reads the file and sends newly-added
    /// projects to the returned receiver. The task exits on shutdown.
    pub fn spawn_watcher(
        &self,
        shutdown: Shutdown,
    ) -> Result<mpsc::UnboundedReceiver<TrackedProject>> {
        let watch_dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<TrackedProject>();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(_) => {
                        let _ = raw_tx.send(());
                    }
                    Err(e) => warn!("Tracked-list watcher error: {}", e),
                }
            })
            .context("Failed to create tracked-list watcher")?;

        // Watch the directory, not the file: editors and atomic writers
        // replace the inode.
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch tracked-list directory: {:?}", watch_dir))?;

        let manager = self.clone();
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the task.
            let _watcher = watcher;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = raw_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        // Debounce bursts of filesystem events.
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        while raw_rx.try_recv().is_ok() {}

                        for project in manager.refresh().await {
                            if out_tx.send(project).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            debug!("Tracked-list watcher task exiting");
        });

        Ok(out_rx)
    }

    /// Parse list-file content, reporting and skipping malformed entries.
    fn parse_entries(&self, content: &str) -> Vec<TrackedProject> {
        let mut seen = HashSet::new();
        let mut projects = Vec::new();

        for line in content.lines() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }

            match TrackedProject::parse(entry) {
                Ok(project) => {
                    if seen.insert(project.clone()) {
                        projects.push(project);
                    } else {
                        debug!("Duplicate tracked-list entry ignored: {}", entry);
                    }
                }
                Err(e) => {
                    warn!("Skipping malformed tracked-list entry {:?}: {}", entry, e);
                    self.sink.notify(
                        SyncEvent::new(
                            EventKind::ProjectRejected,
                            format!("skipped malformed entry {:?}", entry),
                        )
                        .details(e.to_string()),
                    );
                }
            }
        }

        projects
    }
}
