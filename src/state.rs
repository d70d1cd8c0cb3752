//! State Store - durable per-project sync cursors
//!
//! Cursors are plain key-value records stored inside each project's artifact
//! directory:
//! - `version_info_release.txt` holds `tag,commit`
//! - `version_info_branch.txt` holds `branch,commit`
//!
//! `save_*` writes to a temporary sibling and renames it into place, so a
//! reader never observes a half-written cursor. `load_*` treats a missing or
//! malformed record as "never synced" (with a warning), never as a fatal
//! error. The change log (`release_notes.txt`) is append-only.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::gateway::Commit;
use crate::tracklist::TrackedProject;

const RELEASE_CURSOR_FILE: &str = "version_info_release.txt";
const BRANCH_CURSOR_FILE: &str = "version_info_branch.txt";
const CHANGELOG_FILE: &str = "release_notes.txt";

/// Last successfully synchronized release for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseCursor {
    pub tag: String,
    pub commit: String,
}

impl ReleaseCursor {
    fn to_record(&self) -> String {
        format!("{},{}", self.tag, self.commit)
    }

    fn parse(record: &str) -> Option<Self> {
        let (tag, commit) = record.trim().split_once(',')?;
        if tag.is_empty() || commit.is_empty() {
            return None;
        }
        Some(Self {
            tag: tag.to_string(),
            commit: commit.to_string(),
        })
    }
}

/// Last successfully synchronized branch head for a project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCursor {
    pub branch: String,
    pub commit: String,
}

impl BranchCursor {
    fn to_record(&self) -> String {
        format!("{},{}", self.branch, self.commit)
    }

    fn parse(record: &str) -> Option<Self> {
        let (branch, commit) = record.trim().split_once(',')?;
        if branch.is_empty() || commit.is_empty() {
            return None;
        }
        Some(Self {
            branch: branch.to_string(),
            commit: commit.to_string(),
        })
    }
}

/// A human-readable change-log line derived from one commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub summary: String,
    pub author: String,
    pub timestamp: String,
}

impl ChangeLogEntry {
    pub fn from_commit(commit: &Commit) -> Self {
        Self {
            summary: commit
                .commit
                .message
                .lines()
                .next()
                .unwrap_or_default()
                .to_string(),
            author: commit.commit.author.name.clone(),
            timestamp: commit.commit.author.date.to_rfc3339(),
        }
    }

    pub fn format_line(&self) -> String {
        format!("- {} (by {} on {})", self.summary, self.author, self.timestamp)
    }
}

/// File-backed cursor store, rooted at the download directory
#[derive(Debug, Clone)]
pub struct CursorStore {
    root: PathBuf,
}

impl CursorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Per-project directory, keyed by owner and name so same-named projects
    /// from different owners never collide.
    pub fn project_dir(&self, project: &TrackedProject) -> PathBuf {
        self.root.join(&project.owner).join(&project.name)
    }

    /// Directory holding downloaded release assets for a project
    pub fn releases_dir(&self, project: &TrackedProject) -> PathBuf {
        self.project_dir(project).join("releases")
    }

    pub fn changelog_path(&self, project: &TrackedProject) -> PathBuf {
        self.project_dir(project).join(CHANGELOG_FILE)
    }

    pub async fn load_release(
        &self,
        project: &TrackedProject,
    ) -> Result<Option<ReleaseCursor>, SyncError> {
        let path = self.project_dir(project).join(RELEASE_CURSOR_FILE);
        self.load_record(&path, ReleaseCursor::parse).await
    }

    pub async fn load_branch(
        &self,
        project: &TrackedProject,
    ) -> Result<Option<BranchCursor>, SyncError> {
        let path = self.project_dir(project).join(BRANCH_CURSOR_FILE);
        self.load_record(&path, BranchCursor::parse).await
    }

    pub async fn save_release(
        &self,
        project: &TrackedProject,
        cursor: &ReleaseCursor,
    ) -> Result<(), SyncError> {
        let path = self.project_dir(project).join(RELEASE_CURSOR_FILE);
        self.save_record(&path, &cursor.to_record()).await?;
        debug!("Saved release cursor for {}: {}", project, cursor.to_record());
        Ok(())
    }

    pub async fn save_branch(
        &self,
        project: &TrackedProject,
        cursor: &BranchCursor,
    ) -> Result<(), SyncError> {
        let path = self.project_dir(project).join(BRANCH_CURSOR_FILE);
        self.save_record(&path, &cursor.to_record()).await?;
        debug!("Saved branch cursor for {}: {}", project, cursor.to_record());
        Ok(())
    }

    /// Append change-log lines for a project. Creates the file on first use.
    pub async fn append_changelog(
        &self,
        project: &TrackedProject,
        entries: &[ChangeLogEntry],
    ) -> Result<(), SyncError> {
        if entries.is_empty() {
            return Ok(());
        }

        let path = self.changelog_path(project);
        self.ensure_parent(&path).await?;

        let mut block = String::new();
        for entry in entries {
            block.push_str(&entry.format_line());
            block.push('\n');
        }

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SyncError::storage_write(&path, e))?;
        file.write_all(block.as_bytes())
            .await
            .map_err(|e| SyncError::storage_write(&path, e))?;
        file.flush()
            .await
            .map_err(|e| SyncError::storage_write(&path, e))?;

        debug!("Appended {} change-log line(s) for {}", entries.len(), project);
        Ok(())
    }

    /// Read a cursor record. Missing file → `None`; malformed record → a
    /// warning and `None`, so the next sync starts from scratch.
    async fn load_record<T>(
        &self,
        path: &Path,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<Option<T>, SyncError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Unreadable cursor record at {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        match parse(&content) {
            Some(cursor) => Ok(Some(cursor)),
            None => {
                let err = SyncError::MalformedState {
                    path: path.to_path_buf(),
                };
                warn!("{}; treating project as never synced", err);
                Ok(None)
            }
        }
    }

    /// Atomically publish a record: write a temporary sibling, then rename.
    async fn save_record(&self, path: &Path, record: &str) -> Result<(), SyncError> {
        self.ensure_parent(path).await?;

        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, record)
            .await
            .map_err(|e| SyncError::storage_write(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SyncError::storage_write(path, e))?;

        Ok(())
    }

    async fn ensure_parent(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::storage_write(parent, e))?;
        }
        Ok(())
    }
}
