//! Change Detector - decides no-op vs. initial sync vs. incremental update
//!
//! One state machine per (project, cursor kind): fetch the current remote
//! descriptor, compare it against the stored cursor, and either do nothing,
//! perform a first-time download, or fetch the commit range, download the
//! new artifacts and append change-log lines. The cursor is persisted only
//! after every download has completed, so a failed cycle retries the same
//! transition from the same starting point.
//!
//! Artifact writes are atomic: blobs stream to a `.part` sibling and are
//! renamed into place, so a consumer listing the directory mid-download
//! sees the old complete file or nothing.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::gateway::RemoteGateway;
use crate::state::{BranchCursor, ChangeLogEntry, CursorStore, ReleaseCursor};
use crate::tracklist::TrackedProject;

/// The two independent cursors maintained per project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Release,
    Branch,
}

impl CursorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorKind::Release => "release",
            CursorKind::Branch => "branch",
        }
    }
}

/// Terminal state of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Stored cursor matches the remote descriptor; zero writes occurred
    NoChange,
    /// No prior cursor existed; all current artifacts were downloaded
    InitialSync { descriptor: String, artifacts: usize },
    /// Cursor advanced; change log appended and artifacts downloaded
    Updated {
        descriptor: String,
        commits: usize,
        artifacts: usize,
    },
    /// The remote has nothing to sync yet (e.g. no release published)
    Missing,
}

/// Runs sync cycles for single projects against gateway and store
pub struct ChangeDetector {
    gateway: Arc<RemoteGateway>,
    store: CursorStore,
    branch: String,
}

impl ChangeDetector {
    pub fn new(gateway: Arc<RemoteGateway>, store: CursorStore, branch: String) -> Self {
        Self {
            gateway,
            store,
            branch,
        }
    }

    pub fn store(&self) -> &CursorStore {
        &self.store
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// One sync cycle for a project's release cursor.
    pub async fn check_release(
        &self,
        project: &TrackedProject,
    ) -> Result<CheckOutcome, SyncError> {
        let release = match self.gateway.latest_release(project).await {
            Ok(release) => release,
            Err(SyncError::NotFound) => {
                debug!("No release published yet for {}", project);
                return Ok(CheckOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let stored = self.store.load_release(project).await?;

        if let Some(prev) = &stored {
            if prev.tag == release.tag && prev.commit == release.target_commit {
                debug!("Release {} already mirrored for {}", prev.tag, project);
                return Ok(CheckOutcome::NoChange);
            }
        }

        info!(
            "New release {} ({}) for {}",
            release.tag, release.target_commit, project
        );

        // Derive the change log before touching storage; only an existing
        // cursor gives a prior point to diff from.
        let pending_changelog = match &stored {
            Some(prev) => Some(
                self.changelog_entries(project, &prev.commit, &release.target_commit)
                    .await?,
            ),
            None => None,
        };

        let releases_dir = self.store.releases_dir(project);
        let mut artifacts = 0usize;
        for asset in &release.assets {
            if !is_safe_file_name(&asset.name) {
                warn!("Skipping release asset with unsafe name {:?}", asset.name);
                continue;
            }
            self.download(&asset.browser_download_url, releases_dir.join(&asset.name))
                .await?;
            artifacts += 1;
        }

        let cursor = ReleaseCursor {
            tag: release.tag,
            commit: release.target_commit,
        };
        let descriptor = format!("{} ({})", cursor.tag, cursor.commit);

        match pending_changelog {
            None => {
                self.store.save_release(project, &cursor).await?;
                Ok(CheckOutcome::InitialSync {
                    descriptor,
                    artifacts,
                })
            }
            Some(entries) => {
                self.store.append_changelog(project, &entries).await?;
                self.store.save_release(project, &cursor).await?;
                Ok(CheckOutcome::Updated {
                    descriptor,
                    commits: entries.len(),
                    artifacts,
                })
            }
        }
    }

    /// One sync cycle for a project's primary-branch cursor.
    pub async fn check_branch(&self, project: &TrackedProject) -> Result<CheckOutcome, SyncError> {
        let head = match self.gateway.latest_branch_head(project, &self.branch).await {
            Ok(head) => head,
            Err(SyncError::NotFound) => {
                debug!("Branch {} not found for {}", self.branch, project);
                return Ok(CheckOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let stored = self.store.load_branch(project).await?;

        if let Some(prev) = &stored {
            if prev.branch == self.branch && prev.commit == head.sha {
                debug!("Branch {} up to date for {}", self.branch, project);
                return Ok(CheckOutcome::NoChange);
            }
        }

        info!(
            "New head {} on branch {} for {}",
            head.sha, self.branch, project
        );

        let pending_changelog = match &stored {
            Some(prev) => Some(
                self.changelog_entries(project, &prev.commit, &head.sha)
                    .await?,
            ),
            None => None,
        };

        let archive_url = self.gateway.archive_url(project, &self.branch);
        let archive_dest = self
            .store
            .project_dir(project)
            .join(format!("{}_{}.zip", project.name, self.branch));
        self.download(&archive_url, archive_dest).await?;

        let cursor = BranchCursor {
            branch: self.branch.clone(),
            commit: head.sha,
        };
        let descriptor = format!("{} @ {}", cursor.branch, cursor.commit);

        match pending_changelog {
            None => {
                self.store.save_branch(project, &cursor).await?;
                Ok(CheckOutcome::InitialSync {
                    descriptor,
                    artifacts: 1,
                })
            }
            Some(entries) => {
                self.store.append_changelog(project, &entries).await?;
                self.store.save_branch(project, &cursor).await?;
                Ok(CheckOutcome::Updated {
                    descriptor,
                    commits: entries.len(),
                    artifacts: 1,
                })
            }
        }
    }

    /// Fetch the commit range and derive change-log entries. A vanished
    /// base commit (force push, shallow history) degrades to an empty
    /// change log rather than blocking the cursor.
    async fn changelog_entries(
        &self,
        project: &TrackedProject,
        from: &str,
        to: &str,
    ) -> Result<Vec<ChangeLogEntry>, SyncError> {
        match self.gateway.commit_range(project, from, to).await {
            Ok(commits) => Ok(commits.iter().map(ChangeLogEntry::from_commit).collect()),
            Err(SyncError::NotFound) => {
                warn!(
                    "Commit range {}..{} unavailable for {}; skipping change log",
                    from, to, project
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Download a blob and publish it atomically at its final path.
    async fn download(&self, url: &str, dest: PathBuf) -> Result<(), SyncError> {
        let mut part = dest.as_os_str().to_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        self.gateway.fetch_blob(url, &part).await?;
        tokio::fs::rename(&part, &dest)
            .await
            .map_err(|e| SyncError::storage_write(&dest, e))?;

        debug!("Stored artifact at {}", dest.display());
        Ok(())
    }
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::events::TraceSink;
    use crate::shutdown::Shutdown;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project() -> TrackedProject {
        TrackedProject {
            owner: "octocat".to_string(),
            name: "Hello-World".to_string(),
        }
    }

    fn detector(server: &MockServer, root: &std::path::Path) -> ChangeDetector {
        let settings = GatewaySettings {
            api_root: server.uri(),
            archive_root: server.uri(),
            token: None,
            safety_margin: 0,
            max_attempts: 2,
            max_rate_limit_waits: 2,
            request_timeout: 5,
        };
        let gateway = Arc::new(
            RemoteGateway::new(&settings, Arc::new(TraceSink), Shutdown::new()).unwrap(),
        );
        ChangeDetector::new(gateway, CursorStore::new(root), "master".to_string())
    }

    async fn mount_release(server: &MockServer, tag: &str, commit: &str, assets: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/repos/octocat/Hello-World/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tag_name": tag,
                "target_commitish": commit,
                "assets": assets
            })))
            .mount(server)
            .await;
    }

    fn commit_json(sha: &str, message: &str) -> serde_json::Value {
        json!({
            "sha": sha,
            "commit": {
                "message": message,
                "author": { "name": "Alice", "date": "2024-05-01T10:00:00Z" }
            }
        })
    }

    #[tokio::test]
    async fn test_initial_release_sync_downloads_everything() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();

        mount_release(
            &server,
            "v1.0",
            "abc",
            json!([{
                "name": "tool.tar.gz",
                "browser_download_url": format!("{}/dl/tool.tar.gz", server.uri())
            }]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/dl/tool.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tarball".to_vec()))
            .expect(1) // idempotence: the second run must not download again
            .mount(&server)
            .await;

        let detector = detector(&server, temp.path());
        let outcome = detector.check_release(&project()).await.unwrap();

        assert_eq!(
            outcome,
            CheckOutcome::InitialSync {
                descriptor: "v1.0 (abc)".to_string(),
                artifacts: 1
            }
        );

        let store = detector.store();
        let asset_path = store.releases_dir(&project()).join("tool.tar.gz");
        assert_eq!(std::fs::read(&asset_path).unwrap(), b"tarball");

        let cursor = store.load_release(&project()).await.unwrap().unwrap();
        assert_eq!(cursor.tag, "v1.0");
        assert_eq!(cursor.commit, "abc");

        // Nothing to diff from: no change log on initial sync
        assert!(!store.changelog_path(&project()).exists());

        // Second run against unchanged remote state performs zero writes
        let outcome = detector.check_release(&project()).await.unwrap();
        assert_eq!(outcome, CheckOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_incremental_release_update_appends_changelog() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let detector = detector(&server, temp.path());

        // Prior completed sync at v1.0/abc
        detector
            .store()
            .save_release(
                &project(),
                &ReleaseCursor {
                    tag: "v1.0".to_string(),
                    commit: "abc".to_string(),
                },
            )
            .await
            .unwrap();

        mount_release(
            &server,
            "v1.1",
            "def",
            json!([{
                "name": "tool.tar.gz",
                "browser_download_url": format!("{}/dl/tool.tar.gz", server.uri())
            }]),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/repos/octocat/Hello-World/compare/abc...def"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commits": [
                    commit_json("c1", "Fix crash\n\nLong body"),
                    commit_json("c2", "Add feature"),
                    commit_json("c3", "Bump version"),
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dl/tool.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v1.1-tarball".to_vec()))
            .mount(&server)
            .await;

        let outcome = detector.check_release(&project()).await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Updated {
                descriptor: "v1.1 (def)".to_string(),
                commits: 3,
                artifacts: 1
            }
        );

        let store = detector.store();
        let cursor = store.load_release(&project()).await.unwrap().unwrap();
        assert_eq!(cursor.tag, "v1.1");
        assert_eq!(cursor.commit, "def");

        let changelog = std::fs::read_to_string(store.changelog_path(&project())).unwrap();
        let lines: Vec<_> = changelog.lines().collect();
        assert_eq!(lines.len(), 3);
        // Only the first line of a commit message becomes the summary
        assert!(lines[0].starts_with("- Fix crash (by Alice on"));
        assert!(lines[2].starts_with("- Bump version (by Alice on"));
    }

    #[tokio::test]
    async fn test_no_release_yet_is_nothing_to_sync() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let detector = detector(&server, temp.path());

        // Unmatched request: wiremock answers 404, like a project without
        // any published release.
        let outcome = detector.check_release(&project()).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Missing);
        assert_eq!(
            detector.store().load_release(&project()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_failed_download_leaves_cursor_untouched() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let detector = detector(&server, temp.path());

        // Asset URL is never mounted, so the download fails partway through
        // the cycle.
        mount_release(
            &server,
            "v1.0",
            "abc",
            json!([{
                "name": "tool.tar.gz",
                "browser_download_url": format!("{}/dl/broken.tar.gz", server.uri())
            }]),
        )
        .await;

        let result = detector.check_release(&project()).await;
        assert!(result.is_err());

        // Prior cursor state (absent) is retained for the idempotent retry
        assert_eq!(
            detector.store().load_release(&project()).await.unwrap(),
            None
        );
        let releases_dir = detector.store().releases_dir(&project());
        if releases_dir.exists() {
            let leftover: Vec<_> = std::fs::read_dir(&releases_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            assert!(leftover.iter().all(|n| !n.ends_with(".part")));
        }
    }

    #[tokio::test]
    async fn test_initial_branch_sync_downloads_archive() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let detector = detector(&server, temp.path());

        Mock::given(method("GET"))
            .and(path("/repos/octocat/Hello-World/commits/master"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(commit_json("def456", "Tip of master")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/octocat/Hello-World/archive/refs/heads/master.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip-bytes".to_vec()))
            .mount(&server)
            .await;

        let outcome = detector.check_branch(&project()).await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::InitialSync {
                descriptor: "master @ def456".to_string(),
                artifacts: 1
            }
        );

        let store = detector.store();
        let archive = store.project_dir(&project()).join("Hello-World_master.zip");
        assert_eq!(std::fs::read(&archive).unwrap(), b"zip-bytes");

        let cursor = store.load_branch(&project()).await.unwrap().unwrap();
        assert_eq!(cursor.branch, "master");
        assert_eq!(cursor.commit, "def456");

        // Unchanged head: second run is a no-op
        let outcome = detector.check_branch(&project()).await.unwrap();
        assert_eq!(outcome, CheckOutcome::NoChange);
    }

    #[tokio::test]
    async fn test_branch_update_with_vanished_range_still_advances() {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let detector = detector(&server, temp.path());

        detector
            .store()
            .save_branch(
                &project(),
                &BranchCursor {
                    branch: "master".to_string(),
                    commit: "old".to_string(),
                },
            )
            .await
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/repos/octocat/Hello-World/commits/master"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(commit_json("new", "Rewritten tip")),
            )
            .mount(&server)
            .await;
        // compare/old...new is never mounted: the base commit vanished
        Mock::given(method("GET"))
            .and(path("/octocat/Hello-World/archive/refs/heads/master.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"zip2".to_vec()))
            .mount(&server)
            .await;

        let outcome = detector.check_branch(&project()).await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Updated {
                descriptor: "master @ new".to_string(),
                commits: 0,
                artifacts: 1
            }
        );

        let cursor = detector
            .store()
            .load_branch(&project())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.commit, "new");
    }

    #[test]
    fn test_safe_file_names() {
        assert!(is_safe_file_name("tool-1.0.tar.gz"));
        assert!(!is_safe_file_name("../escape"));
        assert!(!is_safe_file_name("a/b"));
        assert!(!is_safe_file_name(""));
    }
}
