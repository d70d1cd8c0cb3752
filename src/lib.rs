//! repovault - Release and Branch Artifact Mirroring Daemon
//!
//! repovault mirrors an evolving set of externally hosted projects: for each
//! tracked repository it detects new published releases and new commits on a
//! primary branch, and pulls the corresponding artifacts (release assets,
//! branch archive) into local storage exactly once per change — while
//! tolerating an unreliable, rate-limited remote API and a tracked list that
//! changes at runtime.
//!
//! ## Modules
//!
//! - [`tracklist`]: the live set of tracked projects and its file watcher
//! - [`state`]: durable per-project sync cursors and the change log
//! - [`gateway`]: rate-limit-aware access to the remote API
//! - [`detector`]: no-op vs. initial-sync vs. incremental-update decisions
//! - [`coordinator`]: bounded worker pool with per-project exclusivity
//! - [`events`]: notification sink and persistent sync event log
//! - [`config`]: YAML configuration with XDG compliance
//! - [`daemon`]: background service wiring and lifecycle

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod detector;
pub mod error;
pub mod events;
pub mod gateway;
pub mod shutdown;
pub mod state;
pub mod tracklist;

pub use config::Config;
pub use coordinator::{Coordinator, SweepSummary};
pub use daemon::Daemon;
pub use detector::{ChangeDetector, CheckOutcome};
pub use error::SyncError;
pub use events::{EventLog, NotificationSink, SyncEvent, TraceSink};
pub use gateway::RemoteGateway;
pub use shutdown::Shutdown;
pub use state::{BranchCursor, CursorStore, ReleaseCursor};
pub use tracklist::{TrackedProject, TrackedSet};
