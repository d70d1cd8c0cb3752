//! Concurrency Coordinator - bounded worker pool with per-project exclusivity
//!
//! Two trigger sources enqueue project checks: a periodic sweep timer that
//! covers every known project, and the tracked-list manager's new-project
//! channel, which gets one initial check immediately. A semaphore bounds the
//! number of checks in flight; an in-flight slot per project identity
//! coalesces duplicate triggers by dropping them (the running check observes
//! current remote state anyway), so they are never queued indefinitely.
//!
//! Failures from a single project's check are caught at the task boundary,
//! logged and reported; they never propagate to other tasks or stop the
//! pool. On shutdown the coordinator stops accepting triggers, lets
//! in-flight tasks finish their current atomic step and discards the rest.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::detector::{ChangeDetector, CheckOutcome, CursorKind};
use crate::error::SyncError;
use crate::events::{EventKind, NotificationSink, SyncEvent};
use crate::shutdown::Shutdown;
use crate::tracklist::{ProjectRegistry, TrackedProject};

/// Results of one full sweep
#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub projects: usize,
    pub updates: usize,
    pub unchanged: usize,
    pub failures: usize,
    pub duration: Duration,
}

/// Per-task outcome counts
#[derive(Debug, Clone, Copy, Default)]
struct CheckReport {
    updates: usize,
    unchanged: usize,
    failures: usize,
}

/// Schedules project checks across a bounded worker pool
pub struct Coordinator {
    detector: Arc<ChangeDetector>,
    registry: ProjectRegistry,
    sink: Arc<dyn NotificationSink>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    semaphore: Arc<Semaphore>,
    check_timeout: Duration,
    shutdown: Shutdown,
}

impl Coordinator {
    pub fn new(
        detector: Arc<ChangeDetector>,
        registry: ProjectRegistry,
        sink: Arc<dyn NotificationSink>,
        max_parallel: usize,
        check_timeout: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            detector,
            registry,
            sink,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
            check_timeout,
            shutdown,
        }
    }

    /// Drive checks until shutdown: an immediate sweep, then one sweep per
    /// interval, plus an initial check for every runtime addition.
    pub async fn run(
        &self,
        mut added: mpsc::UnboundedReceiver<TrackedProject>,
        sweep_interval: Duration,
    ) {
        let mut tasks: JoinSet<CheckReport> = JoinSet::new();
        let mut timer = tokio::time::interval(sweep_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut added_open = true;

        info!(
            "Coordinator running (sweep interval {:?}, pool size {})",
            sweep_interval,
            self.semaphore.available_permits()
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, no further checks will be scheduled");
                    break;
                }

                _ = timer.tick() => {
                    let projects = self.snapshot();
                    debug!("Periodic sweep over {} project(s)", projects.len());
                    for project in projects {
                        self.schedule(project, &mut tasks);
                    }
                }

                maybe_added = added.recv(), if added_open => {
                    match maybe_added {
                        Some(project) => {
                            info!("Scheduling initial check for {}", project);
                            self.schedule(project, &mut tasks);
                        }
                        None => added_open = false,
                    }
                }

                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Project check task panicked: {}", e);
                        }
                    }
                }
            }
        }

        // In-flight tasks finish their current atomic step; anything not
        // yet scheduled is discarded.
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Project check task panicked during shutdown: {}", e);
                }
            }
        }
        info!("Coordinator stopped");
    }

    /// One bounded-parallel pass over every known project.
    pub async fn sweep(&self) -> SweepSummary {
        self.sweep_projects(self.snapshot()).await
    }

    /// One bounded-parallel pass over the given projects.
    pub async fn sweep_projects(&self, projects: Vec<TrackedProject>) -> SweepSummary {
        let start = Instant::now();
        let mut summary = SweepSummary {
            projects: projects.len(),
            ..Default::default()
        };

        let mut tasks: JoinSet<CheckReport> = JoinSet::new();
        for project in projects {
            self.schedule(project, &mut tasks);
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(report) => {
                    summary.updates += report.updates;
                    summary.unchanged += report.unchanged;
                    summary.failures += report.failures;
                }
                Err(e) => {
                    if e.is_panic() {
                        error!("Project check task panicked: {}", e);
                        summary.failures += 1;
                    }
                }
            }
        }

        summary.duration = start.elapsed();
        summary
    }

    fn snapshot(&self) -> Vec<TrackedProject> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Claim the project's exclusivity slot and spawn its check. A trigger
    /// for a project whose slot is held is dropped, not queued.
    fn schedule(&self, project: TrackedProject, tasks: &mut JoinSet<CheckReport>) {
        if self.shutdown.is_triggered() {
            return;
        }

        let key = project.full_name();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key.clone()) {
                debug!("Check already in flight for {}, dropping trigger", key);
                return;
            }
        }

        let detector = self.detector.clone();
        let sink = self.sink.clone();
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let check_timeout = self.check_timeout;

        tasks.spawn(async move {
            let report = match semaphore.acquire_owned().await {
                Ok(_permit) => run_check(&detector, &sink, &project, check_timeout).await,
                Err(_) => CheckReport::default(),
            };
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            report
        });
    }
}

/// Run both cursor checks for one project, containing every failure and
/// reporting each terminal outcome exactly once.
async fn run_check(
    detector: &ChangeDetector,
    sink: &Arc<dyn NotificationSink>,
    project: &TrackedProject,
    check_timeout: Duration,
) -> CheckReport {
    let full_name = project.full_name();
    sink.notify(
        SyncEvent::new(EventKind::SyncStarted, format!("checking {}", full_name))
            .project(&full_name),
    );

    let mut report = CheckReport::default();

    for kind in [CursorKind::Release, CursorKind::Branch] {
        let check = async {
            match kind {
                CursorKind::Release => detector.check_release(project).await,
                CursorKind::Branch => detector.check_branch(project).await,
            }
        };

        match tokio::time::timeout(check_timeout, check).await {
            Err(_) => {
                report.failures += 1;
                warn!("{} check timed out for {}", kind.as_str(), full_name);
                sink.notify(
                    SyncEvent::new(
                        EventKind::SyncFailed,
                        format!("{} check timed out", kind.as_str()),
                    )
                    .project(&full_name)
                    .details("timeout"),
                );
            }
            Ok(Ok(outcome)) => report_outcome(sink, &full_name, kind, outcome, &mut report),
            Ok(Err(SyncError::Cancelled)) => {
                debug!(
                    "{} check for {} interrupted by shutdown",
                    kind.as_str(),
                    full_name
                );
                break;
            }
            Ok(Err(e)) => {
                report.failures += 1;
                warn!("{} check failed for {}: {}", kind.as_str(), full_name, e);
                sink.notify(
                    SyncEvent::new(
                        EventKind::SyncFailed,
                        format!("{} check failed: {}", kind.as_str(), e),
                    )
                    .project(&full_name)
                    .details(e.kind()),
                );
            }
        }
    }

    report
}

fn report_outcome(
    sink: &Arc<dyn NotificationSink>,
    full_name: &str,
    kind: CursorKind,
    outcome: CheckOutcome,
    report: &mut CheckReport,
) {
    match outcome {
        CheckOutcome::NoChange => {
            report.unchanged += 1;
            sink.notify(
                SyncEvent::new(
                    EventKind::NoChange,
                    format!("{} cursor up to date", kind.as_str()),
                )
                .project(full_name),
            );
        }
        CheckOutcome::Missing => {
            report.unchanged += 1;
            sink.notify(
                SyncEvent::new(
                    EventKind::NoChange,
                    format!("no {} to sync yet", kind.as_str()),
                )
                .project(full_name),
            );
        }
        CheckOutcome::InitialSync {
            descriptor,
            artifacts,
        } => {
            report.updates += 1;
            sink.notify(
                SyncEvent::new(
                    EventKind::InitialSyncComplete,
                    format!(
                        "initial {} sync at {} ({} artifact(s))",
                        kind.as_str(),
                        descriptor,
                        artifacts
                    ),
                )
                .project(full_name),
            );
        }
        CheckOutcome::Updated {
            descriptor,
            commits,
            artifacts,
        } => {
            report.updates += 1;
            sink.notify(
                SyncEvent::new(
                    EventKind::UpdateComplete,
                    format!(
                        "{} advanced to {} ({} new commit(s), {} artifact(s))",
                        kind.as_str(),
                        descriptor,
                        commits,
                        artifacts
                    ),
                )
                .project(full_name)
                .details_json(&serde_json::json!({
                    "commits": commits,
                    "artifacts": artifacts,
                })),
            );
        }
    }
}
