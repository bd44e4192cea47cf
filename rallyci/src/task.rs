//! A CI run: a set of independently running, independently cancellable jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::job::{Job, JobReport, JobStatus, Runner};

/// Cancellation handle and completion flag of one spawned job.
struct Unit {
    token: CancellationToken,
    done: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: Uuid,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub jobs: Vec<JobReport>,
}

pub struct Task {
    id: Uuid,
    project: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    units: HashMap<Uuid, Unit>,
    running: JoinSet<JobReport>,
    reports: Vec<JobReport>,
}

impl Task {
    pub fn new(project: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            units: HashMap::new(),
            running: JoinSet::new(),
            reports: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start `job` on `runner`. A job's failure never touches its siblings.
    pub fn spawn_job(&mut self, mut job: Job, mut runner: Box<dyn Runner>) {
        let token = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        self.units.insert(
            job.id(),
            Unit {
                token: token.clone(),
                done: done.clone(),
            },
        );
        info!(task = %self.id, job = %job.name(), id = %job.id(), "job started");
        self.running.spawn(async move {
            job.run(runner.as_mut(), token).await;
            done.store(true, Ordering::SeqCst);
            job.report()
        });
    }

    /// Jobs that have not reached a terminal state.
    pub fn outstanding(&self) -> usize {
        self.units
            .values()
            .filter(|u| !u.done.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Wait until every job has finished its cleanup. Safe to drop and call
    /// again; finished jobs are kept.
    pub async fn wait(&mut self) -> TaskReport {
        while let Some(joined) = self.running.join_next().await {
            match joined {
                Ok(report) => self.reports.push(report),
                Err(e) => error!(task = %self.id, error = %e, "job panicked"),
            }
        }
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
            info!(task = %self.id, jobs = self.reports.len(), "task finished");
        }
        self.report()
    }

    /// Cancel every outstanding job and wait for all of them to clean up.
    /// Returns the number of cancellations issued.
    #[instrument(skip(self), fields(task = %self.id))]
    pub async fn cancel(&mut self) -> usize {
        let mut issued = 0;
        for unit in self.units.values() {
            if !unit.done.load(Ordering::SeqCst) && !unit.token.is_cancelled() {
                unit.token.cancel();
                issued += 1;
            }
        }
        info!(cancelled = issued, "task cancelled");
        self.wait().await;
        issued
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            id: self.id,
            project: self.project.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            success: self.is_finished()
                && self.reports.len() == self.units.len()
                && self.reports.iter().all(|r| r.status == JobStatus::Success),
            jobs: self.reports.clone(),
        }
    }
}
