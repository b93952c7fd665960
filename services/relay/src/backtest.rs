//! Backtest job registry: tracks long-running producer jobs so progress
//! and result events can be routed to the user that owns them.

use relay_protocol::{BacktestProgress, BacktestResult};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BacktestJob {
    pub job_id: String,
    /// The user that launched the job; events for owned jobs are emitted
    /// per-user, ownerless jobs broadcast.
    pub user_id: Option<String>,
    pub progress: f64,
    pub current_symbol: Option<String>,
    pub estimated_completion: Option<String>,
    pub status: JobStatus,
    pub results: serde_json::Value,
}

#[derive(Default)]
pub struct BacktestRegistry {
    jobs: RwLock<HashMap<String, BacktestJob>>,
}

impl BacktestRegistry {
    pub fn new() -> Self {
        BacktestRegistry::default()
    }

    /// Apply a progress event; creates the job on first sight.
    pub async fn update_progress(&self, progress: &BacktestProgress) -> BacktestJob {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .entry(progress.job_id.clone())
            .or_insert_with(|| BacktestJob {
                job_id: progress.job_id.clone(),
                user_id: None,
                progress: 0.0,
                current_symbol: None,
                estimated_completion: None,
                status: JobStatus::Running,
                results: serde_json::Value::Null,
            });
        job.progress = progress.progress;
        job.current_symbol = progress.current_symbol.clone();
        job.estimated_completion = progress.estimated_completion.clone();
        if progress.user_id.is_some() {
            job.user_id = progress.user_id.clone();
        }
        debug!(job_id = %job.job_id, progress = job.progress, "backtest progress");
        job.clone()
    }

    /// Apply a terminal result event.
    pub async fn complete(&self, result: &BacktestResult) -> BacktestJob {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .entry(result.job_id.clone())
            .or_insert_with(|| BacktestJob {
                job_id: result.job_id.clone(),
                user_id: None,
                progress: 0.0,
                current_symbol: None,
                estimated_completion: None,
                status: JobStatus::Running,
                results: serde_json::Value::Null,
            });
        job.status = if result.status == "completed" {
            job.progress = 1.0;
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.results = result.results.clone();
        if result.user_id.is_some() {
            job.user_id = result.user_id.clone();
        }
        debug!(job_id = %job.job_id, status = ?job.status, "backtest finished");
        job.clone()
    }

    pub async fn get(&self, job_id: &str) -> Option<BacktestJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
