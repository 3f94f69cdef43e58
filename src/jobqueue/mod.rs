//! Persistent job queue with dependency gating and token-indirected dispatch.

pub mod fs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use fs::FsJobQueue;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
        }
    }
}

/// A job handed to a worker: the minted token, the stored payload, and the
/// results of every dependency in declaration order.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: Uuid,
    pub token: Uuid,
    pub jtype: String,
    pub args: Value,
    pub dep_results: Vec<Value>,
}

/// Point-in-time view of a job's queue metadata.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub jtype: String,
    pub state: JobState,
    pub canceled: bool,
    pub dependencies: Vec<Uuid>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
