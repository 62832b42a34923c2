use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Deployment target class, derived from the branch a pipeline was triggered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle shared by pipelines and jobs: `pending -> running -> {success | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Pipeline {
    pub id: String,
    pub branch: String,
    pub commit_sha: String,
    pub author: String,
    pub message: String,
    pub environment: Environment,
    pub status: Status,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: String,
    pub pipeline_id: String,
    pub name: String,
    #[sqlx(rename = "job_order")]
    pub order: i64,
    pub status: Status,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub logs: Option<String>,
}

/// A job template before it is bound to a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: &'static str,
    pub order: i64,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MergeRequest {
    pub id: String,
    pub pipeline_id: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub status: String,
    pub approvals: i64,
    pub required_approvals: i64,
    pub has_conflicts: bool,
    pub additions: i64,
    pub deletions: i64,
    pub files_changed: i64,
    pub created_at: i64,
}

/// Partial field set for `PipelineStore::update_pipeline`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineUpdate {
    pub status: Option<Status>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Partial field set for `PipelineStore::update_job`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<Status>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineFilter {
    pub status: Option<Status>,
    pub branch: Option<String>,
    pub environment: Option<Environment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SummaryStat {
    pub total_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub running_count: i64,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
}
