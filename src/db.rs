use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use anyhow::Result;

const INIT_SQL: &str = r#"
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    branch TEXT NOT NULL,
    commit_sha TEXT NOT NULL,
    author TEXT NOT NULL,
    message TEXT NOT NULL,
    environment TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER
);
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    job_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    duration_seconds INTEGER,
    logs TEXT,
    UNIQUE(pipeline_id, job_order)
);
CREATE TABLE IF NOT EXISTS merge_requests (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    author TEXT NOT NULL,
    source_branch TEXT NOT NULL,
    target_branch TEXT NOT NULL,
    status TEXT NOT NULL,
    approvals INTEGER NOT NULL DEFAULT 0,
    required_approvals INTEGER NOT NULL,
    has_conflicts INTEGER NOT NULL DEFAULT 0,
    additions INTEGER NOT NULL DEFAULT 0,
    deletions INTEGER NOT NULL DEFAULT 0,
    files_changed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pipelines_status_started ON pipelines(status, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_pipelines_branch_started ON pipelines(branch, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_jobs_pipeline_order ON jobs(pipeline_id, job_order);
CREATE INDEX IF NOT EXISTS idx_merge_requests_created ON merge_requests(created_at DESC);
"#;

pub async fn init_db(url: &str, max_connections: u32) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url).await?;

    sqlx::query(INIT_SQL).execute(&pool).await?;
    Ok(pool)
}

/// A private in-memory database. Pinned to one connection that never expires, since every
/// new connection to `sqlite::memory:` would open an empty database.
pub async fn init_memory_db() -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:").await?;

    sqlx::query(INIT_SQL).execute(&pool).await?;
    Ok(pool)
}
