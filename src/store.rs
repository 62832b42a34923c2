use crate::error::StoreError;
use crate::models::{
    Job, JobUpdate, MergeRequest, Pipeline, PipelineFilter, PipelineUpdate, Status, SummaryStat,
};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

/// The most rows any listing returns.
const MAX_ROW_LIMIT: i64 = 100;

/// Persistence collaborator for pipelines, jobs and merge requests.
///
/// Every method is independently fallible. `create_run`, `reset_run` and
/// `finish_job_and_pipeline` write more than one row atomically.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    async fn insert_jobs(&self, jobs: &[Job]) -> Result<(), StoreError>;

    async fn update_pipeline(&self, id: &str, fields: PipelineUpdate) -> Result<(), StoreError>;

    async fn update_job(&self, id: &str, fields: JobUpdate) -> Result<(), StoreError>;

    /// Sorted by job order ascending.
    async fn list_jobs(&self, pipeline_id: &str) -> Result<Vec<Job>, StoreError>;

    async fn get_pipeline(&self, id: &str) -> Result<Pipeline, StoreError>;

    /// Newest first.
    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>, StoreError>;

    /// Writes a terminal job state and the owning pipeline's state together.
    async fn finish_job_and_pipeline(
        &self,
        job_id: &str,
        job_fields: JobUpdate,
        pipeline_id: &str,
        pipeline_fields: PipelineUpdate,
    ) -> Result<(), StoreError>;

    /// Writes a new pipeline, its jobs and its merge request, if any, in one transaction.
    async fn create_run(
        &self,
        pipeline: &Pipeline,
        jobs: &[Job],
        merge_request: Option<&MergeRequest>,
    ) -> Result<(), StoreError>;

    /// Puts a pipeline and all of its jobs back to `pending` for a manual re-run.
    async fn reset_run(&self, pipeline_id: &str) -> Result<(), StoreError>;

    async fn insert_merge_request(&self, mr: &MergeRequest) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_merge_requests(&self) -> Result<Vec<MergeRequest>, StoreError>;

    async fn summary(&self) -> Result<SummaryStat, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn pipeline_update_query(
    id: &str,
    fields: &PipelineUpdate,
) -> Result<QueryBuilder<'static, Sqlite>, StoreError> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE pipelines SET ");
    let mut updated_fields_total = 0;

    {
        let mut separated = query.separated(", ");
        if let Some(status) = fields.status {
            separated.push("status = ");
            separated.push_bind_unseparated(status);
            updated_fields_total += 1;
        }
        if let Some(started_at) = fields.started_at {
            separated.push("started_at = ");
            separated.push_bind_unseparated(started_at);
            updated_fields_total += 1;
        }
        if let Some(finished_at) = fields.finished_at {
            separated.push("finished_at = ");
            separated.push_bind_unseparated(finished_at);
            updated_fields_total += 1;
        }
    }

    if updated_fields_total == 0 {
        return Err(StoreError::NoFieldsUpdated);
    }

    query.push(" WHERE id = ");
    query.push_bind(id.to_string());
    Ok(query)
}

fn job_update_query(
    id: &str,
    fields: &JobUpdate,
) -> Result<QueryBuilder<'static, Sqlite>, StoreError> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET ");
    let mut updated_fields_total = 0;

    {
        let mut separated = query.separated(", ");
        if let Some(status) = fields.status {
            separated.push("status = ");
            separated.push_bind_unseparated(status);
            updated_fields_total += 1;
        }
        if let Some(started_at) = fields.started_at {
            separated.push("started_at = ");
            separated.push_bind_unseparated(started_at);
            updated_fields_total += 1;
        }
        if let Some(finished_at) = fields.finished_at {
            separated.push("finished_at = ");
            separated.push_bind_unseparated(finished_at);
            updated_fields_total += 1;
        }
        if let Some(duration) = fields.duration_seconds {
            separated.push("duration_seconds = ");
            separated.push_bind_unseparated(duration);
            updated_fields_total += 1;
        }
        if let Some(logs) = &fields.logs {
            separated.push("logs = ");
            separated.push_bind_unseparated(logs.clone());
            updated_fields_total += 1;
        }
    }

    if updated_fields_total == 0 {
        return Err(StoreError::NoFieldsUpdated);
    }

    query.push(" WHERE id = ");
    query.push_bind(id.to_string());
    Ok(query)
}

fn expect_one_row(rows_affected: u64) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

async fn insert_pipeline_row(conn: &mut SqliteConnection, p: &Pipeline) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO pipelines (id, branch, commit_sha, author, message, environment, status, started_at, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&p.id)
    .bind(&p.branch)
    .bind(&p.commit_sha)
    .bind(&p.author)
    .bind(&p.message)
    .bind(p.environment)
    .bind(p.status)
    .bind(p.started_at)
    .bind(p.finished_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_job_rows(conn: &mut SqliteConnection, jobs: &[Job]) -> Result<(), StoreError> {
    if jobs.is_empty() {
        return Ok(());
    }

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO jobs (id, pipeline_id, name, job_order, status, started_at, finished_at, duration_seconds, logs) ",
    );
    query.push_values(jobs, |mut row, job| {
        row.push_bind(&job.id)
            .push_bind(&job.pipeline_id)
            .push_bind(&job.name)
            .push_bind(job.order)
            .push_bind(job.status)
            .push_bind(job.started_at)
            .push_bind(job.finished_at)
            .push_bind(job.duration_seconds)
            .push_bind(&job.logs);
    });
    query.build().execute(&mut *conn).await?;
    Ok(())
}

async fn insert_merge_request_row(
    conn: &mut SqliteConnection,
    mr: &MergeRequest,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO merge_requests (id, pipeline_id, title, description, author, source_branch, target_branch,
            status, approvals, required_approvals, has_conflicts, additions, deletions, files_changed, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&mr.id)
    .bind(&mr.pipeline_id)
    .bind(&mr.title)
    .bind(&mr.description)
    .bind(&mr.author)
    .bind(&mr.source_branch)
    .bind(&mr.target_branch)
    .bind(&mr.status)
    .bind(mr.approvals)
    .bind(mr.required_approvals)
    .bind(mr.has_conflicts)
    .bind(mr.additions)
    .bind(mr.deletions)
    .bind(mr.files_changed)
    .bind(mr.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_pipeline_row(&mut conn, pipeline).await
    }

    async fn insert_jobs(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_job_rows(&mut conn, jobs).await
    }

    async fn update_pipeline(&self, id: &str, fields: PipelineUpdate) -> Result<(), StoreError> {
        let mut query = pipeline_update_query(id, &fields)?;
        let result = query.build().execute(&self.pool).await?;
        expect_one_row(result.rows_affected())
    }

    async fn update_job(&self, id: &str, fields: JobUpdate) -> Result<(), StoreError> {
        let mut query = job_update_query(id, &fields)?;
        let result = query.build().execute(&self.pool).await?;
        expect_one_row(result.rows_affected())
    }

    async fn list_jobs(&self, pipeline_id: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT id, pipeline_id, name, job_order, status, started_at, finished_at, duration_seconds, logs \
            FROM jobs WHERE pipeline_id = ? ORDER BY job_order ASC",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn get_pipeline(&self, id: &str) -> Result<Pipeline, StoreError> {
        let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(pipeline)
    }

    async fn list_pipelines(&self, filter: &PipelineFilter) -> Result<Vec<Pipeline>, StoreError> {
        let mut query_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM pipelines WHERE 1=1");

        if let Some(status) = filter.status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status);
        }
        if let Some(branch) = &filter.branch {
            if !branch.is_empty() {
                query_builder.push(" AND branch = ");
                query_builder.push_bind(branch);
            }
        }
        if let Some(environment) = filter.environment {
            query_builder.push(" AND environment = ");
            query_builder.push_bind(environment);
        }

        query_builder.push(" ORDER BY started_at DESC, id DESC LIMIT ");
        query_builder.push_bind(MAX_ROW_LIMIT);

        let pipelines = query_builder
            .build_query_as::<Pipeline>()
            .fetch_all(&self.pool)
            .await?;
        Ok(pipelines)
    }

    async fn finish_job_and_pipeline(
        &self,
        job_id: &str,
        job_fields: JobUpdate,
        pipeline_id: &str,
        pipeline_fields: PipelineUpdate,
    ) -> Result<(), StoreError> {
        let mut job_query = job_update_query(job_id, &job_fields)?;
        let mut pipeline_query = pipeline_update_query(pipeline_id, &pipeline_fields)?;

        let mut tx = self.pool.begin().await?;

        let result = job_query.build().execute(&mut *tx).await?;
        expect_one_row(result.rows_affected())?;
        let result = pipeline_query.build().execute(&mut *tx).await?;
        expect_one_row(result.rows_affected())?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_run(
        &self,
        pipeline: &Pipeline,
        jobs: &[Job],
        merge_request: Option<&MergeRequest>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        insert_pipeline_row(&mut tx, pipeline).await?;
        insert_job_rows(&mut tx, jobs).await?;
        if let Some(mr) = merge_request {
            insert_merge_request_row(&mut tx, mr).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset_run(&self, pipeline_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE pipelines SET status = ?, finished_at = NULL WHERE id = ?")
            .bind(Status::Pending)
            .bind(pipeline_id)
            .execute(&mut *tx)
            .await?;
        expect_one_row(result.rows_affected())?;

        sqlx::query(
            "UPDATE jobs SET status = ?, started_at = NULL, finished_at = NULL, duration_seconds = NULL, logs = NULL \
            WHERE pipeline_id = ?",
        )
        .bind(Status::Pending)
        .bind(pipeline_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_merge_request(&self, mr: &MergeRequest) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_merge_request_row(&mut conn, mr).await
    }

    async fn list_merge_requests(&self) -> Result<Vec<MergeRequest>, StoreError> {
        let mrs = sqlx::query_as::<_, MergeRequest>(
            "SELECT * FROM merge_requests ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(MAX_ROW_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(mrs)
    }

    async fn summary(&self) -> Result<SummaryStat, StoreError> {
        let stat = sqlx::query_as::<_, SummaryStat>(
            r#"
            SELECT
                COUNT(*) as total_count,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) as success_count,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) as failed_count,
                COALESCE(SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END), 0) as running_count,
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END) * 100.0
                    / NULLIF(SUM(CASE WHEN status IN ('success', 'failed') THEN 1 ELSE 0 END), 0), 0.0) as success_rate,
                COALESCE(AVG(CASE WHEN finished_at IS NOT NULL THEN (finished_at - started_at) / 1000.0 END), 0.0) as avg_duration_seconds
            FROM pipelines
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stat)
    }
}
