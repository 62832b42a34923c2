use crate::error::StoreError;
use crate::factory;
use crate::models::{
    Environment, Job, MergeRequest, Pipeline, PipelineFilter, PipelineUpdate, Status, SummaryStat,
};
use crate::state::AppState;
use crate::webhook_types::PushEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) | ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(e) => {
                error!("request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct PipelineQuery {
    status: Option<Status>,
    branch: Option<String>,
    environment: Option<Environment>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TriggerResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_request_id: Option<String>,
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RunResponse {
    pub pipeline_id: String,
    pub status: Status,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PipelineResponse {
    pub id: String,
    pub branch: String,
    pub commit_sha: String,
    pub author: String,
    pub message: String,
    pub environment: Environment,
    pub status: Status,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub order: i64,
    pub status: Status,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub logs: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PipelineDetail {
    #[serde(flatten)]
    pub pipeline: PipelineResponse,
    pub jobs: Vec<JobResponse>,
}

fn rfc3339(ms: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

impl From<Pipeline> for PipelineResponse {
    fn from(p: Pipeline) -> Self {
        PipelineResponse {
            id: p.id,
            branch: p.branch,
            commit_sha: p.commit_sha,
            author: p.author,
            message: p.message,
            environment: p.environment,
            status: p.status,
            started_at: rfc3339(p.started_at),
            finished_at: p.finished_at.map(rfc3339),
        }
    }
}

impl From<Job> for JobResponse {
    fn from(j: Job) -> Self {
        JobResponse {
            id: j.id,
            name: j.name,
            order: j.order,
            status: j.status,
            started_at: j.started_at.map(rfc3339),
            finished_at: j.finished_at.map(rfc3339),
            duration_seconds: j.duration_seconds,
            logs: j.logs,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/webhooks/git", post(trigger_pipeline))
        .route("/api/pipelines", get(list_pipelines))
        .route("/api/pipelines/:id", get(get_pipeline))
        .route("/api/pipelines/:id/run", post(run_pipeline))
        .route("/api/merge-requests", get(list_merge_requests))
        .route("/api/stats/summary", get(get_summary_stats))
        .with_state(state)
}

/// Creates the pipeline, jobs and merge request for a push and queues the run. Responds as
/// soon as the rows exist; the run's outcome is only visible through later reads.
async fn trigger_pipeline(
    State(state): State<AppState>,
    Json(event): Json<PushEvent>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    if event.commits.is_empty() {
        return Err(ApiError::BadRequest("No commits found".to_string()));
    }
    let trigger = event
        .to_trigger()
        .ok_or_else(|| ApiError::BadRequest("Push is missing a branch or commit id".to_string()))?;

    if let Some(re) = &state.branch_filter {
        if !re.is_match(&trigger.branch) {
            info!("Ignoring push to {} (branch filter)", trigger.branch);
            return Ok((
                StatusCode::ACCEPTED,
                Json(TriggerResponse {
                    pipeline_id: None,
                    environment: None,
                    merge_request_id: None,
                    skipped: true,
                }),
            ));
        }
    }

    let now = state.clock.now();
    let (pipeline, jobs) = factory::create_pipeline(
        &trigger.branch,
        &trigger.commit_sha,
        &trigger.author,
        &trigger.message,
        now,
    );
    let merge_request = factory::synthesize_merge_request(&pipeline, state.random.as_ref(), now);
    state
        .store
        .create_run(&pipeline, &jobs, merge_request.as_ref())
        .await?;
    if let Some(mr) = &merge_request {
        info!("Opened merge request {} -> {}", mr.source_branch, mr.target_branch);
    }

    state.cache.invalidate_all();
    if !state.dispatcher.enqueue(&pipeline.id) {
        fail_undispatched(&state, &pipeline.id).await;
        return Err(ApiError::Unavailable(format!(
            "Pipeline {} was created but could not be queued",
            pipeline.id
        )));
    }
    info!(
        "Created pipeline {} for {}@{} ({}, {} jobs)",
        pipeline.id,
        pipeline.branch,
        pipeline.commit_sha,
        pipeline.environment,
        jobs.len()
    );

    Ok((
        StatusCode::OK,
        Json(TriggerResponse {
            pipeline_id: Some(pipeline.id),
            environment: Some(pipeline.environment),
            merge_request_id: merge_request.map(|mr| mr.id),
            skipped: false,
        }),
    ))
}

/// Manual re-run: resets every job to pending and queues the pipeline again.
async fn run_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    state.store.get_pipeline(&id).await?;
    // a stored `running` status with no claim is left over from a stopped process
    if !state.dispatcher.claim(&id) {
        return Err(ApiError::Conflict(format!("Pipeline {} is already queued or running", id)));
    }

    if let Err(e) = state.store.reset_run(&id).await {
        state.dispatcher.release(&id);
        return Err(e.into());
    }
    if !state.dispatcher.submit(&id) {
        fail_undispatched(&state, &id).await;
        return Err(ApiError::Unavailable(format!("Pipeline {} could not be queued", id)));
    }
    state.cache.invalidate_all();
    info!("Manual run queued for pipeline {}", id);

    Ok((
        StatusCode::ACCEPTED,
        Json(RunResponse {
            pipeline_id: id,
            status: Status::Pending,
        }),
    ))
}

/// Marks a pipeline that no runner will pick up as `failed`.
async fn fail_undispatched(state: &AppState, pipeline_id: &str) {
    let fields = PipelineUpdate {
        status: Some(Status::Failed),
        finished_at: Some(state.clock.now().timestamp_millis()),
        ..Default::default()
    };
    if let Err(e) = state.store.update_pipeline(pipeline_id, fields).await {
        error!("Could not mark undispatched pipeline {} failed: {}", pipeline_id, e);
    }
    state.cache.invalidate_all();
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<PipelineQuery>,
) -> Result<Json<Vec<PipelineResponse>>, ApiError> {
    let filter = PipelineFilter {
        status: query.status,
        branch: query.branch,
        environment: query.environment,
    };
    let pipelines = state.store.list_pipelines(&filter).await?;
    Ok(Json(pipelines.into_iter().map(PipelineResponse::from).collect()))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineDetail>, ApiError> {
    let pipeline = match state.store.get_pipeline(&id).await {
        Ok(p) => p,
        Err(StoreError::NotFound) => {
            return Err(ApiError::NotFound(format!("Pipeline {} not found", id)))
        }
        Err(e) => return Err(e.into()),
    };
    let jobs = state.store.list_jobs(&id).await?;

    Ok(Json(PipelineDetail {
        pipeline: pipeline.into(),
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
    }))
}

async fn list_merge_requests(
    State(state): State<AppState>,
) -> Result<Json<Vec<MergeRequest>>, ApiError> {
    Ok(Json(state.store.list_merge_requests().await?))
}

async fn get_summary_stats(State(state): State<AppState>) -> Result<Json<SummaryStat>, ApiError> {
    let key = "summary".to_string();

    if let Some(cached) = state.cache.get(&key) {
        if let Ok(v) = serde_json::from_value::<SummaryStat>(cached.clone()) {
            return Ok(Json(v));
        }
    }

    let stats = state.store.summary().await?;

    if let Ok(val) = serde_json::to_value(&stats) {
        state.cache.insert(key, val).await;
    }

    Ok(Json(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::dispatcher::{self, start_dispatch_loop};
    use crate::runner::{Runner, RunnerSettings};
    use crate::sources::testing::{FixedRandom, ManualClock};
    use crate::sources::Clock;
    use crate::store::{PipelineStore, SqliteStore};
    use moka::future::Cache;
    use pretty_assertions::assert_eq;
    use regex::Regex;
    use std::sync::Arc;
    use std::time::Duration;

    enum Dispatch {
        Running,
        /// Queue is kept open but never drained, so runs stay claimed.
        Stalled,
        Stopped,
    }

    struct TestServer {
        base: String,
        client: reqwest::Client,
        store: Arc<SqliteStore>,
        _queue: Option<dispatcher::DispatchQueue>,
    }

    impl TestServer {
        async fn start(branch_filter: Option<&str>, random: f64) -> Self {
            Self::with_dispatch(branch_filter, random, Dispatch::Running).await
        }

        async fn with_dispatch(branch_filter: Option<&str>, random: f64, dispatch: Dispatch) -> Self {
            let store = Arc::new(SqliteStore::new(db::init_memory_db().await.unwrap()));
            let clock = Arc::new(ManualClock::fixed());
            let random = Arc::new(FixedRandom(random));
            let runner = Arc::new(Runner::new(
                store.clone(),
                clock.clone(),
                random.clone(),
                RunnerSettings::default(),
            ));
            let (dispatcher, queue) = dispatcher::channel();
            let queue = match dispatch {
                Dispatch::Running => {
                    tokio::spawn(start_dispatch_loop(runner, queue));
                    None
                }
                Dispatch::Stalled => Some(queue),
                Dispatch::Stopped => None,
            };

            let state = AppState {
                store: store.clone(),
                dispatcher,
                clock,
                random,
                branch_filter: branch_filter.map(|re| Regex::new(re).unwrap()),
                cache: Cache::builder()
                    .time_to_live(Duration::from_millis(1))
                    .max_capacity(10)
                    .build(),
            };

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app_router(state)).await.unwrap();
            });

            Self {
                base: format!("http://{}", addr),
                client: reqwest::Client::new(),
                store,
                _queue: queue,
            }
        }

        async fn run(&self, id: &str) -> reqwest::Response {
            self.client
                .post(format!("{}/api/pipelines/{}/run", self.base, id))
                .send()
                .await
                .unwrap()
        }

        async fn push(&self, git_ref: &str) -> reqwest::Response {
            self.client
                .post(format!("{}/api/webhooks/git", self.base))
                .json(&json!({
                    "ref": git_ref,
                    "commits": [
                        { "id": "0123456789abcdef", "message": "add login form", "author": { "name": "ada" } }
                    ]
                }))
                .send()
                .await
                .unwrap()
        }

        async fn pipeline(&self, id: &str) -> reqwest::Response {
            self.client
                .get(format!("{}/api/pipelines/{}", self.base, id))
                .send()
                .await
                .unwrap()
        }

        async fn wait_for_terminal(&self, id: &str) -> PipelineDetail {
            for _ in 0..400 {
                let detail: PipelineDetail = self.pipeline(id).await.json().await.unwrap();
                if matches!(detail.pipeline.status, Status::Success | Status::Failed) {
                    return detail;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("pipeline {} never finished", id);
        }
    }

    #[tokio::test]
    async fn push_creates_pipeline_and_runs_it() {
        let server = TestServer::start(None, 0.5).await;

        let res = server.push("refs/heads/feature/login").await;
        assert_eq!(res.status().as_u16(), StatusCode::OK.as_u16());
        let body: TriggerResponse = res.json().await.unwrap();
        assert_eq!(body.environment, Some(Environment::Development));
        assert!(body.merge_request_id.is_some());
        assert!(!body.skipped);

        let detail = server.wait_for_terminal(&body.pipeline_id.unwrap()).await;
        assert_eq!(detail.pipeline.status, Status::Success);
        assert_eq!(detail.pipeline.branch, "feature/login");
        assert_eq!(detail.pipeline.commit_sha, "01234567");
        assert!(detail.pipeline.finished_at.is_some());
        let orders: Vec<i64> = detail.jobs.iter().map(|j| j.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
        assert!(detail.jobs.iter().all(|j| j.status == Status::Success));

        let mrs: Vec<MergeRequest> = server
            .client
            .get(format!("{}/api/merge-requests", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(mrs.len(), 1);
        assert_eq!(mrs[0].target_branch, "develop");
        assert_eq!(mrs[0].required_approvals, 1);
    }

    #[tokio::test]
    async fn release_branch_gets_no_merge_request() {
        let server = TestServer::start(None, 0.5).await;

        let body: TriggerResponse = server.push("refs/heads/release/v2").await.json().await.unwrap();
        assert!(body.merge_request_id.is_none());
        assert_eq!(body.environment, Some(Environment::Development));
    }

    #[tokio::test]
    async fn push_without_commits_is_rejected() {
        let server = TestServer::start(None, 0.5).await;

        let res = server
            .client
            .post(format!("{}/api/webhooks/git", server.base))
            .json(&json!({ "ref": "refs/heads/main", "commits": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), StatusCode::BAD_REQUEST.as_u16());
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["error"], "No commits found");

        let list: Vec<PipelineResponse> = server
            .client
            .get(format!("{}/api/pipelines", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn filtered_branches_are_skipped() {
        let server = TestServer::start(Some("^(main|develop)$"), 0.5).await;

        let res = server.push("refs/heads/feature/login").await;
        assert_eq!(res.status().as_u16(), StatusCode::ACCEPTED.as_u16());
        let body: TriggerResponse = res.json().await.unwrap();
        assert!(body.skipped);
        assert!(body.pipeline_id.is_none());

        let res = server.push("refs/heads/main").await;
        assert_eq!(res.status().as_u16(), StatusCode::OK.as_u16());
    }

    #[tokio::test]
    async fn failing_job_fails_the_pipeline() {
        let server = TestServer::start(None, 0.05).await;

        let body: TriggerResponse = server.push("refs/heads/main").await.json().await.unwrap();
        let detail = server.wait_for_terminal(&body.pipeline_id.unwrap()).await;

        assert_eq!(detail.pipeline.status, Status::Failed);
        assert_eq!(detail.jobs.len(), 5);
        assert_eq!(detail.jobs[0].status, Status::Failed);
        assert!(detail.jobs[1..].iter().all(|j| j.status == Status::Pending));
        assert!(detail.jobs[0].logs.as_deref().unwrap().contains("💥 Error: "));
    }

    #[tokio::test]
    async fn unknown_pipeline_is_404() {
        let server = TestServer::start(None, 0.5).await;

        assert_eq!(server.pipeline("nope").await.status().as_u16(), StatusCode::NOT_FOUND.as_u16());
        assert_eq!(server.run("nope").await.status().as_u16(), StatusCode::NOT_FOUND.as_u16());
    }

    #[tokio::test]
    async fn manual_run_reruns_a_finished_pipeline() {
        let server = TestServer::start(None, 0.5).await;

        let body: TriggerResponse = server.push("refs/heads/develop").await.json().await.unwrap();
        let id = body.pipeline_id.unwrap();
        server.wait_for_terminal(&id).await;

        // the dispatcher releases the pipeline just after its final write
        let mut res = None;
        for _ in 0..100 {
            let attempt = server.run(&id).await;
            if attempt.status().as_u16() != StatusCode::CONFLICT.as_u16() {
                res = Some(attempt);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let res = res.unwrap();
        assert_eq!(res.status().as_u16(), StatusCode::ACCEPTED.as_u16());
        let run: RunResponse = res.json().await.unwrap();
        assert_eq!(run.pipeline_id, id);

        let detail = server.wait_for_terminal(&id).await;
        assert_eq!(detail.pipeline.status, Status::Success);
        assert_eq!(detail.jobs.len(), 5);
        assert!(detail.jobs.iter().all(|j| j.status == Status::Success));
    }

    #[tokio::test]
    async fn list_filters_and_summary() {
        let server = TestServer::start(None, 0.5).await;

        let mut ids = Vec::new();
        for git_ref in ["refs/heads/main", "refs/heads/develop", "refs/heads/feature/a"] {
            let body: TriggerResponse = server.push(git_ref).await.json().await.unwrap();
            ids.push(body.pipeline_id.unwrap());
        }
        for id in &ids {
            server.wait_for_terminal(id).await;
        }

        let production: Vec<PipelineResponse> = server
            .client
            .get(format!("{}/api/pipelines?environment=production", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(production.len(), 1);
        assert_eq!(production[0].branch, "main");

        let res = server
            .client
            .get(format!("{}/api/pipelines?status=bogus", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), StatusCode::BAD_REQUEST.as_u16());

        let stats: SummaryStat = server
            .client
            .get(format!("{}/api/stats/summary", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn manual_run_of_queued_pipeline_conflicts() {
        let server = TestServer::with_dispatch(None, 0.5, Dispatch::Stalled).await;

        let body: TriggerResponse = server.push("refs/heads/main").await.json().await.unwrap();
        let id = body.pipeline_id.unwrap();

        let res = server.run(&id).await;
        assert_eq!(res.status().as_u16(), StatusCode::CONFLICT.as_u16());
        assert_eq!(server.store.get_pipeline(&id).await.unwrap().status, Status::Pending);
    }

    #[tokio::test]
    async fn manual_run_recovers_orphaned_running_pipeline() {
        let server = TestServer::start(None, 0.5).await;
        let (pipeline, jobs) =
            factory::create_pipeline("main", "abcdef12", "ada", "msg", ManualClock::fixed().now());
        server.store.create_run(&pipeline, &jobs, None).await.unwrap();
        server
            .store
            .update_pipeline(&pipeline.id, PipelineUpdate { status: Some(Status::Running), ..Default::default() })
            .await
            .unwrap();
        server
            .store
            .update_job(&jobs[0].id, crate::models::JobUpdate { status: Some(Status::Running), ..Default::default() })
            .await
            .unwrap();

        let res = server.run(&pipeline.id).await;
        assert_eq!(res.status().as_u16(), StatusCode::ACCEPTED.as_u16());

        let detail = server.wait_for_terminal(&pipeline.id).await;
        assert_eq!(detail.pipeline.status, Status::Success);
        assert!(detail.jobs.iter().all(|j| j.status == Status::Success));
    }

    #[tokio::test]
    async fn push_with_stopped_dispatcher_fails_the_pipeline() {
        let server = TestServer::with_dispatch(None, 0.5, Dispatch::Stopped).await;

        let res = server.push("refs/heads/main").await;
        assert_eq!(res.status().as_u16(), StatusCode::SERVICE_UNAVAILABLE.as_u16());

        let pipelines = server.store.list_pipelines(&PipelineFilter::default()).await.unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].status, Status::Failed);
        assert!(pipelines[0].finished_at.is_some());
    }
}
