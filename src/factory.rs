use crate::models::{Environment, Job, JobSpec, MergeRequest, Pipeline, Status};
use crate::sources::RandomSource;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const BASE_JOBS: [&str; 4] = [
    "Lint & Type Check",
    "Unit Tests",
    "Build Applications",
    "Integration Tests",
];

/// Exact, case-sensitive match; anything unrecognised is a development branch.
pub fn classify_environment(branch: &str) -> Environment {
    match branch {
        "main" | "master" => Environment::Production,
        "develop" | "staging" => Environment::Staging,
        _ => Environment::Development,
    }
}

pub fn build_jobs(environment: Environment) -> Vec<JobSpec> {
    let mut jobs: Vec<JobSpec> = BASE_JOBS
        .iter()
        .zip(1..)
        .map(|(&name, order)| JobSpec {
            name,
            order,
            status: Status::Pending,
        })
        .collect();

    let deploy = match environment {
        Environment::Production => Some("Deploy to Production"),
        Environment::Staging => Some("Deploy to Staging"),
        Environment::Development => None,
    };
    if let Some(name) = deploy {
        jobs.push(JobSpec {
            name,
            order: jobs.len() as i64 + 1,
            status: Status::Pending,
        });
    }

    jobs
}

/// Builds a pending pipeline and its job list. Nothing is persisted here.
pub fn create_pipeline(
    branch: &str,
    commit_sha: &str,
    author: &str,
    message: &str,
    now: DateTime<Utc>,
) -> (Pipeline, Vec<Job>) {
    let environment = classify_environment(branch);
    let pipeline = Pipeline {
        id: Uuid::now_v7().to_string(),
        branch: branch.to_string(),
        commit_sha: commit_sha.to_string(),
        author: author.to_string(),
        message: message.to_string(),
        environment,
        status: Status::Pending,
        started_at: now.timestamp_millis(),
        finished_at: None,
    };

    let jobs = build_jobs(environment)
        .into_iter()
        .map(|spec| Job {
            id: Uuid::now_v7().to_string(),
            pipeline_id: pipeline.id.clone(),
            name: spec.name.to_string(),
            order: spec.order,
            status: spec.status,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            logs: None,
        })
        .collect();

    (pipeline, jobs)
}

/// Target branch for branches that get a merge request, `None` for everything else.
pub fn merge_target(branch: &str) -> Option<&'static str> {
    if branch.starts_with("hotfix/") {
        Some("main")
    } else if branch.starts_with("feature/") {
        Some("develop")
    } else {
        None
    }
}

/// One-shot merge request for `feature/` and `hotfix/` pushes. Diff stats are demo values.
pub fn synthesize_merge_request(
    pipeline: &Pipeline,
    random: &dyn RandomSource,
    now: DateTime<Utc>,
) -> Option<MergeRequest> {
    let target = merge_target(&pipeline.branch)?;
    let required_approvals = if target == "main" { 2 } else { 1 };

    let has_conflicts = random.next_f64() > 0.8;
    let additions = 10 + (random.next_f64() * 490.0).floor() as i64;
    let deletions = (random.next_f64() * 200.0).floor() as i64;
    let files_changed = 1 + (random.next_f64() * 20.0).floor() as i64;

    Some(MergeRequest {
        id: Uuid::now_v7().to_string(),
        pipeline_id: pipeline.id.clone(),
        title: format!("Merge {} into {}", pipeline.branch, target),
        description: pipeline.message.clone(),
        author: pipeline.author.clone(),
        source_branch: pipeline.branch.clone(),
        target_branch: target.to_string(),
        status: "open".to_string(),
        approvals: 0,
        required_approvals,
        has_conflicts,
        additions,
        deletions,
        files_changed,
        created_at: now.timestamp_millis(),
    })
}
