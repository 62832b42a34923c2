use crate::error::{RunError, StoreError};
use crate::models::{Job, JobUpdate, PipelineUpdate, Status};
use crate::sources::{Clock, RandomSource};
use crate::store::PipelineStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ERROR_MESSAGES: [&str; 5] = [
    "Test assertion failed: expected status 200 but received 500",
    "Module not found: cannot resolve '@/lib/supabase'",
    "Connection timed out while waiting for the database",
    "TypeError: cannot read properties of undefined (reading 'id')",
    "Health check failed after deployment: service unavailable",
];

/// Sampling parameters for simulated jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub min_duration_seconds: i64,
    /// Durations fall in `[min, min + span - 1]`.
    pub duration_span_seconds: i64,
    /// A job fails when its outcome draw is at or below this value.
    pub failure_threshold: f64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            min_duration_seconds: 30,
            duration_span_seconds: 90,
            failure_threshold: 0.1,
        }
    }
}

impl RunnerSettings {
    pub fn sample_duration(&self, r: f64) -> i64 {
        self.min_duration_seconds + (r * self.duration_span_seconds as f64).floor() as i64
    }

    pub fn sample_success(&self, r: f64) -> bool {
        r > self.failure_threshold
    }
}

pub fn pick_error_message(r: f64) -> &'static str {
    let index = ((r * ERROR_MESSAGES.len() as f64).floor() as usize).min(ERROR_MESSAGES.len() - 1);
    ERROR_MESSAGES[index]
}

pub fn build_job_logs(
    job_name: &str,
    success: bool,
    duration_seconds: i64,
    error_message: Option<&str>,
) -> String {
    let mut lines = vec![
        format!("🚀 Starting {}...", job_name),
        "⏳ Setting up environment...".to_string(),
        "📦 Installing dependencies...".to_string(),
        format!("🔧 Running {}...", job_name.to_lowercase()),
    ];

    if success {
        lines.push(format!("✅ {} completed successfully in {}s", job_name, duration_seconds));
    } else {
        lines.push(format!("❌ {} failed after {}s", job_name, duration_seconds));
        lines.push(format!("💥 Error: {}", error_message.unwrap_or(ERROR_MESSAGES[0])));
    }

    lines.join("\n")
}

/// Advances one pipeline's jobs strictly in order, stopping at the first failure.
pub struct Runner {
    store: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    settings: RunnerSettings,
}

impl Runner {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            clock,
            random,
            settings,
        }
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Runs the pipeline to a terminal state and returns it.
    ///
    /// Only a `pending` pipeline whose jobs are all `pending` is run. A store error at any step
    /// aborts the run and forces the pipeline to `failed`; jobs that were already written keep
    /// whatever state they reached.
    pub async fn run(&self, pipeline_id: &str) -> Result<Status, RunError> {
        match self.execute(pipeline_id).await {
            Err(RunError::Store(cause)) => {
                error!("Pipeline {} aborted: {}", pipeline_id, cause);
                let forced = PipelineUpdate {
                    status: Some(Status::Failed),
                    finished_at: Some(self.now_millis()),
                    ..Default::default()
                };
                match self.store.update_pipeline(pipeline_id, forced).await {
                    Ok(()) => Err(RunError::Store(cause)),
                    Err(source) => Err(RunError::Forced { cause, source }),
                }
            }
            other => other,
        }
    }

    async fn execute(&self, pipeline_id: &str) -> Result<Status, RunError> {
        let pipeline = self.store.get_pipeline(pipeline_id).await?;
        if pipeline.status != Status::Pending {
            warn!("Pipeline {} is {}, not running it", pipeline_id, pipeline.status);
            return Err(RunError::NotPending(pipeline.status));
        }

        let jobs = self.store.list_jobs(pipeline_id).await?;
        if let Some(job) = jobs.iter().find(|j| j.status != Status::Pending) {
            warn!(
                "Job '{}' of pipeline {} is {}, failing the pipeline",
                job.name, pipeline_id, job.status
            );
            self.store
                .update_pipeline(
                    pipeline_id,
                    PipelineUpdate {
                        status: Some(Status::Failed),
                        finished_at: Some(self.now_millis()),
                        ..Default::default()
                    },
                )
                .await?;
            return Err(RunError::JobNotPending {
                name: job.name.clone(),
                status: job.status,
            });
        }

        self.store
            .update_pipeline(
                pipeline_id,
                PipelineUpdate {
                    status: Some(Status::Running),
                    started_at: Some(self.now_millis()),
                    ..Default::default()
                },
            )
            .await?;
        info!("Pipeline {} running ({} jobs)", pipeline_id, jobs.len());

        for job in &jobs {
            let (success, fields) = self.run_job(job).await?;

            if !success {
                let pipeline_fields = PipelineUpdate {
                    status: Some(Status::Failed),
                    finished_at: fields.finished_at,
                    ..Default::default()
                };
                self.store
                    .finish_job_and_pipeline(&job.id, fields, pipeline_id, pipeline_fields)
                    .await?;
                info!("Pipeline {} failed at job '{}'", pipeline_id, job.name);
                return Ok(Status::Failed);
            }

            self.store.update_job(&job.id, fields).await?;
        }

        self.store
            .update_pipeline(
                pipeline_id,
                PipelineUpdate {
                    status: Some(Status::Success),
                    finished_at: Some(self.now_millis()),
                    ..Default::default()
                },
            )
            .await?;
        info!("Pipeline {} succeeded", pipeline_id);
        Ok(Status::Success)
    }

    /// Marks the job running, waits out its simulated duration and returns the terminal write.
    async fn run_job(&self, job: &Job) -> Result<(bool, JobUpdate), StoreError> {
        let started_at = self.now_millis();
        self.store
            .update_job(
                &job.id,
                JobUpdate {
                    status: Some(Status::Running),
                    started_at: Some(started_at),
                    ..Default::default()
                },
            )
            .await?;

        let duration = self.settings.sample_duration(self.random.next_f64());
        debug!("Job '{}' ({}) running for {}s", job.name, job.id, duration);
        self.clock
            .sleep(Duration::from_secs(duration.max(0) as u64))
            .await;

        let success = self.settings.sample_success(self.random.next_f64());
        let error_message = if success {
            None
        } else {
            Some(pick_error_message(self.random.next_f64()))
        };

        let fields = JobUpdate {
            status: Some(if success { Status::Success } else { Status::Failed }),
            started_at: None,
            finished_at: Some(self.now_millis()),
            duration_seconds: Some(duration),
            logs: Some(build_job_logs(&job.name, success, duration, error_message)),
        };
        Ok((success, fields))
    }
}
