use crate::models::Status;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("requested entity not found")]
    NotFound,

    #[error("no fields were given to update")]
    NoFieldsUpdated,

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Outcome of a run that could not complete normally.
#[derive(Error, Debug)]
pub enum RunError {
    /// The pipeline was not `pending` when the run started. Nothing was written.
    #[error("pipeline is {0}, only pending pipelines can run")]
    NotPending(Status),

    /// A job was not `pending` when the run started. The pipeline was marked `failed`.
    #[error("job '{name}' is {status}, expected every job to be pending")]
    JobNotPending { name: String, status: Status },

    /// The run was aborted by a store error; the pipeline was forced to `failed`.
    #[error("run aborted: {0}")]
    Store(StoreError),

    /// The run was aborted and the forced `failed` write did not land either.
    #[error("run aborted ({cause}) and forcing the pipeline to failed also failed: {source}")]
    Forced {
        cause: StoreError,
        #[source]
        source: StoreError,
    },
}

impl From<StoreError> for RunError {
    fn from(e: StoreError) -> Self {
        RunError::Store(e)
    }
}
