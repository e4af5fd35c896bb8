use thiserror::Error;

/// Failures surfaced by the batch pipeline.
///
/// Infrastructure failures (`DataSourceUnavailable`) abort the round and are
/// retried wholesale by the caller. Per-item failures (`PerUserSegmentation`,
/// `Render`) are caught where they happen and never abort a page.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data source unavailable: {0}")]
    DataSourceUnavailable(String),

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("segmentation failed for user {user_id}: {reason}")]
    PerUserSegmentation { user_id: String, reason: String },

    #[error("render failed for pair {pair_key}: {reason}")]
    Render { pair_key: String, reason: String },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
}

impl PipelineError {
    /// Stable machine-readable code, used in round detail payloads.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DataSourceUnavailable(_) => "data_source_unavailable",
            PipelineError::InvalidReference(_) => "invalid_reference",
            PipelineError::PerUserSegmentation { .. } => "per_user_segmentation_error",
            PipelineError::Render { .. } => "render_failure",
            PipelineError::ConcurrencyConflict(_) => "round_in_progress",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::DataSourceUnavailable(format!("database: {e}"))
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(e: redis::RedisError) -> Self {
        PipelineError::DataSourceUnavailable(format!("redis: {e}"))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
