//! Read side of user segmentations (writes go through the pending queue's
//! atomic completion).

use async_trait::async_trait;
use sqlx::PgPool;

use crate::models::segmentation::UserSegmentation;
use crate::pipeline::errors::PipelineResult;

#[async_trait]
pub trait SegmentationRepository: Send + Sync {
    async fn list_all(&self) -> PipelineResult<Vec<UserSegmentation>>;
    async fn get(&self, user_id: &str) -> PipelineResult<Option<UserSegmentation>>;
}

pub struct PgSegmentationRepository {
    pool: PgPool,
}

impl PgSegmentationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SegmentationRepository for PgSegmentationRepository {
    async fn list_all(&self) -> PipelineResult<Vec<UserSegmentation>> {
        Ok(sqlx::query_as::<_, UserSegmentation>(
            "SELECT user_id, label, updated_at FROM user_segmentations ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get(&self, user_id: &str) -> PipelineResult<Option<UserSegmentation>> {
        Ok(sqlx::query_as::<_, UserSegmentation>(
            "SELECT user_id, label, updated_at FROM user_segmentations WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
