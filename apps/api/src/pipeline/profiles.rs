use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::pipeline::errors::PipelineResult;

/// User profiles as written by the storefront. Only the home location matters here.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// user_id → "City, Country" for the users that have a location set.
    async fn home_locations(&self, user_ids: &[String]) -> PipelineResult<HashMap<String, String>>;
}

pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn home_locations(&self, user_ids: &[String]) -> PipelineResult<HashMap<String, String>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT user_id, user_location
            FROM users
            WHERE user_id = ANY($1) AND user_location IS NOT NULL
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
