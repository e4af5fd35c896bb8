//! Pending queue: durable set of users awaiting segmentation.
//!
//! Selection is stable (insertion time, then user_id) and side-effect free:
//! `dequeue_page` never claims entries. Rounds are serialized by the round
//! lease instead, and completion is signalled per user.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::config::HistoryLimits;
use crate::models::history::{RawEvent, RawOrder, UserHistory};
use crate::models::segmentation::UserSegmentation;
use crate::pipeline::errors::PipelineResult;

#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// Upserts one entry per id. Re-enqueuing a pending user keeps its
    /// original position. Returns the number of ids written.
    async fn enqueue_batch(&self, user_ids: &BTreeSet<String>) -> PipelineResult<u64>;

    async fn count_pending(&self) -> PipelineResult<u64>;

    /// Up to `page_size` pending users with their recent event/order history.
    async fn dequeue_page(&self, page_size: usize) -> PipelineResult<Vec<UserHistory>>;

    /// Removes the entry without touching segmentation results.
    async fn complete(&self, user_id: &str) -> PipelineResult<()>;

    /// Writes the segmentation and removes the entry in one transaction.
    async fn complete_with_result(&self, segmentation: &UserSegmentation) -> PipelineResult<()>;
}

pub struct PgPendingQueue {
    pool: PgPool,
    limits: HistoryLimits,
}

impl PgPendingQueue {
    pub fn new(pool: PgPool, limits: HistoryLimits) -> Self {
        Self { pool, limits }
    }

    async fn load_history(&self, user_id: String) -> PipelineResult<UserHistory> {
        let events = sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT user_id, session_id, event_name, event_time, path_name, payload, event_location
            FROM user_events
            WHERE user_id = $1
            ORDER BY event_time DESC
            LIMIT $2
            "#,
        )
        .bind(&user_id)
        .bind(self.limits.events)
        .fetch_all(&self.pool)
        .await?;

        let orders = sqlx::query_as::<_, RawOrder>(
            r#"
            SELECT order_id, user_id, session_id, products_payload, paid_amount, order_date, session_location
            FROM user_orders
            WHERE user_id = $1
            ORDER BY order_date DESC
            LIMIT $2
            "#,
        )
        .bind(&user_id)
        .bind(self.limits.orders)
        .fetch_all(&self.pool)
        .await?;

        let home_location: Option<String> =
            sqlx::query_scalar("SELECT user_location FROM users WHERE user_id = $1")
                .bind(&user_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        Ok(UserHistory {
            user_id,
            home_location,
            events,
            orders,
        })
    }
}

#[async_trait]
impl PendingQueue for PgPendingQueue {
    async fn enqueue_batch(&self, user_ids: &BTreeSet<String>) -> PipelineResult<u64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = user_ids.iter().cloned().collect();

        sqlx::query(
            r#"
            INSERT INTO pending_segmentations (user_id, created_at)
            SELECT id, now() FROM UNNEST($1::text[]) AS t(id)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        info!("Enqueued {} users for segmentation", ids.len());
        Ok(ids.len() as u64)
    }

    async fn count_pending(&self) -> PipelineResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_segmentations")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn dequeue_page(&self, page_size: usize) -> PipelineResult<Vec<UserHistory>> {
        let user_ids: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM pending_segmentations ORDER BY created_at, user_id LIMIT $1",
        )
        .bind(i64::try_from(page_size).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        debug!("Selected page of {} pending users", user_ids.len());

        let mut page = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            page.push(self.load_history(user_id).await?);
        }
        Ok(page)
    }

    async fn complete(&self, user_id: &str) -> PipelineResult<()> {
        sqlx::query("DELETE FROM pending_segmentations WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_with_result(&self, segmentation: &UserSegmentation) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO user_segmentations (user_id, label, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
                SET label = EXCLUDED.label,
                    updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&segmentation.user_id)
        .bind(&segmentation.label)
        .bind(segmentation.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM pending_segmentations WHERE user_id = $1")
            .bind(&segmentation.user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
