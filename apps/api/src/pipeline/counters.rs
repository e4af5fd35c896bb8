//! Activity counters: per-user event/order totals over the warehouse facts,
//! and the append-only snapshot history used as the comparison baseline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::activity::{ActivityCountRow, ActivitySnapshot, SnapshotRef};
use crate::pipeline::errors::{PipelineError, PipelineResult};

#[async_trait]
pub trait ActivityCounterStore: Send + Sync {
    /// Aggregates events and orders per user (full outer join: a user with
    /// only orders still appears with `event_count = 0`). The result stays in
    /// the store; only a reference comes back.
    async fn compute_snapshot(&self) -> PipelineResult<SnapshotRef>;

    /// Materializes a computed snapshot for comparison.
    async fn load_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<ActivitySnapshot>;

    /// Most recent persisted snapshot, or `None` on the first run.
    async fn latest_baseline(&self) -> PipelineResult<Option<ActivitySnapshot>>;

    /// Appends the referenced snapshot to the history and returns the number
    /// of users recorded. Persisting the same reference twice is a no-op.
    async fn persist_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<u64>;
}

pub struct PgActivityCounterStore {
    pool: PgPool,
}

impl PgActivityCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_ref_exists(&self, snapshot: &SnapshotRef) -> PipelineResult<()> {
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT snapshot_id FROM activity_snapshot_refs WHERE snapshot_id = $1")
                .bind(snapshot.id())
                .fetch_optional(&self.pool)
                .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| PipelineError::InvalidReference(snapshot.to_string()))
    }
}

#[async_trait]
impl ActivityCounterStore for PgActivityCounterStore {
    async fn compute_snapshot(&self) -> PipelineResult<SnapshotRef> {
        let snapshot = SnapshotRef::new();
        let mut tx = self.pool.begin().await?;

        // Unpersisted computations older than a day are never going to be used.
        sqlx::query(
            "DELETE FROM activity_snapshot_refs WHERE computed_at < now() - interval '1 day'",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO activity_snapshot_refs (snapshot_id, computed_at) VALUES ($1, now())")
            .bind(snapshot.id())
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            INSERT INTO activity_snapshot_staging (snapshot_id, user_id, event_count, order_count)
            SELECT $1,
                   COALESCE(e.user_id, o.user_id),
                   COALESCE(e.cnt, 0),
                   COALESCE(o.cnt, 0)
            FROM (SELECT user_id, COUNT(*) AS cnt FROM user_events GROUP BY user_id) e
            FULL OUTER JOIN
                 (SELECT user_id, COUNT(*) AS cnt FROM user_orders GROUP BY user_id) o
              ON e.user_id = o.user_id
            "#,
        )
        .bind(snapshot.id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!("Computed activity snapshot {snapshot} covering {rows} users");
        Ok(snapshot)
    }

    async fn load_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<ActivitySnapshot> {
        self.ensure_ref_exists(snapshot).await?;

        let rows = sqlx::query_as::<_, ActivityCountRow>(
            r#"
            SELECT user_id, event_count, order_count
            FROM activity_snapshot_staging
            WHERE snapshot_id = $1
            "#,
        )
        .bind(snapshot.id())
        .fetch_all(&self.pool)
        .await?;

        debug!("Loaded {} rows for {snapshot}", rows.len());
        Ok(rows.into_iter().collect())
    }

    async fn latest_baseline(&self) -> PipelineResult<Option<ActivitySnapshot>> {
        let latest: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT snapshot_id, captured_at FROM activity_snapshots ORDER BY captured_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((snapshot_id, captured_at)) = latest else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, ActivityCountRow>(
            r#"
            SELECT user_id, event_count, order_count
            FROM activity_snapshot_rows
            WHERE snapshot_id = $1
            "#,
        )
        .bind(snapshot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut baseline: ActivitySnapshot = rows.into_iter().collect();
        baseline.captured_at = Some(captured_at);
        Ok(Some(baseline))
    }

    async fn persist_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<u64> {
        self.ensure_ref_exists(snapshot).await?;
        let mut tx = self.pool.begin().await?;

        let already: Option<i64> =
            sqlx::query_scalar("SELECT user_count FROM activity_snapshots WHERE snapshot_id = $1")
                .bind(snapshot.id())
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(count) = already {
            tx.rollback().await?;
            return Ok(u64::try_from(count).unwrap_or(0));
        }

        let staged: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM activity_snapshot_staging WHERE snapshot_id = $1")
                .bind(snapshot.id())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO activity_snapshots (snapshot_id, captured_at, user_count) VALUES ($1, now(), $2)",
        )
        .bind(snapshot.id())
        .bind(staged)
        .execute(&mut *tx)
        .await?;

        let count = sqlx::query(
            r#"
            INSERT INTO activity_snapshot_rows (snapshot_id, user_id, event_count, order_count)
            SELECT snapshot_id, user_id, event_count, order_count
            FROM activity_snapshot_staging
            WHERE snapshot_id = $1
            "#,
        )
        .bind(snapshot.id())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!("Persisted baseline {snapshot} with {count} users");
        Ok(count)
    }
}
