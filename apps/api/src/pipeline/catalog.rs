//! Content dispatch catalog: distinct (segment, city, country) pairs that
//! need one generated creative each.
//!
//! Pairs are upserted non-destructively: a later sync refreshes descriptive
//! fields but never resets a filled `image_url` back to empty.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::creative::prompts::build_image_prompt;
use crate::creative::{AspectRatio, Renderer};
use crate::models::location::Location;
use crate::models::segmentation::{pair_key, PairCandidate, SegmentationLocationPair};
use crate::pipeline::errors::{PipelineError, PipelineResult};
use crate::pipeline::lease::LeaseGuard;
use crate::pipeline::profiles::ProfileStore;
use crate::pipeline::results::SegmentationRepository;
use crate::pipeline::segmentation::ERROR_LABEL;

#[async_trait]
pub trait PairStore: Send + Sync {
    /// Create-if-absent, else refresh descriptive fields. Never touches `image_url`.
    async fn upsert_pair(&self, candidate: &PairCandidate) -> PipelineResult<()>;

    /// Pairs whose `image_url` is still empty, oldest first.
    async fn list_pending(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>>;

    async fn list(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>>;

    async fn get(&self, pair_key: &str) -> PipelineResult<Option<SegmentationLocationPair>>;

    /// Returns false when no pair has that key.
    async fn set_image_url(&self, pair_key: &str, url: &str) -> PipelineResult<bool>;
}

pub struct PgPairStore {
    pool: PgPool,
}

impl PgPairStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl PairStore for PgPairStore {
    async fn upsert_pair(&self, candidate: &PairCandidate) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO segmentation_location_pairs
                (pair_key, segment_label, city, country, image_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, '', now(), now())
            ON CONFLICT (pair_key) DO UPDATE
                SET segment_label = EXCLUDED.segment_label,
                    city = EXCLUDED.city,
                    country = EXCLUDED.country,
                    updated_at = now()
            "#,
        )
        .bind(candidate.key())
        .bind(&candidate.segment_label)
        .bind(&candidate.city)
        .bind(&candidate.country)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>> {
        Ok(sqlx::query_as::<_, SegmentationLocationPair>(
            r#"
            SELECT * FROM segmentation_location_pairs
            WHERE image_url = ''
            ORDER BY created_at, pair_key
            LIMIT $1
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>> {
        Ok(sqlx::query_as::<_, SegmentationLocationPair>(
            "SELECT * FROM segmentation_location_pairs ORDER BY pair_key LIMIT $1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get(&self, pair_key: &str) -> PipelineResult<Option<SegmentationLocationPair>> {
        Ok(sqlx::query_as::<_, SegmentationLocationPair>(
            "SELECT * FROM segmentation_location_pairs WHERE pair_key = $1",
        )
        .bind(pair_key)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn set_image_url(&self, pair_key: &str, url: &str) -> PipelineResult<bool> {
        let updated = sqlx::query(
            "UPDATE segmentation_location_pairs SET image_url = $2, updated_at = now() WHERE pair_key = $1",
        )
        .bind(pair_key)
        .bind(url)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

/// Outcome of one rendering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderSummary {
    pub attempted: usize,
    pub rendered: usize,
    pub failed: Vec<String>,
}

pub struct ContentDispatchCatalog {
    segmentations: Arc<dyn SegmentationRepository>,
    profiles: Arc<dyn ProfileStore>,
    pairs: Arc<dyn PairStore>,
}

impl ContentDispatchCatalog {
    pub fn new(
        segmentations: Arc<dyn SegmentationRepository>,
        profiles: Arc<dyn ProfileStore>,
        pairs: Arc<dyn PairStore>,
    ) -> Self {
        Self {
            segmentations,
            profiles,
            pairs,
        }
    }

    /// Derives the distinct pairs from current segmentations joined to
    /// profile locations and upserts each. Users without a profile city, and
    /// degraded segmentations, produce no pair. Returns the pair count.
    pub async fn sync_pairs(&self) -> PipelineResult<usize> {
        let segmentations = self.segmentations.list_all().await?;
        let user_ids: Vec<String> = segmentations.iter().map(|s| s.user_id.clone()).collect();
        let locations = self.profiles.home_locations(&user_ids).await?;

        // Keyed by identity: triples that normalize to the same key are one pair.
        let candidates: BTreeMap<String, PairCandidate> = segmentations
            .iter()
            .filter(|s| s.label != ERROR_LABEL)
            .filter_map(|s| {
                let location = locations.get(&s.user_id).and_then(|l| Location::parse(l))?;
                let city = location.city?;
                let candidate = PairCandidate {
                    segment_label: s.label.clone(),
                    city,
                    country: location.country,
                };
                Some((candidate.key(), candidate))
            })
            .collect();

        for candidate in candidates.values() {
            self.pairs.upsert_pair(candidate).await?;
        }

        info!(
            "Synced {} segmentation/location pairs from {} segmentations",
            candidates.len(),
            segmentations.len()
        );
        Ok(candidates.len())
    }

    pub async fn list_pending_pairs(
        &self,
        limit: usize,
    ) -> PipelineResult<Vec<SegmentationLocationPair>> {
        self.pairs.list_pending(limit).await
    }

    pub async fn mark_rendered(&self, pair_key: &str, url: &str) -> PipelineResult<()> {
        if url.trim().is_empty() {
            return Err(PipelineError::InvalidReference(format!(
                "empty image url for pair {pair_key}"
            )));
        }
        if self.pairs.set_image_url(pair_key, url).await? {
            Ok(())
        } else {
            Err(PipelineError::InvalidReference(format!(
                "unknown pair {pair_key}"
            )))
        }
    }

    pub async fn list_pairs(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>> {
        self.pairs.list(limit).await
    }

    /// Pair serving a given user, if the user is segmented and located.
    pub async fn pair_for_user(
        &self,
        user_id: &str,
    ) -> PipelineResult<Option<SegmentationLocationPair>> {
        let Some(segmentation) = self.segmentations.get(user_id).await? else {
            return Ok(None);
        };
        let locations = self.profiles.home_locations(&[user_id.to_string()]).await?;
        let Some(location) = locations.get(user_id).and_then(|l| Location::parse(l)) else {
            return Ok(None);
        };
        let Some(city) = location.city else {
            return Ok(None);
        };
        self.pairs
            .get(&pair_key(&segmentation.label, &city, &location.country))
            .await
    }

    /// Renders up to `limit` pending pairs. A failed render leaves its pair
    /// pending for the next pass and does not stop the others.
    ///
    /// The round lease is refreshed before every pair; losing it stops the
    /// pass with `ConcurrencyConflict`, leaving the remaining pairs pending.
    pub async fn render_pending(
        &self,
        renderer: &dyn Renderer,
        limit: usize,
        lease: &LeaseGuard<'_>,
    ) -> PipelineResult<RenderSummary> {
        let pending = self.list_pending_pairs(limit).await?;
        let mut summary = RenderSummary::default();

        for pair in pending {
            lease.refresh().await?;
            summary.attempted += 1;
            let prompt = build_image_prompt(&pair);
            let target_path = format!("segmentations/{}.png", pair.pair_key);

            let url = match renderer
                .render_and_store(&prompt, AspectRatio::Wide, &target_path)
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    let e = PipelineError::Render {
                        pair_key: pair.pair_key.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{e}");
                    summary.failed.push(pair.pair_key);
                    continue;
                }
            };

            self.mark_rendered(&pair.pair_key, &url).await?;
            summary.rendered += 1;
            info!("Rendered creative for {} at {url}", pair.pair_key);
        }

        Ok(summary)
    }
}
