use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Current segmentation for one user. Overwritten on every recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserSegmentation {
    pub user_id: String,
    pub label: String,
    pub updated_at: DateTime<Utc>,
}

/// A (segment, city, country) combination that needs one creative asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SegmentationLocationPair {
    pub pair_key: String,
    pub segment_label: String,
    pub city: String,
    pub country: String,
    /// Empty until rendering succeeds. Never reset once filled.
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SegmentationLocationPair {
    pub fn is_rendered(&self) -> bool {
        !self.image_url.is_empty()
    }
}

/// Fields derived from segmentations + profiles, before they hit the pair store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairCandidate {
    pub segment_label: String,
    pub city: String,
    pub country: String,
}

impl PairCandidate {
    pub fn key(&self) -> String {
        pair_key(&self.segment_label, &self.city, &self.country)
    }
}

/// Identity key used both for storage and by the storefront's ad lookup.
pub fn pair_key(segment_label: &str, city: &str, country: &str) -> String {
    format!(
        "{}_{}_{}",
        normalize_key_part(segment_label),
        normalize_key_part(city),
        normalize_key_part(country)
    )
}

/// Trim, slashes to `_`, drop commas, whitespace runs to a single `_`.
pub fn normalize_key_part(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ',')
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("_")
}
