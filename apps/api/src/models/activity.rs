use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Aggregate activity counters for one user at capture time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub event_count: u64,
    pub order_count: u64,
}

impl ActivityCounts {
    pub fn new(event_count: u64, order_count: u64) -> Self {
        Self {
            event_count,
            order_count,
        }
    }
}

/// Per-user counters captured at one instant.
/// Immutable once persisted: a new capture is a new snapshot, never an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    pub users: BTreeMap<String, ActivityCounts>,
}

impl ActivitySnapshot {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, user_id: &str) -> Option<&ActivityCounts> {
        self.users.get(user_id)
    }
}

impl FromIterator<ActivityCountRow> for ActivitySnapshot {
    fn from_iter<I: IntoIterator<Item = ActivityCountRow>>(rows: I) -> Self {
        let users = rows
            .into_iter()
            .map(|row| {
                let counts = ActivityCounts::new(
                    u64::try_from(row.event_count).unwrap_or(0),
                    u64::try_from(row.order_count).unwrap_or(0),
                );
                (row.user_id, counts)
            })
            .collect();
        Self {
            captured_at: None,
            users,
        }
    }
}

/// Opaque handle to a computed-but-not-yet-persisted snapshot.
/// Steps pass this around instead of the full row set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef(Uuid);

impl SnapshotRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for SnapshotRef {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "snapshot:{}", self.0)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ActivityCountRow {
    pub user_id: String,
    pub event_count: i64,
    pub order_count: i64,
}
