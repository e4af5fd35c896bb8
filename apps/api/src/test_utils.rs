//! In-memory stand-ins for the storage seams, used by unit tests.
//!
//! They implement the same traits as the Postgres/Redis/S3 backends so the
//! orchestrator, catalog and router are exercised through their real code paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

use crate::config::HistoryLimits;
use crate::creative::{AspectRatio, RenderError, Renderer};
use crate::models::activity::{ActivityCounts, ActivitySnapshot, SnapshotRef};
use crate::models::history::{RawEvent, RawOrder, UserHistory};
use crate::models::segmentation::{PairCandidate, SegmentationLocationPair, UserSegmentation};
use crate::pipeline::catalog::PairStore;
use crate::pipeline::counters::ActivityCounterStore;
use crate::pipeline::errors::{PipelineError, PipelineResult};
use crate::pipeline::lease::RoundLease;
use crate::pipeline::profiles::ProfileStore;
use crate::pipeline::queue::PendingQueue;
use crate::pipeline::results::SegmentationRepository;

pub fn at_minute(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute)
}

pub fn make_event(user_id: &str, session: &str, name: &str, minute: i64) -> RawEvent {
    RawEvent {
        user_id: user_id.to_string(),
        session_id: Some(session.to_string()),
        event_name: name.to_string(),
        event_time: at_minute(minute),
        path_name: Some("/".to_string()),
        payload: None,
        event_location: None,
    }
}

pub fn make_order(user_id: &str, session: &str, amount: f64, minute: i64) -> RawOrder {
    RawOrder {
        order_id: format!("ord_{user_id}_{minute}"),
        user_id: user_id.to_string(),
        session_id: Some(session.to_string()),
        products_payload: None,
        paid_amount: amount,
        order_date: at_minute(minute),
        session_location: None,
    }
}

#[derive(Default)]
struct MemoryState {
    events: Vec<RawEvent>,
    orders: Vec<RawOrder>,
    profiles: HashMap<String, String>,
    staging: HashMap<SnapshotRef, ActivitySnapshot>,
    persisted: HashSet<SnapshotRef>,
    history: Vec<ActivitySnapshot>,
    pending: BTreeMap<String, u64>,
    next_seq: u64,
    segmentations: BTreeMap<String, UserSegmentation>,
    unavailable: bool,
    rejected_commits: HashSet<String>,
    operations: Vec<&'static str>,
}

/// Warehouse + document store in one process-local struct.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    limits: HistoryLimits,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&self, event: RawEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn add_order(&self, order: RawOrder) {
        self.state.lock().unwrap().orders.push(order);
    }

    pub fn set_profile(&self, user_id: &str, location: &str) {
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(user_id.to_string(), location.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// Commits for this user fail until cleared, simulating a crash mid-page.
    pub fn reject_commits_for(&self, user_id: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_commits
            .insert(user_id.to_string());
    }

    pub fn clear_rejections(&self) {
        self.state.lock().unwrap().rejected_commits.clear();
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<(&String, &u64)> = state.pending.iter().collect();
        entries.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn segmentation(&self, user_id: &str) -> Option<UserSegmentation> {
        self.state.lock().unwrap().segmentations.get(user_id).cloned()
    }

    pub fn insert_segmentation(&self, user_id: &str, label: &str) {
        self.state.lock().unwrap().segmentations.insert(
            user_id.to_string(),
            UserSegmentation {
                user_id: user_id.to_string(),
                label: label.to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn baseline_count(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    pub fn operations(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().operations.clone()
    }

    fn check_available(state: &MemoryState) -> PipelineResult<()> {
        if state.unavailable {
            Err(PipelineError::DataSourceUnavailable(
                "memory store offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ActivityCounterStore for MemoryStore {
    async fn compute_snapshot(&self) -> PipelineResult<SnapshotRef> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.operations.push("compute_snapshot");

        let mut users: BTreeMap<String, ActivityCounts> = BTreeMap::new();
        for e in &state.events {
            users.entry(e.user_id.clone()).or_default().event_count += 1;
        }
        for o in &state.orders {
            users.entry(o.user_id.clone()).or_default().order_count += 1;
        }
        let snapshot = SnapshotRef::new();
        state.staging.insert(
            snapshot,
            ActivitySnapshot {
                captured_at: None,
                users,
            },
        );
        Ok(snapshot)
    }

    async fn load_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<ActivitySnapshot> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state
            .staging
            .get(snapshot)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidReference(snapshot.to_string()))
    }

    async fn latest_baseline(&self) -> PipelineResult<Option<ActivitySnapshot>> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.operations.push("latest_baseline");
        Ok(state.history.last().cloned())
    }

    async fn persist_snapshot(&self, snapshot: &SnapshotRef) -> PipelineResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.operations.push("persist_snapshot");
        let mut staged = state
            .staging
            .get(snapshot)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidReference(snapshot.to_string()))?;
        let count = staged.len() as u64;
        if state.persisted.insert(*snapshot) {
            staged.captured_at = Some(Utc::now());
            state.history.push(staged);
        }
        Ok(count)
    }
}

#[async_trait]
impl PendingQueue for MemoryStore {
    async fn enqueue_batch(&self, user_ids: &BTreeSet<String>) -> PipelineResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.operations.push("enqueue_batch");
        for id in user_ids {
            if !state.pending.contains_key(id) {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.pending.insert(id.clone(), seq);
            }
        }
        Ok(user_ids.len() as u64)
    }

    async fn count_pending(&self) -> PipelineResult<u64> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.pending.len() as u64)
    }

    async fn dequeue_page(&self, page_size: usize) -> PipelineResult<Vec<UserHistory>> {
        let ids: Vec<String> = self.pending_ids().into_iter().take(page_size).collect();
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;

        Ok(ids
            .into_iter()
            .map(|user_id| {
                let mut events: Vec<RawEvent> = state
                    .events
                    .iter()
                    .filter(|e| e.user_id == user_id)
                    .cloned()
                    .collect();
                events.sort_by(|a, b| b.event_time.cmp(&a.event_time));
                events.truncate(self.limits.events as usize);

                let mut orders: Vec<RawOrder> = state
                    .orders
                    .iter()
                    .filter(|o| o.user_id == user_id)
                    .cloned()
                    .collect();
                orders.sort_by(|a, b| b.order_date.cmp(&a.order_date));
                orders.truncate(self.limits.orders as usize);

                UserHistory {
                    home_location: state.profiles.get(&user_id).cloned(),
                    user_id,
                    events,
                    orders,
                }
            })
            .collect())
    }

    async fn complete(&self, user_id: &str) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        state.pending.remove(user_id);
        Ok(())
    }

    async fn complete_with_result(&self, segmentation: &UserSegmentation) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if state.rejected_commits.contains(&segmentation.user_id) {
            return Err(PipelineError::DataSourceUnavailable(format!(
                "commit rejected for {}",
                segmentation.user_id
            )));
        }
        state
            .segmentations
            .insert(segmentation.user_id.clone(), segmentation.clone());
        state.pending.remove(&segmentation.user_id);
        Ok(())
    }
}

#[async_trait]
impl SegmentationRepository for MemoryStore {
    async fn list_all(&self) -> PipelineResult<Vec<UserSegmentation>> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.segmentations.values().cloned().collect())
    }

    async fn get(&self, user_id: &str) -> PipelineResult<Option<UserSegmentation>> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.segmentations.get(user_id).cloned())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn home_locations(&self, user_ids: &[String]) -> PipelineResult<HashMap<String, String>> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(user_ids
            .iter()
            .filter_map(|id| state.profiles.get(id).map(|l| (id.clone(), l.clone())))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryPairStore {
    pairs: Mutex<BTreeMap<String, SegmentationLocationPair>>,
}

impl MemoryPairStore {
    pub fn snapshot(&self) -> Vec<SegmentationLocationPair> {
        self.pairs.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl PairStore for MemoryPairStore {
    async fn upsert_pair(&self, candidate: &PairCandidate) -> PipelineResult<()> {
        let mut pairs = self.pairs.lock().unwrap();
        let now = Utc::now();
        pairs
            .entry(candidate.key())
            .and_modify(|p| {
                p.segment_label = candidate.segment_label.clone();
                p.city = candidate.city.clone();
                p.country = candidate.country.clone();
                p.updated_at = now;
            })
            .or_insert_with(|| SegmentationLocationPair {
                pair_key: candidate.key(),
                segment_label: candidate.segment_label.clone(),
                city: candidate.city.clone(),
                country: candidate.country.clone(),
                image_url: String::new(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>> {
        let mut pending: Vec<_> = self
            .pairs
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.image_url.is_empty())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.pair_key.cmp(&b.pair_key))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list(&self, limit: usize) -> PipelineResult<Vec<SegmentationLocationPair>> {
        Ok(self.snapshot().into_iter().take(limit).collect())
    }

    async fn get(&self, pair_key: &str) -> PipelineResult<Option<SegmentationLocationPair>> {
        Ok(self.pairs.lock().unwrap().get(pair_key).cloned())
    }

    async fn set_image_url(&self, pair_key: &str, url: &str) -> PipelineResult<bool> {
        let mut pairs = self.pairs.lock().unwrap();
        match pairs.get_mut(pair_key) {
            Some(p) => {
                p.image_url = url.to_string();
                p.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Reentrant single-holder lease that honours its TTL on the tokio clock,
/// so paused-time tests can let it expire mid-round.
#[derive(Default)]
pub struct MemoryLease {
    holder: Mutex<Option<(String, Option<Instant>)>>,
    acquisitions: AtomicUsize,
}

impl MemoryLease {
    /// Held by another run with no expiry.
    pub fn held_by(run_id: &str) -> Self {
        Self {
            holder: Mutex::new(Some((run_id.to_string(), None))),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// Current unexpired holder.
    pub fn holder(&self) -> Option<String> {
        let holder = self.holder.lock().unwrap();
        match holder.as_ref() {
            Some((run_id, expires)) if !expired(*expires) => Some(run_id.clone()),
            _ => None,
        }
    }

    /// Successful acquire/refresh calls so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

fn expired(expires: Option<Instant>) -> bool {
    expires.is_some_and(|at| Instant::now() >= at)
}

#[async_trait]
impl RoundLease for MemoryLease {
    async fn acquire(&self, run_id: &str, ttl: Duration) -> PipelineResult<bool> {
        let mut holder = self.holder.lock().unwrap();
        let free = match holder.as_ref() {
            None => true,
            Some((current, expires)) => current == run_id || expired(*expires),
        };
        if free {
            *holder = Some((run_id.to_string(), Some(Instant::now() + ttl)));
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(free)
    }

    async fn release(&self, run_id: &str) -> PipelineResult<()> {
        let mut holder = self.holder.lock().unwrap();
        if holder.as_ref().is_some_and(|(current, _)| current == run_id) {
            *holder = None;
        }
        Ok(())
    }
}

/// Renderer that "stores" to a fake CDN; fails for targets containing a marker.
#[derive(Default)]
pub struct FakeRenderer {
    fail_marker: Option<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl FakeRenderer {
    pub fn failing_for(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Self::default()
        }
    }

    /// Each render takes `delay` on the tokio clock.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render_and_store(
        &self,
        _prompt: &str,
        _aspect_ratio: AspectRatio,
        target_path: &str,
    ) -> Result<String, RenderError> {
        self.calls.lock().unwrap().push(target_path.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(marker) = &self.fail_marker {
            if target_path.contains(marker.as_str()) {
                return Err(RenderError::Storage("bucket unreachable".to_string()));
            }
        }
        Ok(format!("https://cdn.test/{target_path}"))
    }
}
