//! Batch orchestrator: one resumable round of the segmentation pipeline.
//!
//! Phases: `idle → counting → comparing → draining → done` for a full cycle,
//! `idle → draining → done` for a continuation round. Nothing is held in
//! memory between rounds: the queue, the snapshot history and the results
//! stores carry all state, and the returned status tells the caller whether
//! to invoke again.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::models::segmentation::UserSegmentation;
use crate::pipeline::comparator::diff;
use crate::pipeline::counters::ActivityCounterStore;
use crate::pipeline::errors::{PipelineError, PipelineResult};
use crate::pipeline::queue::PendingQueue;
use crate::pipeline::segmentation::{Segmenter, ERROR_LABEL};

/// Status token handed back to the external caller. The caller's retry loop
/// keys entirely on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Continue,
    SegmentationFinished,
    FlowFinished,
    Failed,
    NoPendingUsers,
}

impl RoundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Continue => "continue",
            RoundStatus::SegmentationFinished => "segmentation_finished",
            RoundStatus::FlowFinished => "flow_finished",
            RoundStatus::Failed => "failed",
            RoundStatus::NoPendingUsers => "no_pending_users",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Counting,
    Comparing,
    Draining,
    Done,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Counting)
                | (Phase::Idle, Phase::Draining)
                | (Phase::Counting, Phase::Comparing)
                | (Phase::Comparing, Phase::Draining)
                | (Phase::Draining, Phase::Done)
        )
    }
}

fn advance(phase: &mut Phase, next: Phase) {
    debug_assert!(
        phase.can_advance_to(next),
        "illegal phase transition {phase:?} -> {next:?}"
    );
    debug!("Orchestrator phase {:?} -> {:?}", phase, next);
    *phase = next;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub status: RoundStatus,
    /// Present on full cycles only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty_users: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_users: Option<u64>,
    pub pending_total: u64,
    pub processed: usize,
    pub remaining: u64,
    /// Users recorded with the degraded label this round.
    pub degraded: Vec<String>,
    /// Users whose result could not be committed; they stay pending.
    pub uncommitted: Vec<String>,
}

impl RoundReport {
    fn empty(status: RoundStatus) -> Self {
        Self {
            status,
            dirty_users: None,
            baseline_users: None,
            pending_total: 0,
            processed: 0,
            remaining: 0,
            degraded: Vec::new(),
            uncommitted: Vec::new(),
        }
    }
}

pub struct BatchOrchestrator {
    counters: Arc<dyn ActivityCounterStore>,
    queue: Arc<dyn PendingQueue>,
    segmenter: Arc<dyn Segmenter>,
    page_size: usize,
}

impl BatchOrchestrator {
    pub fn new(
        counters: Arc<dyn ActivityCounterStore>,
        queue: Arc<dyn PendingQueue>,
        segmenter: Arc<dyn Segmenter>,
        page_size: usize,
    ) -> Self {
        Self {
            counters,
            queue,
            segmenter,
            page_size: page_size.max(1),
        }
    }

    /// Full cycle: count, compare against the old baseline, enqueue the dirty
    /// set, persist the new baseline, then drain one page.
    ///
    /// The baseline is written only after the dirty set is safely enqueued;
    /// any earlier failure aborts the round with the old baseline intact.
    pub async fn run_cycle(&self) -> PipelineResult<RoundReport> {
        let mut phase = Phase::Idle;

        advance(&mut phase, Phase::Counting);
        let current_ref = self.counters.compute_snapshot().await?;
        let current = self.counters.load_snapshot(&current_ref).await?;
        if current.is_empty() {
            warn!("Snapshot {current_ref} has no active users");
        }

        advance(&mut phase, Phase::Comparing);
        let baseline = self.counters.latest_baseline().await?;
        let dirty = diff(&current, baseline.as_ref());
        info!(
            "Compared {} users against baseline ({} users): {} dirty",
            current.len(),
            baseline.as_ref().map(|b| b.len()).unwrap_or(0),
            dirty.len()
        );
        self.queue.enqueue_batch(&dirty).await?;
        let baseline_users = self.counters.persist_snapshot(&current_ref).await?;

        advance(&mut phase, Phase::Draining);
        let mut report = self.drain(&mut phase).await?;

        if dirty.is_empty() && report.pending_total == 0 {
            report.status = RoundStatus::NoPendingUsers;
        }
        report.dirty_users = Some(dirty.len());
        report.baseline_users = Some(baseline_users);
        Ok(report)
    }

    /// Continuation round: drain one page of whatever is pending.
    pub async fn drain_round(&self) -> PipelineResult<RoundReport> {
        let mut phase = Phase::Idle;
        advance(&mut phase, Phase::Draining);
        self.drain(&mut phase).await
    }

    async fn drain(&self, phase: &mut Phase) -> PipelineResult<RoundReport> {
        let pending_total = self.queue.count_pending().await?;
        if pending_total == 0 {
            advance(phase, Phase::Done);
            info!("Pending queue empty, segmentation finished");
            return Ok(RoundReport::empty(RoundStatus::SegmentationFinished));
        }

        let page = self.queue.dequeue_page(self.page_size).await?;
        debug!(
            "Draining page of {} users: {:?}",
            page.len(),
            page.iter().map(|h| h.user_id.as_str()).collect::<Vec<_>>()
        );

        let mut report = RoundReport::empty(RoundStatus::Continue);
        report.pending_total = pending_total;

        for history in &page {
            let label = match self.segmenter.segment(history) {
                Ok(label) => label,
                Err(e) => {
                    let e = PipelineError::PerUserSegmentation {
                        user_id: history.user_id.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{e}; recording degraded label");
                    report.degraded.push(history.user_id.clone());
                    ERROR_LABEL.to_string()
                }
            };

            let segmentation = UserSegmentation {
                user_id: history.user_id.clone(),
                label,
                updated_at: Utc::now(),
            };

            match self.queue.complete_with_result(&segmentation).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    error!(
                        "Could not commit segmentation for {}: {e}; user stays pending",
                        history.user_id
                    );
                    report.uncommitted.push(history.user_id.clone());
                }
            }
        }

        report.remaining = pending_total.saturating_sub(report.processed as u64);
        report.status = if !page.is_empty() && report.processed == 0 {
            // No progress: looping on `continue` would never terminate.
            RoundStatus::Failed
        } else if report.remaining > 0 {
            RoundStatus::Continue
        } else {
            RoundStatus::SegmentationFinished
        };

        advance(phase, Phase::Done);
        info!(
            "Round processed {} of {} pending ({} degraded, {} uncommitted), remaining {} -> {}",
            report.processed,
            pending_total,
            report.degraded.len(),
            report.uncommitted.len(),
            report.remaining,
            report.status.as_str()
        );
        Ok(report)
    }
}
