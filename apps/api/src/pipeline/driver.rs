//! Directive dispatch and the in-process status chain.
//!
//! Every directive that touches the queue or the catalog runs under the round
//! lease. A `flow` resolves `segment → continue* → creative` the way the
//! scheduled caller would over HTTP, holding the lease for the whole chain.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::PipelineSettings;
use crate::creative::Renderer;
use crate::notify::{ProgressEvent, ProgressReporter};
use crate::pipeline::catalog::ContentDispatchCatalog;
use crate::pipeline::errors::{PipelineError, PipelineResult};
use crate::pipeline::lease::{LeaseGuard, RoundLease};
use crate::pipeline::orchestrator::{BatchOrchestrator, RoundStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Directive {
    Segment,
    Continue,
    Creative,
    Flow,
}

impl Directive {
    pub fn as_str(self) -> &'static str {
        match self {
            Directive::Segment => "segment",
            Directive::Continue => "continue",
            Directive::Creative => "creative",
            Directive::Flow => "flow",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RoundStatus,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl RunOutcome {
    fn failed(run_id: &str, error: &PipelineError) -> Self {
        Self {
            status: RoundStatus::Failed,
            run_id: run_id.to_string(),
            detail: Some(json!({
                "error": error.code(),
                "message": error.to_string(),
            })),
        }
    }

    /// Outcome for a request that never reached the driver.
    pub fn invalid_request(run_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: RoundStatus::Failed,
            run_id: run_id.to_string(),
            detail: Some(json!({
                "error": "invalid_request",
                "message": message.into(),
            })),
        }
    }
}

pub struct FlowDriver {
    orchestrator: BatchOrchestrator,
    catalog: Arc<ContentDispatchCatalog>,
    renderer: Arc<dyn Renderer>,
    lease: Arc<dyn RoundLease>,
    reporter: ProgressReporter,
    settings: PipelineSettings,
}

impl FlowDriver {
    pub fn new(
        orchestrator: BatchOrchestrator,
        catalog: Arc<ContentDispatchCatalog>,
        renderer: Arc<dyn Renderer>,
        lease: Arc<dyn RoundLease>,
        reporter: ProgressReporter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            renderer,
            lease,
            reporter,
            settings,
        }
    }

    /// Runs one directive to a status token. Errors never escape: they are
    /// logged and surfaced as `failed` with the error code in `detail`.
    pub async fn execute(&self, directive: Directive, run_id: &str) -> RunOutcome {
        info!("Run {run_id}: directive {}", directive.as_str());
        self.reporter
            .report(ProgressEvent::new(
                run_id,
                "running",
                format!("{} started", directive.as_str()),
                Some(directive.as_str().to_string()),
            ))
            .await;

        let result = match self.acquire(run_id).await {
            Ok(()) => {
                let result = match directive {
                    Directive::Flow => self.run_flow(run_id).await,
                    single => self
                        .run_single(single, run_id)
                        .await
                        .map(|(status, detail)| (status, Some(detail))),
                };
                if let Err(e) = self.lease.release(run_id).await {
                    error!("Run {run_id}: could not release round lease: {e}");
                }
                result
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok((status, detail)) => RunOutcome {
                status,
                run_id: run_id.to_string(),
                detail,
            },
            Err(e) => {
                error!("Run {run_id}: {} failed: {e}", directive.as_str());
                RunOutcome::failed(run_id, &e)
            }
        };

        self.reporter
            .report(ProgressEvent::new(
                run_id,
                outcome.status.as_str(),
                format!("{} -> {}", directive.as_str(), outcome.status.as_str()),
                Some(directive.as_str().to_string()),
            ))
            .await;
        outcome
    }

    fn guard<'a>(&'a self, run_id: &'a str) -> LeaseGuard<'a> {
        LeaseGuard::new(self.lease.as_ref(), run_id, self.settings.lease_ttl)
    }

    async fn acquire(&self, run_id: &str) -> PipelineResult<()> {
        self.guard(run_id).refresh().await
    }

    async fn run_single(
        &self,
        directive: Directive,
        run_id: &str,
    ) -> PipelineResult<(RoundStatus, Value)> {
        match directive {
            Directive::Segment => {
                let report = self.orchestrator.run_cycle().await?;
                Ok((report.status, serde_json::to_value(&report).unwrap_or(Value::Null)))
            }
            Directive::Continue => {
                let report = self.orchestrator.drain_round().await?;
                Ok((report.status, serde_json::to_value(&report).unwrap_or(Value::Null)))
            }
            Directive::Creative => self.creative_round(run_id).await,
            Directive::Flow => Err(PipelineError::InvalidReference(
                "flow is not a single round".to_string(),
            )),
        }
    }

    async fn creative_round(&self, run_id: &str) -> PipelineResult<(RoundStatus, Value)> {
        let pairs = self.catalog.sync_pairs().await?;
        let summary = self
            .catalog
            .render_pending(
                self.renderer.as_ref(),
                self.settings.max_pairs_per_round,
                &self.guard(run_id),
            )
            .await?;
        info!(
            "Creative round: {} pairs, rendered {} of {} ({} failed)",
            pairs,
            summary.rendered,
            summary.attempted,
            summary.failed.len()
        );
        Ok((
            RoundStatus::FlowFinished,
            json!({ "pairs": pairs, "render": summary }),
        ))
    }

    /// `segment`, then `continue` while the chain says so (bounded by
    /// `max_followups`), then `creative` once segmentation is finished.
    /// The caller must already hold the lease for `run_id`.
    pub async fn run_flow(&self, run_id: &str) -> PipelineResult<(RoundStatus, Option<Value>)> {
        let mut chain = vec![Directive::Segment.as_str().to_string()];
        let (mut status, _) = self.run_single(Directive::Segment, run_id).await?;
        chain.push(status.as_str().to_string());

        let mut followups = 0u32;
        while status == RoundStatus::Continue && followups < self.settings.max_followups {
            // Re-entrant for the same run; also refreshes the TTL.
            self.acquire(run_id).await?;
            followups += 1;
            status = self.run_single(Directive::Continue, run_id).await?.0;
            chain.push(status.as_str().to_string());
            self.reporter
                .report(ProgressEvent::new(
                    run_id,
                    status.as_str(),
                    format!("follow-up round {followups}"),
                    Some(Directive::Continue.as_str().to_string()),
                ))
                .await;
        }
        if status == RoundStatus::Continue {
            warn!("Run {run_id}: follow-up limit {followups} reached with users still pending");
        }

        if status == RoundStatus::SegmentationFinished {
            self.acquire(run_id).await?;
            status = self.run_single(Directive::Creative, run_id).await?.0;
            chain.push(status.as_str().to_string());
        }

        info!("Run {run_id}: flow resolved to {} ({:?})", status.as_str(), chain);
        Ok((
            status,
            Some(json!({ "status_chain": chain, "followups": followups })),
        ))
    }
}
