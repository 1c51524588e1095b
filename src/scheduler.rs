//! Single-flight analysis scheduling.
//! At most one analysis runs at a time. A request arriving while one is in
//! flight is dropped rather than queued; the next detected change produces a
//! fresh request anyway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, Side};
use crate::bridge::DialogueBridge;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::frame::Frame;

#[derive(Debug)]
pub enum SubmitOutcome {
    Completed,
    Dropped,
    Failed(PipelineError),
}

/// Clears the busy flag however the analysis ends, panics included.
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                flag: Arc::clone(flag),
            })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct AnalysisScheduler {
    ctx: Arc<PipelineContext>,
    analyzer: Arc<dyn Analyzer>,
    bridge: Arc<dyn DialogueBridge>,
    busy: Arc<AtomicBool>,
}

impl AnalysisScheduler {
    pub fn new(ctx: Arc<PipelineContext>, analyzer: Arc<dyn Analyzer>, bridge: Arc<dyn DialogueBridge>) -> Self {
        Self {
            ctx,
            analyzer,
            bridge,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Runs one analysis if none is in flight.
    pub async fn submit(&self, position: String, frame: Arc<Frame>) -> SubmitOutcome {
        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            debug!(position = %position, "analysis in flight, dropping request");
            return SubmitOutcome::Dropped;
        };
        self.analyze(guard, position, frame).await
    }

    /// Fire-and-forget variant for the polling loop. The busy flag is taken
    /// before spawning, so `true` always means this request is the one
    /// running; `false` means it was dropped.
    pub fn spawn_submit(self: &Arc<Self>, position: String, frame: Arc<Frame>) -> bool {
        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            debug!(position = %position, "analysis in flight, not spawning");
            return false;
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let SubmitOutcome::Failed(err) = scheduler.analyze(guard, position, frame).await {
                error!(error = %err, "background analysis ended with an error");
            }
        });
        true
    }

    /// Holds `_guard` until the analysis and any narrative push are done.
    async fn analyze(&self, _guard: BusyGuard, position: String, frame: Arc<Frame>) -> SubmitOutcome {
        let start = Instant::now();
        info!(position = %position, "analyzing new position from both perspectives");
        let commentary = self.ctx.commentary.snapshot();

        let result = match self
            .analyzer
            .analyze_both_perspectives(&position, &frame, &commentary)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, position = %position, "analysis failed");
                return SubmitOutcome::Failed(err);
            }
        };

        let white = result.perspective(Side::White).map(|(_, a)| a.clone());
        self.ctx.store_analysis(result);
        info!(elapsed = ?start.elapsed(), position = %position, "current analysis updated");

        if self.ctx.is_watching() {
            match white {
                Some(analysis) => {
                    if let Err(err) = self
                        .bridge
                        .push_narrative(&analysis.formatted_narrative, analysis.screenshot.as_ref())
                        .await
                    {
                        warn!(error = %err, "failed to push narrative");
                    }
                }
                None => warn!("analysis has no white perspective to push"),
            }
        }
        SubmitOutcome::Completed
    }
}
