//! Position change tracking loop.
//! Polls at a fixed cadence: take a fresh frame, extract and validate the
//! position, and when it differs from the last confirmed one, store it and
//! hand it to the scheduler without waiting for the analysis.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::FrameHub;
use crate::context::PipelineContext;
use crate::diagnostics::DebugSink;
use crate::error::PipelineError;
use crate::extract::{ExtractionPath, FastFenExtractor};
use crate::fen::{render_board, validate_position};
use crate::scheduler::AnalysisScheduler;

const HEARTBEAT_EVERY: u64 = 6;

#[derive(Debug)]
pub enum PollOutcome {
    WaitingForMask,
    Unchanged,
    Changed {
        previous: Option<String>,
        position: String,
        path: ExtractionPath,
        analysis_started: bool,
    },
    Skipped(PipelineError),
}

pub struct PositionChangeTracker {
    ctx: Arc<PipelineContext>,
    hub: FrameHub,
    extractor: FastFenExtractor,
    scheduler: Arc<AnalysisScheduler>,
    debug: DebugSink,
    poll_interval: Duration,
    mask_wait: Duration,
    stable_ticks: u64,
}

impl PositionChangeTracker {
    pub fn new(
        ctx: Arc<PipelineContext>,
        hub: FrameHub,
        extractor: FastFenExtractor,
        scheduler: Arc<AnalysisScheduler>,
        debug: DebugSink,
        poll_interval: Duration,
        mask_wait: Duration,
    ) -> Self {
        Self {
            ctx,
            hub,
            extractor,
            scheduler,
            debug,
            poll_interval,
            mask_wait,
            stable_ticks: 0,
        }
    }

    pub async fn poll_once(&mut self) -> PollOutcome {
        // one snapshot per tick, even if a scene change swaps the cache
        let Some(mask) = self.ctx.mask.snapshot() else {
            return PollOutcome::WaitingForMask;
        };
        debug!(bbox = ?mask.bbox, since = %mask.timestamp, "polling with cached mask");

        let frame = match self.hub.fresh().await {
            Ok(frame) => frame,
            Err(err) => return PollOutcome::Skipped(err),
        };

        let extraction = match self.extractor.extract(&frame, Some(&mask)).await {
            Ok(extraction) => extraction,
            Err(err) => return PollOutcome::Skipped(err),
        };

        let position = match validate_position(&extraction.position) {
            Ok(position) => position,
            Err(err) => return PollOutcome::Skipped(err),
        };

        if self.ctx.board().position.as_deref() == Some(position.as_str()) {
            self.stable_ticks += 1;
            if self.stable_ticks % HEARTBEAT_EVERY == 0 {
                let since = self.ctx.board().last_updated;
                info!(ticks = self.stable_ticks, position = %position, ?since, "position stable");
            }
            return PollOutcome::Unchanged;
        }

        self.stable_ticks = 0;
        let previous = self.ctx.set_position(position.clone());
        info!(
            from = previous.as_deref().unwrap_or("none"),
            to = %position,
            path = ?extraction.path,
            pieces = extraction.piece_count,
            captured = %frame.captured_at.format("%H:%M:%S%.3f"),
            "position changed\n{}",
            render_board(&position)
        );
        self.debug.save_board_snapshot(&position);

        let analysis_started = self.scheduler.spawn_submit(position.clone(), frame);
        PollOutcome::Changed {
            previous,
            position,
            path: extraction.path,
            analysis_started,
        }
    }

    /// Polls until cancelled. Only fatal errors end the loop early.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        info!(interval = ?self.poll_interval, "position tracking started");
        loop {
            let outcome = tokio::select! {
                outcome = self.poll_once() => outcome,
                _ = token.cancelled() => break,
            };

            let delay = match outcome {
                PollOutcome::WaitingForMask => {
                    info!("waiting for board mask");
                    self.mask_wait
                }
                PollOutcome::Skipped(err) if err.is_fatal() => return Err(err.into()),
                PollOutcome::Skipped(PipelineError::Validation { fen, reason }) => {
                    warn!(fen = %fen, reason = %reason, "discarding invalid position");
                    self.poll_interval
                }
                PollOutcome::Skipped(err) => {
                    debug!(error = %err, "poll skipped");
                    self.poll_interval
                }
                PollOutcome::Unchanged | PollOutcome::Changed { .. } => self.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => break,
            }
        }
        info!("position tracking stopped");
        Ok(())
    }
}
