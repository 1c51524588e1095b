//! Dialogue side of the pipeline.
//! `DialogueBridge` receives narratives pushed in watching mode. Incoming
//! requests arrive as `ToolCall`s and are answered with serializable
//! `ToolResponse`s; inspection only reads the stored analysis and never
//! starts a new one.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, Side, format_narrative};
use crate::capture::FrameHub;
use crate::context::PipelineContext;
use crate::frame::Screenshot;

const NO_ANALYSIS_MESSAGE: &str = "No analysis available yet. Please wait for position detection.";

#[async_trait]
pub trait DialogueBridge: Send + Sync {
    async fn push_narrative(&self, text: &str, screenshot: Option<&Screenshot>) -> Result<()>;
}

/// Prints narratives to stdout.
pub struct ConsoleBridge;

#[async_trait]
impl DialogueBridge for ConsoleBridge {
    async fn push_narrative(&self, text: &str, screenshot: Option<&Screenshot>) -> Result<()> {
        println!("\n{}\n{}\n{}", "=".repeat(50), text.trim_end(), "=".repeat(50));
        if let Some(shot) = screenshot {
            debug!(mime = %shot.mime_type, bytes = shot.data.len(), "narrative screenshot attached");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ToolCall {
    InspectCurrentPosition {
        #[serde(default)]
        query: String,
        #[serde(default)]
        side: Option<Side>,
    },
    StartWatchingMode,
    StopWatchingMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResponse {
    AnalysisReady {
        analysis: String,
        query: String,
        perspective: Side,
    },
    NoAnalysis {
        message: String,
    },
    WatchingModeStarted,
    WatchingModeStopped,
}

pub async fn handle_tool_call(
    call: ToolCall,
    ctx: &PipelineContext,
    hub: &FrameHub,
    analyzer: &Arc<dyn Analyzer>,
) -> ToolResponse {
    match call {
        ToolCall::InspectCurrentPosition { query, side } => {
            inspect_current_position(ctx, hub, analyzer.as_ref(), &query, side).await
        }
        ToolCall::StartWatchingMode => {
            ctx.set_watching(true);
            info!("watching mode on");
            ToolResponse::WatchingModeStarted
        }
        ToolCall::StopWatchingMode => {
            ctx.set_watching(false);
            info!("watching mode off");
            ToolResponse::WatchingModeStopped
        }
    }
}

/// Answers a question from the stored analysis. The side is the explicit one
/// when given, otherwise resolved from the query and broadcast overlay, and
/// white whenever resolution fails.
pub async fn inspect_current_position(
    ctx: &PipelineContext,
    hub: &FrameHub,
    analyzer: &dyn Analyzer,
    query: &str,
    side: Option<Side>,
) -> ToolResponse {
    let query = match query.trim() {
        "" => ctx.take_pending_query().unwrap_or_default(),
        q => q.to_string(),
    };

    let Some(current) = ctx.latest_analysis() else {
        info!("no current analysis available");
        // keep the question for the first inspection after analysis exists
        ctx.set_pending_query(Some(query));
        return ToolResponse::NoAnalysis {
            message: NO_ANALYSIS_MESSAGE.to_string(),
        };
    };

    let requested = match side {
        Some(side) => side,
        None => resolve_side(hub, analyzer, &query).await,
    };

    let Some((perspective, stored)) = current.perspective(requested) else {
        return ToolResponse::NoAnalysis {
            message: NO_ANALYSIS_MESSAGE.to_string(),
        };
    };

    let mut analysis = stored.clone();
    analysis.user_query = Some(query.clone()).filter(|q| !q.is_empty());
    analysis.formatted_narrative = format_narrative(&analysis);
    info!(
        %perspective,
        query = %query,
        analyzed_at = %current.analyzed_at,
        "answering from stored analysis"
    );

    ToolResponse::AnalysisReady {
        analysis: analysis.formatted_narrative,
        query,
        perspective,
    }
}

async fn resolve_side(hub: &FrameHub, analyzer: &dyn Analyzer, query: &str) -> Side {
    let frame = match hub.latest() {
        Some(frame) => frame,
        None => match hub.fresh().await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "no frame for perspective resolution, using white");
                return Side::White;
            }
        },
    };

    let context = match analyzer.extract_broadcast_context(&frame).await {
        Ok(context) => context,
        Err(err) => {
            warn!(error = %err, "broadcast context unavailable, using white");
            return Side::White;
        }
    };

    match analyzer.determine_perspective(query, &context).await {
        Ok(side) => side,
        Err(err) => {
            warn!(error = %err, "perspective unresolved, using white");
            Side::White
        }
    }
}
