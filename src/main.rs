mod analyzer;
mod bridge;
mod capture;
mod commentary;
mod config;
mod console;
mod context;
mod diagnostics;
mod error;
mod extract;
mod fen;
mod frame;
mod mask;
mod scene;
mod scheduler;
mod tracker;
mod vision;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analyzer::{Analyzer, UnavailableAnalyzer, VisionAnalyzer};
use crate::bridge::{ConsoleBridge, DialogueBridge};
use crate::capture::{FrameHub, ImageFileSource, ScreenSource};
use crate::commentary::{CommentaryBuffer, ingest_transcripts, read_transcript_feed};
use crate::config::{ANALYZER_KEY_VAR, Config, SourceConfig, analyzer_api_key, load_config, save_config, vision_api_key};
use crate::context::PipelineContext;
use crate::diagnostics::DebugSink;
use crate::extract::{FastFenExtractor, FullConsensusDetector};
use crate::frame::FrameSource;
use crate::mask::BoardMaskCache;
use crate::scene::{DiffSceneDetector, run_scene_monitor};
use crate::scheduler::AnalysisScheduler;
use crate::tracker::PositionChangeTracker;
use crate::vision::RoboflowClient;

type TaskSet = JoinSet<(&'static str, Result<()>)>;

struct RunOptions {
    headless: bool,
    transcripts: Option<PathBuf>,
}

fn cli() -> Command {
    Command::new("zugzwang-live")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Live chess broadcast companion: tracks the board on screen and narrates each new position")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Config file (defaults to ./zugzwang.json when present)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("source")
                .long("source")
                .value_name("screen|PATH")
                .help("Frame source: the primary screen, or an image file re-read every frame"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .help("Save fast-path crops and board snapshots to the debug directory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-watch")
                .long("no-watch")
                .help("Start with watching mode off (answer questions only)")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("transcripts")
                .long("transcripts")
                .value_name("PATH")
                .help("Transcription feed to tail for commentary ('final:'/'partial:' lines)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("poll-secs")
                .long("poll-secs")
                .value_name("N")
                .help("Seconds between position polls")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("headless")
                .long("headless")
                .help("Run without the interactive console")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("write-config")
                .long("write-config")
                .value_name("PATH")
                .help("Write the effective config as JSON and exit")
                .value_parser(value_parser!(PathBuf)),
        )
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(source) = matches.get_one::<String>("source") {
        config.source = match source.as_str() {
            "screen" => match &config.source {
                SourceConfig::Screen { .. } => config.source.clone(),
                SourceConfig::Image { .. } => SourceConfig::default(),
            },
            path => SourceConfig::Image {
                path: PathBuf::from(path),
            },
        };
    }
    if matches.get_flag("debug") {
        config.debug = true;
    }
    if matches.get_flag("no-watch") {
        config.watching = false;
    }
    if let Some(secs) = matches.get_one::<u64>("poll-secs") {
        config.poll_interval_secs = *secs;
    }
}

fn main() -> Result<()> {
    let matches = cli().get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zugzwang_live=info")),
        )
        .with_target(false)
        .init();

    let mut config = load_config(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    apply_overrides(&mut config, &matches);
    config.validate().context("Invalid configuration")?;

    if let Some(path) = matches.get_one::<PathBuf>("write-config") {
        save_config(&config, path)?;
        info!(path = %path.display(), "config written");
        return Ok(());
    }

    // missing vision credential is fatal before any task starts
    let vision_key = vision_api_key()?;

    let options = RunOptions {
        headless: matches.get_flag("headless"),
        transcripts: matches.get_one::<PathBuf>("transcripts").cloned(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(config, vision_key, options));
    // the console's stdin thread cannot be interrupted
    runtime.shutdown_timeout(Duration::from_secs(2));
    result
}

fn spawn_named<F>(tasks: &mut TaskSet, name: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) });
}

async fn run(config: Config, vision_key: String, options: RunOptions) -> Result<()> {
    info!(
        source = ?config.source,
        poll = ?config.poll_interval(),
        watching = config.watching,
        "zugzwang-live starting"
    );

    let vision = Arc::new(RoboflowClient::new(vision_key, &config.vision)?);
    let analyzer: Arc<dyn Analyzer> = match analyzer_api_key() {
        Some(key) => Arc::new(VisionAnalyzer::new(key, &config.analyzer)?),
        None => {
            warn!("{ANALYZER_KEY_VAR} not set, positions will be tracked but not analyzed");
            Arc::new(UnavailableAnalyzer::new(format!("{ANALYZER_KEY_VAR} not set")))
        }
    };
    let debug = if config.debug {
        DebugSink::new(&config.debug_dir)
            .with_context(|| format!("Failed to create debug dir {}", config.debug_dir.display()))?
    } else {
        DebugSink::disabled()
    };
    let source: Arc<dyn FrameSource> = match &config.source {
        SourceConfig::Screen { monitor, region } => Arc::new(ScreenSource::new(*monitor, *region)),
        SourceConfig::Image { path } => Arc::new(ImageFileSource::new(path.clone())),
    };

    let (hub, publisher) = FrameHub::new(config.frame_timeout());
    let mask = Arc::new(BoardMaskCache::new(vision.clone()));
    let commentary = Arc::new(CommentaryBuffer::with_capacity(config.commentary_capacity));
    let ctx = Arc::new(PipelineContext::new(mask.clone(), commentary.clone(), config.watching));
    let bridge: Arc<dyn DialogueBridge> = Arc::new(ConsoleBridge);
    let scheduler = Arc::new(AnalysisScheduler::new(ctx.clone(), analyzer.clone(), bridge));

    let piece_model = config.vision.piece_model.clone();
    let fallback = FullConsensusDetector::new(
        vision.clone(),
        vision.clone(),
        piece_model.clone(),
        config.consensus.passes,
        config.consensus.min_consensus,
    );
    let extractor = FastFenExtractor::new(vision, piece_model, fallback, debug.clone());
    let tracker = PositionChangeTracker::new(
        ctx.clone(),
        hub.clone(),
        extractor,
        scheduler,
        debug,
        config.poll_interval(),
        config.mask_wait(),
    );

    let token = CancellationToken::new();
    let mut tasks = TaskSet::new();

    spawn_named(
        &mut tasks,
        "capture",
        publisher.run(source, config.frame_interval(), config.max_capture_failures, token.clone()),
    );
    spawn_named(&mut tasks, "board-mask", seed_board_mask(mask.clone(), hub.clone(), token.clone()));
    {
        let mask = mask.clone();
        spawn_named(
            &mut tasks,
            "scene",
            run_scene_monitor(
                hub.clone(),
                Box::new(DiffSceneDetector::new(&config.scene)),
                move |frame| {
                    let mask = mask.clone();
                    async move {
                        if let Ok(updated) = mask.update(&frame).await {
                            debug!(bbox = ?updated.bbox, "mask refreshed after scene change");
                        }
                    }
                },
                token.clone(),
            ),
        );
    }
    spawn_named(&mut tasks, "tracker", tracker.run(token.clone()));

    if let Some(path) = options.transcripts {
        let (tx, rx) = mpsc::channel(64);
        spawn_named(&mut tasks, "commentary", ingest_transcripts(rx, commentary, token.clone()));
        spawn_named(&mut tasks, "transcript-feed", read_transcript_feed(path, tx, token.clone()));
    }
    if !options.headless {
        spawn_named(&mut tasks, "console", console::run_console(ctx, hub, analyzer, token.clone()));
    }
    spawn_named(&mut tasks, "signal", wait_for_ctrl_c(token.clone()));

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!(task = name, "task finished"),
            Ok((name, Err(err))) => {
                error!(task = name, error = %format!("{err:#}"), "task failed, shutting down");
                token.cancel();
                first_error.get_or_insert(err.context(format!("{name} task failed")));
            }
            Err(err) => {
                error!(error = %err, "task panicked, shutting down");
                token.cancel();
                first_error.get_or_insert(anyhow::anyhow!("task panicked: {err}"));
            }
        }
    }

    info!("pipeline stopped");
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Seeds the mask cache from the first available frame. A failure only
/// disables the fast path until the next scene change.
async fn seed_board_mask(mask: Arc<BoardMaskCache>, hub: FrameHub, token: CancellationToken) -> Result<()> {
    let frame = loop {
        let next = tokio::select! {
            next = hub.fresh() => next,
            _ = token.cancelled() => return Ok(()),
        };
        match next {
            Ok(frame) => break frame,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => debug!(error = %err, "waiting for first frame"),
        }
    };

    match mask.detect_initial(&frame).await {
        Ok(initial) => info!(bbox = ?initial.bbox, confidence = initial.confidence, "initial board mask ready"),
        Err(err) => warn!(error = %err, "initial board detection failed, waiting for a scene change"),
    }
    Ok(())
}

async fn wait_for_ctrl_c(token: CancellationToken) -> Result<()> {
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("ctrl-c received, shutting down");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
    Ok(())
}
