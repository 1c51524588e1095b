//! Hand-written doubles for the pipeline's trait seams.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, GenericImageView, RgbImage};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, Semaphore};

use crate::analyzer::{AnalysisResult, Analyzer, PerspectiveAnalysis, Side, format_narrative, side_from_query};
use crate::bridge::DialogueBridge;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameSource, Screenshot};
use crate::mask::BoardMask;
use crate::vision::{BBox, PieceDetector, Prediction, Segmenter};

pub fn blank_frame(width: u32, height: u32) -> Frame {
    Frame::new(DynamicImage::ImageRgb8(RgbImage::new(width, height)), 0)
}

pub fn board_prediction(x: f32, y: f32, width: f32, height: f32) -> Prediction {
    Prediction {
        x,
        y,
        width,
        height,
        confidence: 0.9,
        class_name: "board".to_string(),
        points: Vec::new(),
    }
}

fn piece_at(class: &str, file: u32, row: u32, size: u32) -> Prediction {
    let square = size as f32 / 8.0;
    Prediction {
        x: (file as f32 + 0.5) * square,
        y: (row as f32 + 0.5) * square,
        width: square * 0.8,
        height: square * 0.8,
        confidence: 0.85,
        class_name: class.to_string(),
        points: Vec::new(),
    }
}

/// Black king e8, white king e1, white pawn e4 on a `size` x `size` board
/// image: `4k3/8/8/8/4P3/8/8/4K3`. The kings come first.
pub fn kings_and_pawn(size: u32) -> Vec<Prediction> {
    vec![
        piece_at("black-king", 4, 0, size),
        piece_at("white-king", 4, 7, size),
        piece_at("white-pawn", 4, 4, size),
    ]
}

/// Detections whose class maps to no piece.
pub fn non_pieces(count: usize) -> Vec<Prediction> {
    (0..count)
        .map(|i| board_prediction(100.0 + i as f32 * 50.0, 100.0, 40.0, 40.0))
        .collect()
}

pub fn mask_at(bbox: BBox) -> BoardMask {
    BoardMask {
        bbox,
        confidence: 1.0,
        timestamp: Utc::now(),
    }
}

pub fn sample_analysis(side: Side) -> PerspectiveAnalysis {
    sample_analysis_for(side, "4k3/8/8/8/4P3/8/8/4K3")
}

fn sample_analysis_for(side: Side, position: &str) -> PerspectiveAnalysis {
    let mut analysis = PerspectiveAnalysis {
        side,
        position: position.to_string(),
        evaluation_text: format!("{side} is fine."),
        commentary: Vec::new(),
        user_query: None,
        formatted_narrative: String::new(),
        screenshot: None,
    };
    analysis.formatted_narrative = format_narrative(&analysis);
    analysis
}

pub struct StaticSource {
    image: Option<DynamicImage>,
}

impl StaticSource {
    pub fn new(image: DynamicImage) -> Self {
        Self { image: Some(image) }
    }

    pub fn failing() -> Self {
        Self { image: None }
    }
}

impl FrameSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    fn read(&self) -> PipelineResult<DynamicImage> {
        self.image
            .clone()
            .ok_or_else(|| PipelineError::Capture("device unplugged".to_string()))
    }
}

/// Replays scripted results in call order, then returns `repeat` (or an
/// empty list).
pub struct ScriptedSegmenter {
    script: Mutex<VecDeque<PipelineResult<Vec<Prediction>>>>,
    repeat: Option<Vec<Prediction>>,
    seen: Mutex<Vec<(u32, u32)>>,
}

impl ScriptedSegmenter {
    pub fn new(script: Vec<PipelineResult<Vec<Prediction>>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always(predictions: Vec<Prediction>) -> Self {
        Self {
            repeat: Some(predictions),
            ..Self::new(Vec::new())
        }
    }

    pub fn seen_dimensions(&self) -> Vec<(u32, u32)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Segmenter for ScriptedSegmenter {
    async fn segment(&self, image: &DynamicImage) -> PipelineResult<Vec<Prediction>> {
        self.seen.lock().push(image.dimensions());
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.repeat.clone().unwrap_or_default()))
    }
}

/// Replays scripted results in call order; once the script runs out it
/// returns `repeat` (or nothing).
pub struct ScriptedDetector {
    script: Mutex<VecDeque<PipelineResult<Vec<Prediction>>>>,
    repeat: Option<Vec<Prediction>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(u32, u32)>>,
}

impl ScriptedDetector {
    pub fn new(script: Vec<PipelineResult<Vec<Prediction>>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always(predictions: Vec<Prediction>) -> Self {
        Self {
            repeat: Some(predictions),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_dimensions(&self) -> Vec<(u32, u32)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl PieceDetector for ScriptedDetector {
    async fn detect(&self, image: &DynamicImage, _model_id: &str) -> PipelineResult<Vec<Prediction>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(image.dimensions());
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.repeat.clone().unwrap_or_default()))
    }
}

/// Analyzer whose `analyze_both_perspectives` can be held open until
/// `release` is called, to observe the scheduler while busy.
pub struct GatedAnalyzer {
    gate: Option<Semaphore>,
    fail: bool,
    calls: AtomicUsize,
    started: Notify,
}

impl GatedAnalyzer {
    pub fn new() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            fail: false,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn open() -> Self {
        Self {
            gate: None,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::open()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl Analyzer for GatedAnalyzer {
    async fn analyze_both_perspectives(
        &self,
        position: &str,
        _frame: &Frame,
        commentary: &[String],
    ) -> PipelineResult<AnalysisResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| PipelineError::Analysis(e.to_string()))?
                .forget();
        }
        if self.fail {
            return Err(PipelineError::Analysis("model unavailable".to_string()));
        }

        let by_perspective = [Side::White, Side::Black]
            .into_iter()
            .map(|side| {
                let mut analysis = sample_analysis_for(side, position);
                analysis.commentary = commentary.to_vec();
                analysis.formatted_narrative = format_narrative(&analysis);
                (side, analysis)
            })
            .collect::<HashMap<_, _>>();
        Ok(AnalysisResult {
            by_perspective,
            source_position: position.to_string(),
            analyzed_at: Utc::now(),
        })
    }

    async fn extract_broadcast_context(&self, _frame: &Frame) -> PipelineResult<String> {
        if self.fail {
            return Err(PipelineError::Analysis("model unavailable".to_string()));
        }
        Ok("Carlsen (white) vs Nakamura (black), white to move".to_string())
    }

    async fn determine_perspective(&self, query: &str, _context: &str) -> PipelineResult<Side> {
        if self.fail {
            return Err(PipelineError::Analysis("model unavailable".to_string()));
        }
        Ok(side_from_query(query).unwrap_or(Side::White))
    }
}

#[derive(Default)]
pub struct RecordingBridge {
    pushed: Mutex<Vec<String>>,
}

impl RecordingBridge {
    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().clone()
    }
}

#[async_trait]
impl DialogueBridge for RecordingBridge {
    async fn push_narrative(&self, text: &str, _screenshot: Option<&Screenshot>) -> Result<()> {
        self.pushed.lock().push(text.to_string());
        Ok(())
    }
}
