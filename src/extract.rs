//! Position extraction.
//! Fast path: normalize -> crop by cached bbox -> resize to 640x640 -> one
//! piece-detection call -> grid conversion. Any rejection (no mask, empty crop,
//! detector error, fewer than two pieces, empty board) defers to the consensus
//! detector, which votes over several passes that each locate the board in
//! the full frame before detecting pieces.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::diagnostics::DebugSink;
use crate::error::{PipelineError, PipelineResult};
use crate::fen::{EMPTY_BOARD, MIN_PIECES, count_pieces, piece_char, pieces_to_fen};
use crate::frame::{Frame, PIECE_INPUT_SIZE};
use crate::mask::BoardMask;
use crate::vision::{PieceDetector, Prediction, Segmenter, extract_bbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPath {
    Fast,
    Consensus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub position: String,
    pub piece_count: usize,
    pub path: ExtractionPath,
}

/// Grid conversion plus the two rejection rules shared by both paths.
/// `width` x `height` must be the size of the board image the predictions
/// were made on.
fn reading_from(predictions: &[Prediction], width: u32, height: u32, model_id: &str) -> PipelineResult<(String, usize)> {
    let pieces = predictions
        .iter()
        .filter(|p| piece_char(&p.class_name).is_some())
        .count();
    if pieces < MIN_PIECES {
        return Err(PipelineError::Detection(format!(
            "only {pieces} pieces among {} predictions",
            predictions.len()
        )));
    }
    let fen = pieces_to_fen(predictions, width, height, model_id);
    if fen == EMPTY_BOARD {
        return Err(PipelineError::Detection(format!(
            "empty board FEN from {pieces} pieces"
        )));
    }
    Ok((fen, pieces))
}

/// One consensus vote: locate the board in `image`, crop to it and read the
/// pieces on the crop.
async fn consensus_pass(
    segmenter: &dyn Segmenter,
    detector: &dyn PieceDetector,
    image: &DynamicImage,
    model_id: &str,
) -> PipelineResult<String> {
    let (width, height) = image.dimensions();
    let boards = segmenter.segment(image).await?;
    let (bbox, _) = extract_bbox(&boards, width, height)
        .ok_or_else(|| PipelineError::Segmentation("no board located in frame".to_string()))?;

    let crop = image.crop_imm(bbox.x_min, bbox.y_min, bbox.width(), bbox.height());
    let predictions = detector.detect(&crop, model_id).await?;
    reading_from(&predictions, crop.width(), crop.height(), model_id).map(|(fen, _)| fen)
}

pub struct FullConsensusDetector {
    segmenter: Arc<dyn Segmenter>,
    detector: Arc<dyn PieceDetector>,
    model_id: String,
    passes: usize,
    min_consensus: usize,
}

impl FullConsensusDetector {
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        detector: Arc<dyn PieceDetector>,
        model_id: impl Into<String>,
        passes: usize,
        min_consensus: usize,
    ) -> Self {
        Self {
            segmenter,
            detector,
            model_id: model_id.into(),
            passes,
            min_consensus,
        }
    }

    /// Runs `passes` independent segment-crop-detect passes over the full
    /// (thumbnailed) frame and accepts the reading at least `min_consensus`
    /// passes agree on.
    pub async fn detect(&self, frame: &Frame) -> PipelineResult<Extraction> {
        info!(passes = self.passes, min = self.min_consensus, "running full consensus detection");
        let start = Instant::now();
        let image = Arc::new(frame.thumbnail());

        let mut set = JoinSet::new();
        for pass in 0..self.passes {
            let segmenter = Arc::clone(&self.segmenter);
            let detector = Arc::clone(&self.detector);
            let image = Arc::clone(&image);
            let model_id = self.model_id.clone();
            set.spawn(async move {
                let result = consensus_pass(segmenter.as_ref(), detector.as_ref(), &image, &model_id).await;
                (pass, result)
            });
        }

        let mut readings = Vec::with_capacity(self.passes);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(fen))) => readings.push(fen),
                Ok((pass, Err(err))) => debug!(pass, error = %err, "consensus pass cast no vote"),
                Err(err) => warn!(error = %err, "consensus pass task failed"),
            }
        }

        let position = tally(&readings, self.min_consensus)?;
        let piece_count = count_pieces(&position);
        if piece_count < MIN_PIECES || position == EMPTY_BOARD {
            return Err(PipelineError::Detection(format!(
                "consensus reading has {piece_count} pieces"
            )));
        }

        info!(elapsed = ?start.elapsed(), votes = readings.len(), position = %position, "consensus detection complete");
        Ok(Extraction {
            position,
            piece_count,
            path: ExtractionPath::Consensus,
        })
    }
}

/// Majority vote: the most common reading wins only with at least
/// `min_consensus` votes and no tie for first place.
pub fn tally(readings: &[String], min_consensus: usize) -> PipelineResult<String> {
    let mut votes: HashMap<&str, usize> = HashMap::new();
    for reading in readings {
        *votes.entry(reading.as_str()).or_default() += 1;
    }

    let top = votes.values().copied().max().unwrap_or(0);
    let leaders: Vec<&str> = votes
        .iter()
        .filter(|(_, count)| **count == top)
        .map(|(fen, _)| *fen)
        .collect();

    match leaders.as_slice() {
        [winner] if top >= min_consensus => Ok(winner.to_string()),
        [] => Err(PipelineError::Detection("no consensus pass produced a reading".to_string())),
        [_] => Err(PipelineError::Detection(format!(
            "best reading has {top} votes, {min_consensus} required"
        ))),
        _ => Err(PipelineError::Detection(format!(
            "{} readings tied at {top} votes",
            leaders.len()
        ))),
    }
}

pub struct FastFenExtractor {
    detector: Arc<dyn PieceDetector>,
    model_id: String,
    fallback: FullConsensusDetector,
    debug: DebugSink,
}

impl FastFenExtractor {
    pub fn new(detector: Arc<dyn PieceDetector>, model_id: impl Into<String>, fallback: FullConsensusDetector, debug: DebugSink) -> Self {
        Self {
            detector,
            model_id: model_id.into(),
            fallback,
            debug,
        }
    }

    /// `mask` must be a snapshot taken once by the caller.
    pub async fn extract(&self, frame: &Frame, mask: Option<&BoardMask>) -> PipelineResult<Extraction> {
        let Some(mask) = mask else {
            info!("no cached board mask, falling back to consensus");
            return self.fallback.detect(frame).await;
        };

        match self.fast_path(frame, mask).await {
            Ok(extraction) => Ok(extraction),
            Err(err) => {
                info!(error = %err, "fast path rejected, falling back to consensus");
                self.fallback.detect(frame).await
            }
        }
    }

    async fn fast_path(&self, frame: &Frame, mask: &BoardMask) -> PipelineResult<Extraction> {
        let start = Instant::now();
        let crop = crop_to_mask(&frame.normalized(), mask)?;
        let crop = crop.resize_exact(PIECE_INPUT_SIZE, PIECE_INPUT_SIZE, FilterType::Lanczos3);
        debug!(
            frame = ?frame.dimensions(),
            bbox = ?mask.bbox,
            "fast path: frame -> 1024 -> crop -> 640 -> piece detection"
        );

        let predictions = self.detector.detect(&crop, &self.model_id).await?;
        let (position, piece_count) = reading_from(&predictions, PIECE_INPUT_SIZE, PIECE_INPUT_SIZE, &self.model_id)?;

        self.debug.save_image("fast_crop", &crop);
        info!(piece_count, position = %position, elapsed = ?start.elapsed(), "fast FEN extracted");
        Ok(Extraction {
            position,
            piece_count,
            path: ExtractionPath::Fast,
        })
    }
}

fn crop_to_mask(normalized: &DynamicImage, mask: &BoardMask) -> PipelineResult<DynamicImage> {
    let (w, h) = normalized.dimensions();
    let bbox = mask.bbox.clamped(w, h);
    if bbox.is_empty() {
        return Err(PipelineError::Detection(format!(
            "empty crop from cached bbox {:?}",
            mask.bbox
        )));
    }
    Ok(normalized.crop_imm(bbox.x_min, bbox.y_min, bbox.width(), bbox.height()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        ScriptedDetector, ScriptedSegmenter, blank_frame, board_prediction, kings_and_pawn, mask_at, non_pieces,
    };
    use crate::vision::BBox;

    const MODEL: &str = "chess.comdetection/4";

    /// Segmenter that finds a board filling a 1024x1024 thumbnail.
    fn whole_frame_board() -> Arc<ScriptedSegmenter> {
        Arc::new(ScriptedSegmenter::always(vec![board_prediction(512.0, 512.0, 1024.0, 1024.0)]))
    }

    fn extractor(detector: Arc<ScriptedDetector>) -> FastFenExtractor {
        let fallback = FullConsensusDetector::new(whole_frame_board(), detector.clone(), MODEL, 7, 3);
        FastFenExtractor::new(detector, MODEL, fallback, DebugSink::disabled())
    }

    #[test]
    fn test_tally_majority_and_ties() {
        let v = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<_>>();

        assert_eq!(tally(&v(&["a", "a", "a", "b", "b"]), 3).unwrap(), "a");
        assert!(tally(&v(&["a", "a", "b", "b", "c"]), 2).is_err());
        assert!(tally(&v(&["a", "a", "b"]), 3).is_err());
        assert!(tally(&[], 3).is_err());
    }

    #[tokio::test]
    async fn test_fast_path_uses_one_call_on_cropped_input() {
        let detector = Arc::new(ScriptedDetector::always(kings_and_pawn(640)));
        let extractor = extractor(detector.clone());
        let mask = mask_at(BBox { x_min: 100, y_min: 100, x_max: 900, y_max: 900 });

        let extraction = extractor.extract(&blank_frame(1920, 1080), Some(&mask)).await.unwrap();
        assert_eq!(extraction.path, ExtractionPath::Fast);
        assert_eq!(extraction.position, "4k3/8/8/8/4P3/8/8/4K3");
        assert_eq!(detector.calls(), 1);
        assert_eq!(detector.seen_dimensions(), vec![(640, 640)]);
    }

    #[tokio::test]
    async fn test_missing_mask_goes_straight_to_consensus() {
        let detector = Arc::new(ScriptedDetector::always(kings_and_pawn(1024)));
        let extractor = extractor(detector.clone());

        let extraction = extractor.extract(&blank_frame(1024, 1024), None).await.unwrap();
        assert_eq!(extraction.path, ExtractionPath::Consensus);
        assert_eq!(detector.calls(), 7);
    }

    #[tokio::test]
    async fn test_too_few_pieces_triggers_fallback() {
        // fast call sees one piece; consensus passes see the full set
        let mut script = vec![Ok(kings_and_pawn(640)[..1].to_vec())];
        script.extend((0..7).map(|_| Ok(kings_and_pawn(1024))));
        let detector = Arc::new(ScriptedDetector::new(script));
        let extractor = extractor(detector.clone());
        let mask = mask_at(BBox { x_min: 0, y_min: 0, x_max: 1024, y_max: 1024 });

        let extraction = extractor.extract(&blank_frame(1024, 1024), Some(&mask)).await.unwrap();
        assert_eq!(extraction.path, ExtractionPath::Consensus);
        assert_eq!(detector.calls(), 8);
    }

    #[tokio::test]
    async fn test_empty_board_everywhere_is_detection_failure() {
        // predictions that map to no piece class produce the empty sentinel
        let detector = Arc::new(ScriptedDetector::always(non_pieces(3)));
        let extractor = extractor(detector.clone());
        let mask = mask_at(BBox { x_min: 0, y_min: 0, x_max: 512, y_max: 512 });

        let err = extractor.extract(&blank_frame(1024, 1024), Some(&mask)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Detection(_)));
        assert_eq!(detector.calls(), 8);
    }

    #[tokio::test]
    async fn test_zero_area_crop_falls_back() {
        let detector = Arc::new(ScriptedDetector::always(kings_and_pawn(1024)));
        let extractor = extractor(detector.clone());
        let mask = mask_at(BBox { x_min: 1024, y_min: 0, x_max: 1200, y_max: 500 });

        let extraction = extractor.extract(&blank_frame(1024, 1024), Some(&mask)).await.unwrap();
        assert_eq!(extraction.path, ExtractionPath::Consensus);
        assert_eq!(detector.calls(), 7);
    }

    #[tokio::test]
    async fn test_consensus_requires_min_agreement() {
        let other = kings_and_pawn(1024)[..2].to_vec();
        let script = vec![
            Ok(kings_and_pawn(1024)),
            Ok(kings_and_pawn(1024)),
            Ok(other.clone()),
            Ok(other.clone()),
            Err(PipelineError::Detection("timeout".into())),
            Ok(vec![]),
            Ok(vec![]),
        ];
        let detector = Arc::new(ScriptedDetector::new(script));
        let consensus = FullConsensusDetector::new(whole_frame_board(), detector, MODEL, 7, 3);
        assert!(consensus.detect(&blank_frame(1024, 1024)).await.is_err());
    }

    #[tokio::test]
    async fn test_consensus_reads_board_inside_wide_frame() {
        // 1920x1080 thumbnails to 1024x576; a 600px board at (660, 240) becomes
        // a 320px square at (352, 128)
        let segmenter = Arc::new(ScriptedSegmenter::always(vec![board_prediction(512.0, 288.0, 320.0, 320.0)]));
        let detector = Arc::new(ScriptedDetector::always(kings_and_pawn(320)));
        let consensus = FullConsensusDetector::new(segmenter.clone(), detector.clone(), MODEL, 7, 3);

        let extraction = consensus.detect(&blank_frame(1920, 1080)).await.unwrap();
        assert_eq!(extraction.position, "4k3/8/8/8/4P3/8/8/4K3");
        assert_eq!(extraction.path, ExtractionPath::Consensus);
        assert_eq!(segmenter.seen_dimensions(), vec![(1024, 576); 7]);
        assert_eq!(detector.seen_dimensions(), vec![(320, 320); 7]);
    }

    #[tokio::test]
    async fn test_consensus_pass_without_board_casts_no_vote() {
        let segmenter = Arc::new(ScriptedSegmenter::new(vec![]));
        let detector = Arc::new(ScriptedDetector::always(kings_and_pawn(1024)));
        let consensus = FullConsensusDetector::new(segmenter, detector.clone(), MODEL, 7, 3);

        assert!(consensus.detect(&blank_frame(1024, 1024)).await.is_err());
        assert_eq!(detector.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_piece_classes_do_not_count_as_pieces() {
        // one king next to board outlines: not enough for the fast path
        let mut predictions = kings_and_pawn(640)[..1].to_vec();
        predictions.extend(non_pieces(2));
        let mut script = vec![Ok(predictions)];
        script.extend((0..7).map(|_| Ok(kings_and_pawn(1024))));
        let detector = Arc::new(ScriptedDetector::new(script));
        let extractor = extractor(detector.clone());
        let mask = mask_at(BBox { x_min: 0, y_min: 0, x_max: 1024, y_max: 1024 });

        let extraction = extractor.extract(&blank_frame(1024, 1024), Some(&mask)).await.unwrap();
        assert_eq!(extraction.path, ExtractionPath::Consensus);
        assert_eq!(extraction.piece_count, 3);
        assert_eq!(detector.calls(), 8);
    }
}
