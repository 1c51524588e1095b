//! Board mask cache.
//! Holds at most one `BoardMask` (bbox in the normalized 1024x1024 space plus
//! confidence and timestamp). The cache is either one complete, current mask
//! or nothing: every update replaces the `Arc` wholesale, and any failed
//! update clears it so extraction falls back instead of using stale geometry.

use chrono::{DateTime, Utc};
use image::GenericImageView;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::Frame;
use crate::vision::{BBox, Segmenter, extract_bbox};

#[derive(Debug, Clone, PartialEq)]
pub struct BoardMask {
    /// Always in `frame::NORMALIZED_SIZE` coordinates.
    pub bbox: BBox,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

pub struct BoardMaskCache {
    current: RwLock<Option<Arc<BoardMask>>>,
    segmenter: Arc<dyn Segmenter>,
}

impl BoardMaskCache {
    pub fn new(segmenter: Arc<dyn Segmenter>) -> Self {
        Self {
            current: RwLock::new(None),
            segmenter,
        }
    }

    /// Takes the current mask once; callers keep using this snapshot for a
    /// whole extraction even if a scene change swaps the cache meanwhile.
    pub fn snapshot(&self) -> Option<Arc<BoardMask>> {
        self.current.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_some()
    }

    /// Seeds the cache at startup. A failure leaves the cache empty, so the
    /// fast path stays disabled until a scene change produces a mask.
    pub async fn detect_initial(&self, frame: &Frame) -> PipelineResult<Arc<BoardMask>> {
        info!(seq = frame.seq, "detecting initial board location");
        self.refresh(frame).await
    }

    /// Re-segments unconditionally (scene-change callback). Success replaces
    /// the mask; any failure clears it.
    pub async fn update(&self, frame: &Frame) -> PipelineResult<Arc<BoardMask>> {
        info!(seq = frame.seq, "updating board bounding box");
        self.refresh(frame).await
    }

    async fn refresh(&self, frame: &Frame) -> PipelineResult<Arc<BoardMask>> {
        match self.segment_frame(frame).await {
            Ok(mask) => {
                let mask = Arc::new(mask);
                self.replace(Some(Arc::clone(&mask)));
                Ok(mask)
            }
            Err(err) => {
                warn!(error = %err, "board mask update failed, clearing cache");
                self.replace(None);
                Err(err)
            }
        }
    }

    fn replace(&self, mask: Option<Arc<BoardMask>>) {
        *self.current.write() = mask;
    }

    async fn segment_frame(&self, frame: &Frame) -> PipelineResult<BoardMask> {
        let start = Instant::now();
        let timestamp = Utc::now();
        let normalized = frame.normalized();
        let (width, height) = normalized.dimensions();

        let predictions = self.segmenter.segment(&normalized).await?;
        if predictions.is_empty() {
            return Err(PipelineError::Segmentation(
                "board segmentation found no predictions".to_string(),
            ));
        }

        let (bbox, confidence) = extract_bbox(&predictions, width, height).ok_or_else(|| {
            PipelineError::Segmentation("no valid bounding box extracted".to_string())
        })?;

        info!(?bbox, confidence, elapsed = ?start.elapsed(), "board mask cached");
        Ok(BoardMask {
            bbox,
            confidence,
            timestamp,
        })
    }
}

#[cfg(test)]
impl BoardMaskCache {
    pub fn with_mask(segmenter: Arc<dyn Segmenter>, bbox: BBox) -> Self {
        let cache = Self::new(segmenter);
        cache.replace(Some(Arc::new(BoardMask {
            bbox,
            confidence: 1.0,
            timestamp: Utc::now(),
        })));
        cache
    }
}
