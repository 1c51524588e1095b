//! Scene-change monitoring.
//! `DiffSceneDetector` compares a tiny grayscale thumbnail of each frame with a
//! rolling baseline (pixel difference + luma histogram overlap) and reports a
//! change after `confirm_frames` consecutive differing frames. Small changes
//! such as a piece moving stay under the threshold and fold into the baseline.

use image::imageops::FilterType;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capture::FrameHub;
use crate::config::SceneConfig;
use crate::frame::Frame;

const SAMPLE_SIZE: (u32, u32) = (32, 18);
const HISTOGRAM_BINS: usize = 64;

pub trait SceneChangeDetector: Send {
    /// Feeds one frame; returns true when the view changed materially.
    fn observe(&mut self, frame: &Frame) -> bool;
}

struct Signature {
    luma: Vec<u8>,
    histogram: [u32; HISTOGRAM_BINS],
}

impl Signature {
    fn of(frame: &Frame) -> Self {
        let luma = frame
            .image
            .resize_exact(SAMPLE_SIZE.0, SAMPLE_SIZE.1, FilterType::Triangle)
            .to_luma8()
            .into_raw();
        let mut histogram = [0u32; HISTOGRAM_BINS];
        for &v in &luma {
            histogram[(v >> 2) as usize] += 1;
        }
        Self { luma, histogram }
    }

    /// 0 = identical, 1 = completely different.
    fn distance(&self, other: &Signature) -> f32 {
        if self.luma.is_empty() || self.luma.len() != other.luma.len() {
            return 1.0;
        }
        let pixel_diff: u32 = self
            .luma
            .iter()
            .zip(&other.luma)
            .map(|(a, b)| a.abs_diff(*b) as u32)
            .sum();
        let pixel_score = pixel_diff as f32 / (self.luma.len() as f32 * 255.0);

        let overlap: u32 = self
            .histogram
            .iter()
            .zip(other.histogram.iter())
            .map(|(a, b)| *a.min(b))
            .sum();
        let total = self.luma.len() as f32;
        let histogram_score = 1.0 - overlap as f32 / total;

        pixel_score * 0.5 + histogram_score * 0.5
    }
}

pub struct DiffSceneDetector {
    threshold: f32,
    confirm_frames: u32,
    baseline: Option<Signature>,
    pending: u32,
}

impl DiffSceneDetector {
    pub fn new(config: &SceneConfig) -> Self {
        Self {
            threshold: config.threshold,
            confirm_frames: config.confirm_frames.max(1),
            baseline: None,
            pending: 0,
        }
    }
}

impl SceneChangeDetector for DiffSceneDetector {
    fn observe(&mut self, frame: &Frame) -> bool {
        let current = Signature::of(frame);
        let Some(baseline) = &self.baseline else {
            // first frame is covered by initial mask detection
            self.baseline = Some(current);
            return false;
        };

        let score = current.distance(baseline);
        if score <= self.threshold {
            self.pending = 0;
            self.baseline = Some(current);
            return false;
        }

        self.pending += 1;
        debug!(score, pending = self.pending, "frame differs from baseline");
        if self.pending >= self.confirm_frames {
            self.pending = 0;
            self.baseline = Some(current);
            return true;
        }
        false
    }
}

/// Feeds every published frame to `detector` and awaits `on_change` for each
/// detected change, so mask updates run one at a time in frame order.
pub async fn run_scene_monitor<F, Fut>(
    hub: FrameHub,
    mut detector: Box<dyn SceneChangeDetector>,
    mut on_change: F,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    F: FnMut(Arc<Frame>) -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    info!("scene detection started");
    loop {
        let frame = tokio::select! {
            frame = hub.fresh() => frame,
            _ = token.cancelled() => break,
        };

        match frame {
            Ok(frame) => {
                if detector.observe(&frame) {
                    info!(seq = frame.seq, "scene change detected");
                    on_change(frame).await;
                }
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => debug!(error = %err, "scene monitor skipped a frame"),
        }
    }
    info!("scene detection stopped");
    Ok(())
}
