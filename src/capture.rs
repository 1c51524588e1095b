//! Capture module
//! Frame sources (`xcap` screen capture of the primary display, or a still image
//! re-read on every tick) plus the `FrameHub`, the single owning reader of the
//! device. The hub's publisher task is the only code that touches the source;
//! every other task receives immutable `Arc<Frame>` snapshots over a watch channel.

use anyhow::{Context, Result, bail};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xcap::Monitor;

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, FrameSource};

/// Optional crop applied to each screen capture (x, y, width, height in pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    fn check_within(&self, screen_w: u32, screen_h: u32) -> PipelineResult<()> {
        if self.width < 64 || self.height < 64 {
            return Err(PipelineError::Capture(
                "capture region too small for a chessboard (min 64x64 pixels)".to_string(),
            ));
        }
        if self.x >= screen_w
            || self.y >= screen_h
            || self.x.saturating_add(self.width) > screen_w
            || self.y.saturating_add(self.height) > screen_h
        {
            return Err(PipelineError::Capture(format!(
                "capture region ({},{},{},{}) exceeds screenshot dimensions {}x{}",
                self.x, self.y, self.width, self.height, screen_w, screen_h
            )));
        }
        Ok(())
    }
}

/// Captures a monitor (for a broadcast playing in a window or an HDMI preview).
/// On macOS, grant "Screen & System Audio Recording" permission to the terminal.
pub struct ScreenSource {
    monitor_index: usize,
    region: Option<CaptureRegion>,
}

impl ScreenSource {
    pub fn new(monitor_index: usize, region: Option<CaptureRegion>) -> Self {
        Self {
            monitor_index,
            region,
        }
    }
}

impl FrameSource for ScreenSource {
    fn name(&self) -> &str {
        "screen"
    }

    fn read(&self) -> PipelineResult<DynamicImage> {
        let monitors = Monitor::all()
            .map_err(|e| PipelineError::Capture(format!("failed to enumerate monitors: {e}")))?;

        let monitor = monitors.get(self.monitor_index).ok_or_else(|| {
            PipelineError::Capture(format!(
                "monitor {} not found ({} available)",
                self.monitor_index,
                monitors.len()
            ))
        })?;

        let raw = monitor.capture_image().map_err(|e| {
            PipelineError::Capture(format!(
                "failed to capture image (check screen recording permission): {e}"
            ))
        })?;

        let screenshot = DynamicImage::ImageRgba8(raw);
        let (screen_w, screen_h) = screenshot.dimensions();
        if (screen_w, screen_h) == (0, 0) {
            return Err(PipelineError::Capture(
                "captured empty screenshot - possible permission issue or no display".to_string(),
            ));
        }

        match self.region {
            Some(region) => {
                region.check_within(screen_w, screen_h)?;
                Ok(screenshot.crop_imm(region.x, region.y, region.width, region.height))
            }
            None => Ok(screenshot),
        }
    }
}

/// Re-reads an image file on every call, so an external grabber can keep
/// overwriting it (e.g. `screenshots/current_board.png`).
pub struct ImageFileSource {
    path: PathBuf,
    label: String,
}

impl ImageFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = format!("file:{}", path.display());
        Self { path, label }
    }
}

impl FrameSource for ImageFileSource {
    fn name(&self) -> &str {
        &self.label
    }

    fn read(&self) -> PipelineResult<DynamicImage> {
        image::open(&self.path).map_err(|e| {
            PipelineError::Capture(format!("failed to read {}: {e}", self.path.display()))
        })
    }
}

/// Read side of the device: cheap to clone, one per consuming task.
#[derive(Clone)]
pub struct FrameHub {
    rx: watch::Receiver<Option<Arc<Frame>>>,
    frame_timeout: Duration,
}

/// Write side of the device, owned by exactly one task.
pub struct FramePublisher {
    tx: watch::Sender<Option<Arc<Frame>>>,
    seq: u64,
}

impl FrameHub {
    pub fn new(frame_timeout: Duration) -> (FrameHub, FramePublisher) {
        let (tx, rx) = watch::channel(None);
        (FrameHub { rx, frame_timeout }, FramePublisher { tx, seq: 0 })
    }

    /// Most recent published frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().clone()
    }

    /// Waits for the next frame published after this call.
    pub async fn fresh(&self) -> PipelineResult<Arc<Frame>> {
        let mut rx = self.rx.clone();
        rx.borrow_and_update();

        match tokio::time::timeout(self.frame_timeout, rx.changed()).await {
            Ok(Ok(())) => rx
                .borrow()
                .clone()
                .ok_or_else(|| PipelineError::Capture("no frame published".to_string())),
            Ok(Err(_)) => Err(PipelineError::Device("frame publisher stopped".to_string())),
            Err(_) => Err(PipelineError::Capture(format!(
                "no frame within {:?}",
                self.frame_timeout
            ))),
        }
    }
}

impl FramePublisher {
    pub fn publish(&mut self, image: DynamicImage) -> Arc<Frame> {
        self.seq += 1;
        let frame = Arc::new(Frame::new(image, self.seq));
        self.tx.send_replace(Some(Arc::clone(&frame)));
        frame
    }

    /// Reads the device at a fixed interval until cancelled. Isolated read
    /// failures are logged; `max_failures` consecutive failures are fatal.
    pub async fn run(
        mut self,
        source: Arc<dyn FrameSource>,
        interval: Duration,
        max_failures: u32,
        token: CancellationToken,
    ) -> Result<()> {
        info!(source = source.name(), ?interval, "frame publisher started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let reader = Arc::clone(&source);
                    let read = tokio::task::spawn_blocking(move || reader.read())
                        .await
                        .context("capture thread panicked")?;

                    match read {
                        Ok(image) => {
                            consecutive_failures = 0;
                            let frame = self.publish(image);
                            debug!(seq = frame.seq, latency = ?start.elapsed(), "frame captured");
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            warn!(error = %err, consecutive_failures, "frame read failed");
                            if consecutive_failures >= max_failures {
                                bail!(PipelineError::Device(format!(
                                    "{} consecutive read failures from {}: {}",
                                    consecutive_failures,
                                    source.name(),
                                    err
                                )));
                            }
                        }
                    }
                }
                _ = token.cancelled() => {
                    info!(source = source.name(), "frame publisher stopped, releasing capture device");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticSource;
    use image::RgbaImage;

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(w, h))
    }

    #[test]
    fn test_region_bounds_checked() {
        let region = CaptureRegion { x: 200, y: 300, width: 480, height: 480 };
        assert!(region.check_within(1920, 1080).is_ok());
        assert!(region.check_within(600, 600).is_err());

        let tiny = CaptureRegion { x: 0, y: 0, width: 32, height: 32 };
        assert!(tiny.check_within(1920, 1080).is_err());
    }

    #[tokio::test]
    async fn test_fresh_waits_for_next_frame() {
        let (hub, mut publisher) = FrameHub::new(Duration::from_secs(2));
        publisher.publish(blank(8, 8));

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.fresh().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(blank(16, 16));

        let frame = waiter.await.unwrap().expect("fresh frame");
        assert_eq!(frame.seq, 2);
        assert_eq!(frame.dimensions(), (16, 16));
        assert_eq!(hub.latest().map(|f| f.seq), Some(2));
    }

    #[tokio::test]
    async fn test_fresh_times_out_as_capture_failure() {
        let (hub, _publisher) = FrameHub::new(Duration::from_millis(20));
        let err = hub.fresh().await.unwrap_err();
        assert!(matches!(err, PipelineError::Capture(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_fresh_reports_stopped_publisher_as_fatal() {
        let (hub, publisher) = FrameHub::new(Duration::from_secs(1));
        drop(publisher);
        let err = hub.fresh().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_publisher_gives_up_after_consecutive_failures() {
        let (_hub, publisher) = FrameHub::new(Duration::from_secs(1));
        let source: Arc<dyn FrameSource> = Arc::new(StaticSource::failing());
        let result = publisher
            .run(source, Duration::from_millis(1), 3, CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publisher_stops_on_cancel() {
        let (hub, publisher) = FrameHub::new(Duration::from_secs(1));
        let source: Arc<dyn FrameSource> = Arc::new(StaticSource::new(blank(8, 8)));
        let token = CancellationToken::new();
        let task = tokio::spawn(publisher.run(source, Duration::from_millis(5), 3, token.clone()));

        let frame = hub.fresh().await.expect("published frame");
        assert!(frame.seq >= 1);

        token.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    #[ignore = "requires graphical display and screen recording permissions"]
    fn test_screen_capture_dimensions() {
        let img = ScreenSource::new(0, None).read().expect("screen capture failed");
        let (w, h) = img.dimensions();
        assert!(w > 0 && h > 0, "captured image has invalid dimensions {}x{}", w, h);
    }
}
