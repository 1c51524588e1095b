//! Frame snapshots and the capture-device seam.
//! A `Frame` is an immutable image plus sequence number, shared as `Arc<Frame>`
//! by every consumer of the `FrameHub`. Board geometry is always computed in the
//! square `NORMALIZED_SIZE` space produced by `Frame::normalized`.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::error::{PipelineError, PipelineResult};

/// Side length of the canonical space used for segmentation and cropping.
pub const NORMALIZED_SIZE: u32 = 1024;
/// Input size expected by the piece detector.
pub const PIECE_INPUT_SIZE: u32 = 640;

#[derive(Debug, Clone)]
pub struct Frame {
    pub image: DynamicImage,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
}

/// Base64 JPEG attachment for analyzer and dialogue payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub mime_type: String,
    pub data: String,
}

impl Frame {
    pub fn new(image: DynamicImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: Utc::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Stretches the frame into the square normalized space (aspect is not kept,
    /// so bbox coordinates from segmentation map back onto the same pixels).
    pub fn normalized(&self) -> DynamicImage {
        self.image
            .resize_exact(NORMALIZED_SIZE, NORMALIZED_SIZE, FilterType::Lanczos3)
    }

    /// Downscales to fit within the normalized size, keeping aspect. Never upscales.
    pub fn thumbnail(&self) -> DynamicImage {
        let (w, h) = self.dimensions();
        if w <= NORMALIZED_SIZE && h <= NORMALIZED_SIZE {
            return self.image.clone();
        }
        self.image
            .resize(NORMALIZED_SIZE, NORMALIZED_SIZE, FilterType::Lanczos3)
    }

    pub fn to_screenshot(&self) -> PipelineResult<Screenshot> {
        encode_jpeg(&self.thumbnail())
    }
}

pub fn encode_jpeg(image: &DynamicImage) -> PipelineResult<Screenshot> {
    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut bytes = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .map_err(|e| PipelineError::Capture(format!("JPEG encoding failed: {e}")))?;

    Ok(Screenshot {
        mime_type: "image/jpeg".to_string(),
        data: general_purpose::STANDARD.encode(&bytes),
    })
}

/// A live video device. Implementations may block; the `FrameHub` calls `read`
/// from a blocking thread and is the only caller.
pub trait FrameSource: Send + Sync {
    fn name(&self) -> &str;
    fn read(&self) -> PipelineResult<DynamicImage>;
}
