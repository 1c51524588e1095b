//! Vision service seam.
//! `Segmenter` finds the board, `PieceDetector` classifies pieces in one call.
//! `RoboflowClient` implements both against the Roboflow hosted inference API
//! (base64 JPEG body, JSON predictions back). Requires ROBOFLOW_API_KEY.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::VisionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::encode_jpeg;

// *************** Prediction Types ***************

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// One detection in the pixel space of the submitted image. `x`/`y` are the
/// box center; segmentation models also return a polygon in `points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(rename = "class", default)]
    pub class_name: String,
    #[serde(default)]
    pub points: Vec<Point>,
}

/// Axis-aligned box in integer pixel coordinates (x_max/y_max exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl BBox {
    pub fn width(&self) -> u32 {
        self.x_max.saturating_sub(self.x_min)
    }

    pub fn height(&self) -> u32 {
        self.y_max.saturating_sub(self.y_min)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersection with a `width` x `height` canvas.
    pub fn clamped(&self, width: u32, height: u32) -> BBox {
        BBox {
            x_min: self.x_min.min(width),
            y_min: self.y_min.min(height),
            x_max: self.x_max.min(width),
            y_max: self.y_max.min(height),
        }
    }
}

#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, image: &DynamicImage) -> PipelineResult<Vec<Prediction>>;
}

#[async_trait]
pub trait PieceDetector: Send + Sync {
    async fn detect(&self, image: &DynamicImage, model_id: &str) -> PipelineResult<Vec<Prediction>>;
}

/// Picks the most confident board prediction and turns it into a bbox clamped
/// to the `width` x `height` image it was computed on. Polygon points win over
/// the center/size box when present.
pub fn extract_bbox(predictions: &[Prediction], width: u32, height: u32) -> Option<(BBox, f32)> {
    let best = predictions
        .iter()
        .filter(|p| p.confidence.is_finite())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;

    let (x_min, y_min, x_max, y_max) = if best.points.len() >= 3 {
        best.points.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(x0, y0, x1, y1), p| (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)),
        )
    } else {
        (
            best.x - best.width / 2.0,
            best.y - best.height / 2.0,
            best.x + best.width / 2.0,
            best.y + best.height / 2.0,
        )
    };

    let to_px = |v: f32, limit: u32| v.round().clamp(0.0, limit as f32) as u32;
    let bbox = BBox {
        x_min: to_px(x_min, width),
        y_min: to_px(y_min, height),
        x_max: to_px(x_max, width),
        y_max: to_px(y_max, height),
    };

    if bbox.is_empty() {
        return None;
    }
    Some((bbox, best.confidence))
}

// *************** Roboflow Client ***************

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

pub struct RoboflowClient {
    client: Client,
    api_key: String,
    detect_url: String,
    segment_url: String,
    segmentation_model: String,
    max_retries: u32,
}

impl RoboflowClient {
    pub fn new(api_key: String, config: &VisionConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            detect_url: config.detect_url.trim_end_matches('/').to_string(),
            segment_url: config.segment_url.trim_end_matches('/').to_string(),
            segmentation_model: config.segmentation_model.clone(),
            max_retries: config.max_retries,
        })
    }

    async fn infer_with_retry(&self, base_url: &str, model_id: &str, image: &DynamicImage) -> Result<Vec<Prediction>> {
        let body = encode_jpeg(image)?.data;
        let url = format!("{base_url}/{model_id}");

        let mut last_error = None;
        for attempt in 1..=self.max_retries + 1 {
            match self.infer(&url, &body).await {
                Ok(predictions) => {
                    debug!(model_id, attempt, count = predictions.len(), "inference complete");
                    return Ok(predictions);
                }
                Err(e) => {
                    warn!(model_id, attempt, error = %e, "vision API call failed");
                    last_error = Some(e);
                    if attempt <= self.max_retries {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no inference attempt made")))
    }

    /// The key travels as a query parameter, so every reqwest error has its
    /// URL stripped before it can reach a log line.
    async fn infer(&self, url: &str, body: &str) -> Result<Vec<Prediction>> {
        let response = self
            .client
            .post(url)
            .query(&[("api_key", self.api_key.as_str())])
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.to_string())
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send request to vision API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("vision API error {}: {}", status, body);
        }

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to parse vision API response")?;
        Ok(parsed.predictions)
    }
}

#[async_trait]
impl Segmenter for RoboflowClient {
    async fn segment(&self, image: &DynamicImage) -> PipelineResult<Vec<Prediction>> {
        self.infer_with_retry(&self.segment_url, &self.segmentation_model, image)
            .await
            .map_err(|e| PipelineError::Segmentation(format!("{e:#}")))
    }
}

#[async_trait]
impl PieceDetector for RoboflowClient {
    async fn detect(&self, image: &DynamicImage, model_id: &str) -> PipelineResult<Vec<Prediction>> {
        let (w, h) = image.dimensions();
        debug!(model_id, w, h, "piece detection request");
        self.infer_with_retry(&self.detect_url, model_id, image)
            .await
            .map_err(|e| PipelineError::Detection(format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_prediction(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Prediction {
        Prediction {
            x,
            y,
            width: w,
            height: h,
            confidence,
            class_name: "board".to_string(),
            points: Vec::new(),
        }
    }

    #[test]
    fn test_extract_bbox_from_center_box() {
        let preds = vec![board_prediction(512.0, 400.0, 600.0, 600.0, 0.9)];
        let (bbox, confidence) = extract_bbox(&preds, 1024, 1024).expect("bbox");
        assert_eq!(bbox, BBox { x_min: 212, y_min: 100, x_max: 812, y_max: 700 });
        assert!((confidence - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_extract_bbox_prefers_polygon_and_highest_confidence() {
        let mut polygon = board_prediction(0.0, 0.0, 10.0, 10.0, 0.95);
        polygon.points = vec![
            Point { x: 100.0, y: 120.0 },
            Point { x: 700.0, y: 110.0 },
            Point { x: 710.0, y: 690.0 },
            Point { x: 90.0, y: 700.0 },
        ];
        let weaker = board_prediction(500.0, 500.0, 200.0, 200.0, 0.4);

        let (bbox, confidence) = extract_bbox(&[weaker, polygon], 1024, 1024).expect("bbox");
        assert_eq!(bbox, BBox { x_min: 90, y_min: 110, x_max: 710, y_max: 700 });
        assert!((confidence - 0.95).abs() < f32::EPSILON);
    }

    #[test]
    fn test_extract_bbox_clamps_to_canvas() {
        let preds = vec![board_prediction(1000.0, 20.0, 200.0, 100.0, 0.8)];
        let (bbox, _) = extract_bbox(&preds, 1024, 1024).expect("bbox");
        assert_eq!(bbox, BBox { x_min: 900, y_min: 0, x_max: 1024, y_max: 70 });
    }

    #[test]
    fn test_extract_bbox_rejects_empty_inputs() {
        assert!(extract_bbox(&[], 1024, 1024).is_none());
        let degenerate = vec![board_prediction(50.0, 50.0, 0.0, 40.0, 0.9)];
        assert!(extract_bbox(&degenerate, 1024, 1024).is_none());
    }

    #[tokio::test]
    async fn test_transport_error_does_not_leak_api_key() {
        // nothing listens on the discard port
        let config = VisionConfig {
            detect_url: "http://127.0.0.1:9".to_string(),
            segment_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            max_retries: 0,
            ..VisionConfig::default()
        };
        let client = RoboflowClient::new("SECRET_KEY_123".to_string(), &config).unwrap();
        let image = DynamicImage::ImageRgb8(image::RgbImage::new(16, 16));

        let err = client.detect(&image, "chess.comdetection/4").await.unwrap_err();
        assert!(matches!(err, PipelineError::Detection(_)));
        assert!(!err.to_string().contains("SECRET_KEY_123"), "{err}");

        let err = client.segment(&image).await.unwrap_err();
        assert!(matches!(err, PipelineError::Segmentation(_)));
        assert!(!err.to_string().contains("SECRET_KEY_123"), "{err}");
    }

    #[test]
    fn test_prediction_parses_roboflow_json() {
        let json = r#"{"predictions":[{"x":10.5,"y":20.0,"width":30,"height":40,"confidence":0.87,"class":"white-king","class_id":3}]}"#;
        let parsed: InferenceResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(parsed.predictions.len(), 1);
        assert_eq!(parsed.predictions[0].class_name, "white-king");
        assert!(parsed.predictions[0].points.is_empty());
    }
}
