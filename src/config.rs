//! Config module.
//! Manages I/O for zugzwang.json (source, cadences, vision models, thresholds).
//! Uses serde for JSON serialization; every field has a default so a missing
//! file or a partial file both work. CLI flags override file values.
//! Credentials come only from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::CaptureRegion;
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_CONFIG_PATH: &str = "zugzwang.json";
pub const VISION_KEY_VAR: &str = "ROBOFLOW_API_KEY";
pub const ANALYZER_KEY_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Screen {
        #[serde(default)]
        monitor: usize,
        #[serde(default)]
        region: Option<CaptureRegion>,
    },
    Image {
        path: PathBuf,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Screen {
            monitor: 0,
            region: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub detect_url: String,
    pub segment_url: String,
    pub segmentation_model: String,
    pub piece_model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            detect_url: "https://detect.roboflow.com".to_string(),
            segment_url: "https://outline.roboflow.com".to_string(),
            segmentation_model: "chessboard-segmentation/1".to_string(),
            piece_model: "chess.comdetection/4".to_string(),
            timeout_secs: 30,
            max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub passes: usize,
    pub min_consensus: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            passes: 7,
            min_consensus: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Combined difference score (0..1) above which a frame counts as a cut.
    pub threshold: f32,
    /// Consecutive differing frames required before the change fires.
    pub confirm_frames: u32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            confirm_frames: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub api_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub poll_interval_secs: u64,
    pub mask_wait_secs: u64,
    pub frame_interval_ms: u64,
    pub frame_timeout_ms: u64,
    pub max_capture_failures: u32,
    pub commentary_capacity: usize,
    pub watching: bool,
    pub debug: bool,
    pub debug_dir: PathBuf,
    pub vision: VisionConfig,
    pub consensus: ConsensusConfig,
    pub scene: SceneConfig,
    pub analyzer: AnalyzerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            poll_interval_secs: 5,
            mask_wait_secs: 2,
            frame_interval_ms: 250,
            frame_timeout_ms: 3000,
            max_capture_failures: 40,
            commentary_capacity: crate::commentary::COMMENTARY_CAPACITY,
            watching: true,
            debug: false,
            debug_dir: PathBuf::from("debug_chess_frames"),
            vision: VisionConfig::default(),
            consensus: ConsensusConfig::default(),
            scene: SceneConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn mask_wait(&self) -> Duration {
        Duration::from_secs(self.mask_wait_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(PipelineError::Config("poll_interval_secs must be > 0".into()));
        }
        if self.frame_interval_ms == 0 {
            return Err(PipelineError::Config("frame_interval_ms must be > 0".into()));
        }
        if self.max_capture_failures == 0 {
            return Err(PipelineError::Config("max_capture_failures must be > 0".into()));
        }
        if self.commentary_capacity == 0 {
            return Err(PipelineError::Config("commentary_capacity must be > 0".into()));
        }
        let ConsensusConfig { passes, min_consensus } = self.consensus;
        if min_consensus == 0 || min_consensus > passes {
            return Err(PipelineError::Config(format!(
                "consensus.min_consensus ({min_consensus}) must be between 1 and passes ({passes})"
            )));
        }
        if !(0.0..=1.0).contains(&self.scene.threshold) {
            return Err(PipelineError::Config("scene.threshold must be within 0..=1".into()));
        }
        Ok(())
    }
}

/// Loads config from `path`. A missing file at the default location yields
/// defaults; a missing file that was asked for explicitly is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    if !path.exists() {
        if explicit {
            anyhow::bail!("config file {} not found", path.display());
        }
        return Ok(Config::default());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, json).with_context(|| format!("Failed to write config {}", path.display()))
}

/// Vision credential; its absence is fatal before anything starts.
pub fn vision_api_key() -> PipelineResult<String> {
    read_key(VISION_KEY_VAR).ok_or(PipelineError::MissingCredential(VISION_KEY_VAR))
}

pub fn analyzer_api_key() -> Option<String> {
    read_key(ANALYZER_KEY_VAR)
}

fn read_key(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
