//! Deep analysis seam.
//! The `Analyzer` produces one narrative per side for a position, given the
//! frame and recent commentary. `VisionAnalyzer` implements it with the OpenAI
//! chat-completions API (GPT-4o vision): each side is one request carrying the
//! FEN, the commentary window and the frame as a JPEG data URL.
//! Requires OPENAI_API_KEY; without it `UnavailableAnalyzer` is used and every
//! analysis fails cleanly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, Screenshot};

const MAX_API_RETRIES: u32 = 1;

/// Which side's viewpoint a narrative is framed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }

    /// Lenient parse of a model reply or user token ("White.", " black\n").
    pub fn parse(text: &str) -> Option<Side> {
        let word = text
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphabetic())
            .to_ascii_lowercase();
        match word.as_str() {
            "white" | "w" => Some(Side::White),
            "black" | "b" => Some(Side::Black),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerspectiveAnalysis {
    pub side: Side,
    pub position: String,
    pub evaluation_text: String,
    pub commentary: Vec<String>,
    pub user_query: Option<String>,
    pub formatted_narrative: String,
    #[serde(skip)]
    pub screenshot: Option<Screenshot>,
}

/// Most recent analysis; replaced wholesale, never merged.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub by_perspective: HashMap<Side, PerspectiveAnalysis>,
    pub source_position: String,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// The requested side's analysis, or white's when that side is missing.
    pub fn perspective(&self, side: Side) -> Option<(Side, &PerspectiveAnalysis)> {
        self.by_perspective
            .get(&side)
            .map(|a| (side, a))
            .or_else(|| self.by_perspective.get(&Side::White).map(|a| (Side::White, a)))
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze_both_perspectives(
        &self,
        position: &str,
        frame: &Frame,
        commentary: &[String],
    ) -> PipelineResult<AnalysisResult>;

    /// Free-text description of the broadcast overlay (names, clocks, turn).
    async fn extract_broadcast_context(&self, frame: &Frame) -> PipelineResult<String>;

    async fn determine_perspective(&self, query: &str, broadcast_context: &str) -> PipelineResult<Side>;
}

/// Text handed to the dialogue side for one perspective.
pub fn format_narrative(analysis: &PerspectiveAnalysis) -> String {
    let mut out = format!(
        "POSITION ANALYSIS ({} perspective)\nFEN: {}\n",
        analysis.side, analysis.position
    );
    if let Some(query) = analysis.user_query.as_deref().filter(|q| !q.trim().is_empty()) {
        out.push_str(&format!("\nUser question: {}\n", query.trim()));
    }
    out.push_str(&format!("\nEvaluation:\n{}\n", analysis.evaluation_text.trim()));
    if !analysis.commentary.is_empty() {
        out.push_str("\nRecent commentary:\n");
        for line in &analysis.commentary {
            out.push_str(&format!("- {line}\n"));
        }
    }
    out
}

/// Side named explicitly in a question ("what should White play?"); `None`
/// when neither or both are mentioned.
pub fn side_from_query(query: &str) -> Option<Side> {
    let lower = query.to_ascii_lowercase();
    match (lower.contains("white"), lower.contains("black")) {
        (true, false) => Some(Side::White),
        (false, true) => Some(Side::Black),
        _ => None,
    }
}

// *************** Request/Response Types ***************

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlDetail },
}

#[derive(Serialize)]
struct ImageUrlDetail {
    url: String,
    detail: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

// *************** Vision Analyzer ***************

pub struct VisionAnalyzer {
    client: Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl VisionAnalyzer {
    pub fn new(api_key: String, config: &AnalyzerConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key,
            api_url: config.api_url.clone(),
            model: config.model.clone(),
        })
    }

    fn build_request(&self, prompt: &str, screenshot: Option<&Screenshot>, max_tokens: u32) -> ChatRequest {
        let mut content = vec![ContentPart::Text {
            text: prompt.to_string(),
        }];
        if let Some(shot) = screenshot {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrlDetail {
                    url: format!("data:{};base64,{}", shot.mime_type, shot.data),
                    detail: "high".to_string(),
                },
            });
        }
        ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens,
        }
    }

    async fn complete(&self, request: &ChatRequest) -> PipelineResult<String> {
        let mut last_error = None;
        for attempt in 1..=MAX_API_RETRIES + 1 {
            match self.call_api(request).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(attempt, error = %e, "analyzer API call failed");
                    last_error = Some(e);
                    if attempt <= MAX_API_RETRIES {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
        Err(PipelineError::Analysis(
            last_error.map_or_else(|| "no attempt made".to_string(), |e| format!("{e:#}")),
        ))
    }

    async fn call_api(&self, request: &ChatRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .context("Failed to send request to OpenAI")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {}: {}", status, body);
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        api_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("No response from OpenAI"))
    }

    async fn analyze_side(
        &self,
        side: Side,
        position: &str,
        commentary: &[String],
        screenshot: Option<&Screenshot>,
    ) -> PipelineResult<PerspectiveAnalysis> {
        let prompt = build_analysis_prompt(side, position, commentary);
        let request = self.build_request(&prompt, screenshot, 600);
        let evaluation_text = self.complete(&request).await?;
        debug!(%side, chars = evaluation_text.len(), "perspective analysis received");

        let mut analysis = PerspectiveAnalysis {
            side,
            position: position.to_string(),
            evaluation_text,
            commentary: commentary.to_vec(),
            user_query: None,
            formatted_narrative: String::new(),
            screenshot: screenshot.cloned(),
        };
        analysis.formatted_narrative = format_narrative(&analysis);
        Ok(analysis)
    }
}

fn build_analysis_prompt(side: Side, position: &str, commentary: &[String]) -> String {
    let commentary = if commentary.is_empty() {
        "(no commentary yet)".to_string()
    } else {
        commentary.join("\n")
    };
    format!(
        r#"You are an expert chess commentator. Analyze this position from {side}'s point of view.

Board (FEN piece placement, rank 8 first): {position}

Recent broadcast commentary:
{commentary}

Rules:
- Give an evaluation (who is better and roughly by how much)
- Name the main plan and one or two candidate moves for {side}
- Point out tactical threats for both sides
- Keep it under 150 words, plain text, no markdown"#
    )
}

const BROADCAST_PROMPT: &str = "Describe the chess broadcast overlay in this image in one or two lines: \
player names with the colour each is playing, clocks, and whose turn it appears to be. \
Output only the description.";

#[async_trait]
impl Analyzer for VisionAnalyzer {
    async fn analyze_both_perspectives(
        &self,
        position: &str,
        frame: &Frame,
        commentary: &[String],
    ) -> PipelineResult<AnalysisResult> {
        let screenshot = match frame.to_screenshot() {
            Ok(shot) => Some(shot),
            Err(e) => {
                warn!(error = %e, "analysing without a screenshot");
                None
            }
        };

        let (white, black) = tokio::try_join!(
            self.analyze_side(Side::White, position, commentary, screenshot.as_ref()),
            self.analyze_side(Side::Black, position, commentary, screenshot.as_ref()),
        )?;

        Ok(AnalysisResult {
            by_perspective: HashMap::from([(Side::White, white), (Side::Black, black)]),
            source_position: position.to_string(),
            analyzed_at: Utc::now(),
        })
    }

    async fn extract_broadcast_context(&self, frame: &Frame) -> PipelineResult<String> {
        let screenshot = frame.to_screenshot()?;
        let request = self.build_request(BROADCAST_PROMPT, Some(&screenshot), 120);
        self.complete(&request).await
    }

    async fn determine_perspective(&self, query: &str, broadcast_context: &str) -> PipelineResult<Side> {
        if let Some(side) = side_from_query(query) {
            return Ok(side);
        }
        let prompt = format!(
            "Broadcast context: {broadcast_context}\nViewer question: {query}\n\
             Which side (white or black) is the question about? Answer with one word: white or black."
        );
        let request = self.build_request(&prompt, None, 5);
        let reply = self.complete(&request).await?;
        Side::parse(&reply)
            .ok_or_else(|| PipelineError::Analysis(format!("unrecognised perspective reply '{reply}'")))
    }
}

/// Stand-in when no analyzer credential is configured.
pub struct UnavailableAnalyzer {
    reason: String,
}

impl UnavailableAnalyzer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Analyzer for UnavailableAnalyzer {
    async fn analyze_both_perspectives(&self, _: &str, _: &Frame, _: &[String]) -> PipelineResult<AnalysisResult> {
        Err(PipelineError::Analysis(self.reason.clone()))
    }

    async fn extract_broadcast_context(&self, _: &Frame) -> PipelineResult<String> {
        Err(PipelineError::Analysis(self.reason.clone()))
    }

    async fn determine_perspective(&self, query: &str, _: &str) -> PipelineResult<Side> {
        side_from_query(query).ok_or_else(|| PipelineError::Analysis(self.reason.clone()))
    }
}
