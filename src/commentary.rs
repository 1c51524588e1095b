//! Rolling commentary context for the analyzer.
//! Only finalized transcript lines are kept, newest last, capped at
//! `COMMENTARY_CAPACITY`. The buffer is never cleared on a position change so
//! the narrative carries across moves.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const COMMENTARY_CAPACITY: usize = 10;

pub struct CommentaryBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for CommentaryBuffer {
    fn default() -> Self {
        Self::with_capacity(COMMENTARY_CAPACITY)
    }
}

impl CommentaryBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity + 1)),
            capacity: capacity.max(1),
        }
    }

    /// Appends a finalized line, evicting the oldest past capacity. Blank
    /// lines are ignored. Returns the new length.
    pub fn push_final(&self, line: &str) -> usize {
        let line = line.trim();
        let mut lines = self.lines.lock();
        if line.is_empty() {
            return lines.len();
        }
        lines.push_back(line.to_string());
        while lines.len() > self.capacity {
            lines.pop_front();
        }
        lines.len()
    }

    /// Copy of the buffer in arrival order.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

impl TranscriptEvent {
    /// Parses one line of an external transcription feed:
    /// `final: text`, `partial: text`, or plain text (treated as final).
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (text, is_final) = if let Some(rest) = line.strip_prefix("partial:") {
            (rest, false)
        } else if let Some(rest) = line.strip_prefix("final:") {
            (rest, true)
        } else {
            (line, true)
        };
        Some(Self {
            text: text.trim().to_string(),
            is_final,
        })
    }
}

/// Moves finalized transcript events into the buffer until the channel
/// closes or the token is cancelled.
pub async fn ingest_transcripts(
    mut rx: mpsc::Receiver<TranscriptEvent>,
    buffer: Arc<CommentaryBuffer>,
    token: CancellationToken,
) -> Result<()> {
    let mut received = 0u64;
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = token.cancelled() => break,
        };
        let Some(event) = event else { break };

        if !event.is_final || event.text.trim().is_empty() {
            continue;
        }
        received += 1;
        let len = buffer.push_final(&event.text);
        debug!(received, len, latest = %event.text, "commentary buffered");
    }
    info!(received, "transcript ingestion stopped");
    Ok(())
}

/// Tails a transcript file (or FIFO) written by an external speech-to-text
/// process, forwarding each parsed line.
pub async fn read_transcript_feed(
    path: PathBuf,
    tx: mpsc::Sender<TranscriptEvent>,
    token: CancellationToken,
) -> Result<()> {
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Failed to open transcript feed {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    info!(path = %path.display(), "reading transcript feed");

    loop {
        let next = tokio::select! {
            next = lines.next_line() => next.context("Failed to read transcript feed")?,
            _ = token.cancelled() => break,
        };
        match next {
            Some(line) => {
                if let Some(event) = TranscriptEvent::parse_line(&line) {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            // at EOF keep polling for appended lines
            None => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
    Ok(())
}
