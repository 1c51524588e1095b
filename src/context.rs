//! Shared pipeline state, owned by one `PipelineContext` and handed to every
//! task as an `Arc`. Locks are held only long enough to clone or swap a value.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::analyzer::AnalysisResult;
use crate::commentary::CommentaryBuffer;
use crate::mask::BoardMaskCache;

/// Last confirmed position. `position` starts unset and only ever holds a
/// validated board string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardState {
    pub position: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

pub struct PipelineContext {
    board: RwLock<BoardState>,
    analysis: RwLock<Option<Arc<AnalysisResult>>>,
    pending_query: Mutex<Option<String>>,
    watching: AtomicBool,
    pub commentary: Arc<CommentaryBuffer>,
    pub mask: Arc<BoardMaskCache>,
}

impl PipelineContext {
    pub fn new(mask: Arc<BoardMaskCache>, commentary: Arc<CommentaryBuffer>, watching: bool) -> Self {
        Self {
            board: RwLock::new(BoardState::default()),
            analysis: RwLock::new(None),
            pending_query: Mutex::new(None),
            watching: AtomicBool::new(watching),
            commentary,
            mask,
        }
    }

    pub fn board(&self) -> BoardState {
        self.board.read().clone()
    }

    /// Stores `position` and returns the previous one.
    pub fn set_position(&self, position: String) -> Option<String> {
        let mut board = self.board.write();
        board.last_updated = Some(Utc::now());
        board.position.replace(position)
    }

    pub fn latest_analysis(&self) -> Option<Arc<AnalysisResult>> {
        self.analysis.read().clone()
    }

    pub fn store_analysis(&self, result: AnalysisResult) {
        *self.analysis.write() = Some(Arc::new(result));
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Returns the previous mode.
    pub fn set_watching(&self, on: bool) -> bool {
        self.watching.swap(on, Ordering::SeqCst)
    }

    /// Question asked before any analysis existed; answered with the next
    /// inspection that has none of its own.
    pub fn set_pending_query(&self, query: Option<String>) {
        *self.pending_query.lock() = query.filter(|q| !q.trim().is_empty());
    }

    pub fn take_pending_query(&self) -> Option<String> {
        self.pending_query.lock().take()
    }
}
