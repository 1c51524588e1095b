//! Position strings.
//! Converts piece detections into a board FEN by grid math (no API calls),
//! validates FEN syntax with shakmaty (no legality checks), and renders the
//! 8x8 text view logged on every position change.

use shakmaty::fen::Fen;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::vision::Prediction;

/// Board FEN of an empty board; detectors return it when they see nothing.
pub const EMPTY_BOARD: &str = "8/8/8/8/8/8/8/8";

/// Minimum detected pieces for a reading to be considered.
pub const MIN_PIECES: usize = 2;

/// Maps detector class labels to FEN piece letters. Accepts the naming
/// schemes our models use: `white-king`, `black_pawn`, `wk`, `bp`, or a bare
/// FEN letter. Returns `None` for non-piece classes (e.g. `board`).
pub fn piece_char(label: &str) -> Option<char> {
    let label = label.trim();
    if label.len() == 1 {
        let c = label.chars().next()?;
        return "KQRBNPkqrbnp".contains(c).then_some(c);
    }

    let lower = label.to_ascii_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c == '-' || c == '_' || c == ' ')
        .filter(|w| !w.is_empty())
        .collect();

    let (white, role) = match words.as_slice() {
        [color, role] => (
            match *color {
                "white" | "w" => true,
                "black" | "b" => false,
                _ => return None,
            },
            *role,
        ),
        [compact] if compact.len() == 2 => {
            let mut chars = compact.chars();
            let white = match chars.next()? {
                'w' => true,
                'b' => false,
                _ => return None,
            };
            return role_char(&chars.collect::<String>()).map(|c| if white { c.to_ascii_uppercase() } else { c });
        }
        _ => return None,
    };

    role_char(role).map(|c| if white { c.to_ascii_uppercase() } else { c })
}

fn role_char(role: &str) -> Option<char> {
    match role {
        "king" | "k" => Some('k'),
        "queen" | "q" => Some('q'),
        "rook" | "r" => Some('r'),
        "bishop" | "b" => Some('b'),
        "knight" | "n" => Some('n'),
        "pawn" | "p" => Some('p'),
        _ => None,
    }
}

/// Builds a board FEN from detections made on a `width` x `height` image that
/// shows exactly the board, rank 8 at the top. When two pieces land on the
/// same square the more confident one wins.
pub fn pieces_to_fen(predictions: &[Prediction], width: u32, height: u32, model_id: &str) -> String {
    if width == 0 || height == 0 {
        return EMPTY_BOARD.to_string();
    }

    let square_w = width as f32 / 8.0;
    let square_h = height as f32 / 8.0;
    let mut grid: [[Option<(char, f32)>; 8]; 8] = [[None; 8]; 8];

    for prediction in predictions {
        let Some(piece) = piece_char(&prediction.class_name) else {
            debug!(class = %prediction.class_name, model_id, "ignoring non-piece class");
            continue;
        };
        if !(prediction.x.is_finite() && prediction.y.is_finite()) {
            continue;
        }

        let file = ((prediction.x / square_w).floor().max(0.0) as usize).min(7);
        let row = ((prediction.y / square_h).floor().max(0.0) as usize).min(7);

        let wins = grid[row][file].is_none_or(|(_, confidence)| prediction.confidence > confidence);
        if wins {
            grid[row][file] = Some((piece, prediction.confidence));
        }
    }

    grid.iter()
        .map(|row| {
            let mut rank = String::new();
            let mut empty = 0;
            for square in row {
                match square {
                    Some((piece, _)) => {
                        if empty > 0 {
                            rank.push_str(&empty.to_string());
                            empty = 0;
                        }
                        rank.push(*piece);
                    }
                    None => empty += 1,
                }
            }
            if empty > 0 {
                rank.push_str(&empty.to_string());
            }
            rank
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Number of pieces on a board FEN.
pub fn count_pieces(fen: &str) -> usize {
    board_part(fen).chars().filter(|c| c.is_ascii_alphabetic()).count()
}

fn board_part(fen: &str) -> &str {
    fen.split_whitespace().next().unwrap_or("")
}

/// Syntactic validation only. Accepts a bare board FEN or a full FEN and
/// returns the board part, which is what the tracker compares.
pub fn validate_position(fen: &str) -> PipelineResult<String> {
    let trimmed = fen.trim();
    let board = board_part(trimmed);
    if board.is_empty() {
        return Err(PipelineError::validation(fen, "empty position string"));
    }

    let full = if trimmed.contains(char::is_whitespace) {
        trimmed.to_string()
    } else {
        format!("{board} w - - 0 1")
    };

    Fen::from_ascii(full.as_bytes()).map_err(|e| PipelineError::validation(fen, e.to_string()))?;

    Ok(board.to_string())
}

/// Expands a FEN rank ("r3k2r" stays, "8" becomes "........").
fn expand_rank(rank: &str) -> String {
    let mut result = String::new();
    for c in rank.chars() {
        if let Some(n) = c.to_digit(10) {
            result.push_str(&".".repeat(n as usize));
        } else {
            result.push(c);
        }
    }
    result
}

/// Squares of a validated board FEN, rank 8 first, `None` for empty.
pub fn board_rows(fen: &str) -> Vec<Vec<Option<char>>> {
    board_part(fen)
        .split('/')
        .map(|rank| {
            expand_rank(rank)
                .chars()
                .map(|c| (c != '.').then_some(c))
                .collect()
        })
        .collect()
}

/// 8x8 text diagram with file and rank labels.
pub fn render_board(fen: &str) -> String {
    let mut out = String::from("   a b c d e f g h\n");
    for (i, row) in board_rows(fen).iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .map(|sq| sq.map_or(".".to_string(), |c| c.to_string()))
            .collect();
        out.push_str(&format!("{}: {}\n", 8 - i, cells.join(" ")));
    }
    out
}
