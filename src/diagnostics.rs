//! Debug image output (`--debug`).
//! Saves fast-path crops and rendered board snapshots with timestamped names.
//! Write failures are logged and never interrupt the pipeline.

use chrono::Utc;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
use imageproc::rect::Rect;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::fen::board_rows;

const LIGHT_SQUARE: Rgb<u8> = Rgb([238, 238, 210]);
const DARK_SQUARE: Rgb<u8> = Rgb([118, 150, 86]);
const WHITE_PIECE: Rgb<u8> = Rgb([250, 250, 250]);
const BLACK_PIECE: Rgb<u8> = Rgb([20, 20, 20]);

#[derive(Debug, Clone, Default)]
pub struct DebugSink {
    dir: Option<PathBuf>,
}

impl DebugSink {
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn save_image(&self, label: &str, image: &DynamicImage) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let path = dir.join(format!("{}_{}.png", label, Utc::now().format("%H%M%S_%3f")));
        match image.save(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "saved debug image");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to save debug image");
                None
            }
        }
    }

    pub fn save_board_snapshot(&self, fen: &str) -> Option<PathBuf> {
        if !self.is_enabled() {
            return None;
        }
        let board = DynamicImage::ImageRgb8(render_board_image(fen, 48));
        self.save_image("board", &board)
    }
}

/// Draws the position as an 8x8 board: light/dark squares, pieces as discs
/// sized by role (white filled light, black filled dark).
pub fn render_board_image(fen: &str, square_px: u32) -> RgbImage {
    let size = square_px * 8;
    let mut img = RgbImage::new(size, size);

    for (row, squares) in board_rows(fen).iter().enumerate().take(8) {
        for file in 0..8usize {
            let x = (file as u32 * square_px) as i32;
            let y = (row as u32 * square_px) as i32;
            let color = if (row + file) % 2 == 0 { LIGHT_SQUARE } else { DARK_SQUARE };
            draw_filled_rect_mut(&mut img, Rect::at(x, y).of_size(square_px, square_px), color);

            let Some(piece) = squares.get(file).copied().flatten() else {
                continue;
            };
            let center = (x + square_px as i32 / 2, y + square_px as i32 / 2);
            let radius = piece_radius(piece, square_px);
            let (fill, outline) = if piece.is_ascii_uppercase() {
                (WHITE_PIECE, BLACK_PIECE)
            } else {
                (BLACK_PIECE, WHITE_PIECE)
            };
            draw_filled_circle_mut(&mut img, center, radius, fill);
            draw_hollow_circle_mut(&mut img, center, radius, outline);
        }
    }
    img
}

fn piece_radius(piece: char, square_px: u32) -> i32 {
    let scale = match piece.to_ascii_lowercase() {
        'k' => 0.44,
        'q' => 0.40,
        'r' => 0.34,
        'b' | 'n' => 0.30,
        _ => 0.22,
    };
    (square_px as f32 * scale) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_board_image_colors() {
        let img = render_board_image("k7/8/8/8/8/8/8/7K", 40);
        assert_eq!(img.dimensions(), (320, 320));
        // a8 holds a black king: disc center is dark
        assert_eq!(*img.get_pixel(20, 20), BLACK_PIECE);
        // h1 holds a white king
        assert_eq!(*img.get_pixel(300, 300), WHITE_PIECE);
        // b8 is an empty dark square
        assert_eq!(*img.get_pixel(60, 20), DARK_SQUARE);
    }

    #[test]
    fn test_disabled_sink_writes_nothing() {
        let sink = DebugSink::disabled();
        assert!(sink.save_board_snapshot("8/8/8/8/8/8/8/8").is_none());
    }

    #[test]
    fn test_enabled_sink_writes_png() {
        let dir = std::env::temp_dir().join(format!("zugzwang-debug-{}", std::process::id()));
        let sink = DebugSink::new(&dir).unwrap();
        let path = sink.save_board_snapshot("4k3/8/8/8/8/8/8/4K3").expect("saved");
        assert!(path.exists());
        fs::remove_dir_all(&dir).ok();
    }
}
