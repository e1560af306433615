//! Layout strings: the piece-placement field of a FEN, without side to move,
//! castling or move counters. Helpers to build them from per-square labels,
//! shorten/expand empty runs, validate, and undo a board seen from black's side.

use anyhow::{Result, bail};

/// Classifier label alphabet; index 0 is an empty square.
pub const PIECE_LABELS: &[u8; 13] = b" KQRBNPkqrbnp";

/// Which side of the board faces the camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perspective {
    White,
    Black,
}

/// Builds a layout from 64 labels ordered a1, b1, ..., h8 (rank-major from
/// the bottom of the image).
pub fn layout_from_labels(labels: &[usize]) -> Result<String> {
    if labels.len() != 64 {
        bail!("Expected 64 square labels, got {}", labels.len());
    }
    let mut ranks = Vec::with_capacity(8);
    for rank in (0..8).rev() {
        let mut row = String::with_capacity(8);
        for &label in &labels[rank * 8..rank * 8 + 8] {
            match label {
                0 => row.push('1'),
                1..=12 => row.push(PIECE_LABELS[label] as char),
                _ => bail!("Unknown square label {}", label),
            }
        }
        ranks.push(row);
    }
    Ok(shorten(&ranks.join("/")))
}

/// Expands a rank (e.g. "r3k2r" -> "r...k..r").
pub fn expand_rank(rank: &str) -> String {
    let mut result = String::with_capacity(8);
    for c in rank.chars() {
        if let Some(n) = c.to_digit(10) {
            result.push_str(&".".repeat(n as usize));
        } else {
            result.push(c);
        }
    }
    result
}

/// Collapses runs of empty squares into digits ("111p11Q" -> "3p2Q").
pub fn shorten(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len());
    let mut empty = 0u32;
    for c in layout.chars() {
        match c.to_digit(10) {
            Some(n) => empty += n,
            None if c == '.' => empty += 1,
            None => {
                if empty > 0 {
                    out.push_str(&empty.to_string());
                    empty = 0;
                }
                out.push(c);
            }
        }
    }
    if empty > 0 {
        out.push_str(&empty.to_string());
    }
    out
}

/// Guesses the camera side from piece distribution: more white pieces in the
/// top half, or more black pieces in the bottom half, means black at the bottom.
pub fn predict_perspective(layout: &str) -> Perspective {
    let ranks: Vec<&str> = layout.split('/').collect();
    let split = ranks.len().min(4);
    let count = |part: &[&str], pred: fn(&char) -> bool| -> usize {
        part.iter()
            .flat_map(|rank| rank.chars())
            .filter(|c| c.is_ascii_alphabetic())
            .filter(pred)
            .count()
    };
    let (top, bottom) = ranks.split_at(split);
    let top_white = count(top, char::is_ascii_uppercase);
    let bottom_white = count(bottom, char::is_ascii_uppercase);
    let top_black = count(top, char::is_ascii_lowercase);
    let bottom_black = count(bottom, char::is_ascii_lowercase);

    if top_white > bottom_white || top_black < bottom_black {
        Perspective::Black
    } else {
        Perspective::White
    }
}

/// Rotates the board 180 degrees.
pub fn rotate(layout: &str) -> String {
    let ranks: Vec<String> = layout
        .split('/')
        .rev()
        .map(|rank| rank.chars().rev().collect())
        .collect();
    shorten(&ranks.join("/"))
}

/// Returns the layout as seen from white's side.
pub fn normalize_orientation(layout: &str) -> String {
    match predict_perspective(layout) {
        Perspective::White => shorten(layout),
        Perspective::Black => rotate(layout),
    }
}

/// Rejects layouts no game can reach in the ways recognizers usually get
/// wrong, then checks the syntax with shakmaty. Returns the shortened layout.
pub fn validate_layout(layout: &str) -> Result<String> {
    let layout = layout.trim();
    let white_kings = layout.chars().filter(|&c| c == 'K').count();
    let black_kings = layout.chars().filter(|&c| c == 'k').count();
    if white_kings != 1 || black_kings != 1 {
        bail!(
            "Invalid layout: expected exactly 1 king per side, got {} white kings and {} black kings (received: '{}')",
            white_kings,
            black_kings,
            layout
        );
    }

    let white_pawns = layout.chars().filter(|&c| c == 'P').count();
    let black_pawns = layout.chars().filter(|&c| c == 'p').count();
    if white_pawns > 8 {
        bail!("Invalid layout: White has {} pawns (max 8) (received: '{}')", white_pawns, layout);
    }
    if black_pawns > 8 {
        bail!("Invalid layout: Black has {} pawns (max 8) (received: '{}')", black_pawns, layout);
    }

    let shortened = shorten(layout);
    let fen = format!("{} w - - 0 1", shortened);
    shakmaty::fen::Fen::from_ascii(fen.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid layout syntax: {} (received: '{}')", e, layout))?;
    Ok(shortened)
}
