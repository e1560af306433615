//! Classifier port.
//! Turns a [`TileGrid`] into a layout string. Implementations are swappable:
//! - [`LabelingClassifier`]: any per-square labeling model (e.g. a CNN over the 64 tiles)
//! - [`crate::vision_api::VisionApiClassifier`]: hosted vision model over the board image

use crate::layout;
use crate::tiles::TileGrid;
use anyhow::{Result, bail};

/// Outcome for one board. Orientation is whatever the model saw.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    pub layout: String,
    pub confidence: Option<f32>,
}

/// Classifies a board. `Ok(None)` means the model saw no usable position.
pub trait Classifier: Send + Sync {
    fn classify(&self, tiles: &TileGrid) -> Result<Option<Classification>>;
}

/// One square's prediction: index into [`layout::PIECE_LABELS`] and its probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SquareLabel {
    pub label: usize,
    pub probability: f32,
}

/// A model that labels every tile of a grid (a1..h8 order).
pub trait TileLabeler: Send + Sync {
    fn label_tiles(&self, tiles: &TileGrid) -> Result<Vec<SquareLabel>>;
}

/// Builds a layout out of per-square labels. Confidence is the least
/// certain square.
pub struct LabelingClassifier<L> {
    labeler: L,
}

impl<L: TileLabeler> LabelingClassifier<L> {
    pub fn new(labeler: L) -> Self {
        Self { labeler }
    }
}

impl<L: TileLabeler> Classifier for LabelingClassifier<L> {
    fn classify(&self, tiles: &TileGrid) -> Result<Option<Classification>> {
        let squares = self.labeler.label_tiles(tiles)?;
        if squares.is_empty() {
            return Ok(None);
        }
        if squares.len() != tiles.len() {
            bail!("Labeler returned {} squares for {} tiles", squares.len(), tiles.len());
        }
        let labels: Vec<usize> = squares.iter().map(|s| s.label).collect();
        let layout = layout::layout_from_labels(&labels)?;
        let confidence = squares
            .iter()
            .map(|s| s.probability)
            .fold(f32::INFINITY, f32::min);
        Ok(Some(Classification {
            layout,
            confidence: Some(confidence),
        }))
    }
}

impl<F> TileLabeler for F
where
    F: Fn(&TileGrid) -> Result<Vec<SquareLabel>> + Send + Sync,
{
    fn label_tiles(&self, tiles: &TileGrid) -> Result<Vec<SquareLabel>> {
        self(tiles)
    }
}
