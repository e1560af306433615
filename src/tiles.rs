//! Tile extraction.
//! Crops the located board (edge-padding where the box leaves the frame),
//! resamples it to 256x256 and cuts it into 64 normalized 32x32 tiles.

use crate::error::FrameError;
use crate::locator::BoardBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

pub const TILES_PER_SIDE: usize = 8;
pub const TILE_COUNT: usize = TILES_PER_SIDE * TILES_PER_SIDE;
pub const TILE_SIZE: u32 = 32;
pub const BOARD_SIZE: u32 = TILE_SIZE * TILES_PER_SIDE as u32;
pub const TILE_PIXELS: usize = (TILE_SIZE * TILE_SIZE) as usize;

/// 64 tiles of 32x32 values in [0, 1], stored tile after tile.
///
/// Tile `rank * 8 + file` is square `(rank, file)` with rank 0 being the
/// bottom row of the board image, so index 0 is a1 when white is at the
/// bottom. Each tile is row-major, top row first.
#[derive(Clone, Debug, PartialEq)]
pub struct TileGrid {
    values: Vec<f32>,
}

impl TileGrid {
    pub fn from_values(values: Vec<f32>) -> Result<Self, FrameError> {
        let expected = TILE_COUNT * TILE_PIXELS;
        if values.len() != expected {
            return Err(FrameError::TileShape {
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        TILE_COUNT
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn tile(&self, rank: usize, file: usize) -> &[f32] {
        let start = (rank * TILES_PER_SIDE + file) * TILE_PIXELS;
        &self.values[start..start + TILE_PIXELS]
    }

    /// Tiles in rank-major order (a1, b1, ..., h8 from white's view).
    pub fn tiles(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks_exact(TILE_PIXELS)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Reassembles the 256x256 board image the tiles were cut from.
    pub fn to_image(&self) -> GrayImage {
        let mut board = GrayImage::new(BOARD_SIZE, BOARD_SIZE);
        for rank in 0..TILES_PER_SIDE {
            let row = (TILES_PER_SIDE - 1 - rank) as u32;
            for file in 0..TILES_PER_SIDE {
                let tile = self.tile(rank, file);
                for (i, value) in tile.iter().enumerate() {
                    let x = file as u32 * TILE_SIZE + i as u32 % TILE_SIZE;
                    let y = row * TILE_SIZE + i as u32 / TILE_SIZE;
                    let level = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
                    board.put_pixel(x, y, Luma([level]));
                }
            }
        }
        board
    }
}

/// Cuts `board` out of `gray` and slices it into a [`TileGrid`].
///
/// Pixels outside the frame repeat the nearest edge pixel, so any box with
/// positive area yields exactly 64 tiles.
pub fn extract_tiles(gray: &GrayImage, board: &BoardBox) -> Result<TileGrid, FrameError> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return Err(FrameError::EmptyFrame { width, height });
    }
    if board.width() <= 0 || board.height() <= 0 {
        return Err(FrameError::DegenerateBox {
            left: board.left,
            top: board.top,
            right: board.right,
            bottom: board.bottom,
        });
    }

    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let crop = GrayImage::from_fn(board.width() as u32, board.height() as u32, |x, y| {
        let src_x = (board.left as i64 + x as i64).clamp(0, max_x) as u32;
        let src_y = (board.top as i64 + y as i64).clamp(0, max_y) as u32;
        *gray.get_pixel(src_x, src_y)
    });
    let resized = imageops::resize(&crop, BOARD_SIZE, BOARD_SIZE, FilterType::Triangle);

    let mut values = Vec::with_capacity(TILE_COUNT * TILE_PIXELS);
    for rank in 0..TILES_PER_SIDE {
        // Rank 1 sits at the bottom of the image.
        let row = (TILES_PER_SIDE - 1 - rank) as u32;
        for file in 0..TILES_PER_SIDE as u32 {
            for y in 0..TILE_SIZE {
                for x in 0..TILE_SIZE {
                    let pixel = resized.get_pixel(file * TILE_SIZE + x, row * TILE_SIZE + y);
                    values.push(pixel[0] as f32 / 255.0);
                }
            }
        }
    }
    TileGrid::from_values(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::render_board;

    fn assert_normalized(grid: &TileGrid) {
        assert_eq!(grid.len(), 64);
        assert_eq!(grid.tiles().count(), 64);
        assert!(grid.tiles().all(|t| t.len() == TILE_PIXELS));
        assert!(grid.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_extract_inside_frame() {
        let img = render_board(400, 320, 60, 30, 30);
        let grid = extract_tiles(&img, &BoardBox::new(60, 30, 300, 270)).unwrap();
        assert_normalized(&grid);
        // a1 is a dark square, h1 a light one.
        let mean = |t: &[f32]| t.iter().sum::<f32>() / t.len() as f32;
        assert!(mean(grid.tile(0, 0)) < 0.1);
        assert!(mean(grid.tile(0, 7)) > 0.9);
    }

    #[test]
    fn test_extract_non_square_box() {
        let img = GrayImage::from_pixel(200, 100, Luma([40]));
        let grid = extract_tiles(&img, &BoardBox::new(10, 10, 190, 40)).unwrap();
        assert_normalized(&grid);
    }

    #[test]
    fn test_extract_box_beyond_frame_pads_edges() {
        let img = GrayImage::from_fn(100, 100, |x, _| if x < 50 { Luma([0]) } else { Luma([255]) });
        let grid = extract_tiles(&img, &BoardBox::new(-60, -20, 160, 130)).unwrap();
        assert_normalized(&grid);
        assert!(grid.tile(3, 0).iter().all(|&v| v < 0.01));
        assert!(grid.tile(3, 7).iter().all(|&v| v > 0.99));
    }

    #[test]
    fn test_rank_one_comes_from_image_bottom() {
        let img = GrayImage::from_fn(64, 64, |_, y| if y < 32 { Luma([255]) } else { Luma([0]) });
        let grid = extract_tiles(&img, &BoardBox::new(0, 0, 64, 64)).unwrap();
        assert!(grid.tile(0, 3).iter().all(|&v| v < 0.01));
        assert!(grid.tile(7, 3).iter().all(|&v| v > 0.99));
    }

    #[test]
    fn test_to_image_restores_layout() {
        let img = GrayImage::from_fn(256, 256, |_, y| if y < 128 { Luma([255]) } else { Luma([0]) });
        let grid = extract_tiles(&img, &BoardBox::new(0, 0, 256, 256)).unwrap();
        let board = grid.to_image();
        assert_eq!(board.dimensions(), (BOARD_SIZE, BOARD_SIZE));
        assert_eq!(board.get_pixel(10, 10)[0], 255);
        assert_eq!(board.get_pixel(10, 250)[0], 0);
    }

    #[test]
    fn test_rejects_empty_box_and_frame() {
        let img = GrayImage::from_pixel(10, 10, Luma([0]));
        assert!(matches!(
            extract_tiles(&img, &BoardBox::new(5, 5, 5, 9)),
            Err(FrameError::DegenerateBox { .. })
        ));
        assert!(matches!(
            extract_tiles(&GrayImage::new(0, 0), &BoardBox::new(0, 0, 4, 4)),
            Err(FrameError::EmptyFrame { .. })
        ));
        assert!(TileGrid::from_values(vec![0.0; 10]).is_err());
    }
}
