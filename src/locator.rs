//! Board locator.
//! Finds the outer bounding box of a chessboard in a grayscale frame by
//! correlating against a checkerboard corner kernel, collecting the hits as
//! interior grid intersections, and growing their extent by one square.
//! Best effort: overlays, perspective and partial boards are not handled.

use crate::config::LocatorConfig;
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::point::Point;
use std::collections::HashMap;
use tracing::trace;

/// Interior intersections span six squares between the outermost hits.
const INTERIOR_SQUARES: f32 = 6.0;

const AREA_EPSILON: f64 = 1e-9;

/// Outer board boundary in frame pixels. `right`/`bottom` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoardBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoardBox {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_within(&self, width: u32, height: u32) -> bool {
        0 <= self.left
            && self.left < self.right
            && self.right <= width as i32
            && 0 <= self.top
            && self.top < self.bottom
            && self.bottom <= height as i32
    }
}

pub struct BoardLocator {
    config: LocatorConfig,
}

impl BoardLocator {
    pub fn new(config: LocatorConfig) -> Self {
        Self { config }
    }

    /// Returns `None` when no board is visible. Never panics on odd input.
    pub fn locate(&self, gray: &GrayImage) -> Option<BoardBox> {
        let corners = self.find_inner_corners(gray)?;
        let (width, height) = gray.dimensions();
        corners_to_board_box(&corners, width, height, self.config.min_line_support)
    }

    /// Centroids of the kernel hits, shifted to the intersection they sit on.
    pub fn find_inner_corners(&self, gray: &GrayImage) -> Option<Vec<(f32, f32)>> {
        let k = self.config.kernel_size;
        let response = CornerResponse::compute(gray, k)?;
        let mask = response.threshold(self.config.match_threshold);

        let half = (k / 2) as f32;
        let centers: Vec<(f32, f32)> = find_contours::<u32>(&mask)
            .iter()
            .filter(|contour| matches!(contour.border_type, BorderType::Outer))
            .filter_map(|contour| contour_centroid(&contour.points))
            .map(|(x, y)| (x + half, y + half))
            .collect();

        trace!("corner kernel produced {} centroids", centers.len());
        if centers.len() < self.config.min_corners {
            return None;
        }
        Some(centers)
    }
}

/// Zero-mean normalized cross-correlation of every k x k window against a
/// two-tone corner kernel (bright top-left and bottom-right quadrants).
/// Indexed by window origin; size is `(w - k + 1) x (h - k + 1)`.
struct CornerResponse {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl CornerResponse {
    fn compute(gray: &GrayImage, k: u32) -> Option<Self> {
        let (w, h) = gray.dimensions();
        if k < 2 || w < k || h < k {
            return None;
        }
        let table = IntegralTable::new(gray);
        let half = k / 2;
        let n = (k * k) as f64;
        let width = w - k + 1;
        let height = h - k + 1;
        let mut values = Vec::with_capacity((width * height) as usize);

        for y in 0..height {
            for x in 0..width {
                let (sum, sum_sq) = table.window(x, y, x + k, y + k);
                let variance = sum_sq - sum * sum / n;
                if variance <= AREA_EPSILON * n {
                    values.push(0.0);
                    continue;
                }
                let top_left = table.sum(x, y, x + half, y + half);
                let top_right = table.sum(x + half, y, x + k, y + half);
                let bottom_left = table.sum(x, y + half, x + half, y + k);
                let bottom_right = table.sum(x + half, y + half, x + k, y + k);
                let score =
                    (top_left + bottom_right - top_right - bottom_left) / (n * variance).sqrt();
                values.push(score as f32);
            }
        }

        Some(Self {
            width,
            height,
            values,
        })
    }

    fn threshold(&self, level: f32) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            let value = self.values[(y * self.width + x) as usize];
            if value > level { Luma([255]) } else { Luma([0]) }
        })
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct IntegralTable {
    sums: Image<Luma<u64>>,
    squares: Image<Luma<u64>>,
}

impl IntegralTable {
    fn new(gray: &GrayImage) -> Self {
        Self {
            sums: integral_image::<_, u64>(gray),
            squares: integral_squared_image::<_, u64>(gray),
        }
    }

    /// Sum over `[x0, x1) x [y0, y1)`. Both ranges must be non-empty.
    fn sum(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
        sum_image_pixels(&self.sums, x0, y0, x1 - 1, y1 - 1)[0] as f64
    }

    fn window(&self, x0: u32, y0: u32, x1: u32, y1: u32) -> (f64, f64) {
        let squares = sum_image_pixels(&self.squares, x0, y0, x1 - 1, y1 - 1)[0];
        (self.sum(x0, y0, x1, y1), squares as f64)
    }
}

/// Area-weighted centroid of a closed contour. Zero-area contours (single
/// pixels, straight runs) fall back to the mean of their points.
fn contour_centroid(points: &[Point<u32>]) -> Option<(f32, f32)> {
    if points.is_empty() {
        return None;
    }
    let mut area = 0.0f64;
    let mut cx = 0.0f64;
    let mut cy = 0.0f64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        let (px, py, qx, qy) = (p.x as f64, p.y as f64, q.x as f64, q.y as f64);
        let cross = px * qy - qx * py;
        area += cross;
        cx += (px + qx) * cross;
        cy += (py + qy) * cross;
    }
    area *= 0.5;

    if area.abs() < AREA_EPSILON {
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.y as f64).sum::<f64>() / n;
        return Some((mean_x as f32, mean_y as f32));
    }
    Some(((cx / (6.0 * area)) as f32, (cy / (6.0 * area)) as f32))
}

/// Grid lines are rounded coordinates shared by at least `min_support`
/// centroids. Their extent is six squares; the board adds one more per side.
fn corners_to_board_box(
    corners: &[(f32, f32)],
    width: u32,
    height: u32,
    min_support: usize,
) -> Option<BoardBox> {
    let (left_col, right_col) = line_extent(corners.iter().map(|c| c.0), min_support)?;
    let (top_row, bottom_row) = line_extent(corners.iter().map(|c| c.1), min_support)?;

    let square_width = (right_col - left_col) as f32 / INTERIOR_SQUARES;
    let square_height = (bottom_row - top_row) as f32 / INTERIOR_SQUARES;

    let left = (left_col as f32 - square_width).round().max(0.0) as i32;
    let right = (right_col as f32 + square_width).round().min(width as f32) as i32;
    let top = (top_row as f32 - square_height).round().max(0.0) as i32;
    let bottom = (bottom_row as f32 + square_height).round().min(height as f32) as i32;

    let board = BoardBox::new(left, top, right, bottom);
    board.is_within(width, height).then_some(board)
}

fn line_extent(values: impl Iterator<Item = f32>, min_support: usize) -> Option<(i32, i32)> {
    let mut counts: HashMap<i32, usize> = HashMap::new();
    for value in values {
        *counts.entry(value.round() as i32).or_default() += 1;
    }
    let mut lines = counts
        .into_iter()
        .filter(|&(_, count)| count >= min_support)
        .map(|(line, _)| line);
    let first = lines.next()?;
    let (min, max) = lines.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
    (min < max).then_some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::render_board;

    fn locator() -> BoardLocator {
        BoardLocator::new(LocatorConfig::default())
    }

    fn assert_close(actual: BoardBox, expected: BoardBox, tolerance: i32) {
        for (a, e) in [
            (actual.left, expected.left),
            (actual.top, expected.top),
            (actual.right, expected.right),
            (actual.bottom, expected.bottom),
        ] {
            assert!(
                (a - e).abs() <= tolerance,
                "detected {:?}, expected {:?}",
                actual,
                expected
            );
        }
    }

    #[test]
    fn test_locates_synthetic_board() {
        let img = render_board(400, 320, 60, 30, 30);
        let board = locator().locate(&img).expect("board should be found");
        assert_close(board, BoardBox::new(60, 30, 300, 270), 3);
        assert!(board.is_within(400, 320));
    }

    #[test]
    fn test_locates_board_touching_frame_edge() {
        let img = render_board(300, 260, 0, 10, 28);
        let board = locator().locate(&img).expect("board should be found");
        assert_close(board, BoardBox::new(0, 10, 224, 234), 3);
        assert!(board.is_within(300, 260));
    }

    #[test]
    fn test_blank_frame_is_not_found() {
        let img = GrayImage::from_pixel(320, 240, Luma([128]));
        assert_eq!(locator().locate(&img), None);
    }

    #[test]
    fn test_gradient_frame_is_not_found() {
        let img = GrayImage::from_fn(320, 240, |x, y| Luma([((x + y) % 256) as u8]));
        assert_eq!(locator().locate(&img), None);
    }

    #[test]
    fn test_too_few_corners_is_not_found() {
        // A 2x2 checker has a single interior corner.
        let img = GrayImage::from_fn(120, 120, |x, y| {
            if (x < 60) == (y < 60) { Luma([255]) } else { Luma([0]) }
        });
        assert_eq!(locator().locate(&img), None);
    }

    #[test]
    fn test_frame_smaller_than_kernel_is_not_found() {
        let img = GrayImage::new(8, 8);
        assert_eq!(locator().locate(&img), None);
    }

    #[test]
    fn test_integral_table_sums_half_open_windows() {
        let img = GrayImage::from_fn(5, 4, |x, y| Luma([(x + 10 * y) as u8]));
        let table = IntegralTable::new(&img);
        // Row 1, columns 2..4: 12 + 13.
        assert_eq!(table.sum(2, 1, 4, 2), 25.0);
        assert_eq!(table.sum(0, 0, 1, 1), 0.0);
        let (sum, squares) = table.window(3, 2, 5, 4);
        assert_eq!(sum, (23 + 24 + 33 + 34) as f64);
        assert_eq!(squares, (23 * 23 + 24 * 24 + 33 * 33 + 34 * 34) as f64);
    }

    #[test]
    fn test_centroid_of_square_contour() {
        let square = [
            Point::new(0u32, 0u32),
            Point::new(4, 0),
            Point::new(4, 4),
            Point::new(0, 4),
        ];
        let (x, y) = contour_centroid(&square).unwrap();
        assert!((x - 2.0).abs() < 1e-4 && (y - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_centroid_falls_back_for_degenerate_contours() {
        assert_eq!(contour_centroid(&[Point::new(7u32, 3u32)]), Some((7.0, 3.0)));
        let line = [Point::new(2u32, 5u32), Point::new(4, 5)];
        assert_eq!(contour_centroid(&line), Some((3.0, 5.0)));
        assert_eq!(contour_centroid(&[]), None);
    }

    #[test]
    fn test_line_extent_ignores_sparse_lines() {
        let values = [10.0, 10.2, 9.8, 50.0, 50.0, 50.0, 90.0, 120.0, 120.0];
        assert_eq!(line_extent(values.into_iter(), 3), Some((10, 50)));
        assert_eq!(line_extent([1.0, 2.0].into_iter(), 3), None);
    }
}
