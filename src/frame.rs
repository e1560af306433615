use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use std::sync::Arc;
use std::time::Duration;

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub video_id: Arc<str>,
    /// 0-based position in the stream.
    pub index: u64,
    pub fps: f64,
    pub image: DynamicImage,
}

impl Frame {
    pub fn new(video_id: Arc<str>, index: u64, fps: f64, image: DynamicImage) -> Self {
        Self {
            video_id,
            index,
            fps,
            image,
        }
    }

    pub fn timestamp(&self) -> Duration {
        frame_timestamp(self.index, self.fps)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Grayscale copy for detection, downscaled (aspect preserved) when
    /// either side exceeds `max_dimension`.
    pub fn luma_for_detection(&self, max_dimension: u32) -> GrayImage {
        let (width, height) = self.dimensions();
        if max_dimension > 0 && (width > max_dimension || height > max_dimension) {
            self.image
                .resize(max_dimension, max_dimension, FilterType::Triangle)
                .to_luma8()
        } else {
            self.image.to_luma8()
        }
    }
}

/// `index / fps`, clamped to zero for nonsensical rates.
pub fn frame_timestamp(index: u64, fps: f64) -> Duration {
    if fps > 0.0 && fps.is_finite() {
        Duration::from_secs_f64(index as f64 / fps)
    } else {
        Duration::ZERO
    }
}
