use crate::error::SourceError;
use crate::source::FrameSource;
use image::{DynamicImage, GrayImage, Luma};

/// Grey frame with an 8x8 checkerboard whose top-left square is light.
pub(crate) fn render_board(width: u32, height: u32, left: u32, top: u32, square: u32) -> GrayImage {
    let side = square * 8;
    GrayImage::from_fn(width, height, |x, y| {
        if x < left || y < top || x >= left + side || y >= top + side {
            return Luma([128]);
        }
        let col = (x - left) / square;
        let row = (y - top) / square;
        if (row + col) % 2 == 0 { Luma([255]) } else { Luma([0]) }
    })
}

/// Yields `frames` copies of `image`, then panics inside `read_frame`.
pub(crate) struct PanickingSource {
    pub image: DynamicImage,
    pub frames: u32,
    pub reads: u32,
}

impl FrameSource for PanickingSource {
    fn video_id(&self) -> &str {
        "crashy"
    }

    fn fps(&self) -> f64 {
        10.0
    }

    fn len(&self) -> Option<u64> {
        None
    }

    fn open(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        self.reads += 1;
        if self.reads > self.frames {
            panic!("decoder blew up");
        }
        Ok(Some(self.image.clone()))
    }
}
