//! Failure diagnostics.
//! Frames that failed detection can be dumped for offline inspection. Writing
//! them is best effort: problems are logged and never reach the pipeline.

use crate::error::FrameError;
use image::GrayImage;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub trait DiagnosticsSink: Send + Sync {
    fn record_failure(
        &self,
        video_id: &str,
        frame_index: u64,
        timestamp: Duration,
        error: &FrameError,
        image: &GrayImage,
    );
}

/// Writes `{video_id}_{frame_index}.png` into a directory.
pub struct DirectoryDiagnostics {
    dir: PathBuf,
}

impl DirectoryDiagnostics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, video_id: &str, frame_index: u64) -> PathBuf {
        let safe_id: String = video_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe_id}_{frame_index}.png"))
    }
}

impl DiagnosticsSink for DirectoryDiagnostics {
    fn record_failure(
        &self,
        video_id: &str,
        frame_index: u64,
        timestamp: Duration,
        error: &FrameError,
        image: &GrayImage,
    ) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Cannot create diagnostics dir {}: {}", self.dir.display(), e);
            return;
        }
        let path = self.path_for(video_id, frame_index);
        match image.save(&path) {
            Ok(()) => debug!(
                "Saved frame {} at {:.2}s ({}) to {}",
                frame_index,
                timestamp.as_secs_f64(),
                error,
                path.display()
            ),
            Err(e) => warn!("Cannot save failed frame to {}: {}", path.display(), e),
        }
    }
}
