//! Frame sources.
//! A source decodes one video into [`Frame`]s and streams them into a
//! bounded channel. An unreadable frame is reported in its slot and the
//! stream goes on. The stream always ends with exactly one
//! [`SourceEvent::EndOfStream`], whether it ran dry, failed, or was cancelled.

use crate::cancel::CancellationToken;
use crate::error::SourceError;
use crate::frame::Frame;
use crossbeam_channel::Sender;
use image::DynamicImage;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// What travels on the decoded-frame queue.
#[derive(Debug)]
pub enum SourceEvent {
    /// Sent once after a successful open, before any frame.
    Opened { fps: f64, len: Option<u64> },
    Frame(Frame),
    /// Frame `frame_index` could not be decoded. Later frames keep their index.
    FrameFailed { frame_index: u64, error: SourceError },
    /// Open failure (in place of the first frame) or a broken decoder. Nothing
    /// but the end marker follows.
    Failed(SourceError),
    EndOfStream,
}

pub trait FrameSource: Send {
    fn video_id(&self) -> &str;

    /// Frames per second. Sources that probe the stream know it after `open`.
    fn fps(&self) -> f64;

    /// Frame count when known.
    fn len(&self) -> Option<u64>;

    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    fn open(&mut self) -> Result<(), SourceError>;

    /// Next decoded image, `Ok(None)` at end of stream.
    /// [`SourceError::Decode`] skips one frame; any other error ends the stream.
    fn read_frame(&mut self) -> Result<Option<DynamicImage>, SourceError>;

    /// Releases decoder resources. Called once streaming stops.
    fn close(&mut self) {}

    /// Decodes until exhaustion or cancellation, pushing into `tx`.
    /// Blocks while `tx` is full. Sends the end marker exactly once.
    fn stream_frames(&mut self, tx: &Sender<SourceEvent>, cancel: &CancellationToken) {
        if let Err(err) = self.open() {
            warn!("{}: {}", self.video_id(), err);
            let _ = tx.send(SourceEvent::Failed(err));
            let _ = tx.send(SourceEvent::EndOfStream);
            return;
        }
        debug!("{}: source opened at {:.3} fps", self.video_id(), self.fps());

        let video_id: Arc<str> = Arc::from(self.video_id());
        let fps = self.fps();
        let mut receiver_alive = tx.send(SourceEvent::Opened { fps, len: self.len() }).is_ok();
        let mut index = 0u64;

        while receiver_alive && !cancel.is_cancelled() {
            match self.read_frame() {
                Ok(Some(image)) => {
                    let frame = Frame::new(video_id.clone(), index, fps, image);
                    receiver_alive = tx.send(SourceEvent::Frame(frame)).is_ok();
                    index += 1;
                }
                Ok(None) => break,
                Err(SourceError::Decode { reason, .. }) => {
                    warn!("{}: frame {} unreadable: {}", video_id, index, reason);
                    let error = SourceError::Decode {
                        frame_index: index,
                        reason,
                    };
                    receiver_alive = tx
                        .send(SourceEvent::FrameFailed {
                            frame_index: index,
                            error,
                        })
                        .is_ok();
                    index += 1;
                }
                Err(err) => {
                    warn!("{}: {}", video_id, err);
                    let _ = tx.send(SourceEvent::Failed(err));
                    break;
                }
            }
        }

        self.close();
        debug!(
            "{}: source stopped after {} frames (cancelled: {})",
            video_id,
            index,
            cancel.is_cancelled()
        );
        let _ = tx.send(SourceEvent::EndOfStream);
    }
}

enum Pending {
    Images(std::vec::IntoIter<DynamicImage>),
    Files(std::vec::IntoIter<PathBuf>),
}

/// Frames from in-memory images or from a directory of image files (sorted
/// by file name) played back at a fixed rate.
pub struct ImageSequenceSource {
    video_id: String,
    fps: f64,
    images: Option<Vec<DynamicImage>>,
    dir: Option<PathBuf>,
    len: Option<u64>,
    pending: Option<Pending>,
    /// Frames handed out so far, readable or not.
    position: u64,
}

impl ImageSequenceSource {
    pub fn from_images(video_id: impl Into<String>, fps: f64, images: Vec<DynamicImage>) -> Self {
        Self {
            video_id: video_id.into(),
            fps,
            len: Some(images.len() as u64),
            images: Some(images),
            dir: None,
            pending: None,
            position: 0,
        }
    }

    pub fn from_dir(video_id: impl Into<String>, fps: f64, dir: impl Into<PathBuf>) -> Self {
        Self {
            video_id: video_id.into(),
            fps,
            images: None,
            dir: Some(dir.into()),
            len: None,
            pending: None,
            position: 0,
        }
    }

    fn list_images(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            uri: dir.display().to_string(),
            reason,
        };
        let entries = fs::read_dir(dir).map_err(|e| open_error(e.to_string()))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| open_error(e.to_string()))?.path();
            if path.is_file() && image::ImageFormat::from_path(&path).is_ok() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

impl FrameSource for ImageSequenceSource {
    fn video_id(&self) -> &str {
        &self.video_id
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn len(&self) -> Option<u64> {
        self.len
    }

    fn open(&mut self) -> Result<(), SourceError> {
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            return Err(SourceError::Open {
                uri: self.video_id.clone(),
                reason: format!("invalid frame rate {}", self.fps),
            });
        }
        if let Some(images) = self.images.take() {
            self.pending = Some(Pending::Images(images.into_iter()));
        } else if let Some(dir) = &self.dir {
            let paths = Self::list_images(dir)?;
            self.len = Some(paths.len() as u64);
            self.pending = Some(Pending::Files(paths.into_iter()));
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        let frame_index = self.position;
        let next = match self.pending.as_mut() {
            Some(Pending::Images(images)) => Ok(images.next()),
            Some(Pending::Files(paths)) => match paths.next() {
                Some(path) => image::open(&path).map(Some).map_err(|e| SourceError::Decode {
                    frame_index,
                    reason: format!("{}: {}", path.display(), e),
                }),
                None => Ok(None),
            },
            None => Ok(None),
        };
        if !matches!(next, Ok(None)) {
            self.position += 1;
        }
        next
    }

    fn close(&mut self) {
        self.pending = None;
    }
}
