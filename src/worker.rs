//! Detection worker.
//!
//! Runs on its own thread and owns a decode thread feeding it frames through
//! a bounded queue. For every frame it locates the board and cuts tiles, then
//! reports one [`WorkerMessage`] per frame on the bounded tile queue. After
//! the last frame (or on cancellation) it sends [`WorkerMessage::Done`]
//! exactly once. A worker that disappears without `Done` has crashed.

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::{FrameError, PipelineError, SourceError};
use crate::frame::Frame;
use crate::locator::{BoardBox, BoardLocator};
use crate::source::{FrameSource, SourceEvent};
use crate::tiles::{TileGrid, extract_tiles};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use image::GrayImage;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

const SEND_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum WorkerMessage {
    /// The source opened. Always precedes per-frame messages.
    Opened { fps: f64, len: Option<u64> },
    Tiles {
        frame_index: u64,
        board: BoardBox,
        tiles: TileGrid,
    },
    NotFound { frame_index: u64 },
    /// Detection failed for one frame. `image` is the frame in grayscale when
    /// it had pixels, for diagnostics.
    Failure {
        frame_index: u64,
        error: FrameError,
        image: Option<GrayImage>,
    },
    SourceFailed(SourceError),
    Done,
}

/// Handle to a running worker.
pub struct DetectionWorker {
    handle: Option<JoinHandle<()>>,
    finished: Receiver<()>,
    video_id: String,
}

/// Starts the decode and detection threads for `source`.
pub fn spawn_detection_worker(
    mut source: Box<dyn FrameSource>,
    config: &Config,
    cancel: CancellationToken,
) -> Result<(Receiver<WorkerMessage>, DetectionWorker), PipelineError> {
    let video_id = source.video_id().to_string();
    let (tiles_tx, tiles_rx) = bounded(config.tile_queue_capacity.max(1));
    let frame_capacity = config.frame_queue_capacity.max(1);
    let locator = BoardLocator::new(config.locator.clone());
    let max_dimension = config.locator.max_dimension;
    // Dropped when the worker thread exits, panicking or not.
    let (finished_tx, finished_rx) = bounded::<()>(0);

    let handle = thread::Builder::new()
        .name(format!("detect-{video_id}"))
        .spawn(move || {
            let _finished = finished_tx;
            let (frame_tx, frame_rx) = bounded(frame_capacity);
            let decode_cancel = cancel.clone();
            let decoder = thread::Builder::new()
                .name(format!("decode-{}", source.video_id()))
                .spawn(move || source.stream_frames(&frame_tx, &decode_cancel));
            let decoder = match decoder {
                Ok(handle) => handle,
                Err(e) => {
                    // No Done: the coordinator reports the crash.
                    warn!("failed to spawn decode thread: {}", e);
                    return;
                }
            };

            let worker = Worker {
                locator,
                max_dimension,
                tiles_tx,
                cancel,
            };
            worker.run(&frame_rx);

            drop(frame_rx);
            if decoder.join().is_err() {
                warn!("decode thread panicked");
            }
        })
        .map_err(|source| PipelineError::Spawn {
            role: "detection",
            source,
        })?;

    Ok((
        tiles_rx,
        DetectionWorker {
            handle: Some(handle),
            finished: finished_rx,
            video_id,
        },
    ))
}

impl DetectionWorker {
    /// Waits up to `grace` for the worker to exit. Returns `false` and
    /// detaches the thread when it does not.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        match self.finished.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: detection worker still running after {:?}, detaching",
                    self.video_id, grace
                );
                self.handle.take();
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!("{}: detection worker panicked", self.video_id);
                    }
                }
                true
            }
        }
    }
}

struct Worker {
    locator: BoardLocator,
    max_dimension: u32,
    tiles_tx: Sender<WorkerMessage>,
    cancel: CancellationToken,
}

impl Worker {
    fn run(&self, frames: &Receiver<SourceEvent>) {
        let mut processed = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                debug!("detection cancelled after {} frames", processed);
                break;
            }
            let event = match frames.recv_timeout(SEND_RETRY) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // No Done: the coordinator reports the crash.
                    warn!("decode thread stopped without an end marker after {} frames", processed);
                    return;
                }
            };
            let message = match event {
                SourceEvent::Opened { fps, len } => WorkerMessage::Opened { fps, len },
                SourceEvent::Frame(frame) => {
                    processed += 1;
                    self.process(&frame)
                }
                SourceEvent::FrameFailed { frame_index, error } => {
                    processed += 1;
                    WorkerMessage::Failure {
                        frame_index,
                        error: FrameError::Decode(error),
                        image: None,
                    }
                }
                SourceEvent::Failed(error) => WorkerMessage::SourceFailed(error),
                SourceEvent::EndOfStream => break,
            };
            if !self.send(message) {
                return;
            }
        }
        self.send(WorkerMessage::Done);
    }

    fn process(&self, frame: &Frame) -> WorkerMessage {
        let frame_index = frame.index;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.detect(frame)))
            .unwrap_or_else(|payload| Err(FrameError::DetectionPanic(panic_message(&*payload))));

        match outcome {
            Ok(Some((board, tiles))) => {
                trace!("frame {}: board at {:?}", frame_index, board);
                WorkerMessage::Tiles {
                    frame_index,
                    board,
                    tiles,
                }
            }
            Ok(None) => WorkerMessage::NotFound { frame_index },
            Err(error) => {
                debug!("frame {}: {}", frame_index, error);
                let (width, height) = frame.dimensions();
                let image = (width > 0 && height > 0).then(|| frame.image.to_luma8());
                WorkerMessage::Failure {
                    frame_index,
                    error,
                    image,
                }
            }
        }
    }

    fn detect(&self, frame: &Frame) -> Result<Option<(BoardBox, TileGrid)>, FrameError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyFrame { width, height });
        }
        let gray = frame.luma_for_detection(self.max_dimension);
        let Some(board) = self.locator.locate(&gray) else {
            return Ok(None);
        };
        let tiles = extract_tiles(&gray, &board)?;
        Ok(Some((board, tiles)))
    }

    /// Blocking send that gives up on cancellation or a closed queue.
    fn send(&self, mut message: WorkerMessage) -> bool {
        loop {
            match self.tiles_tx.send_timeout(message, SEND_RETRY) {
                Ok(()) => return true,
                Err(SendTimeoutError::Disconnected(_)) => return false,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    message = returned;
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
