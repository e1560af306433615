//! Error types shared by the pipeline stages.
//! Per-frame problems are `FrameError`s and never stop a run; only the
//! variants of `PipelineError` end one.

use thiserror::Error;

/// A problem with a single frame. The worker reports it and moves on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
    #[error("board box {left},{top},{right},{bottom} has no area")]
    DegenerateBox {
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
    },
    #[error("tile buffer has {actual} values, expected {expected}")]
    TileShape { expected: usize, actual: usize },
    #[error("detection panicked: {0}")]
    DetectionPanic(String),
    #[error("classification failed: {0}")]
    Classification(String),
    #[error(transparent)]
    Decode(#[from] SourceError),
}

/// Failure of the frame source itself.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {uri:?}: {reason}")]
    Open { uri: String, reason: String },
    /// One frame is unreadable; the stream goes on.
    #[error("failed to decode frame {frame_index}: {reason}")]
    Decode { frame_index: u64, reason: String },
    /// The decoder itself broke; no further frames can be read.
    #[error("video stream broke after {frames_read} frames: {reason}")]
    Stream { frames_read: u64, reason: String },
}

/// Terminal outcomes of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("video {video_id} could not be opened: {reason}")]
    SourceOpen { video_id: String, reason: String },
    #[error("video {video_id} stopped decoding: {reason}")]
    SourceRead { video_id: String, reason: String },
    #[error("detection worker for {video_id} stopped without finishing the stream")]
    WorkerCrashed { video_id: String },
    #[error("failed to spawn {role} thread")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist sighting for {video_id}")]
    Persistence {
        video_id: String,
        #[source]
        source: anyhow::Error,
    },
}
