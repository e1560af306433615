//! fenwatch: finds chessboards in video frames and records each position that
//! stays on screen, with the time it first appeared.
//!
//! Stages, leaf first:
//! - [`source`] / [`ffmpeg`]: decoded frames
//! - [`locator`]: board bounding box from the inner-corner grid
//! - [`tiles`]: 64 normalized 32x32 tiles
//! - [`classifier`] / [`vision_api`]: tiles to layout string
//! - [`stability`]: debounce into sightings
//! - [`pipeline`]: threads, queues, cancellation, persistence

pub mod cancel;
pub mod classifier;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod layout;
pub mod locator;
pub mod pipeline;
pub mod source;
pub mod stability;
pub mod store;
pub mod telemetry;
pub mod tiles;
pub mod vision_api;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use cancel::CancellationToken;
pub use classifier::{Classification, Classifier};
pub use config::Config;
pub use error::{FrameError, PipelineError, SourceError};
pub use pipeline::{PipelineTask, Progress, RunSummary, StopHandle};
pub use stability::PositionSighting;
pub use store::{JsonlStore, MemoryStore, SightingStore, VideoMetadata};
