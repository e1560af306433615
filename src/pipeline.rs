//! Pipeline coordinator.
//!
//! One [`PipelineTask`] processes one video:
//!
//! ```text
//! decode thread --frames--> detection worker --tiles--> coordinator
//!                                                        |  classifier thread
//!                                                        v
//!                                              stability filter -> store
//! ```
//!
//! Queues are bounded, so a slow classifier backs up into the decoder. The
//! coordinator polls with a timeout and checks the cancellation token every
//! cycle, including while the classifier is busy. On shutdown, threads that
//! miss the grace period are detached.

use crate::cancel::CancellationToken;
use crate::classifier::{Classification, Classifier};
use crate::config::Config;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{FrameError, PipelineError, SourceError};
use crate::frame::frame_timestamp;
use crate::layout;
use crate::source::FrameSource;
use crate::stability::{PositionSighting, StabilityFilter};
use crate::store::SightingStore;
use crate::tiles::TileGrid;
use crate::worker::{WorkerMessage, spawn_detection_worker};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use image::GrayImage;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reported once per consumed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    pub frames_consumed: u64,
    pub total_frames: Option<u64>,
}

pub type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub video_id: String,
    pub fps: f64,
    pub frames_consumed: u64,
    pub boards_found: u64,
    pub frame_failures: u64,
    pub sightings: Vec<PositionSighting>,
    /// Stopped through the cancellation token before the stream ended.
    pub cancelled: bool,
}

/// Stops a [`PipelineTask`] from another thread while `run` blocks.
#[derive(Clone, Debug)]
pub struct StopHandle {
    cancel: CancellationToken,
}

impl StopHandle {
    /// Requests shutdown; `run` returns within the grace period.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct PipelineTask {
    source: Box<dyn FrameSource>,
    video_id: Arc<str>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn SightingStore>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    progress: Option<ProgressCallback>,
    config: Config,
    cancel: CancellationToken,
}

impl PipelineTask {
    pub fn new(
        source: Box<dyn FrameSource>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn SightingStore>,
        config: Config,
    ) -> Self {
        let video_id: Arc<str> = Arc::from(source.video_id());
        Self {
            source,
            video_id,
            classifier,
            store,
            diagnostics: None,
            progress: None,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn with_progress(mut self, callback: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Shares an externally owned token (e.g. wired to Ctrl+C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Take this before calling `run`, which consumes the task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Processes the whole video, blocking the calling thread.
    pub fn run(self) -> Result<RunSummary, PipelineError> {
        let Self {
            source,
            video_id,
            classifier,
            store,
            diagnostics,
            progress,
            config,
            cancel,
        } = self;
        info!("{}: starting", video_id);
        let started = Instant::now();

        let (tiles_rx, worker) = spawn_detection_worker(source, &config, cancel.clone())?;
        let classifier_thread = match ClassifierThread::spawn(classifier, &video_id) {
            Ok(thread) => thread,
            Err(e) => {
                cancel.cancel();
                worker.shutdown(config.shutdown_grace());
                return Err(e);
            }
        };

        let mut coordinator = Coordinator {
            summary: RunSummary {
                video_id: video_id.to_string(),
                ..RunSummary::default()
            },
            filter: StabilityFilter::new(video_id.clone(), 0.0, &config.stability),
            total_frames: None,
            video_id,
            store,
            diagnostics,
            progress,
            classifier: &classifier_thread,
            poll_interval: config.poll_interval(),
            normalize_orientation: config.stability.normalize_orientation,
            cancel: &cancel,
        };
        let outcome = coordinator.drive(&tiles_rx);
        let Coordinator {
            mut summary,
            mut filter,
            video_id,
            ..
        } = coordinator;
        filter.reset();

        // Unblock anything still producing before waiting on it.
        let finished_normally = matches!(outcome, Ok(false));
        summary.cancelled = cancel.is_cancelled() && !finished_normally;
        if !finished_normally {
            cancel.cancel();
        }
        drop(tiles_rx);
        let deadline = Instant::now() + config.shutdown_grace();
        let worker_exited = worker.shutdown(deadline.saturating_duration_since(Instant::now()));
        let classifier_exited =
            classifier_thread.shutdown(deadline.saturating_duration_since(Instant::now()));
        if !(worker_exited && classifier_exited) {
            warn!("{}: detached threads that missed the shutdown grace period", video_id);
        }

        outcome?;
        info!(
            "{}: {} frames, {} boards, {} failures, {} sightings in {:.1}s{}",
            video_id,
            summary.frames_consumed,
            summary.boards_found,
            summary.frame_failures,
            summary.sightings.len(),
            started.elapsed().as_secs_f64(),
            if summary.cancelled { " (cancelled)" } else { "" }
        );
        Ok(summary)
    }
}

struct Coordinator<'a> {
    summary: RunSummary,
    filter: StabilityFilter,
    total_frames: Option<u64>,
    video_id: Arc<str>,
    store: Arc<dyn SightingStore>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    progress: Option<ProgressCallback>,
    classifier: &'a ClassifierThread,
    poll_interval: Duration,
    normalize_orientation: bool,
    cancel: &'a CancellationToken,
}

impl Coordinator<'_> {
    /// Consumes worker messages until `Done`. `Ok(true)` means cancelled.
    fn drive(&mut self, messages: &Receiver<WorkerMessage>) -> Result<bool, PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("{}: cancelled", self.video_id);
                return Ok(true);
            }
            let message = match messages.recv_timeout(self.poll_interval) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::WorkerCrashed {
                        video_id: self.video_id.to_string(),
                    });
                }
            };

            match message {
                WorkerMessage::Opened { fps, len } => {
                    debug!("{}: opened, {:.3} fps, {:?} frames", self.video_id, fps, len);
                    self.summary.fps = fps;
                    self.filter.set_fps(fps);
                    self.total_frames = len;
                }
                WorkerMessage::SourceFailed(error) => {
                    let video_id = self.video_id.to_string();
                    let reason = error.to_string();
                    return Err(match error {
                        SourceError::Open { .. } => PipelineError::SourceOpen { video_id, reason },
                        _ => PipelineError::SourceRead { video_id, reason },
                    });
                }
                WorkerMessage::NotFound { frame_index } => {
                    self.observe(frame_index, None)?;
                    self.consumed();
                }
                WorkerMessage::Failure {
                    frame_index,
                    error,
                    image,
                } => {
                    self.record_failure(frame_index, &error, image.as_ref());
                    self.consumed();
                }
                WorkerMessage::Tiles {
                    frame_index, tiles, ..
                } => {
                    self.summary.boards_found += 1;
                    let result =
                        self.classifier
                            .classify(frame_index, tiles, self.poll_interval, self.cancel);
                    let Some(result) = result else {
                        // Cancelled mid-call.
                        continue;
                    };
                    match result {
                        Ok(classification) => {
                            let layout = classification.map(|c| self.oriented(c));
                            self.observe(frame_index, layout)?;
                        }
                        Err((error, tiles)) => {
                            let board = tiles.to_image();
                            self.record_failure(frame_index, &error, Some(&board));
                        }
                    }
                    self.consumed();
                }
                WorkerMessage::Done => {
                    debug!("{}: end of stream", self.video_id);
                    return Ok(false);
                }
            }
        }
    }

    fn oriented(&self, classification: Classification) -> String {
        if self.normalize_orientation {
            layout::normalize_orientation(&classification.layout)
        } else {
            classification.layout
        }
    }

    fn observe(&mut self, frame_index: u64, layout: Option<String>) -> Result<(), PipelineError> {
        let Some(sighting) = self.filter.observe(frame_index + 1, layout) else {
            return Ok(());
        };
        info!(
            "{}: new position at {:.2}s: {}",
            self.video_id, sighting.seconds_into_video, sighting.layout
        );
        self.store
            .save_position_sighting(&sighting.video_id, &sighting.layout, sighting.seconds_into_video)
            .map_err(|source| PipelineError::Persistence {
                video_id: self.video_id.to_string(),
                source,
            })?;
        self.summary.sightings.push(sighting);
        Ok(())
    }

    fn record_failure(&mut self, frame_index: u64, error: &FrameError, image: Option<&GrayImage>) {
        self.summary.frame_failures += 1;
        warn!("{}: frame {}: {}", self.video_id, frame_index, error);
        if let (Some(sink), Some(image)) = (&self.diagnostics, image) {
            let timestamp = frame_timestamp(frame_index, self.summary.fps);
            sink.record_failure(&self.video_id, frame_index, timestamp, error, image);
        }
    }

    fn consumed(&mut self) {
        self.summary.frames_consumed += 1;
        if let Some(progress) = self.progress.as_mut() {
            progress(&Progress {
                frames_consumed: self.summary.frames_consumed,
                total_frames: self.total_frames,
            });
        }
    }
}

type ClassifyJob = (u64, TileGrid);
type ClassifyOutcome = Result<Option<Classification>, (FrameError, TileGrid)>;

/// Runs the classifier off the coordinator thread so a slow call cannot
/// delay cancellation.
struct ClassifierThread {
    jobs: Sender<ClassifyJob>,
    results: Receiver<(u64, ClassifyOutcome)>,
    handle: JoinHandle<()>,
    finished: Receiver<()>,
}

impl ClassifierThread {
    fn spawn(classifier: Arc<dyn Classifier>, video_id: &str) -> Result<Self, PipelineError> {
        let (jobs_tx, jobs_rx) = bounded::<ClassifyJob>(1);
        let (results_tx, results_rx) = bounded(1);
        let (finished_tx, finished_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(format!("classify-{video_id}"))
            .spawn(move || {
                let _finished = finished_tx;
                for (frame_index, tiles) in jobs_rx {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| classifier.classify(&tiles)));
                    let outcome = match outcome {
                        Ok(Ok(classification)) => Ok(classification),
                        Ok(Err(e)) => Err((FrameError::Classification(format!("{e:#}")), tiles)),
                        Err(_) => Err((
                            FrameError::Classification("classifier panicked".to_string()),
                            tiles,
                        )),
                    };
                    if results_tx.send((frame_index, outcome)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| PipelineError::Spawn {
                role: "classifier",
                source,
            })?;

        Ok(Self {
            jobs: jobs_tx,
            results: results_rx,
            handle,
            finished: finished_rx,
        })
    }

    /// Classifies one board, polling for cancellation. `None` when cancelled.
    fn classify(
        &self,
        frame_index: u64,
        tiles: TileGrid,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<ClassifyOutcome> {
        if let Err(e) = self.jobs.send((frame_index, tiles)) {
            let (_, tiles) = e.into_inner();
            return Some(Err((
                FrameError::Classification("classifier thread is gone".to_string()),
                tiles,
            )));
        }
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.results.recv_timeout(poll_interval) {
                Ok((index, outcome)) if index == frame_index => return Some(outcome),
                Ok((index, _)) => warn!("dropping stale classification for frame {}", index),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn shutdown(self, grace: Duration) -> bool {
        let Self {
            jobs,
            results,
            handle,
            finished,
        } = self;
        drop(jobs);
        drop(results);
        match finished.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("classifier still busy after {:?}, detaching", grace);
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("classifier thread panicked");
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ImageSequenceSource;
    use crate::store::MemoryStore;
    use crate::test_support::{PanickingSource, render_board};
    use image::{DynamicImage, Luma};
    use std::fs;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR";

    struct FixedClassifier(&'static str);

    impl Classifier for FixedClassifier {
        fn classify(&self, _: &TileGrid) -> anyhow::Result<Option<Classification>> {
            Ok(Some(Classification {
                layout: self.0.to_string(),
                confidence: Some(0.9),
            }))
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn classify(&self, _: &TileGrid) -> anyhow::Result<Option<Classification>> {
            anyhow::bail!("model unavailable")
        }
    }

    /// Signals when called, then blocks far longer than any test grace period.
    struct SlowClassifier(Sender<()>);

    impl Classifier for SlowClassifier {
        fn classify(&self, _: &TileGrid) -> anyhow::Result<Option<Classification>> {
            let _ = self.0.send(());
            thread::sleep(Duration::from_secs(30));
            Ok(None)
        }
    }

    #[derive(Default)]
    struct CountingDiagnostics(AtomicUsize);

    impl DiagnosticsSink for CountingDiagnostics {
        fn record_failure(&self, _: &str, _: u64, _: Duration, _: &FrameError, _: &GrayImage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct BrokenStore;

    impl SightingStore for BrokenStore {
        fn save_channel(&self, _: &str, _: &str, _: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
        fn save_video(&self, _: &crate::store::VideoMetadata) -> anyhow::Result<()> {
            Ok(())
        }
        fn save_position_sighting(&self, _: &str, _: &str, _: f64) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
        fn all_processed_video_ids(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn sightings_for(&self, _: &str) -> anyhow::Result<Vec<crate::store::StoredSighting>> {
            Ok(Vec::new())
        }
    }

    fn board_frame() -> DynamicImage {
        DynamicImage::ImageLuma8(render_board(400, 320, 60, 30, 30))
    }

    fn blank_frame() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(400, 320, Luma([128])))
    }

    /// `blank` frames without a board, then `boards` frames with one.
    fn video(blank: usize, boards: usize) -> Box<dyn FrameSource> {
        let mut frames: Vec<DynamicImage> = (0..blank).map(|_| blank_frame()).collect();
        frames.extend((0..boards).map(|_| board_frame()));
        Box::new(ImageSequenceSource::from_images("vid", 10.0, frames))
    }

    fn fast_config() -> Config {
        Config {
            poll_interval_ms: 10,
            shutdown_grace_ms: 300,
            ..Config::default()
        }
    }

    #[test]
    fn test_board_appearing_mid_video_yields_one_sighting() {
        let store = Arc::new(MemoryStore::new());
        let task = PipelineTask::new(
            video(15, 25),
            Arc::new(FixedClassifier(START)),
            store.clone(),
            fast_config(),
        );
        let summary = task.run().unwrap();

        assert_eq!(summary.frames_consumed, 40);
        assert_eq!(summary.boards_found, 25);
        assert_eq!(summary.frame_failures, 0);
        assert!(!summary.cancelled);
        assert_eq!(summary.sightings.len(), 1);
        assert_eq!(summary.sightings[0].layout, START);
        assert!((summary.sightings[0].seconds_into_video - 1.5).abs() < 1e-9);

        let stored = store.sightings_for("vid").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].layout, START);
    }

    #[test]
    fn test_black_side_view_is_rotated_before_recording() {
        let flipped = "RNBKQBNR/PPPPPPPP/8/8/8/8/pppppppp/rnbkqbnr";
        let store = Arc::new(MemoryStore::new());
        let summary = PipelineTask::new(video(0, 12), Arc::new(FixedClassifier(flipped)), store, fast_config())
            .run()
            .unwrap();
        assert_eq!(summary.sightings.len(), 1);
        assert_eq!(summary.sightings[0].layout, START);
    }

    #[test]
    fn test_empty_source_finishes_without_sightings() {
        let source = Box::new(ImageSequenceSource::from_images("vid", 25.0, Vec::new()));
        let summary = PipelineTask::new(
            source,
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .run()
        .unwrap();
        assert_eq!(summary.frames_consumed, 0);
        assert!(summary.sightings.is_empty());
        assert!(!summary.cancelled);
    }

    #[test]
    fn test_open_failure_ends_run() {
        let source = Box::new(ImageSequenceSource::from_dir("vid", 25.0, "/no/such/frames"));
        let result = PipelineTask::new(
            source,
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .run();
        assert!(matches!(result, Err(PipelineError::SourceOpen { .. })));
    }

    #[test]
    fn test_failed_frames_are_reported_and_skipped() {
        let mut frames = vec![DynamicImage::new_luma8(0, 0)];
        frames.extend((0..12).map(|_| board_frame()));
        let source = Box::new(ImageSequenceSource::from_images("vid", 10.0, frames));
        let diagnostics = Arc::new(CountingDiagnostics::default());

        let summary = PipelineTask::new(
            source,
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .with_diagnostics(diagnostics.clone())
        .run()
        .unwrap();

        assert_eq!(summary.frames_consumed, 13);
        assert_eq!(summary.frame_failures, 1);
        assert_eq!(summary.sightings.len(), 1);
        // Empty frames carry no image to dump.
        assert_eq!(diagnostics.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_undecodable_frame_file_does_not_truncate_run() {
        let dir = std::env::temp_dir().join(format!("fenwatch-pipeline-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for i in 0..13 {
            let path = dir.join(format!("f{i:03}.png"));
            if i == 2 {
                fs::write(&path, b"truncated upload").unwrap();
            } else {
                board_frame().save(&path).unwrap();
            }
        }
        let diagnostics = Arc::new(CountingDiagnostics::default());

        let result = PipelineTask::new(
            Box::new(ImageSequenceSource::from_dir("vid", 10.0, &dir)),
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .with_diagnostics(diagnostics.clone())
        .run();
        fs::remove_dir_all(&dir).ok();
        let summary = result.unwrap();

        assert_eq!(summary.frames_consumed, 13);
        assert_eq!(summary.boards_found, 12);
        assert_eq!(summary.frame_failures, 1);
        assert_eq!(summary.sightings.len(), 1);
        assert!(!summary.cancelled);
        assert_eq!(diagnostics.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_decoder_crash_is_reported_as_worker_crash() {
        let source = PanickingSource {
            image: board_frame(),
            frames: 4,
            reads: 0,
        };
        let result = PipelineTask::new(
            Box::new(source),
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .run();
        assert!(matches!(result, Err(PipelineError::WorkerCrashed { .. })));
    }

    /// Two blank frames, then the decoder pipe breaks.
    struct BrokenPipeSource(u32);

    impl FrameSource for BrokenPipeSource {
        fn video_id(&self) -> &str {
            "vid"
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
            self.0 += 1;
            if self.0 > 2 {
                return Err(SourceError::Stream {
                    frames_read: 2,
                    reason: "broken pipe".to_string(),
                });
            }
            Ok(Some(blank_frame()))
        }
    }

    #[test]
    fn test_broken_decoder_is_an_error_not_end_of_stream() {
        let result = PipelineTask::new(
            Box::new(BrokenPipeSource(0)),
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .run();
        assert!(matches!(result, Err(PipelineError::SourceRead { .. })));
    }

    #[test]
    fn test_classifier_errors_do_not_stop_the_run() {
        let diagnostics = Arc::new(CountingDiagnostics::default());
        let summary = PipelineTask::new(
            video(2, 5),
            Arc::new(FailingClassifier),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .with_diagnostics(diagnostics.clone())
        .run()
        .unwrap();

        assert_eq!(summary.frames_consumed, 7);
        assert_eq!(summary.frame_failures, 5);
        assert!(summary.sightings.is_empty());
        assert_eq!(diagnostics.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_progress_fires_once_per_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        PipelineTask::new(
            video(3, 4),
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        )
        .with_progress(move |p: &Progress| sink.lock().unwrap().push(*p))
        .run()
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 7);
        assert_eq!(seen.last().unwrap().frames_consumed, 7);
        assert_eq!(seen[0].total_frames, Some(7));
    }

    #[test]
    fn test_persistence_failure_is_terminal() {
        let result = PipelineTask::new(
            video(0, 12),
            Arc::new(FixedClassifier(START)),
            Arc::new(BrokenStore),
            fast_config(),
        )
        .run();
        assert!(matches!(result, Err(PipelineError::Persistence { .. })));
    }

    #[test]
    fn test_stop_during_slow_classification_returns_within_grace() {
        let (called_tx, called_rx) = bounded(1);
        let task = PipelineTask::new(
            video(0, 20),
            Arc::new(SlowClassifier(called_tx)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        );
        let handle = task.stop_handle();
        let stopper = thread::spawn(move || {
            called_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            handle.stop();
            Instant::now()
        });

        let summary = task.run().unwrap();
        let stopped_at = stopper.join().unwrap();
        assert!(summary.cancelled);
        assert!(summary.sightings.is_empty());
        assert!(stopped_at.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_handle_before_run_cancels_immediately() {
        let task = PipelineTask::new(
            video(0, 50),
            Arc::new(FixedClassifier(START)),
            Arc::new(MemoryStore::new()),
            fast_config(),
        );
        let handle = task.stop_handle();
        let copy = handle.clone();
        copy.stop();
        assert!(handle.is_stopped());

        let summary = task.run().unwrap();
        assert!(summary.cancelled);
        assert!(summary.sightings.is_empty());
    }
}
