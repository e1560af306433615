use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, Command};
use fenwatch::classifier::Classifier;
use fenwatch::diagnostics::DirectoryDiagnostics;
use fenwatch::ffmpeg::FfmpegFrameSource;
use fenwatch::source::{FrameSource, ImageSequenceSource};
use fenwatch::vision_api::VisionApiClassifier;
use fenwatch::{
    CancellationToken, Config, JsonlStore, PipelineTask, Progress, SightingStore, VideoMetadata,
    telemetry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const PROGRESS_EVERY: u64 = 250;

fn main() -> Result<()> {
    let matches = Command::new("fenwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Records every stable chess position shown in a video")
        .arg(
            Arg::new("source")
                .value_name("VIDEO")
                .help("Video file or stream URL (decoded with ffmpeg)")
                .required_unless_present("frames-dir"),
        )
        .arg(
            Arg::new("frames-dir")
                .long("frames-dir")
                .value_name("DIR")
                .help("Read frames from a directory of images instead of a video")
                .value_parser(clap::value_parser!(PathBuf))
                .conflicts_with("source"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Frame rate of --frames-dir")
                .value_parser(clap::value_parser!(f64))
                .default_value("30"),
        )
        .arg(
            Arg::new("video-id")
                .long("video-id")
                .value_name("ID")
                .help("Id to store sightings under (default: metadata id or file name)"),
        )
        .arg(
            Arg::new("metadata")
                .long("metadata")
                .value_name("JSON")
                .help("Video metadata file (title, channel, ...)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("JSONL")
                .help("Sightings file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("fenwatch.jsonl"),
        )
        .arg(
            Arg::new("diagnostics")
                .long("diagnostics")
                .value_name("DIR")
                .help("Save frames that failed detection here")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("JSON")
                .help("Pipeline tuning file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("skip-processed")
                .long("skip-processed")
                .help("Do nothing if the video is already in the store")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    telemetry::init_logging(matches.get_flag("verbose"));

    let config = Config::load_or_default(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    let source_uri = matches.get_one::<String>("source");
    let frames_dir = matches.get_one::<PathBuf>("frames-dir");

    let mut metadata = match matches.get_one::<PathBuf>("metadata") {
        Some(path) => VideoMetadata::load(path)?,
        None => VideoMetadata::default(),
    };
    let video_id = match matches.get_one::<String>("video-id") {
        Some(id) => id.clone(),
        None if !metadata.id.is_empty() => metadata.id.clone(),
        None => {
            let path = frames_dir
                .map(PathBuf::as_path)
                .or_else(|| source_uri.map(Path::new))
                .context("No video given")?;
            default_video_id(path)?
        }
    };
    if metadata.id.is_empty() {
        metadata = VideoMetadata {
            title: video_id.clone(),
            id: video_id.clone(),
            ..metadata
        };
    } else if metadata.id != video_id {
        bail!("--video-id {} does not match metadata id {}", video_id, metadata.id);
    }

    let store_path = matches
        .get_one::<PathBuf>("store")
        .context("--store has a default")?;
    let store = Arc::new(JsonlStore::open(store_path)?);
    if matches.get_flag("skip-processed")
        && store.all_processed_video_ids()?.iter().any(|id| *id == video_id)
    {
        info!("{} already processed, skipping", video_id);
        return Ok(());
    }

    let classifier: Arc<dyn Classifier> =
        Arc::new(VisionApiClassifier::from_env().context("Vision classifier unavailable")?);

    let source: Box<dyn FrameSource> = match (frames_dir, source_uri) {
        (Some(dir), _) => {
            let fps = *matches.get_one::<f64>("fps").context("--fps has a default")?;
            Box::new(ImageSequenceSource::from_dir(video_id.clone(), fps, dir.clone()))
        }
        (None, Some(uri)) => Box::new(FfmpegFrameSource::new(video_id.clone(), uri.clone())),
        (None, None) => bail!("Give a video or --frames-dir"),
    };

    let cancel = CancellationToken::new();
    let ctrlc_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Ctrl+C received, stopping");
        ctrlc_token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;

    let mut task = PipelineTask::new(source, classifier, store.clone(), config)
        .with_cancellation(cancel)
        .with_progress(log_progress);
    if let Some(dir) = matches.get_one::<PathBuf>("diagnostics") {
        task = task.with_diagnostics(Arc::new(DirectoryDiagnostics::new(dir.clone())));
    }

    let summary = task
        .run()
        .with_context(|| format!("Processing {} failed", video_id))?;

    for sighting in &summary.sightings {
        println!("{:>9.2}s  {}", sighting.seconds_into_video, sighting.layout);
    }

    if summary.cancelled {
        warn!("{} was cancelled; not marking it processed", video_id);
        return Ok(());
    }
    if let Some(channel_id) = metadata.channel_id.as_deref() {
        let name = metadata.channel_name.as_deref().unwrap_or(channel_id);
        store.save_channel(channel_id, name, metadata.channel_url.as_deref())?;
    }
    store.save_video(&metadata)?;
    info!(
        "{}: {} positions saved to {}",
        video_id,
        summary.sightings.len(),
        store.path().display()
    );
    Ok(())
}

fn log_progress(progress: &Progress) {
    if progress.frames_consumed % PROGRESS_EVERY != 0 {
        return;
    }
    match progress.total_frames {
        Some(total) if total > 0 => info!(
            "{}/{} frames ({:.0}%)",
            progress.frames_consumed,
            total,
            100.0 * progress.frames_consumed as f64 / total as f64
        ),
        _ => info!("{} frames", progress.frames_consumed),
    }
}

/// File stem of a path or the last segment of a URL.
fn default_video_id(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a video id from {}; pass --video-id", path.display()))
}
