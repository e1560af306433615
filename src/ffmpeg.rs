//! Video decoding through the `ffmpeg`/`ffprobe` executables.
//! `ffprobe` reports size and frame rate as JSON, then `ffmpeg` pipes raw
//! 8-bit grayscale frames on stdout. Detection only needs luminance, so
//! decoding straight to gray keeps the pipe small.

use crate::error::SourceError;
use crate::source::FrameSource;
use image::{DynamicImage, GrayImage};
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// What `ffprobe` told us about the first video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StreamInfo {
    width: u32,
    height: u32,
    fps: f64,
    frame_count: Option<u64>,
}

pub struct FfmpegFrameSource {
    video_id: String,
    uri: String,
    info: Option<StreamInfo>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    decoded: u64,
}

impl FfmpegFrameSource {
    /// `uri` is anything ffmpeg accepts as input: a file path or a stream URL.
    pub fn new(video_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            uri: uri.into(),
            info: None,
            child: None,
            stdout: None,
            decoded: 0,
        }
    }

    fn open_error(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Open {
            uri: self.uri.clone(),
            reason: reason.into(),
        }
    }

    fn probe(&self) -> Result<StreamInfo, SourceError> {
        let output = Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,avg_frame_rate,r_frame_rate,nb_frames")
            .arg("-of")
            .arg("json")
            .arg(&self.uri)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.open_error(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.open_error(format!("ffprobe exited with {}: {}", output.status, stderr.trim())));
        }
        parse_probe(&output.stdout).map_err(|reason| self.open_error(reason))
    }

    fn kill_decoder(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl FrameSource for FfmpegFrameSource {
    fn video_id(&self) -> &str {
        &self.video_id
    }

    fn fps(&self) -> f64 {
        self.info.map(|i| i.fps).unwrap_or(0.0)
    }

    fn len(&self) -> Option<u64> {
        self.info.and_then(|i| i.frame_count)
    }

    fn open(&mut self) -> Result<(), SourceError> {
        let info = self.probe()?;
        debug!(
            "{}: {}x{} at {:.3} fps ({:?} frames)",
            self.video_id, info.width, info.height, info.fps, info.frame_count
        );

        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&self.uri)
            .arg("-an")
            .arg("-pix_fmt")
            .arg("gray")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.open_error(format!("failed to start ffmpeg: {e}")))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(self.open_error("failed to capture ffmpeg stdout"));
            }
        };

        self.info = Some(info);
        self.child = Some(child);
        self.stdout = Some(stdout);
        self.decoded = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<DynamicImage>, SourceError> {
        let (Some(info), Some(stdout)) = (self.info, self.stdout.as_mut()) else {
            return Ok(None);
        };

        let mut buffer = vec![0u8; info.width as usize * info.height as usize];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(SourceError::Stream {
                    frames_read: self.decoded,
                    reason: e.to_string(),
                });
            }
        }

        let image = GrayImage::from_raw(info.width, info.height, buffer).ok_or_else(|| {
            SourceError::Stream {
                frames_read: self.decoded,
                reason: "raw frame size mismatch".to_string(),
            }
        })?;
        self.decoded += 1;
        Ok(Some(DynamicImage::ImageLuma8(image)))
    }

    fn close(&mut self) {
        if self.child.is_some() {
            debug!("{}: stopping ffmpeg after {} frames", self.video_id, self.decoded);
        }
        self.kill_decoder();
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        self.kill_decoder();
    }
}

fn parse_probe(json: &[u8]) -> Result<StreamInfo, String> {
    let probe: ProbeOutput =
        serde_json::from_slice(json).map_err(|e| format!("unreadable ffprobe output: {e}"))?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| "no video stream".to_string())?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err("video stream has no frame size".to_string()),
    };

    let fps = [stream.avg_frame_rate.as_deref(), stream.r_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .find_map(parse_frame_rate)
        .ok_or_else(|| "video stream has no usable frame rate".to_string())?;

    let frame_count = stream.nb_frames.as_deref().and_then(|n| n.parse().ok());
    if frame_count.is_none() {
        warn!("ffprobe did not report a frame count");
    }

    Ok(StreamInfo {
        width,
        height,
        fps,
        frame_count,
    })
}

/// Parses "30000/1001" or "25". Zero or malformed rates are `None`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps > 0.0 && fps.is_finite()).then_some(fps)
}
