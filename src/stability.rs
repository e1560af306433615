use crate::config::StabilityConfig;
use std::collections::VecDeque;
use std::sync::Arc;

/// A layout that stayed on screen long enough to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSighting {
    pub video_id: Arc<str>,
    pub layout: String,
    pub seconds_into_video: f64,
}

/// Debounces per-frame classifications.
///
/// The last `window` outcomes are kept (initially all "none"). A layout is
/// accepted once it fills the whole window and differs from the previously
/// accepted one. Its timestamp is backdated by the window length, so it
/// points at the first frame of the run rather than the confirming frame.
/// That is a fixed frame-count offset; dropped frames or a variable frame
/// rate are not accounted for.
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    video_id: Arc<str>,
    fps: f64,
    history: VecDeque<Option<String>>,
    window: usize,
    last_accepted: Option<String>,
}

impl StabilityFilter {
    pub fn new(video_id: Arc<str>, fps: f64, config: &StabilityConfig) -> Self {
        let window = config.window.max(1);
        Self {
            video_id,
            fps,
            history: std::iter::repeat_n(None, window).collect(),
            window,
            last_accepted: None,
        }
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    /// Feeds the outcome for 1-based `frame_number` (frames consumed so far).
    pub fn observe(
        &mut self,
        frame_number: u64,
        classification: Option<String>,
    ) -> Option<PositionSighting> {
        self.history.pop_front();
        self.history.push_back(classification);

        let current = self.history.back()?.as_ref()?;
        if self.history.iter().any(|c| c.as_ref() != Some(current)) {
            return None;
        }
        if self.last_accepted.as_ref() == Some(current) {
            return None;
        }

        let layout = current.clone();
        self.last_accepted = Some(layout.clone());
        Some(PositionSighting {
            video_id: self.video_id.clone(),
            layout,
            seconds_into_video: self.backdated_seconds(frame_number),
        })
    }

    pub fn last_accepted(&self) -> Option<&str> {
        self.last_accepted.as_deref()
    }

    pub fn is_settled(&self) -> bool {
        let first = self.history.front();
        self.history.iter().all(|c| Some(c) == first)
    }

    /// Clears history and the accepted layout (end of stream).
    pub fn reset(&mut self) {
        self.history = std::iter::repeat_n(None, self.window).collect();
        self.last_accepted = None;
    }

    fn backdated_seconds(&self, frame_number: u64) -> f64 {
        if self.fps > 0.0 {
            (frame_number as f64 - self.window as f64) / self.fps
        } else {
            0.0
        }
    }
}
