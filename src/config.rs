//! Config module.
//! Loads pipeline tuning (queue sizes, detector thresholds, stability window)
//! from a JSON file. Uses serde; every field has a default so partial files work.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Board locator tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Side of the square corner kernel in pixels (even).
    pub kernel_size: u32,
    /// Correlation response needed for a pixel to count as a corner hit.
    pub match_threshold: f32,
    /// Fewer corner centroids than this means no board.
    pub min_corners: usize,
    /// A grid line needs this many centroids sharing its coordinate.
    pub min_line_support: usize,
    /// Frames with a larger side are downscaled before detection.
    pub max_dimension: u32,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            kernel_size: 12,
            match_threshold: 0.85,
            min_corners: 20,
            min_line_support: 3,
            max_dimension: 2000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub window: usize,
    /// Rotate layouts that look like they are seen from black's side.
    pub normalize_orientation: bool,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window: 10,
            normalize_orientation: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the decoded-frame queue.
    pub frame_queue_capacity: usize,
    /// Capacity of the worker -> coordinator queue.
    pub tile_queue_capacity: usize,
    pub poll_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub locator: LocatorConfig,
    pub stability: StabilityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 30,
            tile_queue_capacity: 30,
            poll_interval_ms: 50,
            shutdown_grace_ms: 2_000,
            locator: LocatorConfig::default(),
            stability: StabilityConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_queue_capacity == 0 || self.tile_queue_capacity == 0 {
            anyhow::bail!("Queue capacities must be at least 1");
        }
        if self.stability.window == 0 {
            anyhow::bail!("Stability window must hold at least one frame");
        }
        if self.locator.kernel_size < 2 || self.locator.kernel_size % 2 != 0 {
            anyhow::bail!(
                "Corner kernel size must be an even number >= 2 (got {})",
                self.locator.kernel_size
            );
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
