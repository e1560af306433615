//! Sighting persistence.
//! Channels and videos are upserted by id; layouts are stored once and every
//! sighting references its layout. Two backends:
//! - [`MemoryStore`]: process-local, for tests and dry runs
//! - [`JsonlStore`]: append-only JSON lines file, index rebuilt on open

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// What is known about a video besides its frames.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub channel_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub view_count: Option<u64>,
    pub length_seconds: Option<f64>,
}

impl VideoMetadata {
    /// Metadata for a video known only by id.
    pub fn untitled(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata file {}", path.display()))?;
        let meta: VideoMetadata = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse metadata file {}", path.display()))?;
        if meta.id.is_empty() {
            anyhow::bail!("Metadata file {} has no video id", path.display());
        }
        Ok(meta)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub url: Option<String>,
}

/// A stored sighting with its layout resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSighting {
    pub video_id: String,
    pub layout: String,
    pub seconds_into_video: f64,
}

pub trait SightingStore: Send + Sync {
    /// Inserts the channel unless its id is already known.
    fn save_channel(&self, id: &str, name: &str, url: Option<&str>) -> Result<()>;

    /// Inserts the video unless its id is already known. Saving a video marks
    /// it processed.
    fn save_video(&self, meta: &VideoMetadata) -> Result<()>;

    fn save_position_sighting(&self, video_id: &str, layout: &str, seconds_into_video: f64) -> Result<()>;

    fn all_processed_video_ids(&self) -> Result<Vec<String>>;

    fn sightings_for(&self, video_id: &str) -> Result<Vec<StoredSighting>>;
}

// *************** Shared index ***************

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Channel(ChannelRecord),
    Video(VideoMetadata),
    Position {
        id: u64,
        layout: String,
    },
    Sighting {
        position_id: u64,
        video_id: String,
        seconds_into_video: f64,
    },
}

#[derive(Debug, Default)]
struct Index {
    channels: HashMap<String, ChannelRecord>,
    videos: HashMap<String, VideoMetadata>,
    /// layout -> position id
    positions: HashMap<String, u64>,
    layouts: HashMap<u64, String>,
    /// One above the highest position id read or written.
    next_position_id: u64,
    sightings: Vec<(u64, String, f64)>,
}

impl Index {
    fn apply(&mut self, record: Record) {
        match record {
            Record::Channel(channel) => {
                self.channels.entry(channel.id.clone()).or_insert(channel);
            }
            Record::Video(meta) => {
                self.videos.entry(meta.id.clone()).or_insert(meta);
            }
            Record::Position { id, layout } => {
                self.next_position_id = self.next_position_id.max(id + 1);
                self.positions.insert(layout.clone(), id);
                self.layouts.insert(id, layout);
            }
            Record::Sighting {
                position_id,
                video_id,
                seconds_into_video,
            } => self.sightings.push((position_id, video_id, seconds_into_video)),
        }
    }

    /// Records that a change needs, in order. Already-known channels and
    /// videos produce nothing.
    fn plan_channel(&self, id: &str, name: &str, url: Option<&str>) -> Vec<Record> {
        if self.channels.contains_key(id) {
            return Vec::new();
        }
        vec![Record::Channel(ChannelRecord {
            id: id.to_string(),
            name: name.to_string(),
            url: url.map(str::to_string),
        })]
    }

    fn plan_video(&self, meta: &VideoMetadata) -> Vec<Record> {
        if self.videos.contains_key(&meta.id) {
            return Vec::new();
        }
        vec![Record::Video(meta.clone())]
    }

    fn plan_sighting(&self, video_id: &str, layout: &str, seconds_into_video: f64) -> Vec<Record> {
        let mut records = Vec::with_capacity(2);
        let position_id = match self.positions.get(layout) {
            Some(&id) => id,
            None => {
                let id = self.next_position_id.max(1);
                records.push(Record::Position {
                    id,
                    layout: layout.to_string(),
                });
                id
            }
        };
        records.push(Record::Sighting {
            position_id,
            video_id: video_id.to_string(),
            seconds_into_video,
        });
        records
    }

    fn processed_video_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.videos.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn sightings_for(&self, video_id: &str) -> Vec<StoredSighting> {
        self.sightings
            .iter()
            .filter(|(_, vid, _)| vid == video_id)
            .filter_map(|(position_id, vid, seconds)| {
                self.layouts.get(position_id).map(|layout| StoredSighting {
                    video_id: vid.clone(),
                    layout: layout.clone(),
                    seconds_into_video: *seconds,
                })
            })
            .collect()
    }

    fn position_count(&self) -> usize {
        self.layouts.len()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("Store lock poisoned by a panicking writer")
}

// *************** MemoryStore ***************

#[derive(Default)]
pub struct MemoryStore {
    index: Mutex<Index>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct layouts stored.
    pub fn position_count(&self) -> usize {
        self.index.lock().map(|i| i.position_count()).unwrap_or(0)
    }

    fn commit(&self, plan: impl FnOnce(&Index) -> Vec<Record>) -> Result<()> {
        let mut index = self.index.lock().map_err(poisoned)?;
        for record in plan(&index) {
            index.apply(record);
        }
        Ok(())
    }
}

impl SightingStore for MemoryStore {
    fn save_channel(&self, id: &str, name: &str, url: Option<&str>) -> Result<()> {
        self.commit(|index| index.plan_channel(id, name, url))
    }

    fn save_video(&self, meta: &VideoMetadata) -> Result<()> {
        self.commit(|index| index.plan_video(meta))
    }

    fn save_position_sighting(&self, video_id: &str, layout: &str, seconds_into_video: f64) -> Result<()> {
        self.commit(|index| index.plan_sighting(video_id, layout, seconds_into_video))
    }

    fn all_processed_video_ids(&self) -> Result<Vec<String>> {
        Ok(self.index.lock().map_err(poisoned)?.processed_video_ids())
    }

    fn sightings_for(&self, video_id: &str) -> Result<Vec<StoredSighting>> {
        Ok(self.index.lock().map_err(poisoned)?.sightings_for(video_id))
    }
}

// *************** JsonlStore ***************

struct JsonlState {
    index: Index,
    file: File,
}

pub struct JsonlStore {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlStore {
    /// Opens (or creates) the store file and replays it into memory.
    /// Unparseable lines are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
        }

        let mut index = Index::default();
        let mut torn_tail = false;
        if path.exists() {
            let reader = BufReader::new(
                File::open(&path).with_context(|| format!("Failed to open store {}", path.display()))?,
            );
            for (line_no, line) in reader.lines().enumerate() {
                let line = line.with_context(|| format!("Failed to read store {}", path.display()))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record>(&line) {
                    Ok(record) => index.apply(record),
                    Err(e) => warn!("{}:{}: skipping unreadable record: {}", path.display(), line_no + 1, e),
                }
            }
            torn_tail = ends_mid_line(&path)
                .with_context(|| format!("Failed to read store {}", path.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open store {} for writing", path.display()))?;
        if torn_tail {
            // Keep the next record off the broken line.
            warn!("{}: last record is incomplete", path.display());
            file.write_all(b"\n")
                .with_context(|| format!("Failed to repair store {}", path.display()))?;
        }

        info!(
            "Opened store {} ({} videos, {} positions, {} sightings)",
            path.display(),
            index.videos.len(),
            index.position_count(),
            index.sightings.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(JsonlState { index, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, plan: impl FnOnce(&Index) -> Vec<Record>) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let records = plan(&state.index);
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize store record")?;
            buf.push(b'\n');
        }
        state
            .file
            .write_all(&buf)
            .and_then(|_| state.file.flush())
            .with_context(|| format!("Failed to append to store {}", self.path.display()))?;

        debug!("Appended {} records to {}", records.len(), self.path.display());
        for record in records {
            state.index.apply(record);
        }
        Ok(())
    }
}

fn ends_mid_line(path: &Path) -> std::io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl SightingStore for JsonlStore {
    fn save_channel(&self, id: &str, name: &str, url: Option<&str>) -> Result<()> {
        self.commit(|index| index.plan_channel(id, name, url))
    }

    fn save_video(&self, meta: &VideoMetadata) -> Result<()> {
        self.commit(|index| index.plan_video(meta))
    }

    fn save_position_sighting(&self, video_id: &str, layout: &str, seconds_into_video: f64) -> Result<()> {
        self.commit(|index| index.plan_sighting(video_id, layout, seconds_into_video))
    }

    fn all_processed_video_ids(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().map_err(poisoned)?.index.processed_video_ids())
    }

    fn sightings_for(&self, video_id: &str) -> Result<Vec<StoredSighting>> {
        Ok(self.state.lock().map_err(poisoned)?.index.sightings_for(video_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR";
    const B: &str = "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR";
    const C: &str = "rnbqkbnr/pppp1ppp/8/4p3/4P3/8/PPPP1PPP/RNBQKBNR";

    fn line(record: &Record) -> String {
        serde_json::to_string(record).unwrap()
    }

    fn temp_store_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fenwatch-store-{}-{}", name, std::process::id()));
        fs::remove_dir_all(&dir).ok();
        dir.join("sightings.jsonl")
    }

    #[test]
    fn test_memory_store_dedups_layouts() {
        let store = MemoryStore::new();
        store.save_position_sighting("v1", A, 0.0).unwrap();
        store.save_position_sighting("v1", B, 3.5).unwrap();
        store.save_position_sighting("v2", A, 10.0).unwrap();

        assert_eq!(store.position_count(), 2);
        let v1 = store.sightings_for("v1").unwrap();
        assert_eq!(v1.len(), 2);
        assert_eq!(v1[1].layout, B);
        assert_eq!(v1[1].seconds_into_video, 3.5);
        assert_eq!(store.sightings_for("v2").unwrap()[0].layout, A);
    }

    #[test]
    fn test_memory_store_upserts_are_idempotent() {
        let store = MemoryStore::new();
        let mut meta = VideoMetadata::untitled("v1");
        store.save_video(&meta).unwrap();
        meta.title = "renamed".to_string();
        store.save_video(&meta).unwrap();
        store.save_channel("c1", "Chess Channel", None).unwrap();
        store.save_channel("c1", "Other", None).unwrap();

        assert_eq!(store.all_processed_video_ids().unwrap(), vec!["v1".to_string()]);
        let index = store.index.lock().unwrap();
        assert_eq!(index.videos["v1"].title, "v1");
        assert_eq!(index.channels["c1"].name, "Chess Channel");
    }

    #[test]
    fn test_jsonl_store_survives_reopen() {
        let path = temp_store_path("reopen");
        {
            let store = JsonlStore::open(&path).unwrap();
            store.save_channel("c1", "Chess Channel", Some("https://example.com/c1")).unwrap();
            store.save_video(&VideoMetadata::untitled("v1")).unwrap();
            store.save_position_sighting("v1", A, 1.5).unwrap();
            store.save_position_sighting("v1", B, 4.0).unwrap();
        }

        let store = JsonlStore::open(&path).unwrap();
        assert_eq!(store.all_processed_video_ids().unwrap(), vec!["v1".to_string()]);
        store.save_position_sighting("v2", A, 7.0).unwrap();
        store.save_video(&VideoMetadata::untitled("v1")).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        // channel, video, 2 positions, 3 sightings
        assert_eq!(raw.lines().count(), 7);
        assert_eq!(store.sightings_for("v2").unwrap()[0].layout, A);
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_jsonl_store_skips_corrupt_lines() {
        let path = temp_store_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = serde_json::to_string(&Record::Video(VideoMetadata::untitled("v9"))).unwrap();
        fs::write(&path, format!("{{not json\n{good}\n")).unwrap();

        let store = JsonlStore::open(&path).unwrap();
        assert_eq!(store.all_processed_video_ids().unwrap(), vec!["v9".to_string()]);
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_lost_position_line_does_not_reuse_its_id() {
        let path = temp_store_path("lost-position");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let position_b = line(&Record::Position {
            id: 2,
            layout: B.to_string(),
        });
        let sighting_b = line(&Record::Sighting {
            position_id: 2,
            video_id: "v1".to_string(),
            seconds_into_video: 4.0,
        });
        // Position 1 was written but is now unreadable.
        fs::write(&path, format!("{{\"kind\":\"posi\n{position_b}\n{sighting_b}\n")).unwrap();

        {
            let store = JsonlStore::open(&path).unwrap();
            store.save_position_sighting("v2", C, 1.0).unwrap();
            assert_eq!(store.sightings_for("v1").unwrap()[0].layout, B);
        }

        let store = JsonlStore::open(&path).unwrap();
        assert_eq!(store.sightings_for("v1").unwrap()[0].layout, B);
        assert_eq!(store.sightings_for("v2").unwrap()[0].layout, C);
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_incomplete_last_line_is_closed_before_appending() {
        let path = temp_store_path("torn");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = line(&Record::Video(VideoMetadata::untitled("v1")));
        fs::write(&path, format!("{good}\n{{\"kind\":\"vid")).unwrap();

        {
            let store = JsonlStore::open(&path).unwrap();
            store.save_video(&VideoMetadata::untitled("v2")).unwrap();
        }

        let store = JsonlStore::open(&path).unwrap();
        assert_eq!(
            store.all_processed_video_ids().unwrap(),
            vec!["v1".to_string(), "v2".to_string()]
        );
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_video_metadata_from_json() {
        let meta: VideoMetadata =
            serde_json::from_str(r#"{"id":"abc","title":"Blitz","view_count":12}"#).unwrap();
        assert_eq!(meta.id, "abc");
        assert_eq!(meta.view_count, Some(12));
        assert_eq!(meta.channel_id, None);
    }
}
