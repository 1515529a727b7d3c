use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "quire")
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("quire-data"))
}

/// Where blob and page content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// A directory on the local filesystem.
    Local { root: PathBuf },
    /// An S3-compatible bucket. Credentials are explicit; there is no
    /// fallback to the ambient AWS environment.
    S3 {
        bucket: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
}
impl Default for StorageConfig {
    fn default() -> Self {
        Self::Local { root: data_dir().join("media") }
    }
}

/// Scratch area for unpacking and normalising uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub root: PathBuf,
}
impl Default for StagingConfig {
    fn default() -> Self {
        Self { root: std::env::temp_dir().join("quire") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file.
    pub path: PathBuf,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: data_dir().join("quire.db") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum concurrent CPU-bound jobs (decoding, encoding, extraction).
    pub blocking_threads: usize,
    /// Workers draining the deferred task queue.
    pub deferred_workers: usize,
    /// Deferred tasks that may be queued before `enqueue` waits.
    pub queue_capacity: usize,
    /// Attempts per deferred task, including the first.
    pub max_attempts: u32,
}
impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            blocking_threads: std::thread::available_parallelism().map(usize::from).unwrap_or(4),
            deferred_workers: 2,
            queue_capacity: 256,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// JPEG quality (1-100) for normalised pages.
    pub jpeg_quality: u8,
    /// Slice parts are at most `part_ratio × width` pixels tall.
    pub part_ratio: u32,
    /// Largest strip (width × summed heights) that slicing will assemble in
    /// memory. Three bytes per pixel.
    pub max_slice_pixels: u64,
}
impl Default for ImageConfig {
    fn default() -> Self {
        Self { jpeg_quality: 75, part_ratio: 2, max_slice_pixels: 100_000_000 }
    }
}
