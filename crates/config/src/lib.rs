//! Configuration loading and validation.
//!
//! Values are layered, later layers winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. An optional configuration file (`toml`, `yaml` or `json`, by extension)
//! 3. Environment variables prefixed with `QUIRE_`, using `__` to separate
//!    nested keys (`QUIRE_WORKERS__MAX_ATTEMPTS=3`,
//!    `QUIRE_STORAGE__BACKEND=s3`)
//!
//! The loaded [`Config`] is passed explicitly to whatever needs it; nothing in
//! the workspace reads configuration from a global.

pub mod error;
mod sections;

pub use crate::sections::{DatabaseConfig, ImageConfig, StagingConfig, StorageConfig, WorkerConfig};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "QUIRE_";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub staging: StagingConfig,
    pub database: DatabaseConfig,
    pub workers: WorkerConfig,
    pub images: ImageConfig,
}

impl Config {
    /// Path of the configuration file in the platform config directory
    /// (for example `~/.config/quire/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        sections::project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load configuration from the platform config file (if it exists) and
    /// the environment.
    pub fn discover() -> Result<Self> {
        let path = Self::default_path().filter(|path| path.is_file());
        Self::load(path.as_deref())
    }

    /// Load configuration from an optional file and the environment, then
    /// validate it.
    #[tracing::instrument(level = "debug")]
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(storage = ?config.storage_kind(), "Loaded configuration");
        Ok(config)
    }

    /// The layered provider stack, before extraction.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            figment = match path.extension().and_then(|ext| ext.to_str()).map(str::to_lowercase).as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Reject values that would only fail later, at a less helpful moment.
    pub fn validate(&self) -> Result<()> {
        if let StorageConfig::Local { root } = &self.storage
            && !root.is_absolute()
        {
            exn::bail!(ErrorKind::Invalid(format!("storage root must be absolute: {}", root.display())));
        }
        if !self.staging.root.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!("staging root must be absolute: {}", self.staging.root.display())));
        }
        let workers = &self.workers;
        for (name, value) in [
            ("workers.blocking_threads", workers.blocking_threads),
            ("workers.deferred_workers", workers.deferred_workers),
            ("workers.queue_capacity", workers.queue_capacity),
        ] {
            if value == 0 {
                exn::bail!(ErrorKind::Invalid(format!("{name} must be at least 1")));
            }
        }
        if workers.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("workers.max_attempts must be at least 1".to_string()));
        }
        if !(1..=100).contains(&self.images.jpeg_quality) {
            exn::bail!(ErrorKind::Invalid(format!(
                "images.jpeg_quality must be between 1 and 100, got {}",
                self.images.jpeg_quality
            )));
        }
        if self.images.part_ratio == 0 {
            exn::bail!(ErrorKind::Invalid("images.part_ratio must be at least 1".to_string()));
        }
        if self.images.max_slice_pixels == 0 {
            exn::bail!(ErrorKind::Invalid("images.max_slice_pixels must be at least 1".to_string()));
        }
        Ok(())
    }

    fn storage_kind(&self) -> &'static str {
        match self.storage {
            StorageConfig::Local { .. } => "local",
            StorageConfig::S3 { .. } => "s3",
        }
    }
}
