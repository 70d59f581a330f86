use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid search.{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AppConfig {
    /// Loop point search tuning.
    pub search: SearchConfig,
    /// Output rendering settings.
    pub render: RenderConfig,
    /// External transcoding engine settings.
    pub engine: EngineConfig,
}

/// Frame sampling and similarity search settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// Only the first `window_secs` of the source are sampled.
    pub window_secs: f64,
    /// Sampled frames per second.
    pub sample_fps: u32,
    /// Sampled frames are scaled to `frame_size` x `frame_size`.
    pub frame_size: u32,
    /// Minimum distance between the two loop points, in seconds.
    pub min_loop_secs: f64,
    /// Optional maximum distance between the two loop points, in seconds.
    pub max_loop_secs: Option<f64>,
    /// Minimum similarity score (0..1) for a pair to be accepted.
    pub threshold: f64,
    /// Per-channel difference, as a fraction of full range, above which a pixel counts as different.
    pub channel_tolerance: f64,
    /// Number of parallel workers for the pairwise scan. 0 = auto-detect.
    pub workers: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            window_secs: 10.0,
            sample_fps: 10,
            frame_size: 64,
            min_loop_secs: 1.0,
            max_loop_secs: None,
            threshold: 0.95,
            channel_tolerance: 0.10,
            workers: 0,
        }
    }
}

/// Output rendering settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RenderConfig {
    /// Length of the cross-fade blended over the seam, in seconds.
    pub crossfade_secs: f64,
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    /// Appended to the input file stem when no output path is given.
    pub output_suffix: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            crossfade_secs: 0.5,
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            output_suffix: "_loop".to_string(),
        }
    }
}

/// Locations of the engine binaries and the per-call time ceiling.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Any single engine invocation running longer than this is killed.
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            timeout_secs: 600,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AppConfig {
    /// Load config from `~/.config/vidloop/config.toml`.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Load config from an explicit path.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "Invalid config {}: {}. Using defaults.",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!(
                    "Failed to read {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Parse and range-check a config file's contents.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config = toml::from_str::<AppConfig>(contents)?;
        config.search.validate()?;
        Ok(config)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

impl SearchConfig {
    /// Reject values the sampler and search cannot work with. NaN fails every check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: String) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, reason })
        }

        if !(self.window_secs.is_finite() && self.window_secs > 0.0) {
            return invalid("window_secs", format!("must be a positive number of seconds, got {}", self.window_secs));
        }
        if self.sample_fps == 0 {
            return invalid("sample_fps", "must be at least 1".to_string());
        }
        if self.frame_size == 0 {
            return invalid("frame_size", "must be at least 1".to_string());
        }
        if !(self.min_loop_secs.is_finite() && self.min_loop_secs >= 0.0) {
            return invalid("min_loop_secs", format!("must be zero or more seconds, got {}", self.min_loop_secs));
        }
        if let Some(max) = self.max_loop_secs {
            if !(max.is_finite() && max > 0.0) {
                return invalid("max_loop_secs", format!("must be a positive number of seconds, got {}", max));
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid("threshold", format!("must be between 0 and 1, got {}", self.threshold));
        }
        if !(0.0..=1.0).contains(&self.channel_tolerance) {
            return invalid("channel_tolerance", format!("must be between 0 and 1, got {}", self.channel_tolerance));
        }
        Ok(())
    }

    /// Copy with per-run overrides applied, checked like a loaded config.
    pub fn with_overrides(
        &self,
        window_secs: Option<f64>,
        threshold: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let mut search = self.clone();
        if let Some(window) = window_secs {
            search.window_secs = window;
        }
        if let Some(threshold) = threshold {
            search.threshold = threshold;
        }
        search.validate()?;
        Ok(search)
    }

    /// Resolve worker count: 0 → auto-detect (all cores, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
