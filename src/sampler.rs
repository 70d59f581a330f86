//! Frame sampling: pull a short, low-resolution still sequence from the head
//! of a source video for similarity analysis.

use std::path::{Path, PathBuf};

use image::RgbImage;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::SearchConfig;
use crate::engine::{Engine, EngineError, ExtractJob};

/// Frames the engine may drop at the window edges before the sequence is
/// considered incomplete. ffmpeg's fps filter rounds at both ends.
const FRAME_SLACK: usize = 2;

/// Every variant means sampling could not produce the expected frame
/// sequence. None of them are retried.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Frame extraction failed: {0}")]
    Engine(#[from] EngineError),
    #[error("Frame extraction failed: expected about {expected} frames for a {window:.2}s window, engine produced {found}")]
    MissingFrames {
        expected: usize,
        found: usize,
        window: f64,
    },
    #[error("Frame extraction failed: could not decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("Frame extraction failed: scratch directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// One still from the analysis sequence.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Offset from the start of the source, in seconds.
    pub time: f64,
    pub pixels: RgbImage,
}

/// Sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerSettings {
    pub window_secs: f64,
    pub fps: u32,
    pub frame_size: u32,
}

impl From<&SearchConfig> for SamplerSettings {
    fn from(config: &SearchConfig) -> Self {
        Self {
            window_secs: config.window_secs,
            fps: config.sample_fps,
            frame_size: config.frame_size,
        }
    }
}

impl SamplerSettings {
    /// The sampled window: the configured window, capped at the source length.
    pub fn window_for(&self, source_duration: f64) -> f64 {
        self.window_secs.min(source_duration).max(0.0)
    }

    /// Frames a window should yield, not counting the boundary frame.
    pub fn expected_frames(&self, window: f64) -> usize {
        (window * self.fps as f64).round() as usize
    }

    /// Most frames kept: every `k / fps` inside the window, boundary included.
    pub fn max_frames(&self, window: f64) -> usize {
        (window * self.fps as f64 + 1e-9).floor() as usize + 1
    }
}

/// Scratch directory owned by one sampling run.
///
/// The directory and everything in it is removed when this value is dropped,
/// on every exit path.
pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn create() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_frames_", crate::APP_NAME))
            .tempdir()?;
        log::debug!("Scratch directory: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory now, reporting any error instead of ignoring it.
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// Sample the first `min(window, duration)` seconds of `source`.
///
/// Frame `k` is stamped at `k / fps` seconds, so times start at zero and
/// increase strictly.
pub fn sample_frames<E: Engine + ?Sized>(
    engine: &E,
    source: &Path,
    source_duration: f64,
    settings: &SamplerSettings,
) -> Result<Vec<SampledFrame>, SampleError> {
    let window = settings.window_for(source_duration);
    let scratch = ScratchDir::create()?;

    log::info!(
        "Sampling {} at {} fps over {:.2}s ({}x{} frames)",
        source.display(),
        settings.fps,
        window,
        settings.frame_size,
        settings.frame_size
    );

    let job = ExtractJob {
        source: source.to_path_buf(),
        window_secs: window,
        fps: settings.fps,
        frame_size: settings.frame_size,
    };
    engine.extract_frames(&job, scratch.path())?;

    let paths = list_frames(scratch.path())?;
    let expected = settings.expected_frames(window);
    log::info!("Extracted {} frames (expected ~{})", paths.len(), expected);

    if paths.is_empty() || paths.len() + FRAME_SLACK < expected {
        return Err(SampleError::MissingFrames {
            expected,
            found: paths.len(),
            window,
        });
    }

    let frames = paths
        .iter()
        .take(settings.max_frames(window))
        .enumerate()
        .map(|(k, path)| {
            let pixels = image::open(path)
                .map_err(|source| SampleError::Decode {
                    path: path.clone(),
                    source,
                })?
                .to_rgb8();
            Ok(SampledFrame {
                time: k as f64 / settings.fps as f64,
                pixels,
            })
        })
        .collect::<Result<Vec<_>, SampleError>>()?;

    if let Err(e) = scratch.close() {
        log::warn!("Failed to remove scratch directory: {}", e);
    }

    Ok(frames)
}

/// Frame files in the scratch directory, in time order.
fn list_frames(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(index) = path.file_name().and_then(|n| n.to_str()).and_then(frame_index) {
            frames.push((index, path));
        }
    }
    // `%04d` stops padding past 9999, so names don't sort; the index does.
    frames.sort_by_key(|(index, _)| *index);
    Ok(frames.into_iter().map(|(_, path)| path).collect())
}

/// Sequence number of a `frame_<digits>.png` file name.
fn frame_index(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("frame_")?.strip_suffix(".png")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
