//! The external transcoding engine.
//!
//! The loop pipeline needs three things from an engine: a duration probe,
//! sampled still frames, and the final filter-graph render. They sit behind
//! the [`Engine`] trait; [`FfmpegEngine`] shells out to ffmpeg/ffprobe.

pub mod probe;
pub mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::{EngineConfig, RenderConfig};
use crate::filtergraph::{FilterGraph, GraphError, format_secs};

pub use probe::MediaInfo;

/// File name pattern the engine writes sampled frames under.
pub const FRAME_PATTERN: &str = "frame_%04d.png";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{program} not found. Install ffmpeg (e.g. `sudo apt install ffmpeg`) or set [engine] paths in the config")]
    NotFound { program: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} failed (exit {}): {stderr}", describe_status(.status))]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{program} did not finish within {secs:.1}s")]
    Timeout { program: String, secs: f64 },
    #[error("Engine reported success but {} is missing", .path.display())]
    MissingOutput { path: PathBuf },
    #[error("Probe failed: {0}")]
    Probe(String),
}

/// Request to sample still frames from the head of a source.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractJob {
    pub source: PathBuf,
    /// Seconds from the start of the source to sample.
    pub window_secs: f64,
    /// Frames per second to sample.
    pub fps: u32,
    /// Frames are scaled to `frame_size` x `frame_size`.
    pub frame_size: u32,
}

/// Output encoding parameters for the final render.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
}

impl From<&RenderConfig> for Encoding {
    fn from(config: &RenderConfig) -> Self {
        Self {
            video_codec: config.video_codec.clone(),
            preset: config.preset.clone(),
            crf: config.crf,
        }
    }
}

/// Request to render `[start, start + duration)` of a source through a filter graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub source: PathBuf,
    pub output: PathBuf,
    pub start: f64,
    pub duration: f64,
    pub graph: FilterGraph,
    /// Graph pad mapped to the output file.
    pub output_label: String,
    pub encoding: Encoding,
}

impl RenderJob {
    /// Check the graph's wiring with `output_label` as its only sink.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.graph.validate(&[self.output_label.as_str()])
    }
}

pub trait Engine {
    /// Probe a media file for duration and basic stream info.
    fn probe(&self, source: &Path) -> Result<MediaInfo, EngineError>;

    /// Write `job`'s sampled frames into `dest` as [`FRAME_PATTERN`] files, in time order.
    fn extract_frames(&self, job: &ExtractJob, dest: &Path) -> Result<(), EngineError>;

    /// Execute the render and produce `job.output`.
    fn render(&self, job: &RenderJob) -> Result<(), EngineError>;
}

/// [`Engine`] backed by the ffmpeg and ffprobe command-line tools.
#[derive(Debug, Clone)]
pub struct FfmpegEngine {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg.clone(),
            ffprobe: config.ffprobe.clone(),
            timeout: config.timeout(),
        }
    }

    /// Check that ffmpeg can be executed at all.
    pub fn check(&self) -> Result<(), EngineError> {
        process::run(&self.ffmpeg, &["-version".to_string()], self.timeout)?;
        Ok(())
    }

    pub fn extract_args(job: &ExtractJob, dest: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            job.source.to_string_lossy().into_owned(),
            "-t".into(),
            format_secs(job.window_secs),
            "-vf".into(),
            format!("fps={},scale={}:{}", job.fps, job.frame_size, job.frame_size),
            "-f".into(),
            "image2".into(),
            dest.join(FRAME_PATTERN).to_string_lossy().into_owned(),
        ]
    }

    /// Seeking happens on the input so the graph sees the region starting at t=0.
    pub fn render_args(job: &RenderJob) -> Vec<String> {
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-ss".into(),
            format_secs(job.start),
            "-t".into(),
            format_secs(job.duration),
            "-i".into(),
            job.source.to_string_lossy().into_owned(),
            "-filter_complex".into(),
            job.graph.to_string(),
            "-map".into(),
            format!("[{}]", job.output_label),
            "-c:v".into(),
            job.encoding.video_codec.clone(),
            "-preset".into(),
            job.encoding.preset.clone(),
            "-crf".into(),
            job.encoding.crf.to_string(),
            "-an".into(),
            job.output.to_string_lossy().into_owned(),
        ]
    }

    /// Shell-style rendering of the render command, for dry runs and logs.
    pub fn render_command_line(&self, job: &RenderJob) -> String {
        let mut parts = vec![shell_quote(&self.ffmpeg.to_string_lossy())];
        parts.extend(Self::render_args(job).iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl Engine for FfmpegEngine {
    fn probe(&self, source: &Path) -> Result<MediaInfo, EngineError> {
        if !source.exists() {
            return Err(EngineError::Probe(format!(
                "Input file not found: {}",
                source.display()
            )));
        }
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_format".to_string(),
            "-show_streams".to_string(),
            source.to_string_lossy().into_owned(),
        ];
        let output = process::run(&self.ffprobe, &args, self.timeout)?;
        probe::parse_probe_output(&output.stdout)
    }

    fn extract_frames(&self, job: &ExtractJob, dest: &Path) -> Result<(), EngineError> {
        let args = Self::extract_args(job, dest);
        log::info!("Extracting frames with: {} {}", self.ffmpeg.display(), args.join(" "));
        process::run(&self.ffmpeg, &args, self.timeout)?;
        Ok(())
    }

    fn render(&self, job: &RenderJob) -> Result<(), EngineError> {
        log::info!("Rendering: {}", self.render_command_line(job));
        process::run(&self.ffmpeg, &Self::render_args(job), self.timeout)?;
        if !job.output.exists() {
            return Err(EngineError::MissingOutput {
                path: job.output.clone(),
            });
        }
        Ok(())
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
