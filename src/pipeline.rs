//! Caller-facing loop operations: Sampler → Search → Synthesizer, with the
//! search skipped when the caller supplies explicit loop points.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;

use crate::config::{AppConfig, ConfigError};
use crate::engine::{Encoding, Engine, EngineError, RenderJob};
use crate::sampler::{self, SampleError, SamplerSettings};
use crate::search::{self, LoopMatch, LoopPoint, SearchParams};
use crate::synth::{self, LoopSpec, SynthError};

#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Could not probe source: {0}")]
    Probe(#[source] EngineError),
    #[error("Invalid search settings: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error("No similar frames found in the first {window:.1}s. Try specifying start and end manually.")]
    NotFound { window: f64 },
    #[error(transparent)]
    Synth(#[from] SynthError),
}

/// Where a loop's start and end came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointSource {
    Manual,
    Search { score: f64 },
}

/// A single loop request.
#[derive(Debug, Clone, Default)]
pub struct LoopRequest {
    pub input: PathBuf,
    /// Output path; defaults to the input path with the configured suffix.
    pub output: Option<PathBuf>,
    /// Explicit loop points. Skips sampling and search.
    pub manual: Option<LoopPoint>,
    /// Overrides the configured crossfade.
    pub crossfade: Option<f64>,
    /// Overrides the configured search window.
    pub search_window: Option<f64>,
    /// Overrides the configured similarity threshold.
    pub threshold: Option<f64>,
    /// Show a progress bar during the pairwise scan.
    pub progress: bool,
}

/// A validated loop, ready to render.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    pub spec: LoopSpec,
    pub origin: PointSource,
    pub job: RenderJob,
}

/// Sample the head of `source` and search it for the best loop points.
///
/// `Ok(None)` means the search ran but nothing met the threshold; the caller
/// should fall back to explicit start and end times.
pub fn find_loop_points<E: Engine + ?Sized>(
    engine: &E,
    source: &Path,
    source_duration: f64,
    settings: &SamplerSettings,
    params: &SearchParams,
    pb: &ProgressBar,
) -> Result<Option<LoopMatch>, SampleError> {
    log::info!(
        "Finding loop points in {}, search duration: {:.2}s",
        source.display(),
        settings.window_for(source_duration)
    );
    let frames = sampler::sample_frames(engine, source, source_duration, settings)?;
    Ok(search::find_best_pair_with_progress(&frames, params, pb))
}

/// Validate `point` against the source and render the cross-faded loop.
pub fn synthesize_loop<E: Engine + ?Sized>(
    engine: &E,
    source: &Path,
    output: &Path,
    point: LoopPoint,
    source_duration: f64,
    crossfade: f64,
    encoding: Encoding,
) -> Result<PathBuf, SynthError> {
    let spec = LoopSpec::new(point, source_duration, crossfade)?;
    synth::render_loop(engine, &spec, source, output, encoding)
}

/// Resolve loop points (manual or searched) and validate them, without rendering.
pub fn plan_loop<E: Engine + ?Sized>(
    engine: &E,
    request: &LoopRequest,
    config: &AppConfig,
) -> Result<LoopPlan, LoopError> {
    let info = engine.probe(&request.input).map_err(LoopError::Probe)?;
    log::info!(
        "Input: {} ({:.1}s, {}x{}, {} fps, {})",
        request.input.display(),
        info.duration,
        info.width,
        info.height,
        info.fps,
        info.codec
    );

    let (point, origin) = match request.manual {
        Some(point) => {
            log::info!("Loop: {}s -> {}s (manual)", point.start, point.end);
            (point, PointSource::Manual)
        }
        None => {
            let search_config = config
                .search
                .with_overrides(request.search_window, request.threshold)?;
            let settings = SamplerSettings::from(&search_config);
            let params = SearchParams::from(&search_config);
            let pb = if request.progress {
                comparison_bar()
            } else {
                ProgressBar::hidden()
            };

            match find_loop_points(engine, &request.input, info.duration, &settings, &params, &pb)? {
                Some(found) => (found.point, PointSource::Search { score: found.score }),
                None => {
                    return Err(LoopError::NotFound {
                        window: settings.window_for(info.duration),
                    });
                }
            }
        }
    };

    let crossfade = request.crossfade.unwrap_or(config.render.crossfade_secs);
    let spec = LoopSpec::new(point, info.duration, crossfade)?;
    let output = request
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&request.input, &config.render.output_suffix));
    let job = spec.render_job(&request.input, &output, Encoding::from(&config.render))?;

    Ok(LoopPlan { spec, origin, job })
}

/// Plan and render a loop. Returns the plan and the rendered output path.
pub fn create_loop<E: Engine + ?Sized>(
    engine: &E,
    request: &LoopRequest,
    config: &AppConfig,
) -> Result<(LoopPlan, PathBuf), LoopError> {
    let plan = plan_loop(engine, request, config)?;
    let output = synth::render_loop(
        engine,
        &plan.spec,
        &plan.job.source,
        &plan.job.output,
        plan.job.encoding.clone(),
    )?;
    Ok((plan, output))
}

/// `dir/clip.mp4` → `dir/clip<suffix>.mp4`; no extension → suffix appended.
pub fn default_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    input.with_file_name(name)
}

fn comparison_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} start frames ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message("comparing");
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExtractJob, MediaInfo};
    use image::{Rgb, RgbImage};
    use std::cell::RefCell;

    /// In-memory engine: fixed duration, synthetic frames, recorded calls.
    struct FakeEngine {
        duration: f64,
        /// Frame index → seed; equal seeds produce identical frames.
        seeds: Box<dyn Fn(usize) -> u64>,
        fail_render: bool,
        extracted: RefCell<Vec<PathBuf>>,
        rendered: RefCell<Vec<RenderJob>>,
    }

    impl FakeEngine {
        fn new(duration: f64, seeds: impl Fn(usize) -> u64 + 'static) -> Self {
            Self {
                duration,
                seeds: Box::new(seeds),
                fail_render: false,
                extracted: RefCell::new(Vec::new()),
                rendered: RefCell::new(Vec::new()),
            }
        }
    }

    fn noise_frame(seed: u64, size: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        RgbImage::from_fn(size, size, |_, _| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = state.to_le_bytes();
            Rgb([v[0], v[1], v[2]])
        })
    }

    impl Engine for FakeEngine {
        fn probe(&self, _source: &Path) -> Result<MediaInfo, EngineError> {
            Ok(MediaInfo {
                duration: self.duration,
                width: 640,
                height: 360,
                fps: 30.0,
                codec: "h264".to_string(),
            })
        }

        fn extract_frames(&self, job: &ExtractJob, dest: &Path) -> Result<(), EngineError> {
            self.extracted.borrow_mut().push(dest.to_path_buf());
            let count = (job.window_secs * job.fps as f64).round() as usize + 1;
            for k in 0..count {
                noise_frame((self.seeds)(k), job.frame_size)
                    .save(dest.join(format!("frame_{:04}.png", k + 1)))
                    .map_err(|e| EngineError::Probe(e.to_string()))?;
            }
            Ok(())
        }

        fn render(&self, job: &RenderJob) -> Result<(), EngineError> {
            self.rendered.borrow_mut().push(job.clone());
            if self.fail_render {
                return Err(EngineError::Failed {
                    program: "ffmpeg".to_string(),
                    status: Some(1),
                    stderr: "Conversion failed!".to_string(),
                });
            }
            std::fs::write(&job.output, b"loop")?;
            Ok(())
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.search.frame_size = 16;
        config.search.workers = 2;
        config
    }

    /// Frames at 1.0s and 7.2s are identical, every other frame is unique.
    fn scenario_engine(duration: f64) -> FakeEngine {
        FakeEngine::new(duration, |k| if k == 72 { 11 } else { k as u64 + 1 })
    }

    #[test]
    fn test_end_to_end_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scenario_engine(20.0);
        let request = LoopRequest {
            input: dir.path().join("clip.mp4"),
            ..LoopRequest::default()
        };

        let (plan, output) = create_loop(&engine, &request, &test_config()).unwrap();

        assert!((plan.spec.start() - 1.0).abs() < 1e-12);
        assert!((plan.spec.end() - 7.2).abs() < 1e-12);
        assert_eq!(plan.origin, PointSource::Search { score: 1.0 });
        assert_eq!(output, dir.path().join("clip_loop.mp4"));
        assert!(output.exists());

        let rendered = engine.rendered.borrow();
        assert_eq!(rendered.len(), 1);
        assert!((rendered[0].duration - 6.2).abs() < 1e-12);

        // The scratch directory is gone after sampling.
        let scratch = engine.extracted.borrow()[0].clone();
        assert!(!scratch.exists());
    }

    #[test]
    fn test_find_loop_points_direct() {
        let engine = scenario_engine(20.0);
        let config = test_config();
        let found = find_loop_points(
            &engine,
            Path::new("clip.mp4"),
            20.0,
            &SamplerSettings::from(&config.search),
            &SearchParams::from(&config.search),
            &ProgressBar::hidden(),
        )
        .unwrap()
        .unwrap();
        assert_eq!((found.start_frame, found.end_frame), (10, 72));
    }

    #[test]
    fn test_manual_override_skips_search() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scenario_engine(20.0);
        let request = LoopRequest {
            input: dir.path().join("clip.mp4"),
            output: Some(dir.path().join("custom.mp4")),
            manual: Some(LoopPoint::new(2.0, 5.0)),
            ..LoopRequest::default()
        };

        let (plan, output) = create_loop(&engine, &request, &test_config()).unwrap();

        assert!(engine.extracted.borrow().is_empty());
        assert_eq!(plan.origin, PointSource::Manual);
        assert_eq!(output, dir.path().join("custom.mp4"));
        assert_eq!(engine.rendered.borrow()[0].start, 2.0);
    }

    #[test]
    fn test_validation_precedes_render() {
        let engine = scenario_engine(1.0);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            manual: Some(LoopPoint::new(5.0, 3.0)),
            ..LoopRequest::default()
        };
        let err = create_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(err, LoopError::Synth(SynthError::InvalidRange { .. })));
        assert!(engine.rendered.borrow().is_empty());
    }

    #[test]
    fn test_manual_range_past_end() {
        let engine = scenario_engine(4.0);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            manual: Some(LoopPoint::new(1.0, 6.0)),
            ..LoopRequest::default()
        };
        let err = create_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(err, LoopError::Synth(SynthError::RangeExceedsSource { .. })));
        assert!(err.to_string().contains("4.000"));
    }

    #[test]
    fn test_crossfade_override_too_long() {
        let engine = scenario_engine(20.0);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            manual: Some(LoopPoint::new(0.0, 0.8)),
            crossfade: Some(0.5),
            ..LoopRequest::default()
        };
        let err = create_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(
            err,
            LoopError::Synth(SynthError::RegionTooShortForCrossfade { .. })
        ));
    }

    #[test]
    fn test_not_found_cleans_up() {
        let engine = FakeEngine::new(20.0, |k| k as u64 + 1);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            ..LoopRequest::default()
        };
        let err = create_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(err, LoopError::NotFound { .. }));
        assert!(err.to_string().contains("manually"));
        assert!(engine.rendered.borrow().is_empty());
        assert!(!engine.extracted.borrow()[0].exists());
    }

    #[test]
    fn test_threshold_override() {
        // Nothing identical, but a permissive threshold accepts the best noise pair.
        let engine = FakeEngine::new(20.0, |k| k as u64 + 1);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            threshold: Some(0.0),
            search_window: Some(3.0),
            ..LoopRequest::default()
        };
        let plan = plan_loop(&engine, &request, &test_config()).unwrap();
        assert!(matches!(plan.origin, PointSource::Search { .. }));
        assert!(plan.spec.end() <= 3.0);
        assert!(engine.rendered.borrow().is_empty());
    }

    #[test]
    fn test_nan_threshold_override_rejected() {
        let engine = scenario_engine(20.0);
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            threshold: Some(f64::NAN),
            ..LoopRequest::default()
        };
        let err = plan_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
        assert!(engine.extracted.borrow().is_empty());
    }

    #[test]
    fn test_render_failure_surfaces_engine_text() {
        let mut engine = scenario_engine(20.0);
        engine.fail_render = true;
        let request = LoopRequest {
            input: PathBuf::from("clip.mp4"),
            output: Some(PathBuf::from("never_written.mp4")),
            ..LoopRequest::default()
        };
        let err = create_loop(&engine, &request, &test_config()).unwrap_err();
        assert!(matches!(err, LoopError::Synth(SynthError::Engine(_))));
        assert!(err.to_string().contains("Conversion failed!"));
        assert!(!engine.extracted.borrow()[0].exists());
    }

    #[test]
    fn test_synthesize_loop_direct() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scenario_engine(20.0);
        let output = synthesize_loop(
            &engine,
            Path::new("clip.mp4"),
            &dir.path().join("out.mp4"),
            LoopPoint::new(1.0, 7.2),
            20.0,
            synth::DEFAULT_CROSSFADE_SECS,
            Encoding::from(&test_config().render),
        )
        .unwrap();
        assert!(output.exists());
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/videos/clip.mp4"), "_loop"),
            PathBuf::from("/videos/clip_loop.mp4")
        );
        assert_eq!(
            default_output_path(Path::new("clip"), "_loop"),
            PathBuf::from("clip_loop")
        );
        assert_eq!(
            default_output_path(Path::new("a.b.mkv"), "_loop"),
            PathBuf::from("a.b_loop.mkv")
        );
    }
}
