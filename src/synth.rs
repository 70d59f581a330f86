//! Loop synthesis: validate the selected region and describe the cross-faded
//! render that makes its end flow back into its beginning.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::engine::{Encoding, Engine, EngineError, RenderJob};
use crate::filtergraph::{Filter, FilterChain, FilterGraph, GraphError};
use crate::search::LoopPoint;

pub const DEFAULT_CROSSFADE_SECS: f64 = 0.5;

/// Slack for float rounding in frame-derived times (`1.3 - 0.3` etc).
const LENGTH_EPSILON: f64 = 1e-9;

/// Graph pad carrying the finished loop.
pub const OUTPUT_LABEL: &str = "outv";

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("Invalid range: start {start:.3}s must be non-negative and before end {end:.3}s")]
    InvalidRange { start: f64, end: f64 },
    #[error("End time {end:.3}s exceeds video duration {duration:.3}s")]
    RangeExceedsSource { end: f64, duration: f64 },
    #[error("Loop duration ({length:.3}s) too short for a {crossfade:.3}s crossfade (needs at least {:.3}s)", 2.0 * .crossfade)]
    RegionTooShortForCrossfade { length: f64, crossfade: f64 },
    #[error("Crossfade duration must be positive, got {crossfade:.3}s")]
    InvalidCrossfade { crossfade: f64 },
    #[error("Invalid filter graph: {0}")]
    Graph(#[from] GraphError),
    #[error("Render failed: {0}")]
    Engine(#[from] EngineError),
}

/// A validated loop region: `end - start >= 2 * crossfade`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSpec {
    start: f64,
    end: f64,
    crossfade: f64,
}

impl LoopSpec {
    /// Validate `point` against the source. Checks run in order and the first
    /// failure wins: range order, source bounds, crossfade room.
    pub fn new(point: LoopPoint, source_duration: f64, crossfade: f64) -> Result<Self, SynthError> {
        let LoopPoint { start, end } = point;

        if !(start >= 0.0 && start < end) {
            return Err(SynthError::InvalidRange { start, end });
        }
        if !(end <= source_duration) {
            return Err(SynthError::RangeExceedsSource {
                end,
                duration: source_duration,
            });
        }
        let length = end - start;
        if !(length + LENGTH_EPSILON >= 2.0 * crossfade) {
            return Err(SynthError::RegionTooShortForCrossfade { length, crossfade });
        }
        if !(crossfade > 0.0) {
            return Err(SynthError::InvalidCrossfade { crossfade });
        }

        Ok(Self {
            start,
            end,
            crossfade,
        })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn crossfade(&self) -> f64 {
        self.crossfade
    }

    /// Region length `D`.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Graph over the region (rebased to t=0) that blends the tail
    /// `[D-c, D)` into the head `[0, c)` and follows it with the middle
    /// `[c, D-c)`. The result is `D - c` long and its last frame leads
    /// into its first.
    pub fn filter_graph(&self) -> FilterGraph {
        let d = self.duration();
        let c = self.crossfade;

        let segment = |start: f64, end: f64| vec![Filter::Trim { start, end }, Filter::ResetPts];

        FilterGraph::new()
            .chain(FilterChain::new(
                &["0:v"],
                vec![Filter::Split { outputs: 3 }],
                &["head_src", "tail_src", "mid_src"],
            ))
            .chain(FilterChain::new(&["head_src"], segment(0.0, c), &["head"]))
            .chain(FilterChain::new(&["tail_src"], segment(d - c, d), &["tail"]))
            .chain(FilterChain::new(
                &["tail", "head"],
                vec![Filter::Crossfade { duration: c }],
                &["blended"],
            ))
            .chain(FilterChain::new(&["mid_src"], segment(c, d - c), &["middle"]))
            .chain(FilterChain::new(
                &["blended", "middle"],
                vec![Filter::Concat { segments: 2 }],
                &[OUTPUT_LABEL],
            ))
    }

    /// The render request for this region. The graph's wiring is checked
    /// before the job is handed out.
    pub fn render_job(
        &self,
        source: &Path,
        output: &Path,
        encoding: Encoding,
    ) -> Result<RenderJob, SynthError> {
        let job = RenderJob {
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            start: self.start,
            duration: self.duration(),
            graph: self.filter_graph(),
            output_label: OUTPUT_LABEL.to_string(),
            encoding,
        };
        job.validate()?;
        Ok(job)
    }
}

/// Build the render job for an already validated region and hand it to
/// `engine`. The engine is not invoked when the graph is miswired.
pub fn render_loop<E: Engine + ?Sized>(
    engine: &E,
    spec: &LoopSpec,
    source: &Path,
    output: &Path,
    encoding: Encoding,
) -> Result<PathBuf, SynthError> {
    let job = spec.render_job(source, output, encoding)?;
    log::info!(
        "Creating seamless loop: {:.2}s -> {:.2}s ({:.2}s crossfade) into {}",
        spec.start,
        spec.end,
        spec.crossfade,
        output.display()
    );
    engine.render(&job)?;
    Ok(job.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;

    fn spec(start: f64, end: f64) -> LoopSpec {
        LoopSpec::new(LoopPoint::new(start, end), 30.0, DEFAULT_CROSSFADE_SECS).unwrap()
    }

    #[test]
    fn test_valid_region() {
        let s = spec(1.0, 7.2);
        assert!((s.duration() - 6.2).abs() < 1e-12);
        assert_eq!(s.crossfade(), 0.5);
    }

    #[test]
    fn test_invalid_range_checked_first() {
        // Duration is absurdly small, but range order is reported first.
        let err = LoopSpec::new(LoopPoint::new(5.0, 3.0), 0.001, 0.5).unwrap_err();
        assert!(matches!(err, SynthError::InvalidRange { start, end } if start == 5.0 && end == 3.0));
    }

    #[test]
    fn test_equal_and_negative_bounds_invalid() {
        assert!(matches!(
            LoopSpec::new(LoopPoint::new(2.0, 2.0), 10.0, 0.5),
            Err(SynthError::InvalidRange { .. })
        ));
        assert!(matches!(
            LoopSpec::new(LoopPoint::new(-1.0, 2.0), 10.0, 0.5),
            Err(SynthError::InvalidRange { .. })
        ));
        assert!(matches!(
            LoopSpec::new(LoopPoint::new(f64::NAN, 2.0), 10.0, 0.5),
            Err(SynthError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_range_exceeds_source() {
        let err = LoopSpec::new(LoopPoint::new(1.0, 12.0), 10.0, 0.5).unwrap_err();
        assert!(matches!(err, SynthError::RangeExceedsSource { .. }));
        let msg = err.to_string();
        assert!(msg.contains("12.000"));
        assert!(msg.contains("10.000"));
        // End exactly at the source duration is allowed.
        assert!(LoopSpec::new(LoopPoint::new(1.0, 10.0), 10.0, 0.5).is_ok());
    }

    #[test]
    fn test_region_too_short_for_crossfade() {
        let err = LoopSpec::new(LoopPoint::new(0.0, 0.8), 10.0, 0.5).unwrap_err();
        match &err {
            SynthError::RegionTooShortForCrossfade { length, crossfade } => {
                assert!((length - 0.8).abs() < 1e-12);
                assert_eq!(*crossfade, 0.5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("0.800"));
        assert!(err.to_string().contains("1.000"));
        // Exactly twice the crossfade is enough.
        assert!(LoopSpec::new(LoopPoint::new(0.0, 1.0), 10.0, 0.5).is_ok());
    }

    #[test]
    fn test_non_positive_crossfade() {
        assert!(matches!(
            LoopSpec::new(LoopPoint::new(0.0, 3.0), 10.0, 0.0),
            Err(SynthError::InvalidCrossfade { .. })
        ));
    }

    #[test]
    fn test_filter_graph_text() {
        let graph = spec(1.0, 7.2).filter_graph();
        assert_eq!(
            graph.to_string(),
            "[0:v]split=3[head_src][tail_src][mid_src];\
             [head_src]trim=start=0:end=0.5,setpts=PTS-STARTPTS[head];\
             [tail_src]trim=start=5.7:end=6.2,setpts=PTS-STARTPTS[tail];\
             [tail][head]blend=all_expr='A*(1-T/0.5)+B*(T/0.5)'[blended];\
             [mid_src]trim=start=0.5:end=5.7,setpts=PTS-STARTPTS[middle];\
             [blended][middle]concat=n=2:v=1:a=0[outv]"
        );
    }

    #[test]
    fn test_filter_graph_wiring_is_valid() {
        for (start, end) in [(0.0, 1.0), (1.0, 7.2), (3.25, 9.0)] {
            spec(start, end).filter_graph().validate(&[OUTPUT_LABEL]).unwrap();
        }
    }

    #[test]
    fn test_segments_cover_region() {
        let s = spec(2.0, 6.0);
        let graph = s.filter_graph();
        let trims: Vec<(f64, f64)> = graph
            .chains
            .iter()
            .flat_map(|c| c.filters.iter())
            .filter_map(|f| match f {
                Filter::Trim { start, end } => Some((*start, *end)),
                _ => None,
            })
            .collect();
        assert_eq!(trims, vec![(0.0, 0.5), (3.5, 4.0), (0.5, 3.5)]);
        // Head and tail match the crossfade; the middle is what's left.
        let middle = trims[2].1 - trims[2].0;
        assert!((middle - (s.duration() - 2.0 * s.crossfade())).abs() < 1e-12);
    }

    #[test]
    fn test_render_job() {
        let job = spec(1.0, 7.2).render_job(
            Path::new("in.mp4"),
            Path::new("in_loop.mp4"),
            Encoding::from(&RenderConfig::default()),
        )
        .unwrap();
        assert_eq!(job.start, 1.0);
        assert!((job.duration - 6.2).abs() < 1e-12);
        assert_eq!(job.output_label, OUTPUT_LABEL);
        assert_eq!(job.encoding.video_codec, "libx264");
        assert_eq!(job.validate(), Ok(()));
    }

    #[test]
    fn test_miswired_graph_is_synth_error() {
        let mut job = spec(1.0, 7.2)
            .render_job(
                Path::new("in.mp4"),
                Path::new("in_loop.mp4"),
                Encoding::from(&RenderConfig::default()),
            )
            .unwrap();
        job.output_label = "final".to_string();
        let err = SynthError::from(job.validate().unwrap_err());
        assert!(matches!(err, SynthError::Graph(GraphError::Dangling(ref label)) if label == OUTPUT_LABEL));
        assert!(err.to_string().contains("[outv]"));
    }
}
