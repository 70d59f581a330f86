use indicatif::ProgressBar;
use rayon::prelude::*;

use crate::config::SearchConfig;
use crate::sampler::SampledFrame;
use crate::similarity::similarity;

/// A `(start, end)` pair of times in the source, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopPoint {
    pub start: f64,
    pub end: f64,
}

impl LoopPoint {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// The best-scoring frame pair found by [`find_best_pair`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopMatch {
    pub point: LoopPoint,
    pub score: f64,
    pub start_frame: usize,
    pub end_frame: usize,
}

/// Pairwise search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub sample_fps: u32,
    pub min_loop_secs: f64,
    pub max_loop_secs: Option<f64>,
    pub threshold: f64,
    pub channel_tolerance: f64,
    pub workers: usize,
}

impl From<&SearchConfig> for SearchParams {
    fn from(config: &SearchConfig) -> Self {
        Self {
            sample_fps: config.sample_fps,
            min_loop_secs: config.min_loop_secs,
            max_loop_secs: config.max_loop_secs,
            threshold: config.threshold,
            channel_tolerance: config.channel_tolerance,
            workers: config.resolve_workers(),
        }
    }
}

impl Default for SearchParams {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl SearchParams {
    /// Minimum frame distance between the two loop points (at least 1).
    pub fn min_gap(&self) -> usize {
        ((self.min_loop_secs * self.sample_fps as f64).floor() as usize).max(1)
    }

    /// Maximum frame distance, if bounded.
    pub fn max_gap(&self) -> Option<usize> {
        self.max_loop_secs
            .map(|secs| (secs * self.sample_fps as f64).floor() as usize)
    }
}

/// Find the most similar frame pair at least `min_gap` frames apart.
///
/// Every valid pair is scored. Among equal best scores the pair with the
/// smallest start frame wins, then the smallest end frame. Returns `None`
/// when the best score is below the threshold or there are too few frames.
pub fn find_best_pair(frames: &[SampledFrame], params: &SearchParams) -> Option<LoopMatch> {
    find_best_pair_with_progress(frames, params, &ProgressBar::hidden())
}

/// [`find_best_pair`], ticking `pb` once per start frame.
pub fn find_best_pair_with_progress(
    frames: &[SampledFrame],
    params: &SearchParams,
    pb: &ProgressBar,
) -> Option<LoopMatch> {
    let n = frames.len();
    let min_gap = params.min_gap();

    if params.sample_fps == 0 {
        log::warn!("Sample rate is zero, frame times are undefined");
        return None;
    }
    if n <= min_gap {
        log::info!("Not enough frames (need more than {}, got {})", min_gap, n);
        return None;
    }

    let starts = n - min_gap;
    pb.set_length(starts as u64);
    log::info!(
        "Comparing {} frames (min gap {} frames, {} workers)...",
        n,
        min_gap,
        params.workers
    );

    let rows: Vec<Option<(f64, usize)>> = match rayon::ThreadPoolBuilder::new()
        .num_threads(params.workers.max(1))
        .build()
    {
        Ok(pool) => pool.install(|| scan_rows(frames, params, pb)),
        Err(e) => {
            log::warn!("Could not build worker pool ({}), using the global pool", e);
            scan_rows(frames, params, pb)
        }
    };
    pb.finish_and_clear();

    // Rows arrive in start-frame order, so a strict comparison keeps the earliest maximum.
    let mut best: Option<(usize, usize, f64)> = None;
    for (i, row) in rows.into_iter().enumerate() {
        if let Some((score, j)) = row {
            if best.is_none_or(|(_, _, s)| score > s) {
                best = Some((i, j, score));
            }
        }
    }

    let (i, j, score) = best?;
    log::info!(
        "Best similarity score: {:.4} ({} -> {}), threshold: {}",
        score,
        i,
        j,
        params.threshold
    );

    // Written so a NaN threshold accepts nothing.
    if !(score >= params.threshold) {
        log::info!("No similar frames found above threshold");
        return None;
    }

    let fps = params.sample_fps as f64;
    let point = LoopPoint::new(i as f64 / fps, j as f64 / fps);
    log::info!("Found loop points: {:.2}s -> {:.2}s", point.start, point.end);

    Some(LoopMatch {
        point,
        score,
        start_frame: i,
        end_frame: j,
    })
}

/// Best `(score, end_frame)` for each start frame, in start-frame order.
fn scan_rows(
    frames: &[SampledFrame],
    params: &SearchParams,
    pb: &ProgressBar,
) -> Vec<Option<(f64, usize)>> {
    let n = frames.len();
    let min_gap = params.min_gap();
    let max_gap = params.max_gap();

    (0..n - min_gap)
        .into_par_iter()
        .map(|i| {
            let last = match max_gap {
                Some(gap) => (i + gap + 1).min(n),
                None => n,
            };
            let mut row_best: Option<(f64, usize)> = None;
            for j in (i + min_gap)..last {
                let score = similarity(&frames[i].pixels, &frames[j].pixels, params.channel_tolerance);
                if row_best.is_none_or(|(s, _)| score > s) {
                    row_best = Some((score, j));
                }
            }
            pb.inc(1);
            row_best
        })
        .collect()
}
