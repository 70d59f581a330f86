use image::RgbImage;

/// Default per-channel tolerance: a channel must move by more than 10% of
/// full range for its pixel to count as different.
pub const DEFAULT_CHANNEL_TOLERANCE: f64 = 0.10;

/// Fraction of pixels that match between two frames, in `[0, 1]`.
///
/// A pixel differs when any channel delta exceeds `tolerance * 255`.
/// Frames of different dimensions score `0.0`. Two empty frames are identical.
pub fn similarity(a: &RgbImage, b: &RgbImage, tolerance: f64) -> f64 {
    if a.dimensions() != b.dimensions() {
        return 0.0;
    }

    let total = a.width() as usize * a.height() as usize;
    if total == 0 {
        return 1.0;
    }

    let limit = tolerance * 255.0;
    let differing = a
        .pixels()
        .zip(b.pixels())
        .filter(|(p, q)| {
            p.0.iter()
                .zip(q.0.iter())
                .any(|(x, y)| x.abs_diff(*y) as f64 > limit)
        })
        .count();

    1.0 - differing as f64 / total as f64
}
