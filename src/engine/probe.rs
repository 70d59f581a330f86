use serde::Deserialize;

use super::EngineError;

/// Frame rate assumed when the probe doesn't report one.
const DEFAULT_FPS: f64 = 30.0;

/// Metadata probed from a source video.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    /// Total duration in seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(json: &str) -> Result<MediaInfo, EngineError> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| EngineError::Probe(format!("invalid ffprobe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| EngineError::Probe("No video stream found".to_string()))?;

    let duration = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| EngineError::Probe("Source has no usable duration".to_string()))?;

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .unwrap_or(DEFAULT_FPS);

    Ok(MediaInfo {
        duration,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps: (fps * 100.0).round() / 100.0,
        codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// Parse a frame rate given as a ratio ("30000/1001") or a decimal ("29.97").
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}
