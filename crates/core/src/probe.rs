//! Source metadata via `ffprobe`: frame count, frame rate, and the
//! rotation-corrected frame size the decoder will deliver.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::types::PlaneGeometry;

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<serde_json::Value>,
}

/// Frame rate as an exact ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u64,
    pub den: u64,
}

impl FrameRate {
    pub fn new(num: u64, den: u64) -> Result<Self> {
        if num == 0 || den == 0 {
            return Err(probe_error(format!("invalid frame rate {num}/{den}")));
        }
        let g = gcd(num, den);
        Ok(Self {
            num: num / g,
            den: den / g,
        })
    }

    /// Parse `num/den` (or a bare integer) as printed by ffprobe.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (num, den) = match value.split_once('/') {
            Some((num, den)) => (num.trim(), den.trim()),
            None => (value, "1"),
        };
        let num = num
            .parse::<u64>()
            .map_err(|_| probe_error(format!("invalid frame rate ratio '{value}'")))?;
        let den = den
            .parse::<u64>()
            .map_err(|_| probe_error(format!("invalid frame rate ratio '{value}'")))?;
        Self::new(num, den)
    }

    pub fn doubled(self) -> Self {
        let g = gcd(self.num * 2, self.den);
        Self {
            num: self.num * 2 / g,
            den: self.den / g,
        }
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

/// What the rest of the run needs to know about the source video stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub frames: u64,
    pub frame_rate: FrameRate,
    /// Decoded frame width, already swapped for quarter-turn rotations.
    pub width: u32,
    pub height: u32,
    /// Rotation in degrees as reported by the container; 0 when absent.
    pub rotation: i64,
}

impl StreamMetadata {
    pub fn geometry(&self) -> PlaneGeometry {
        PlaneGeometry::new(self.width, self.height)
    }

    pub fn output_frame_rate(&self) -> FrameRate {
        self.frame_rate.doubled()
    }

    pub fn output_frames(&self) -> u64 {
        (2 * self.frames).saturating_sub(1)
    }
}

/// Width and height as the decoder will deliver them: unchanged for 0 and
/// ±180 degrees, swapped for ±90 and ±270, an error for anything else.
pub fn oriented_dimensions(width: u32, height: u32, rotation: i64) -> Result<(u32, u32)> {
    match rotation {
        0 | 180 | -180 => Ok((width, height)),
        90 | -90 | 270 | -270 => Ok((height, width)),
        other => Err(probe_error(format!("unknown rotation value: {other}"))),
    }
}

fn stream_rotation(stream: &FfprobeStream) -> Result<i64> {
    for entry in &stream.side_data_list {
        if let Some(value) = entry.get("rotation") {
            return json_rotation(value);
        }
    }
    match stream.tags.get("rotate") {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|_| probe_error(format!("unknown rotation value: {raw}"))),
        None => Ok(0),
    }
}

fn json_rotation(value: &serde_json::Value) -> Result<i64> {
    if let Some(degrees) = value.as_i64() {
        return Ok(degrees);
    }
    if let Some(degrees) = value.as_f64() {
        if degrees.fract() == 0.0 {
            return Ok(degrees as i64);
        }
    }
    if let Some(raw) = value.as_str() {
        if let Ok(degrees) = raw.trim().parse::<i64>() {
            return Ok(degrees);
        }
    }
    Err(probe_error(format!("unknown rotation value: {value}")))
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<StreamMetadata> {
    let probe: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| probe_error(format!("failed to parse ffprobe JSON: {e}")))?;
    let stream = probe
        .streams
        .first()
        .ok_or_else(|| probe_error("no video stream found".to_string()))?;

    let raw_frames = stream
        .nb_frames
        .as_deref()
        .ok_or_else(|| probe_error("video stream has no frame count (nb_frames)".to_string()))?;
    let frames = raw_frames
        .trim()
        .parse::<u64>()
        .map_err(|_| probe_error(format!("invalid frame count '{raw_frames}'")))?;

    let rate = stream
        .avg_frame_rate
        .as_deref()
        .filter(|r| !r.starts_with('0'))
        .or(stream.r_frame_rate.as_deref())
        .ok_or_else(|| probe_error("video stream has no frame rate".to_string()))?;
    let frame_rate = FrameRate::parse(rate)?;

    let width = stream
        .width
        .filter(|w| *w > 0)
        .ok_or_else(|| probe_error("video stream missing width".to_string()))?;
    let height = stream
        .height
        .filter(|h| *h > 0)
        .ok_or_else(|| probe_error("video stream missing height".to_string()))?;

    let rotation = stream_rotation(stream)?;
    let (width, height) = oriented_dimensions(width, height, rotation)?;

    Ok(StreamMetadata {
        frames,
        frame_rate,
        width,
        height,
        rotation,
    })
}

pub fn run_ffprobe(path: &Path) -> Result<Vec<u8>> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-print_format",
            "json",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(probe_error(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

pub fn probe(path: &Path) -> Result<StreamMetadata> {
    if !path.exists() {
        return Err(probe_error(format!(
            "input file does not exist: {}",
            path.display()
        )));
    }

    debug!(path = %path.display(), "running ffprobe");
    let json = run_ffprobe(path)?;
    let metadata = parse_ffprobe_json(&json)
        .with_context(|| format!("failed to probe {}", path.display()))?;

    debug!(
        frames = metadata.frames,
        fps = %metadata.frame_rate,
        width = metadata.width,
        height = metadata.height,
        rotation = metadata.rotation,
        "video input probed"
    );
    Ok(metadata)
}

fn probe_error(message: String) -> anyhow::Error {
    PipelineError::Probe(message).into()
}
