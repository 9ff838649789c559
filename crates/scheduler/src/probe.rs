//! Probe module for reading stream metadata from media files.
//!
//! Runs ffprobe against a file and turns its JSON report into a
//! [`MediaDescriptor`]. Construction is all-or-nothing: if any required field
//! is missing the probe fails and no descriptor exists.

use crate::media::{MediaDescriptor, Resolution};
use async_trait::async_trait;
use std::num::NonZeroU32;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Codec name recorded when the prober does not report one.
pub const UNKNOWN_CODEC: &str = "unknown";

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe could not be started.
    #[error("failed to run ffprobe: {0}")]
    Spawn(#[from] std::io::Error),

    /// ffprobe exited with a failure status.
    #[error("ffprobe failed: {0}")]
    ToolFailed(String),

    /// ffprobe output was not JSON.
    #[error("ffprobe output was not JSON: {0}")]
    NotJson(String),

    /// A required field was absent from the report.
    #[error("ffprobe output is missing `{0}`")]
    MissingField(&'static str),

    /// A required field was present but unusable.
    #[error("ffprobe field `{field}` is invalid: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Anything that can describe a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub bit_rate: Option<BitRate>,
    }

    /// ffprobe prints bit_rate as a string; hand-written fixtures often use numbers.
    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    pub enum BitRate {
        Number(u64),
        Text(String),
    }
}

/// Builds the ffprobe argument list for the first video stream of `path`.
pub fn build_ffprobe_command(path: &Path) -> Command {
    let mut cmd = Command::new("ffprobe");
    cmd.args([
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,codec_name:format=bit_rate",
        "-of",
        "json",
    ])
    .arg(path);
    cmd
}

/// Parses ffprobe JSON output into a descriptor for `path`.
pub fn parse_probe_output(path: &Path, json_str: &str) -> Result<MediaDescriptor, ProbeError> {
    let output: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::NotJson(e.to_string()))?;

    let stream = output
        .streams
        .and_then(|streams| streams.into_iter().next())
        .ok_or(ProbeError::MissingField("streams"))?;

    let width = stream.width.ok_or(ProbeError::MissingField("width"))?;
    let height = stream.height.ok_or(ProbeError::MissingField("height"))?;
    let resolution = Resolution::from_non_zero(
        positive_dimension("width", width)?,
        positive_dimension("height", height)?,
    );

    let bit_rate = output
        .format
        .and_then(|format| format.bit_rate)
        .ok_or(ProbeError::MissingField("bit_rate"))?;
    let bit_rate_bps = match bit_rate {
        ffprobe_json::BitRate::Number(bps) => bps,
        ffprobe_json::BitRate::Text(text) => {
            text.trim()
                .parse::<u64>()
                .map_err(|_| ProbeError::InvalidField {
                    field: "bit_rate",
                    value: text.clone(),
                })?
        }
    };

    let codec = stream
        .codec_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_CODEC.to_string());

    Ok(MediaDescriptor::from_raw_bitrate(
        path,
        resolution,
        bit_rate_bps,
        codec,
    ))
}

fn positive_dimension(field: &'static str, value: u32) -> Result<NonZeroU32, ProbeError> {
    NonZeroU32::new(value).ok_or(ProbeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Prober backed by the ffprobe binary on PATH.
#[derive(Debug, Default, Clone)]
pub struct FfprobeProber;

impl FfprobeProber {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let output = build_ffprobe_command(path).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ToolFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let descriptor = parse_probe_output(path, &stdout)?;
        tracing::debug!(
            path = %path.display(),
            resolution = %descriptor.resolution(),
            bitrate_kbps = descriptor.bitrate_kbps(),
            codec = descriptor.codec(),
            "probed media file"
        );
        Ok(descriptor)
    }
}
