//! FFmpeg encoder module
//!
//! Builds and runs the ffmpeg invocation for one descriptor. The scheduler
//! only sees pass/fail through the [`Encoder`] trait.

use crate::config::EncoderConfig;
use crate::media::{MediaDescriptor, MAX_HEIGHT, MAX_WIDTH};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg exited with non-zero status
    #[error("ffmpeg failed with exit code: {0}")]
    Failed(i32),

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg process was terminated by signal")]
    Terminated,

    /// The output would overwrite the source file
    #[error("output path {0} is the source file")]
    OutputIsInput(PathBuf),

    /// The source path has no usable file name
    #[error("source path {0} has no file name")]
    NoFileName(PathBuf),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that turns a descriptor into an encoded file.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn execute(&self, descriptor: MediaDescriptor) -> Result<(), EncodeError>;
}

/// Where the encoded copy of `source` lands under `base_path`.
pub fn output_path_for(
    source: &Path,
    base_path: &Path,
    container: &str,
) -> Result<PathBuf, EncodeError> {
    let stem = source
        .file_stem()
        .ok_or_else(|| EncodeError::NoFileName(source.to_path_buf()))?;

    let mut file_name = stem.to_os_string();
    file_name.push(".");
    file_name.push(container);
    let output = base_path.join(file_name);

    if output == source {
        return Err(EncodeError::OutputIsInput(output));
    }
    Ok(output)
}

/// Build the ffmpeg command for one encode
///
/// Adds a scale filter capping the frame at 1920x1080 (aspect preserved)
/// only when the descriptor needs downscaling. Audio is copied.
pub fn build_ffmpeg_command(
    descriptor: &MediaDescriptor,
    output_path: &Path,
    cfg: &EncoderConfig,
) -> Command {
    let mut cmd = Command::new("ffmpeg");

    cmd.args(["-hide_banner", "-nostdin", "-y"]);
    cmd.arg("-i").arg(descriptor.path());

    cmd.arg("-c:v").arg(&cfg.video_codec);
    cmd.arg("-preset").arg(&cfg.preset);
    cmd.arg("-crf").arg(cfg.crf.to_string());

    if descriptor.needs_downscale() {
        cmd.arg("-vf").arg(format!(
            "scale={}:{}:force_original_aspect_ratio=decrease",
            MAX_WIDTH, MAX_HEIGHT
        ));
    }

    cmd.arg("-c:a").arg("copy");
    cmd.arg(output_path);

    cmd
}

/// Encoder that shells out to ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    base_path: PathBuf,
    config: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(base_path: PathBuf, config: EncoderConfig) -> Self {
        Self { base_path, config }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn execute(&self, descriptor: MediaDescriptor) -> Result<(), EncodeError> {
        let output_path =
            output_path_for(descriptor.path(), &self.base_path, &self.config.container)?;
        tokio::fs::create_dir_all(&self.base_path).await?;

        let mut cmd = build_ffmpeg_command(&descriptor, &output_path, &self.config);
        tracing::debug!(
            input = %descriptor.path().display(),
            output = %output_path.display(),
            downscale = descriptor.needs_downscale(),
            "starting ffmpeg"
        );

        let status = cmd.status().await?;

        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(EncodeError::Failed(code)),
                None => Err(EncodeError::Terminated),
            }
        }
    }
}
