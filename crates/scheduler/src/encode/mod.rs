//! Encoding modules for the transcode scheduler

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_command, output_path_for, EncodeError, Encoder, FfmpegEncoder};
