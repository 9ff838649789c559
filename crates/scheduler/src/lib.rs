//! Transcode Scheduler
//!
//! Resource-gated job scheduler for media transcoding: a FIFO of probed
//! files, a monitor that checks host CPU, memory and disk before each
//! dispatch, and the control loop that pairs them.

pub mod encode;
pub mod logging;
pub mod media;
pub mod probe;
pub mod queue;
pub mod resources;
pub mod scan;
pub mod scheduler;

pub use transcode_scheduler_config as config;
pub use transcode_scheduler_config::Config;
pub use encode::{build_ffmpeg_command, output_path_for, EncodeError, Encoder, FfmpegEncoder};
pub use logging::{EventLevel, EventLog, LogError, MemoryEventLog, TracingEventLog};
pub use media::{bps_to_kbps, MediaDescriptor, Resolution};
pub use probe::{parse_probe_output, FfprobeProber, ProbeError, Prober};
pub use queue::{Job, JobId, JobQueue};
pub use resources::{
    disk_usage, evaluate, Denial, DiskUsage, ResourceMonitor, ResourceQueryError,
    ResourceSampler, ResourceSnapshot, ResourceThresholds, SysinfoSampler,
};
pub use scan::{collect_inputs, is_video_file};
pub use scheduler::{
    enqueue_file, RunOutcome, RunReport, Scheduler, SchedulerError, SchedulerSettings,
    SchedulerState, StopHandle,
};
