//! Scheduler control loop
//!
//! Pairs the job queue with the resource monitor: a job is dequeued only
//! after the monitor grants permission, denied checks back off before the
//! next attempt, and the loop ends once a dequeue times out on an empty queue.

use crate::config::Config;
use crate::encode::Encoder;
use crate::logging::EventLog;
use crate::probe::{ProbeError, Prober};
use crate::queue::{Job, JobId, JobQueue};
use crate::resources::{ResourceMonitor, ResourceQueryError, ResourceThresholds};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Error type for the control loop
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Host resources could not be read, so dispatch cannot be judged safe
    #[error("resource query failed {attempts} time(s) in a row: {source}")]
    ResourceQuery {
        attempts: u32,
        #[source]
        source: ResourceQueryError,
    },
}

/// Control loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started
    Idle,
    /// Asking the resource monitor for permission
    Checking,
    /// Pulling a job and running the encoder
    Dispatching,
    /// Permission denied, backing off
    Blocked,
    /// Queue observed empty after a dequeue attempt
    Drained,
    /// Stop signal observed
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Checking => "checking",
            SchedulerState::Dispatching => "dispatching",
            SchedulerState::Blocked => "blocked",
            SchedulerState::Drained => "drained",
            SchedulerState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Drained | SchedulerState::Stopped)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Drained,
    Stopped,
}

/// Summary of one scheduler run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Encode attempts started
    pub dispatched: u64,
    pub succeeded: u64,
    /// Jobs dropped after their last failed attempt
    pub failed: u64,
    /// Failed attempts that were put back for another try
    pub retried: u64,
    /// Checks that ended in backoff
    pub blocked_cycles: u64,
}

impl RunReport {
    fn new() -> Self {
        Self {
            outcome: RunOutcome::Drained,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            blocked_cycles: 0,
        }
    }
}

/// Loop settings, fixed for the lifetime of a run
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub thresholds: ResourceThresholds,
    /// `None` waits for work indefinitely
    pub dequeue_timeout: Option<Duration>,
    pub blocked_backoff: Duration,
    /// Consecutive resource query failures that abort the run (minimum 1)
    pub resource_error_limit: u32,
    /// Extra attempts for a job whose encode failed
    pub max_retries: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            thresholds: ResourceThresholds::from(&cfg.resources),
            dequeue_timeout: cfg.scheduler.dequeue_timeout(),
            blocked_backoff: cfg.scheduler.blocked_backoff(),
            resource_error_limit: cfg.scheduler.resource_error_limit,
            max_retries: cfg.retry.max_retries,
        }
    }
}

/// Requests that a running scheduler stop at its next check or backoff.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves once stop has been requested; never resolves if the handle is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Probe `path` and enqueue the result.
///
/// A probe failure is returned to the caller and nothing is enqueued.
pub async fn enqueue_file(
    prober: &dyn Prober,
    queue: &JobQueue,
    path: &Path,
) -> Result<JobId, ProbeError> {
    let descriptor = prober.probe(path).await?;
    Ok(queue.enqueue(Job::new(descriptor)))
}

/// The resource-gated dispatch loop
pub struct Scheduler {
    queue: Arc<JobQueue>,
    monitor: ResourceMonitor,
    encoder: Arc<dyn Encoder>,
    log: Arc<dyn EventLog>,
    settings: SchedulerSettings,
    state: SchedulerState,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        monitor: ResourceMonitor,
        encoder: Arc<dyn Encoder>,
        log: Arc<dyn EventLog>,
        settings: SchedulerSettings,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            queue,
            monitor,
            encoder,
            log,
            settings,
            state: SchedulerState::Idle,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    fn transition(&mut self, next: SchedulerState) {
        tracing::debug!(from = self.state.as_str(), to = next.as_str(), "scheduler state");
        self.state = next;
    }

    /// Run until the queue drains or a stop is requested.
    ///
    /// A job handed to the encoder always runs to completion; stop requests
    /// are honoured before the next resource check, during backoff, or while
    /// waiting on an empty queue.
    pub async fn run(&mut self) -> Result<RunReport, SchedulerError> {
        let mut report = RunReport::new();
        let mut consecutive_errors = 0u32;
        let error_limit = self.settings.resource_error_limit.max(1);

        self.transition(SchedulerState::Checking);

        while !self.state.is_terminal() {
            match self.state {
                SchedulerState::Checking => {
                    if *self.stop_rx.borrow() {
                        self.transition(SchedulerState::Stopped);
                        continue;
                    }

                    match self.monitor.permits(&self.settings.thresholds).await {
                        Ok(true) => {
                            consecutive_errors = 0;
                            self.transition(SchedulerState::Dispatching);
                        }
                        Ok(false) => {
                            consecutive_errors = 0;
                            report.blocked_cycles += 1;
                            self.log.warning("Insufficient resources. Waiting...");
                            self.transition(SchedulerState::Blocked);
                        }
                        Err(source) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= error_limit {
                                self.log.error(&format!(
                                    "Cannot read host resources, stopping: {}",
                                    source
                                ));
                                return Err(SchedulerError::ResourceQuery {
                                    attempts: consecutive_errors,
                                    source,
                                });
                            }
                            report.blocked_cycles += 1;
                            self.log.warning(&format!(
                                "Resource check failed ({}/{}), treating as insufficient: {}",
                                consecutive_errors, error_limit, source
                            ));
                            self.transition(SchedulerState::Blocked);
                        }
                    }
                }
                SchedulerState::Blocked => {
                    let backoff = self.settings.blocked_backoff;
                    let next = tokio::select! {
                        biased;
                        _ = stop_requested(&mut self.stop_rx) => SchedulerState::Stopped,
                        _ = tokio::time::sleep(backoff) => SchedulerState::Checking,
                    };
                    self.transition(next);
                }
                SchedulerState::Dispatching => {
                    let timeout = self.settings.dequeue_timeout;
                    let dequeued = tokio::select! {
                        biased;
                        job = self.queue.dequeue(timeout) => Some(job),
                        _ = stop_requested(&mut self.stop_rx) => None,
                    };

                    match dequeued {
                        Some(Some(job)) => {
                            self.dispatch(job, &mut report).await;
                            self.transition(SchedulerState::Checking);
                        }
                        Some(None) => {
                            self.log.info("No more files to process.");
                            self.transition(SchedulerState::Drained);
                        }
                        None => self.transition(SchedulerState::Stopped),
                    }
                }
                SchedulerState::Idle | SchedulerState::Drained | SchedulerState::Stopped => break,
            }
        }

        report.outcome = match self.state {
            SchedulerState::Stopped => RunOutcome::Stopped,
            _ => RunOutcome::Drained,
        };
        if report.outcome == RunOutcome::Stopped {
            self.log.info("Scheduler stopped.");
        }
        Ok(report)
    }

    /// Hand one job to the encoder and wait for it.
    async fn dispatch(&self, mut job: Job, report: &mut RunReport) {
        job.attempts += 1;
        report.dispatched += 1;

        let path = job.descriptor.path().to_path_buf();
        tracing::debug!(
            job_id = %job.id,
            path = %path.display(),
            attempt = job.attempts,
            waited_ms = job.waited().as_millis() as u64,
            "dispatching job"
        );

        let retry = (job.attempts <= self.settings.max_retries).then(|| job.clone());

        match self.encoder.execute(job.descriptor).await {
            Ok(()) => {
                report.succeeded += 1;
                self.log
                    .info(&format!("Transcoding completed for {}", path.display()));
            }
            Err(e) => match retry {
                Some(retry) => {
                    report.retried += 1;
                    self.log.warning(&format!(
                        "Transcoding failed for {} (attempt {}): {}; will retry",
                        path.display(),
                        retry.attempts,
                        e
                    ));
                    self.queue.requeue_front(retry);
                }
                None => {
                    report.failed += 1;
                    self.log
                        .error(&format!("Transcoding failed for {}: {}", path.display(), e));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::EncodeError;
    use crate::logging::{EventLevel, MemoryEventLog};
    use crate::media::{MediaDescriptor, Resolution};
    use crate::resources::{ResourceSampler, ResourceSnapshot};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Replays scripted snapshots, then repeats the last one.
    struct ScriptedSampler {
        script: Mutex<VecDeque<Result<ResourceSnapshot, ResourceQueryError>>>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Result<ResourceSnapshot, ResourceQueryError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl ResourceSampler for ScriptedSampler {
        async fn sample(
            &self,
            _cpu_interval: Duration,
            _disk_path: &Path,
        ) -> Result<ResourceSnapshot, ResourceQueryError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                match script.front() {
                    Some(Ok(snapshot)) => Ok(*snapshot),
                    _ => Err(ResourceQueryError::Cpu("script exhausted".to_string())),
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingEncoder {
        seen: Mutex<Vec<PathBuf>>,
        fail_first: Mutex<u32>,
    }

    #[async_trait]
    impl Encoder for RecordingEncoder {
        async fn execute(&self, descriptor: MediaDescriptor) -> Result<(), EncodeError> {
            self.seen.lock().unwrap().push(descriptor.path().to_path_buf());
            let mut fail = self.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(EncodeError::Failed(1));
            }
            Ok(())
        }
    }

    fn idle() -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 10.0,
            mem_percent: 20.0,
            disk_free_percent: 80.0,
        }
    }

    fn busy() -> ResourceSnapshot {
        ResourceSnapshot {
            cpu_percent: 95.0,
            ..idle()
        }
    }

    fn fast_settings() -> SchedulerSettings {
        SchedulerSettings {
            dequeue_timeout: Some(Duration::from_millis(20)),
            blocked_backoff: Duration::from_millis(10),
            ..SchedulerSettings::default()
        }
    }

    fn descriptor(name: &str) -> MediaDescriptor {
        MediaDescriptor::new(
            PathBuf::from(format!("/media/{}.mkv", name)),
            Resolution::new(1920, 1080).unwrap(),
            4000,
            "h264",
        )
    }

    fn build(
        script: Vec<Result<ResourceSnapshot, ResourceQueryError>>,
        encoder: Arc<RecordingEncoder>,
        log: Arc<MemoryEventLog>,
        settings: SchedulerSettings,
    ) -> Scheduler {
        Scheduler::new(
            Arc::new(JobQueue::new()),
            ResourceMonitor::new(Box::new(ScriptedSampler::new(script))),
            encoder,
            log,
            settings,
        )
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SchedulerState::Idle.as_str(), "idle");
        assert_eq!(SchedulerState::Checking.as_str(), "checking");
        assert_eq!(SchedulerState::Dispatching.as_str(), "dispatching");
        assert_eq!(SchedulerState::Blocked.as_str(), "blocked");
        assert_eq!(SchedulerState::Drained.as_str(), "drained");
        assert_eq!(SchedulerState::Stopped.as_str(), "stopped");
        assert!(SchedulerState::Drained.is_terminal());
        assert!(!SchedulerState::Blocked.is_terminal());
    }

    #[test]
    fn test_settings_from_default_config() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.dequeue_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.blocked_backoff, Duration::from_secs(2));
        assert_eq!(settings.resource_error_limit, 1);
        assert_eq!(settings.max_retries, 0);
    }

    #[tokio::test]
    async fn test_empty_queue_drains() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let mut scheduler = build(vec![Ok(idle())], encoder.clone(), log.clone(), fast_settings());

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.dispatched, 0);
        assert_eq!(scheduler.state(), SchedulerState::Drained);
        assert!(encoder.seen.lock().unwrap().is_empty());
        assert_eq!(log.messages(EventLevel::Info), vec!["No more files to process."]);
    }

    #[tokio::test]
    async fn test_never_dispatches_while_denied() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let mut scheduler = build(vec![Ok(busy())], encoder.clone(), log.clone(), fast_settings());
        scheduler.queue().enqueue_descriptor(descriptor("held"));
        let stop = scheduler.stop_handle();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop.stop();
        });

        let report = scheduler.run().await.unwrap();
        stopper.await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.dispatched, 0);
        assert!(report.blocked_cycles >= 2, "backoff should retry: {:?}", report);
        assert!(encoder.seen.lock().unwrap().is_empty());
        assert_eq!(scheduler.queue().len(), 1);
        assert!(!log.messages(EventLevel::Warning).is_empty());
    }

    #[tokio::test]
    async fn test_resource_error_is_fatal_by_default() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let mut scheduler = build(
            vec![Err(ResourceQueryError::Memory("unavailable".to_string()))],
            encoder.clone(),
            log.clone(),
            fast_settings(),
        );
        scheduler.queue().enqueue_descriptor(descriptor("never"));

        let err = scheduler.run().await.unwrap_err();

        let SchedulerError::ResourceQuery { attempts, .. } = err;
        assert_eq!(attempts, 1);
        assert!(encoder.seen.lock().unwrap().is_empty());
        assert_eq!(log.messages(EventLevel::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_resource_error_fails_closed_then_recovers() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let settings = SchedulerSettings {
            resource_error_limit: 3,
            ..fast_settings()
        };
        let mut scheduler = build(
            vec![
                Err(ResourceQueryError::Cpu("hiccup".to_string())),
                Err(ResourceQueryError::Cpu("hiccup".to_string())),
                Ok(idle()),
            ],
            encoder.clone(),
            log.clone(),
            settings,
        );
        scheduler.queue().enqueue_descriptor(descriptor("a"));

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.blocked_cycles, 2);
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_encode_failure_is_consumed_without_retry() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder {
            fail_first: Mutex::new(1),
            ..RecordingEncoder::default()
        });
        let mut scheduler = build(vec![Ok(idle())], encoder.clone(), log.clone(), fast_settings());
        scheduler.queue().enqueue_descriptor(descriptor("bad"));
        scheduler.queue().enqueue_descriptor(descriptor("good"));

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(
            *encoder.seen.lock().unwrap(),
            vec![PathBuf::from("/media/bad.mkv"), PathBuf::from("/media/good.mkv")]
        );
        let errors = log.messages(EventLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("/media/bad.mkv"));
    }

    #[tokio::test]
    async fn test_retry_policy_requeues_at_head() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder {
            fail_first: Mutex::new(2),
            ..RecordingEncoder::default()
        });
        let settings = SchedulerSettings {
            max_retries: 2,
            ..fast_settings()
        };
        let mut scheduler = build(vec![Ok(idle())], encoder.clone(), log.clone(), settings);
        scheduler.queue().enqueue_descriptor(descriptor("flaky"));
        scheduler.queue().enqueue_descriptor(descriptor("next"));

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.retried, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.succeeded, 2);
        assert_eq!(
            *encoder.seen.lock().unwrap(),
            vec![
                PathBuf::from("/media/flaky.mkv"),
                PathBuf::from("/media/flaky.mkv"),
                PathBuf::from("/media/flaky.mkv"),
                PathBuf::from("/media/next.mkv"),
            ]
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_drop_job() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder {
            fail_first: Mutex::new(5),
            ..RecordingEncoder::default()
        });
        let settings = SchedulerSettings {
            max_retries: 1,
            ..fast_settings()
        };
        let mut scheduler = build(vec![Ok(idle())], encoder.clone(), log.clone(), settings);
        scheduler.queue().enqueue_descriptor(descriptor("broken"));

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.dispatched, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 1);
        assert!(scheduler.queue().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_run_dispatches_nothing() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let mut scheduler = build(vec![Ok(idle())], encoder.clone(), log.clone(), fast_settings());
        scheduler.queue().enqueue_descriptor(descriptor("queued"));
        let stop = scheduler.stop_handle();
        stop.stop();
        assert!(stop.is_stopped());

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.dispatched, 0);
        assert_eq!(scheduler.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_indefinite_dequeue() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(RecordingEncoder::default());
        let settings = SchedulerSettings {
            dequeue_timeout: None,
            ..fast_settings()
        };
        let mut scheduler = build(vec![Ok(idle())], encoder, log, settings);
        let stop = scheduler.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.stop();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
            .await
            .expect("stop should end the run")
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Stopped);
    }

    /// Encoder that takes a while per job.
    struct SlowEncoder {
        delay: Duration,
        completed: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Encoder for SlowEncoder {
        async fn execute(&self, descriptor: MediaDescriptor) -> Result<(), EncodeError> {
            tokio::time::sleep(self.delay).await;
            self.completed
                .lock()
                .unwrap()
                .push(descriptor.path().to_path_buf());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_during_encode_lets_the_job_finish() {
        let log = Arc::new(MemoryEventLog::new());
        let encoder = Arc::new(SlowEncoder {
            delay: Duration::from_millis(150),
            completed: Mutex::new(Vec::new()),
        });
        let mut scheduler = Scheduler::new(
            Arc::new(JobQueue::new()),
            ResourceMonitor::new(Box::new(ScriptedSampler::new(vec![Ok(idle())]))),
            encoder.clone(),
            log.clone(),
            fast_settings(),
        );
        for name in ["one", "two", "three"] {
            scheduler.queue().enqueue_descriptor(descriptor(name));
        }
        let stop = scheduler.stop_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.stop();
        });

        let report = scheduler.run().await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            *encoder.completed.lock().unwrap(),
            vec![PathBuf::from("/media/one.mkv")]
        );
        assert_eq!(scheduler.queue().len(), 2);
        assert_eq!(
            scheduler.queue().try_dequeue().map(|job| job.descriptor.path().to_path_buf()),
            Some(PathBuf::from("/media/two.mkv"))
        );
        assert!(log
            .messages(EventLevel::Info)
            .contains(&"Transcoding completed for /media/one.mkv".to_string()));
    }

    struct FailingProber;

    #[async_trait]
    impl Prober for FailingProber {
        async fn probe(&self, _path: &Path) -> Result<MediaDescriptor, ProbeError> {
            Err(ProbeError::MissingField("bit_rate"))
        }
    }

    #[tokio::test]
    async fn test_enqueue_file_rejects_probe_failure() {
        let queue = JobQueue::new();
        let result = enqueue_file(&FailingProber, &queue, Path::new("/media/broken.mkv")).await;

        assert!(matches!(result, Err(ProbeError::MissingField("bit_rate"))));
        assert!(queue.is_empty());
    }
}
