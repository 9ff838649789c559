//! Job queue module
//!
//! Unbounded FIFO of pending transcode jobs. Producers never wait; the
//! consumer waits on a [`Notify`] with an optional timeout.

use crate::media::MediaDescriptor;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// A probed file waiting for dispatch
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// What to encode
    pub descriptor: MediaDescriptor,
    /// When the job first entered the queue
    pub enqueued_at: Instant,
    /// Encode attempts already made
    pub attempts: u32,
}

impl Job {
    pub fn new(descriptor: MediaDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }

    /// Time since the job was first enqueued
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Thread-safe FIFO of jobs
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        // A panic while holding the lock cannot leave the deque half-modified.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a job at the tail. Never blocks.
    pub fn enqueue(&self, job: Job) -> JobId {
        let id = job.id;
        self.lock().push_back(job);
        self.available.notify_one();
        id
    }

    /// Wrap a descriptor in a fresh job and append it.
    pub fn enqueue_descriptor(&self, descriptor: MediaDescriptor) -> JobId {
        self.enqueue(Job::new(descriptor))
    }

    /// Put a job back at the head, ahead of everything queued after it.
    pub fn requeue_front(&self, job: Job) {
        self.lock().push_front(job);
        self.available.notify_one();
    }

    /// Remove the head without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        self.lock().pop_front()
    }

    /// Remove and return the head, waiting up to `timeout` for one to arrive.
    ///
    /// `None` timeout waits indefinitely. Returns `None` once the timeout
    /// expires with the queue still empty.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Job> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue between check and await is not missed.
            notified.as_mut().enable();

            if let Some(job) = self.try_dequeue() {
                return Some(job);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_dequeue();
                    }
                }
                None => notified.await,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
