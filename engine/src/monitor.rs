//! Async job monitor.
//!
//! Supervises an operation owned by an external system. `submit` either
//! finishes immediately or hands back a job handle; handles are polled at a
//! fixed interval until the job reaches a terminal state, the caller cancels,
//! or the optional deadline passes.
//!
//! ```text
//! Submitted --immediate--> Completed | Failed
//! Submitted --handle-----> Running --poll--> Running | Completed | Failed | Cancelled
//! ```
//!
//! Every poll emits a progress event. When the external system gives no
//! percentage, a heartbeat value that grows by a fixed step up to a ceiling
//! is used instead.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::progress::{MonotonicReporter, ProgressReporter, Stage};

/// Error code and message reported by an external system, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFailure {
    pub code: i64,
    pub message: String,
}

impl ExternalFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        ExternalFailure {
            code,
            message: message.into(),
        }
    }

    fn into_error(self, operation: &str) -> EngineError {
        EngineError::ExternalJobFailed {
            operation: operation.to_string(),
            code: self.code,
            message: self.message,
        }
    }
}

/// What `submit` returned.
#[derive(Debug)]
pub enum Submission<T, H> {
    /// The external call finished synchronously
    Immediate(Result<T, ExternalFailure>),
    /// The external call started a job to be polled
    Pending(H),
}

/// One observation of a pending job, already mapped from the external
/// system's vocabulary.
#[derive(Debug)]
pub enum JobPoll<T> {
    Running { progress: Option<u8> },
    Completed(T),
    Failed(ExternalFailure),
    /// Cancelled by the external system or an operator
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Handle to a job owned by an external system.
#[derive(Debug)]
pub struct Job<H> {
    pub id: H,
    pub state: JobState,

    /// Never decreases while the job is running
    pub last_observed_progress: u8,
}

impl<H> Job<H> {
    fn submitted(id: H, start: u8) -> Self {
        Job {
            id,
            state: JobState::Submitted,
            last_observed_progress: start,
        }
    }

    /// Move to `next`, ignoring transitions out of a terminal state.
    fn transition(&mut self, next: JobState) {
        if self.state.is_terminal() {
            return;
        }
        if self.state != next {
            debug!(from = %self.state, to = %next, "job state changed");
        }
        self.state = next;
    }
}

/// Poll loop parameters.
#[derive(Debug, Clone)]
pub struct JobMonitor {
    poll_interval: Duration,
    deadline: Option<Duration>,
    heartbeat_start: u8,
    heartbeat_step: u8,
    heartbeat_ceiling: u8,
    stage: Stage,
}

impl Default for JobMonitor {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl JobMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        let ceiling = config.heartbeat_ceiling.min(100);
        JobMonitor {
            poll_interval: config.poll_interval(),
            deadline: config.job_deadline(),
            heartbeat_start: config.heartbeat_start.min(ceiling),
            heartbeat_step: config.heartbeat_step,
            heartbeat_ceiling: ceiling,
            stage: Stage::WHOLE,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Run `submit` and, if it returns a handle, poll it to a terminal state.
    ///
    /// # Errors
    /// `ExternalJobFailed` with the external code and message,
    /// `Timeout` when the deadline elapses, `Cancelled` when either the
    /// caller or the external system cancels. Errors from `submit` or `poll`
    /// themselves are returned unchanged.
    pub fn supervise<T, H, S, P>(
        &self,
        operation: &str,
        submit: S,
        poll: P,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<T, EngineError>
    where
        S: FnOnce() -> Result<Submission<T, H>, EngineError>,
        P: FnMut(&H) -> Result<JobPoll<T>, EngineError>,
    {
        self.supervise_with_cancel_hook(operation, submit, poll, |_: &H| {}, reporter, cancel)
    }

    /// Like `supervise`, calling `on_cancel` with the job handle when the
    /// caller cancels. The hook is the only way the monitor touches a job
    /// after submission.
    pub fn supervise_with_cancel_hook<T, H, S, P, C>(
        &self,
        operation: &str,
        submit: S,
        mut poll: P,
        on_cancel: C,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<T, EngineError>
    where
        S: FnOnce() -> Result<Submission<T, H>, EngineError>,
        P: FnMut(&H) -> Result<JobPoll<T>, EngineError>,
        C: FnOnce(&H),
    {
        let reporter = MonotonicReporter::new(reporter);
        reporter.report(self.stage.start(), &format!("{}: submitting", operation));

        let handle = match submit()? {
            Submission::Immediate(Ok(value)) => {
                info!(operation, "completed without a job");
                reporter.report(self.stage.end(), &format!("{}: completed", operation));
                return Ok(value);
            }
            Submission::Immediate(Err(failure)) => {
                warn!(operation, code = failure.code, message = %failure.message, "failed on submission");
                return Err(self.fail(&reporter, operation, failure));
            }
            Submission::Pending(handle) => handle,
        };

        let mut job = Job::submitted(handle, self.heartbeat_start);
        let started = Instant::now();
        let mut polls = 0u32;
        info!(operation, "job started; polling");

        loop {
            if cancel.is_cancelled() {
                info!(operation, polls, "cancel requested");
                job.transition(JobState::Cancelled);
                on_cancel(&job.id);
                let err = EngineError::Cancelled {
                    operation: operation.to_string(),
                };
                reporter.report(reporter.last(), &format!("Aborted: {}", err));
                return Err(err);
            }

            polls += 1;
            match poll(&job.id)? {
                JobPoll::Running { progress } => {
                    job.transition(JobState::Running);
                    let next = self.next_progress(job.last_observed_progress, progress);
                    job.last_observed_progress = next;
                    reporter.report(
                        self.stage.percent(next as u64, 100),
                        &format!("{}: running ({}%)", operation, next),
                    );
                }
                JobPoll::Completed(value) => {
                    job.transition(JobState::Completed);
                    info!(operation, polls, "job completed");
                    reporter.report(self.stage.end(), &format!("{}: completed", operation));
                    return Ok(value);
                }
                JobPoll::Failed(failure) => {
                    job.transition(JobState::Failed);
                    warn!(operation, polls, code = failure.code, message = %failure.message, "job failed");
                    return Err(self.fail(&reporter, operation, failure));
                }
                JobPoll::Cancelled => {
                    job.transition(JobState::Cancelled);
                    warn!(operation, polls, "job cancelled by the external system");
                    let err = EngineError::Cancelled {
                        operation: operation.to_string(),
                    };
                    reporter.report(reporter.last(), &format!("Aborted: {}", err));
                    return Err(err);
                }
            }

            if let Some(deadline) = self.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    // The job keeps running under the external system's own lifecycle.
                    warn!(operation, polls, ?elapsed, "deadline passed; leaving job to the external system");
                    let err = EngineError::Timeout {
                        operation: operation.to_string(),
                        elapsed_ms: elapsed.as_millis(),
                    };
                    reporter.report(reporter.last(), &format!("Aborted: {}", err));
                    return Err(err);
                }
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Next heartbeat: the external percentage if it moves forward, otherwise
    /// one step up, never beyond the ceiling.
    fn next_progress(&self, current: u8, reported: Option<u8>) -> u8 {
        let next = match reported {
            Some(p) if p > current => p,
            _ => current.saturating_add(self.heartbeat_step),
        };
        next.min(self.heartbeat_ceiling).max(current)
    }

    fn fail(
        &self,
        reporter: &MonotonicReporter<'_>,
        operation: &str,
        failure: ExternalFailure,
    ) -> EngineError {
        let err = failure.into_error(operation);
        reporter.report(reporter.last(), &format!("Aborted: {}", err));
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::progress::testing::RecordingReporter;
    use std::cell::Cell;
    use std::collections::VecDeque;

    fn fast_monitor() -> JobMonitor {
        JobMonitor::default().with_poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_immediate_result_is_not_polled() {
        let polls = Cell::new(0);
        let recorder = RecordingReporter::new();

        let value = fast_monitor()
            .supervise(
                "snapshot",
                || Ok(Submission::<_, u32>::Immediate(Ok("snap-1"))),
                |_| {
                    polls.set(polls.get() + 1);
                    Ok(JobPoll::Completed("never"))
                },
                &recorder,
                &CancelToken::new(),
            )
            .expect("Immediate success should complete");

        assert_eq!(value, "snap-1");
        assert_eq!(polls.get(), 0);
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    fn test_immediate_failure_surfaces_code() {
        let err = fast_monitor()
            .supervise(
                "VM export",
                || Ok(Submission::<(), u32>::Immediate(Err(ExternalFailure::new(32775, "Invalid state")))),
                |_| Ok(JobPoll::Completed(())),
                &RecordingReporter::new(),
                &CancelToken::new(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ExternalJobFailed);
        assert_eq!(err.to_string(), "VM export failed (code 32775): Invalid state");
    }

    #[test]
    fn test_running_twice_then_failed() {
        let mut script: VecDeque<JobPoll<()>> = VecDeque::from(vec![
            JobPoll::Running { progress: None },
            JobPoll::Running { progress: None },
            JobPoll::Failed(ExternalFailure::new(32768, "Export directory is not writable")),
        ]);
        let polls = Cell::new(0);
        let recorder = RecordingReporter::new();

        let err = fast_monitor()
            .supervise(
                "VM export",
                || Ok(Submission::Pending(7u32)),
                |handle: &u32| {
                    assert_eq!(*handle, 7);
                    polls.set(polls.get() + 1);
                    Ok(script.pop_front().expect("polled past the scripted states"))
                },
                &recorder,
                &CancelToken::new(),
            )
            .unwrap_err();

        match err {
            EngineError::ExternalJobFailed { code, message, .. } => {
                assert_eq!(code, 32768);
                assert_eq!(message, "Export directory is not writable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(polls.get(), 3);

        let running: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|(_, m)| m.contains("running"))
            .map(|(p, _)| p)
            .collect();
        assert_eq!(running, vec![50, 60]);
        recorder.assert_monotonic();
    }

    #[test]
    fn test_heartbeat_is_bounded_and_monotonic() {
        let remaining = Cell::new(20);
        let recorder = RecordingReporter::new();

        fast_monitor()
            .supervise(
                "VM import",
                || Ok(Submission::Pending(())),
                |_| {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        Ok(JobPoll::Completed(()))
                    } else {
                        Ok(JobPoll::Running { progress: None })
                    }
                },
                &recorder,
                &CancelToken::new(),
            )
            .expect("Job should complete");

        recorder.assert_monotonic();
        let running: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|(_, m)| m.contains("running"))
            .map(|(p, _)| p)
            .collect();
        assert_eq!(running.len(), 19);
        assert!(running.iter().all(|p| *p <= 95));
        assert_eq!(recorder.percentages().last(), Some(&100));
    }

    #[test]
    fn test_external_progress_is_used_when_it_advances() {
        let monitor = JobMonitor::default();
        assert_eq!(monitor.next_progress(40, Some(70)), 70);
        assert_eq!(monitor.next_progress(70, Some(20)), 80);
        assert_eq!(monitor.next_progress(90, None), 95);
        assert_eq!(monitor.next_progress(95, Some(100)), 95);
    }

    #[test]
    fn test_deadline_gives_timeout() {
        let err = fast_monitor()
            .with_deadline(Some(Duration::from_millis(20)))
            .supervise(
                "snapshot",
                || Ok(Submission::Pending(())),
                |_| Ok(JobPoll::<()>::Running { progress: None }),
                &RecordingReporter::new(),
                &CancelToken::new(),
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_cancel_invokes_hook_between_polls() {
        let cancel = CancelToken::new();
        let hooked = Cell::new(None);
        let polls = Cell::new(0);

        let err = fast_monitor()
            .supervise_with_cancel_hook(
                "VM export",
                || Ok(Submission::Pending(42u32)),
                |_| {
                    polls.set(polls.get() + 1);
                    cancel.cancel();
                    Ok(JobPoll::<()>::Running { progress: None })
                },
                |handle: &u32| hooked.set(Some(*handle)),
                &RecordingReporter::new(),
                &cancel,
            )
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(polls.get(), 1);
        assert_eq!(hooked.get(), Some(42));
    }

    #[test]
    fn test_job_ignores_transitions_after_terminal() {
        let mut job = Job::submitted((), 40);
        job.transition(JobState::Running);
        job.transition(JobState::Failed);
        job.transition(JobState::Running);
        assert_eq!(job.state, JobState::Failed);
    }
}
