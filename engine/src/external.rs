//! External collaborators.
//!
//! The engine never talks to snapshot services, hypervisors or system-state
//! tools directly. It sees them through the traits below, and every call that
//! may start a long-running job returns a `Submission` for the job monitor.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cell::RefCell;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::monitor::{ExternalFailure, JobPoll, Submission};

/// A point-in-time copy of a volume, readable as a file tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,

    /// Root of the snapshot's file tree
    pub path: PathBuf,
}

/// Creates and removes volume snapshots.
pub trait SnapshotProvider {
    type Job;

    fn create_snapshot(&self, volume: &Path) -> Result<Submission<Snapshot, Self::Job>, EngineError>;

    fn poll_snapshot(&self, job: &Self::Job) -> Result<JobPoll<Snapshot>, EngineError>;

    fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    /// Copy virtual disks along with the definition
    pub copy_storage: bool,
    /// Copy saved state and checkpoints
    pub copy_runtime_state: bool,
    /// Create a subdirectory named after the VM under the destination
    pub create_subdirectory: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            copy_storage: true,
            copy_runtime_state: true,
            create_subdirectory: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Where imported storage goes; `None` leaves it in the backup directory
    pub storage_dir: Option<PathBuf>,
    pub generate_new_id: bool,
}

/// Exports, imports and starts virtual machines.
pub trait VirtualizationManager {
    type Job;

    fn export_definition(
        &self,
        vm_id: &str,
        dest_dir: &Path,
        options: &ExportOptions,
    ) -> Result<Submission<(), Self::Job>, EngineError>;

    fn import_definition(
        &self,
        source_dir: &Path,
        options: &ImportOptions,
    ) -> Result<Submission<(), Self::Job>, EngineError>;

    fn poll(&self, job: &Self::Job) -> Result<JobPoll<()>, EngineError>;

    fn start(&self, vm_id: &str) -> Result<(), EngineError>;
}

/// Hyper-V return values and job states mapped onto the monitor's vocabulary.
pub mod hyperv {
    use super::{ExternalFailure, JobPoll, Submission};
    use tracing::warn;

    pub const RETURN_COMPLETED: u32 = 0;
    pub const RETURN_JOB_STARTED: u32 = 4096;

    pub const JOB_COMPLETED: u16 = 7;
    pub const JOB_TERMINATED: u16 = 8;
    pub const JOB_KILLED: u16 = 9;
    pub const JOB_EXCEPTION: u16 = 10;
    pub const JOB_COMPLETED_WITH_WARNINGS: u16 = 32768;

    /// Map a management method's return value and optional job reference.
    pub fn submission<H>(return_value: u32, job: Option<H>) -> Submission<(), H> {
        match (return_value, job) {
            (RETURN_COMPLETED, _) => Submission::Immediate(Ok(())),
            (RETURN_JOB_STARTED, Some(job)) => Submission::Pending(job),
            (RETURN_JOB_STARTED, None) => Submission::Immediate(Err(ExternalFailure::new(
                RETURN_JOB_STARTED as i64,
                "job started but no job reference was returned",
            ))),
            (code, _) => Submission::Immediate(Err(ExternalFailure::new(
                code as i64,
                format!("method returned {}", code),
            ))),
        }
    }

    /// Map one observation of a `Msvm_ConcreteJob`.
    ///
    /// `error_code` and `error_description` are passed through unchanged when
    /// the job failed; a zero code falls back to the job state.
    pub fn job_poll(
        job_state: u16,
        percent_complete: Option<u8>,
        error_code: i64,
        error_description: &str,
    ) -> JobPoll<()> {
        let failure = |fallback: &str| {
            let code = if error_code != 0 { error_code } else { job_state as i64 };
            let message = if error_description.is_empty() {
                fallback.to_string()
            } else {
                error_description.to_string()
            };
            JobPoll::Failed(ExternalFailure::new(code, message))
        };

        match job_state {
            JOB_COMPLETED | JOB_COMPLETED_WITH_WARNINGS => JobPoll::Completed(()),
            JOB_TERMINATED => failure("job was terminated"),
            JOB_KILLED => failure("job was killed"),
            JOB_EXCEPTION => failure("job failed"),
            2..=6 | 11 | 12 => JobPoll::Running {
                progress: percent_complete,
            },
            other => {
                warn!(job_state = other, "unrecognised job state; treating as running");
                JobPoll::Running {
                    progress: percent_complete,
                }
            }
        }
    }
}

/// Command line for an external system-state restore tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStateTool {
    program: OsString,
    args: Vec<OsString>,
}

impl SystemStateTool {
    pub fn new(program: impl Into<OsString>) -> Self {
        SystemStateTool {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `wbadmin start systemstaterecovery` for a backup version on a target.
    pub fn wbadmin_recovery(version: &str, backup_target: &str) -> Self {
        SystemStateTool::new("wbadmin.exe")
            .arg("start")
            .arg("systemstaterecovery")
            .arg(format!("-version:{}", version))
            .arg(format!("-backupTarget:{}", backup_target))
            .arg("-quiet")
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    /// Start the tool with stdout and stderr captured.
    pub fn spawn(&self) -> Result<ToolProcess, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Unknown {
                message: format!("failed to start {}", self.program.to_string_lossy()),
                source: Some(e),
            })?;

        let (tx, rx) = unbounded();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx);
        }

        debug!(program = %self.program.to_string_lossy(), pid = child.id(), "tool started");
        Ok(ToolProcess {
            child: RefCell::new(child),
            lines: rx,
            last_line: RefCell::new(None),
        })
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    // Console tools redraw progress with carriage returns.
                    for segment in text.split('\r') {
                        let line = segment.trim();
                        if !line.is_empty() && tx.send(line.to_string()).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// How long to wait for buffered output once the tool has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// A running tool process, observed like any other external job.
#[derive(Debug)]
pub struct ToolProcess {
    child: RefCell<Child>,
    lines: Receiver<String>,
    last_line: RefCell<Option<String>>,
}

impl ToolProcess {
    /// Drain captured output and check whether the process has exited.
    ///
    /// Exit code 0 is `Completed`; anything else is `Failed` with the code
    /// and the last line the tool printed.
    pub fn poll(&self) -> Result<JobPoll<()>, EngineError> {
        let mut progress = self.drain();

        let status = self
            .child
            .borrow_mut()
            .try_wait()
            .map_err(|e| EngineError::Unknown {
                message: "failed to query tool process".to_string(),
                source: Some(e),
            })?;

        match status {
            None => Ok(JobPoll::Running { progress }),
            Some(status) => {
                if let Some(p) = self.drain_until_closed(OUTPUT_GRACE) {
                    progress = Some(p);
                }
                debug!(?status, ?progress, "tool exited");
                if status.success() {
                    Ok(JobPoll::Completed(()))
                } else {
                    let code = status.code().map_or(-1, i64::from);
                    let message = self
                        .last_line
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| format!("tool exited with {}", status));
                    Ok(JobPoll::Failed(ExternalFailure::new(code, message)))
                }
            }
        }
    }

    /// Kill the process; used as the monitor's cancel hook.
    pub fn kill(&self) {
        let mut child = self.child.borrow_mut();
        if let Err(e) = child.kill() {
            warn!(error = %e, "failed to kill tool process");
        }
        // Reap it so no zombie is left behind.
        let _ = child.wait();
    }

    fn drain(&self) -> Option<u8> {
        let mut progress = None;
        for line in self.lines.try_iter() {
            if let Some(p) = self.take_line(line) {
                progress = Some(p);
            }
        }
        progress
    }

    /// Collect output until both readers hang up, or `grace` runs out when
    /// a descendant of the tool still holds the pipes open.
    fn drain_until_closed(&self, grace: Duration) -> Option<u8> {
        let deadline = Instant::now() + grace;
        let mut progress = None;
        loop {
            match self.lines.recv_deadline(deadline) {
                Ok(line) => {
                    if let Some(p) = self.take_line(line) {
                        progress = Some(p);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("tool output still open after exit");
                    break;
                }
            }
        }
        progress
    }

    fn take_line(&self, line: String) -> Option<u8> {
        debug!(line = %line, "tool output");
        let progress = parse_percent(&line);
        *self.last_line.borrow_mut() = Some(line);
        progress
    }
}

/// Best-effort percentage hint from a line of tool output: the last
/// `NN%` or `NN percent` value in the line, if it is at most 100.
pub fn parse_percent(line: &str) -> Option<u8> {
    let bytes = line.as_bytes();
    let mut found = None;
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        // Skip a fractional part such as "45.5%".
        let digits_end = i;
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
        let rest = line[i..].trim_start();
        if rest.starts_with('%') || rest.to_ascii_lowercase().starts_with("percent") {
            if let Ok(value) = line[start..digits_end].parse::<u32>() {
                if value <= 100 {
                    found = Some(value as u8);
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::hyperv;
    use super::*;

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("Restoring system state (45%)"), Some(45));
        assert_eq!(parse_percent("12 percent complete"), Some(12));
        assert_eq!(parse_percent("Step 3 of 5: 67.5 %"), Some(67));
        assert_eq!(parse_percent("copied 10% then 20%"), Some(20));
        assert_eq!(parse_percent("version 2024"), None);
        assert_eq!(parse_percent("250%"), None);
    }

    #[test]
    fn test_hyperv_return_values() {
        assert!(matches!(hyperv::submission::<u32>(0, None), Submission::Immediate(Ok(()))));
        assert!(matches!(hyperv::submission(4096, Some(5u32)), Submission::Pending(5)));
        match hyperv::submission::<u32>(32775, None) {
            Submission::Immediate(Err(failure)) => assert_eq!(failure.code, 32775),
            other => panic!("unexpected submission: {other:?}"),
        }
    }

    #[test]
    fn test_hyperv_job_states() {
        assert!(matches!(hyperv::job_poll(7, None, 0, ""), JobPoll::Completed(())));
        assert!(matches!(hyperv::job_poll(32768, None, 0, ""), JobPoll::Completed(())));
        assert!(matches!(
            hyperv::job_poll(4, Some(30), 0, ""),
            JobPoll::Running { progress: Some(30) }
        ));
        match hyperv::job_poll(10, None, 32779, "Access denied") {
            JobPoll::Failed(failure) => {
                assert_eq!(failure.code, 32779);
                assert_eq!(failure.message, "Access denied");
            }
            other => panic!("unexpected poll: {other:?}"),
        }
        match hyperv::job_poll(9, None, 0, "") {
            JobPoll::Failed(failure) => {
                assert_eq!(failure.code, 9);
                assert_eq!(failure.message, "job was killed");
            }
            other => panic!("unexpected poll: {other:?}"),
        }
    }

    #[test]
    fn test_wbadmin_arguments() {
        let tool = SystemStateTool::wbadmin_recovery("01/02/2024-09:00", "E:");
        assert_eq!(tool.program(), &OsString::from("wbadmin.exe"));
        assert_eq!(tool.args[2], OsString::from("-version:01/02/2024-09:00"));
        assert_eq!(tool.args.last(), Some(&OsString::from("-quiet")));
    }

    #[cfg(unix)]
    fn wait_for_exit(process: &ToolProcess) -> JobPoll<()> {
        for _ in 0..500 {
            match process.poll().expect("Failed to poll") {
                JobPoll::Running { .. } => thread::sleep(std::time::Duration::from_millis(10)),
                done => return done,
            }
        }
        panic!("tool did not exit");
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_exit_code_decides_result() {
        let ok = SystemStateTool::new("sh").arg("-c").arg("echo 50%; exit 0");
        let process = ok.spawn().expect("Failed to spawn");
        assert!(matches!(wait_for_exit(&process), JobPoll::Completed(())));

        let failing = SystemStateTool::new("sh").arg("-c").arg("echo disk not ready >&2; exit 3");
        let process = failing.spawn().expect("Failed to spawn");
        match wait_for_exit(&process) {
            JobPoll::Failed(failure) => assert_eq!(failure.code, 3),
            other => panic!("unexpected poll: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_message_is_the_tools_last_line() {
        for _ in 0..20 {
            let tool = SystemStateTool::new("sh")
                .arg("-c")
                .arg("echo preparing 30% >&2; echo restore target is offline >&2; exit 5");
            let process = tool.spawn().expect("Failed to spawn");
            match wait_for_exit(&process) {
                JobPoll::Failed(failure) => {
                    assert_eq!(failure.code, 5);
                    assert_eq!(failure.message, "restore target is offline");
                }
                other => panic!("unexpected poll: {other:?}"),
            }
        }
    }

    #[test]
    fn test_missing_tool_fails_to_spawn() {
        let err = SystemStateTool::new("definitely-not-a-real-tool-7f3a").spawn().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unknown);
    }
}
