//! Worker processes: spawn with captured stdio, probe, and two-phase shutdown.

use std::{
    fmt,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use crossbeam_utils::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};
use tokio::{
    io::{AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{error::MuxError, framer::LineReader};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Name plus command line (executable first) of one tool adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub command: Vec<String>,
}

impl WorkerSpec {
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.command.join(" "))
    }
}

/// Status shared between the owner of a worker and its readers.
#[derive(Clone, Debug)]
pub struct StatusCell(Arc<AtomicCell<WorkerStatus>>);

impl StatusCell {
    pub fn new(status: WorkerStatus) -> Self {
        Self(Arc::new(AtomicCell::new(status)))
    }

    pub fn get(&self) -> WorkerStatus {
        self.0.load()
    }

    pub fn set(&self, status: WorkerStatus) {
        self.0.store(status);
    }
}

/// Pipes taken from a freshly spawned worker.
#[derive(Debug)]
pub struct WorkerPipes {
    /// `None` for detached workers.
    pub stdin: Option<ChildStdin>,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A supervised child process. The OS process is only released through
/// [`Worker::terminate`] or by observing its exit.
///
/// On unix the worker leads its own process group, and stop requests go to
/// the whole group so wrappers like `sh -c` or `npx` take their children
/// down with them.
#[derive(Debug)]
pub struct Worker {
    spec: WorkerSpec,
    child: Option<Child>,
    group: Option<u32>,
    status: StatusCell,
}

impl Worker {
    /// Spawn with stdin, stdout and stderr all captured.
    pub fn start(spec: &WorkerSpec) -> Result<(Self, WorkerPipes), MuxError> {
        Self::spawn(spec, true)
    }

    /// Spawn with stdin closed. Used when the worker talks to the outside
    /// world on its own and only its output is of interest.
    pub fn start_detached(spec: &WorkerSpec) -> Result<(Self, WorkerPipes), MuxError> {
        Self::spawn(spec, false)
    }

    fn spawn(spec: &WorkerSpec, with_stdin: bool) -> Result<(Self, WorkerPipes), MuxError> {
        let spawn_err = |source: std::io::Error| MuxError::Spawn {
            name: spec.name.clone(),
            source,
        };

        let (program, args) = spec.command.split_first().ok_or_else(|| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ))
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // backstop only; terminate() is the real exit path
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(spawn_err)?;

        let status = StatusCell::new(WorkerStatus::Starting);
        let missing =
            |what: &str| spawn_err(std::io::Error::other(format!("{what} was not captured")));
        let stdin = if with_stdin {
            Some(child.stdin.take().ok_or_else(|| missing("stdin"))?)
        } else {
            None
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        // process_group(0) makes the group id equal to the pid
        let group = child.id();
        info!(worker = %spec.name, pid = ?group, "worker started");
        status.set(WorkerStatus::Running);

        Ok((
            Self {
                spec: spec.clone(),
                child: Some(child),
                group,
                status,
            },
            WorkerPipes { stdin, stdout, stderr },
        ))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    pub fn status_cell(&self) -> StatusCell {
        self.status.clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Non-blocking liveness probe. Reaps the process if it has exited.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.mark_exited(status);
                false
            }
            Err(e) => {
                warn!(worker = %self.spec.name, error = %e, "could not probe worker");
                false
            }
        }
    }

    /// Wait for the process to exit by itself. Cancel-safe.
    /// Resolves immediately if it was already reaped.
    pub async fn wait(&mut self) -> Result<Option<ExitStatus>, MuxError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.wait().await?;
        self.mark_exited(status);
        Ok(Some(status))
    }

    /// Ask the process to stop, wait up to `grace`, then kill it.
    ///
    /// Returns only once the exit has been observed. Calling it on a worker
    /// that was already reaped does nothing.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), MuxError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(status) = child.try_wait()? {
            self.log_exit(status);
            sweep_group(self.group, &self.spec.name);
            self.status.set(WorkerStatus::Stopped);
            return Ok(());
        }

        self.status.set(WorkerStatus::Stopping);
        request_stop(&mut child, self.group, &self.spec.name);

        let exited = match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(worker = %self.spec.name, error = %e, "wait failed after stop request");
                None
            }
            Err(_) => {
                warn!(
                    worker = %self.spec.name,
                    grace_ms = grace.as_millis() as u64,
                    "worker ignored stop request, killing"
                );
                None
            }
        };

        let result = match exited {
            Some(status) => {
                self.log_exit(status);
                Ok(())
            }
            None => {
                force_stop(&mut child, self.group, &self.spec.name);
                match child.wait().await {
                    Ok(status) => {
                        self.log_exit(status);
                        Ok(())
                    }
                    Err(e) => Err(MuxError::Io(e)),
                }
            }
        };
        // whatever the leader left behind in its group goes too
        sweep_group(self.group, &self.spec.name);
        self.status.set(WorkerStatus::Stopped);
        result
    }

    fn mark_exited(&mut self, status: ExitStatus) {
        self.child = None;
        self.log_exit(status);
        sweep_group(self.group, &self.spec.name);
        self.status.set(WorkerStatus::Stopped);
    }

    fn log_exit(&self, status: ExitStatus) {
        info!(worker = %self.spec.name, code = ?status.code(), "worker exited");
    }
}

#[cfg(unix)]
fn request_stop(_child: &mut Child, group: Option<u32>, name: &str) {
    use nix::sys::signal::Signal;

    match group {
        Some(pgid) => {
            debug!(worker = %name, pgid, "sending SIGTERM to process group");
            signal_group(pgid, Signal::SIGTERM, name);
        }
        None => debug!(worker = %name, "no pid, process already gone"),
    }
}

#[cfg(unix)]
fn force_stop(child: &mut Child, group: Option<u32>, name: &str) {
    use nix::sys::signal::Signal;

    let signalled = group.is_some_and(|pgid| signal_group(pgid, Signal::SIGKILL, name));
    if !signalled {
        if let Err(e) = child.start_kill() {
            debug!(worker = %name, error = %e, "kill failed");
        }
    }
}

/// Kill anything still running in the group once the leader is gone.
#[cfg(unix)]
fn sweep_group(group: Option<u32>, name: &str) {
    if let Some(pgid) = group {
        signal_group(pgid, nix::sys::signal::Signal::SIGKILL, name);
    }
}

/// False when the group could not be signalled. A group that no longer
/// exists counts as signalled.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal, name: &str) -> bool {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(e) => {
            warn!(worker = %name, pgid, ?signal, error = ?e, "signalling process group failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, _group: Option<u32>, name: &str) {
    if let Err(e) = child.start_kill() {
        warn!(worker = %name, error = %e, "stop request failed");
    }
}

#[cfg(not(unix))]
fn force_stop(child: &mut Child, _group: Option<u32>, name: &str) {
    if let Err(e) = child.start_kill() {
        debug!(worker = %name, error = %e, "kill failed");
    }
}

#[cfg(not(unix))]
fn sweep_group(_group: Option<u32>, _name: &str) {}

/// Which standard stream a log drain follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Follow a freeform text stream and log each line under the worker's name.
/// Ends at end of stream; nothing is ever parsed or forwarded.
pub fn spawn_log_drain<R>(name: String, stream: LogStream, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(BufReader::new(reader), name.clone());
        loop {
            match lines.read_text().await {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => match stream {
                    LogStream::Stderr => warn!(worker = %name, "[{name}] {line}"),
                    LogStream::Stdout => info!(worker = %name, "[{name}] {line}"),
                },
                Ok(None) => {
                    // logged only; stdout decides whether the worker is still usable
                    let closed = MuxError::StreamClosed {
                        name: name.clone(),
                        stream: stream.into(),
                    };
                    warn!(worker = %name, error = %closed, "worker stream ended");
                    break;
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "error reading {stream}");
                    break;
                }
            }
        }
    })
}
