//! Process driver
//!
//! Runs one external tool as a child process in its own process group,
//! forwards every output line as soon as it is read, and on cancellation or
//! timeout terminates the group: SIGTERM first, SIGKILL once the grace
//! period has elapsed. However the tool ends, whatever it left running in
//! its group is killed before `run` returns. The exit status is only
//! returned after every line the process wrote has been handed to the
//! caller.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::models::log_event::LogSource;

/// Exit code reported for a process that had to be killed
pub const KILLED_EXIT_CODE: i32 = 137;

/// A fully resolved tool invocation
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub secret_env: Vec<(String, SecretString)>,
}

impl ProcessInvocation {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            env: Vec::new(),
            secret_env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Command line for diagnostics; never includes environment values
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One line of child output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub source: LogSource,
    pub text: String,
}

/// How the child process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

/// Final report of a child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub termination: Termination,
    /// SIGKILL was needed after the grace period
    pub forced: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == 0
    }
}

enum Wake {
    Exited(ExitStatus),
    Cancelled,
    TimedOut,
}

/// Spawns and supervises tool processes
#[derive(Debug, Clone)]
pub struct ProcessDriver {
    grace_period: Duration,
}

impl ProcessDriver {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Run the invocation to completion, forwarding output lines to `on_line`
    pub async fn run<F>(
        &self,
        invocation: &ProcessInvocation,
        limit: Option<Duration>,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<ProcessOutcome, EngineError>
    where
        F: FnMut(OutputLine),
    {
        let started = Instant::now();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }
        for (key, value) in &invocation.secret_env {
            command.env(key, value.expose_secret());
        }

        let mut child = command.spawn().map_err(|e| EngineError::ProcessSpawn {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;
        let mut guard = GroupGuard::new(child.id());
        debug!(pid = ?child.id(), command = %invocation.display(), "process spawned");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, LogSource::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, LogSource::Stderr, tx.clone())));
        }
        drop(tx);

        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let wake = loop {
            tokio::select! {
                Some(line) = rx.recv() => on_line(line),
                status = child.wait() => break Wake::Exited(status?),
                _ = cancel.cancelled() => break Wake::Cancelled,
                _ = &mut expiry => break Wake::TimedOut,
            }
        };

        let (status, termination, forced) = match wake {
            Wake::Exited(status) => (status, Termination::Exited, false),
            Wake::Cancelled => {
                let (status, forced) = self.terminate(&mut child).await?;
                (status, Termination::Cancelled, forced)
            }
            Wake::TimedOut => {
                let (status, forced) = self.terminate(&mut child).await?;
                (status, Termination::TimedOut, forced)
            }
        };
        guard.kill_group();

        // Descendants that escaped the group may still hold the pipes open
        let drained = tokio::time::timeout(self.grace_period, async {
            while let Some(line) = rx.recv().await {
                on_line(line);
            }
        })
        .await;
        if drained.is_err() {
            warn!(command = %invocation.display(), "output pipes still open after exit, dropping readers");
            for reader in &readers {
                reader.abort();
            }
        }

        let exit_code = if forced {
            KILLED_EXIT_CODE
        } else {
            exit_code(&status)
        };

        Ok(ProcessOutcome {
            exit_code,
            termination,
            forced,
            duration: started.elapsed(),
        })
    }

    /// Graceful stop, escalating to SIGKILL after the grace period
    async fn terminate(&self, child: &mut Child) -> Result<(ExitStatus, bool), EngineError> {
        if let Some(pid) = child.id() {
            signal_group(pid, GroupSignal::Terminate);
        } else {
            return Ok((child.wait().await?, false));
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => Ok((status?, false)),
            Err(_) => {
                warn!(pid = ?child.id(), grace = ?self.grace_period, "process ignored SIGTERM, killing");
                if let Some(pid) = child.id() {
                    signal_group(pid, GroupSignal::Kill);
                }
                child.kill().await?;
                Ok((child.wait().await?, true))
            }
        }
    }
}

async fn forward_lines<R>(reader: R, source: LogSource, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { source, text }).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?source, "failed to read process output: {}", e);
                break;
            }
        }
    }
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    KILLED_EXIT_CODE
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, "killpg failed: {}", e);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) {}

/// Kills the whole process group once the run is over, or if the driver is
/// dropped mid-run
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    /// Background children outlive the leader; the group id stays valid
    /// while any of them is alive
    fn kill_group(&mut self) {
        if let Some(pid) = self.pid.take() {
            signal_group(pid, GroupSignal::Kill);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill_group();
    }
}
