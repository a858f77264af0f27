//! ShellCommand: one external process and its lifecycle.
//!
//! ```text
//!   NotStarted ──start()──▶ Running ──wait──▶ Completed
//!        │                     │
//!        │                     └──deadline──▶ TimedOut (killed)
//!        └──spawn error──▶ Failed
//! ```
//!
//! While running, stderr is always drained by a capture pump so the child can
//! never stall on a full stderr pipe. Stdout has exactly one consumer per run:
//! the capture started by `run`, the iterator from `iter_stdout`, the pump from
//! `stream_stdout`, or the next stage of a chain.
//!
//! Each child leads its own process group. With a timeout configured, a
//! watchdog thread kills the whole group at the deadline whether or not
//! anyone is waiting on the process, so iterating or streaming stdout ends
//! on time too.

use std::io::{self, Cursor, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use shellpipe_types::{CommandConfig, EXIT_NOT_FOUND, ExecutionResult, Output, ProcessStatus};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::command::{IntoArgv, display_argv};
use crate::error::{PipeError, PipeResult};
use crate::pump::{ByteSource, CaptureBuffer, PIPE_BUFFER_SIZE, PumpOutcome, StreamPump};
use crate::resolve::{RawOutput, resolve_output};

/// Identity of a command, handed to stream progress callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    pub argv: Vec<String>,
    pub pid: Option<u32>,
}

/// A pump draining one pipe into memory.
struct Capture {
    pump: StreamPump,
    buffer: CaptureBuffer,
}

impl Capture {
    fn spawn<R: Read + Send + 'static>(label: String, source: R, chunk_size: usize) -> io::Result<Self> {
        let buffer = CaptureBuffer::new();
        let pump = StreamPump::spawn(label, source, buffer.clone(), chunk_size)?;
        Ok(Self { pump, buffer })
    }

    fn finish(self) -> Vec<u8> {
        let outcome = self.pump.join();
        if let Some(e) = outcome.error {
            warn!(error = %e, "capture stopped early");
        }
        self.buffer.take()
    }
}

/// The spawned child, shared with its deadline watchdog.
struct LiveChild {
    child: Arc<Mutex<Child>>,
    pid: u32,
    deadline: Option<Instant>,
    timed_out: Arc<AtomicBool>,
    watchdog: Option<Watchdog>,
}

impl LiveChild {
    fn new(child: Child, label: &str, deadline: Option<Instant>) -> io::Result<Self> {
        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = match deadline {
            Some(deadline) => match Watchdog::arm(label, child.clone(), timed_out.clone(), deadline) {
                Ok(watchdog) => Some(watchdog),
                Err(e) => {
                    let mut child = lock_child(&child);
                    kill_process_group(&mut child);
                    if let Err(wait_err) = child.wait() {
                        warn!(pid, error = %wait_err, "failed to reap process");
                    }
                    return Err(e);
                }
            },
            None => None,
        };
        Ok(Self {
            child,
            pid,
            deadline,
            timed_out,
            watchdog,
        })
    }

    /// Non-blocking exit check.
    fn has_exited(&self) -> io::Result<bool> {
        Ok(lock_child(&self.child).try_wait()?.is_some())
    }

    /// Kill the process group unless the child has already exited.
    fn kill(&self) {
        let mut child = lock_child(&self.child);
        if let Ok(None) = child.try_wait() {
            kill_process_group(&mut child);
        }
    }

    /// Block until the child exits, killing it at the deadline.
    ///
    /// The flag reports whether the deadline was what ended it, here or in
    /// the watchdog.
    fn wait(&self) -> io::Result<(ExitStatus, bool)> {
        let status = {
            let mut child = lock_child(&self.child);
            match self.deadline {
                Some(deadline) => match child.wait_timeout(deadline.saturating_duration_since(Instant::now()))? {
                    Some(status) => status,
                    None => {
                        warn!(pid = self.pid, "deadline passed, killing");
                        kill_process_group(&mut child);
                        self.timed_out.store(true, Ordering::Release);
                        child.wait()?
                    }
                },
                None => child.wait()?,
            }
        };
        Ok((status, self.timed_out.load(Ordering::Acquire)))
    }
}

impl Drop for LiveChild {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.disarm();
        }
    }
}

/// Kills a child's process group at its deadline unless disarmed first.
struct Watchdog {
    disarm: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn arm(label: &str, child: Arc<Mutex<Child>>, fired: Arc<AtomicBool>, deadline: Instant) -> io::Result<Self> {
        let (disarm, disarmed) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name(format!("watchdog:{}", label))
            .spawn(move || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !matches!(disarmed.recv_timeout(remaining), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                let mut child = lock_child(&child);
                if let Ok(None) = child.try_wait() {
                    warn!(pid = child.id(), "deadline passed, killing");
                    kill_process_group(&mut child);
                    fired.store(true, Ordering::Release);
                }
            })?;
        Ok(Self { disarm, handle })
    }

    fn disarm(self) {
        drop(self.disarm);
        if self.handle.join().is_err() {
            warn!("watchdog thread panicked");
        }
    }
}

/// One external process.
pub struct ShellCommand {
    argv: Vec<String>,
    config: CommandConfig,
    status: ProcessStatus,
    child: Option<LiveChild>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stdout_capture: Option<Capture>,
    stderr_capture: Option<Capture>,
    feeder: Option<StreamPump>,
    stream: Option<StreamPump>,
    stream_outcome: Option<PumpOutcome>,
    started_at: Option<Instant>,
    raw: Option<RawOutput>,
    spawn_error: Option<(io::ErrorKind, String)>,
    run_count: u32,
}

impl ShellCommand {
    /// Create a stage with the default configuration (raw bytes, only 0 accepted, no timeout).
    pub fn new(command: impl IntoArgv) -> PipeResult<Self> {
        Self::with_config(command, CommandConfig::default())
    }

    pub fn with_config(command: impl IntoArgv, config: CommandConfig) -> PipeResult<Self> {
        Ok(Self {
            argv: command.into_argv()?,
            config,
            status: ProcessStatus::NotStarted,
            child: None,
            stdin: None,
            stdout: None,
            stdout_capture: None,
            stderr_capture: None,
            feeder: None,
            stream: None,
            stream_outcome: None,
            started_at: None,
            raw: None,
            spawn_error: None,
            run_count: 0,
        })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == ProcessStatus::Running
    }

    /// OS process id while the child is alive.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|live| live.pid)
    }

    /// How many times a process was launched for this stage.
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.raw.as_ref().map(|r| r.exit_code)
    }

    /// Captured stdout, once finished. Empty if another consumer claimed it.
    pub fn stdout(&self) -> Option<&[u8]> {
        self.raw.as_ref().map(|r| r.stdout.as_slice())
    }

    pub fn stderr(&self) -> Option<&[u8]> {
        self.raw.as_ref().map(|r| r.stderr.as_slice())
    }

    /// Wall time from spawn to exit, once finished.
    pub fn elapsed(&self) -> Option<Duration> {
        self.raw.as_ref().map(|r| r.elapsed)
    }

    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            argv: self.argv.clone(),
            pid: self.pid(),
        }
    }

    /// Spawn the process if it has never been started.
    ///
    /// Idempotent: a running or finished stage is left alone. A program that
    /// does not exist completes immediately with exit code 127, like a shell
    /// would report it; any other launch error moves the stage to `Failed`.
    pub fn start(&mut self) -> PipeResult<()> {
        if self.status != ProcessStatus::NotStarted {
            return Ok(());
        }

        let started = Instant::now();
        self.started_at = Some(started);

        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let spawned = command.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(program = %self.argv[0], "command not found");
                self.run_count += 1;
                self.raw = Some(RawOutput {
                    exit_code: EXIT_NOT_FOUND,
                    stdout: Vec::new(),
                    stderr: format!("shellpipe: command '{}' not found", self.argv[0]).into_bytes(),
                    elapsed: started.elapsed(),
                    timed_out: false,
                });
                self.status = ProcessStatus::Completed;
                return Ok(());
            }
            Err(e) => {
                warn!(program = %self.argv[0], error = %e, "spawn failed");
                self.spawn_error = Some((e.kind(), e.to_string()));
                self.status = ProcessStatus::Failed;
                return Err(PipeError::Spawn {
                    program: self.argv[0].clone(),
                    source: e,
                });
            }
        };

        self.run_count += 1;
        debug!(argv = %display_argv(&self.argv), pid = child.id(), "spawned");

        let stderr = child.stderr.take();
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        let deadline = self.config.timeout.map(|limit| started + limit);
        match LiveChild::new(child, &self.argv[0], deadline) {
            Ok(live) => self.child = Some(live),
            Err(e) => return Err(self.abort_start(e)),
        }
        self.status = ProcessStatus::Running;

        if let Some(stderr) = stderr {
            match Capture::spawn(format!("{}:stderr", self.argv[0]), stderr, PIPE_BUFFER_SIZE) {
                Ok(capture) => self.stderr_capture = Some(capture),
                Err(e) => return Err(self.abort_start(e)),
            }
        }
        Ok(())
    }

    /// Undo a half-finished start after a helper thread could not be spawned.
    fn abort_start(&mut self, error: io::Error) -> PipeError {
        if let Some(live) = self.child.take() {
            live.kill();
            if let Err(e) = live.wait() {
                warn!(pid = live.pid, error = %e, "failed to reap process");
            }
        }
        self.stdin.take();
        self.stdout.take();
        self.spawn_error = Some((error.kind(), error.to_string()));
        self.status = ProcessStatus::Failed;
        error.into()
    }

    /// True once the child has exited or is not running. Never blocks.
    pub(crate) fn has_exited(&self) -> bool {
        match &self.child {
            Some(live) => live.has_exited().unwrap_or(true),
            None => true,
        }
    }

    /// Run to completion: start if needed, feed `stdin`, close it, wait.
    ///
    /// Blocks until the process exits or the timeout elapses. Once finished,
    /// calling again returns the recorded result without running anything.
    pub fn run(&mut self, stdin: impl AsRef<[u8]>) -> PipeResult<ExecutionResult> {
        self.start()?;
        if self.status == ProcessStatus::Running {
            let input = stdin.as_ref();
            if self.stdin.is_none() && !input.is_empty() {
                warn!(argv = %display_argv(&self.argv), "stdin already closed; input ignored");
            }
            self.begin_collect(input.to_vec())?;
            self.wait_for_exit(false)?;
        }
        self.resolved()
    }

    /// The stage's result, running it with no stdin first if necessary.
    pub fn result(&mut self) -> PipeResult<ExecutionResult> {
        self.run(b"")
    }

    /// Like `result`, but a non-accepted outcome becomes `PipeError::Failed`.
    pub fn result_strict(&mut self) -> PipeResult<Output> {
        Ok(self.result()?.into_result()?)
    }

    /// Close stdin and wait for the process. Same as `result` on a running stage.
    pub fn finish(&mut self) -> PipeResult<ExecutionResult> {
        self.result()
    }

    /// Force-terminate a running process and record what it left behind.
    pub fn kill(&mut self) -> PipeResult<ExecutionResult> {
        if self.status != ProcessStatus::Running {
            return Err(PipeError::ProcessInactive(display_argv(&self.argv)));
        }
        self.stdin.take();
        self.begin_collect(Vec::new())?;
        self.wait_for_exit(true)?;
        self.resolved()
    }

    /// Forget a finished run so the stage can be started again.
    pub fn reset(&mut self) -> PipeResult<()> {
        if let (ProcessStatus::Running, Some(pid)) = (self.status, self.pid()) {
            return Err(PipeError::AlreadyRunning {
                command: display_argv(&self.argv),
                pid,
            });
        }
        self.status = ProcessStatus::NotStarted;
        self.raw = None;
        self.spawn_error = None;
        self.stream_outcome = None;
        self.started_at = None;
        Ok(())
    }

    /// Run `body` against the started process, then finish it.
    ///
    /// If `body` fails the process is killed instead. Handles and pump
    /// threads are released on both paths.
    pub fn scope<T, F>(&mut self, body: F) -> PipeResult<T>
    where
        F: FnOnce(&mut Self) -> PipeResult<T>,
    {
        self.start()?;
        match body(self) {
            Ok(value) => {
                if self.is_running() {
                    self.finish()?;
                }
                Ok(value)
            }
            Err(e) => {
                if self.is_running()
                    && let Err(kill_err) = self.kill()
                {
                    warn!(argv = %display_argv(&self.argv), error = %kill_err, "kill after scope error failed");
                }
                Err(e)
            }
        }
    }

    /// Blocking, caller-driven stdout: a single-pass iterator of chunks.
    ///
    /// Claims stdout for this run. If the process reads stdin, close it
    /// (or feed it from another thread) before draining the iterator.
    /// With a timeout, the iterator ends when the deadline kills the process.
    pub fn iter_stdout(&mut self) -> PipeResult<StdoutChunks> {
        let stdout = self.claim_stdout()?;
        Ok(StdoutChunks {
            reader: stdout,
            chunk_size: self.config.chunk_size,
            done: false,
        })
    }

    /// Background stdout: pump it into `sink` on a dedicated thread.
    ///
    /// `callback` runs on the pump thread after every chunk with this
    /// command's identity and the cumulative byte count. Returns immediately.
    pub fn stream_stdout<W, F>(&mut self, sink: W, mut callback: F) -> PipeResult<()>
    where
        W: Write + Send + 'static,
        F: FnMut(&CommandInfo, u64) + Send + 'static,
    {
        let stdout = self.claim_stdout()?;
        let info = self.info();
        let pump = StreamPump::spawn_with_progress(
            format!("{}:stream", self.argv[0]),
            stdout,
            sink,
            self.config.chunk_size,
            move |total| callback(&info, total),
        )?;
        self.stream = Some(pump);
        Ok(())
    }

    /// Wait for the `stream_stdout` pump and return its outcome.
    pub fn wait_stream(&mut self) -> PipeResult<PumpOutcome> {
        if let Some(pump) = self.stream.take() {
            return Ok(pump.join());
        }
        self.stream_outcome
            .take()
            .ok_or_else(|| PipeError::ProcessInactive(format!("{} (no stdout stream)", display_argv(&self.argv))))
    }

    /// Write one chunk to the process's stdin.
    ///
    /// Unless another consumer already claimed stdout, it is captured in the
    /// background from here on so the child cannot stall on a full pipe.
    pub fn stream_stdin(&mut self, chunk: impl AsRef<[u8]>) -> PipeResult<()> {
        self.start()?;
        if self.status != ProcessStatus::Running {
            return Err(PipeError::ProcessInactive(display_argv(&self.argv)));
        }
        if let Some(stdout) = self.stdout.take() {
            self.stdout_capture = Some(Capture::spawn(
                format!("{}:stdout", self.argv[0]),
                stdout,
                self.config.chunk_size,
            )?);
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipeError::ProcessInactive(format!("{} (stdin closed)", display_argv(&self.argv))))?;
        stdin.write_all(chunk.as_ref())?;
        Ok(())
    }

    /// Signal end-of-input.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Connect this process's stdout to `next`'s stdin through a pump.
    ///
    /// Returns `None` when either side has no live handle (a stage that was
    /// never spawned, or one whose stdout is already claimed).
    pub(crate) fn link_to(&mut self, next: &mut ShellCommand) -> PipeResult<Option<StreamPump>> {
        if self.stdout.is_none() || next.stdin.is_none() {
            return Ok(None);
        }
        let (Some(stdout), Some(stdin)) = (self.stdout.take(), next.stdin.take()) else {
            return Ok(None);
        };
        let label = format!("{}|{}", self.argv[0], next.argv[0]);
        let pump = StreamPump::spawn(label, stdout, stdin, self.config.chunk_size)?;
        Ok(Some(pump))
    }

    fn claim_stdout(&mut self) -> PipeResult<ChildStdout> {
        self.start()?;
        if self.status != ProcessStatus::Running {
            return Err(PipeError::ProcessInactive(display_argv(&self.argv)));
        }
        self.stdout
            .take()
            .ok_or_else(|| PipeError::StdoutClaimed(display_argv(&self.argv)))
    }

    /// Start feeding `input` and capturing whatever handles are still unclaimed.
    pub(crate) fn begin_collect(&mut self, input: Vec<u8>) -> PipeResult<()> {
        if let Some(stdin) = self.stdin.take()
            && !input.is_empty()
        {
            self.feeder = Some(StreamPump::spawn(
                format!("{}:stdin", self.argv[0]),
                Cursor::new(input),
                stdin,
                self.config.chunk_size,
            )?);
        }
        if let Some(stdout) = self.stdout.take() {
            self.stdout_capture = Some(Capture::spawn(
                format!("{}:stdout", self.argv[0]),
                stdout,
                self.config.chunk_size,
            )?);
        }
        Ok(())
    }

    fn wait_for_exit(&mut self, kill_first: bool) -> PipeResult<()> {
        let Some(live) = self.child.take() else {
            return Ok(());
        };
        let started = self.started_at.unwrap_or_else(Instant::now);

        if kill_first {
            debug!(argv = %display_argv(&self.argv), pid = live.pid, "killing on request");
            live.kill();
        }

        let waited = live.wait();
        let elapsed = started.elapsed();
        drop(live);
        let (status, timed_out) = waited?;

        self.stdin.take();
        if let Some(feeder) = self.feeder.take() {
            let outcome = feeder.join();
            if let Some(e) = outcome.error
                && e.kind() != io::ErrorKind::BrokenPipe
            {
                warn!(argv = %display_argv(&self.argv), error = %e, "stdin feed failed");
            }
        }
        if let Some(pump) = self.stream.take() {
            self.stream_outcome = Some(pump.join());
        }
        let stdout = self.stdout_capture.take().map(Capture::finish).unwrap_or_default();
        let stderr = self.stderr_capture.take().map(Capture::finish).unwrap_or_default();
        self.stdout.take();

        let exit_code = exit_code_of(status);
        debug!(
            argv = %display_argv(&self.argv),
            code = exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            timed_out,
            "process finished"
        );

        self.raw = Some(RawOutput {
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out,
        });
        self.status = if timed_out {
            ProcessStatus::TimedOut
        } else {
            ProcessStatus::Completed
        };
        Ok(())
    }

    fn resolved(&self) -> PipeResult<ExecutionResult> {
        if let Some(raw) = &self.raw {
            return Ok(resolve_output(raw, &self.argv, &self.config));
        }
        if let Some((kind, message)) = &self.spawn_error {
            return Err(PipeError::Spawn {
                program: self.argv[0].clone(),
                source: io::Error::new(*kind, message.clone()),
            });
        }
        Err(PipeError::ProcessInactive(display_argv(&self.argv)))
    }
}

impl Drop for ShellCommand {
    fn drop(&mut self) {
        self.stdin.take();
        if let Some(live) = self.child.take() {
            if matches!(live.has_exited(), Ok(false)) {
                warn!(argv = %display_argv(&self.argv), pid = live.pid, "killing process left running at drop");
                live.kill();
            }
            if let Err(e) = live.wait() {
                warn!(error = %e, "failed to reap process at drop");
            }
        }
        // Remaining pumps join in their own Drop once the pipes close.
    }
}

impl std::fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellCommand")
            .field("argv", &self.argv)
            .field("config", &self.config)
            .field("status", &self.status)
            .field("pid", &self.pid())
            .finish()
    }
}

/// Stdout chunks as the process produces them. Not restartable.
pub struct StdoutChunks {
    reader: ChildStdout,
    chunk_size: usize,
    done: bool,
}

impl Iterator for StdoutChunks {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_chunk(self.chunk_size) {
            Ok(chunk) if chunk.is_empty() => {
                self.done = true;
                None
            }
            Ok(chunk) => Some(Ok(chunk)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for StdoutChunks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdoutChunks").field("done", &self.done).finish()
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Kill the child and everything it started in its process group.
///
/// Only called on an unreaped child, so the group id cannot have been reused.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pgid) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
            && e != Errno::ESRCH
        {
            warn!(pid = child.id(), error = %e, "killing process group failed");
        }
    }
    // InvalidInput means it already exited.
    if let Err(e) = child.kill()
        && e.kind() != io::ErrorKind::InvalidInput
    {
        warn!(pid = child.id(), error = %e, "kill failed");
    }
}

/// Exit code, or the negated signal number for a process killed by a signal.
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
