//! Failure: everything known about a stage that did not succeed.

use std::borrow::Cow;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code reported for a program that could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code used for failures that did not come from a process exit.
pub const EXIT_NO_PROCESS: i32 = -1;

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The process exited with a code that is neither 0 nor accepted.
    ExitCode,
    /// The deadline passed and the process was killed.
    TimedOut,
    /// The program could not be launched.
    Spawn,
    /// The process succeeded but stdout is not valid text.
    Decode,
    /// An in-process transform returned an error.
    Transform,
    /// Reading from or writing to an endpoint failed.
    Io,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::ExitCode => write!(f, "exit code"),
            FailureKind::TimedOut => write!(f, "timed out"),
            FailureKind::Spawn => write!(f, "spawn"),
            FailureKind::Decode => write!(f, "decode"),
            FailureKind::Transform => write!(f, "transform"),
            FailureKind::Io => write!(f, "io"),
        }
    }
}

/// A failed stage with its full captured context.
///
/// Carries the same data whether it is returned in-band inside an
/// `ExecutionResult` or propagated as an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind} failure in {command:?}: exit code {exit_code}")]
pub struct Failure {
    pub kind: FailureKind,
    /// OS exit code. Negative values are the signal that killed the process.
    pub exit_code: i32,
    /// The resolved argument vector.
    pub command: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Wall time in seconds.
    pub time_used: f64,
    /// Index of the failing segment when it ran inside a chain.
    pub position: Option<usize>,
    /// Human-readable cause for failures not fully described by the exit code.
    pub detail: Option<String>,
}

impl Failure {
    fn new(kind: FailureKind, exit_code: i32, command: Vec<String>) -> Self {
        Self {
            kind,
            exit_code,
            command,
            stdout: Vec::new(),
            stderr: Vec::new(),
            time_used: 0.0,
            position: None,
            detail: None,
        }
    }

    /// A process exited with a code that was not accepted.
    pub fn exit(
        exit_code: i32,
        command: Vec<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        elapsed: Duration,
    ) -> Self {
        Self {
            stdout,
            stderr,
            time_used: elapsed.as_secs_f64(),
            ..Self::new(FailureKind::ExitCode, exit_code, command)
        }
    }

    /// A process was killed at its deadline.
    pub fn timed_out(
        exit_code: i32,
        command: Vec<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        elapsed: Duration,
    ) -> Self {
        Self {
            kind: FailureKind::TimedOut,
            detail: Some(format!("timed out after {:.3}s", elapsed.as_secs_f64())),
            ..Self::exit(exit_code, command, stdout, stderr, elapsed)
        }
    }

    /// Stdout could not be decoded as requested.
    pub fn decode(
        exit_code: i32,
        command: Vec<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        elapsed: Duration,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind: FailureKind::Decode,
            detail: Some(detail.into()),
            ..Self::exit(exit_code, command, stdout, stderr, elapsed)
        }
    }

    /// The program could not be launched.
    pub fn spawn(exit_code: i32, command: Vec<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            stderr: detail.clone().into_bytes(),
            detail: Some(detail),
            ..Self::new(FailureKind::Spawn, exit_code, command)
        }
    }

    /// An in-process transform returned an error.
    pub fn transform(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(FailureKind::Transform, EXIT_NO_PROCESS, vec![stage.into()])
        }
    }

    /// Reading from or writing to an endpoint failed.
    pub fn io(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(FailureKind::Io, EXIT_NO_PROCESS, vec![stage.into()])
        }
    }

    /// Record the chain position of the failing segment.
    pub fn at_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::TimedOut
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.time_used.max(0.0))
    }

    /// Stdout as text, with invalid UTF-8 replaced.
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr as text, with invalid UTF-8 replaced.
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// One-paragraph description for terminals and logs.
    pub fn describe(&self) -> String {
        let mut msg = format!("{} (exit code {})", self.command.join(" "), self.exit_code);
        if let Some(pos) = self.position {
            msg.push_str(&format!(" at segment {}", pos));
        }
        msg.push_str(&format!(": {} failure", self.kind));
        if let Some(detail) = &self.detail {
            msg.push_str(&format!(": {}", detail));
        }
        let stderr = self.stderr_lossy();
        let stderr = stderr.trim();
        if !stderr.is_empty() && self.detail.as_deref() != Some(stderr) {
            msg.push_str(&format!("\n{}", stderr));
        }
        msg
    }
}
