//! Engine errors: misuse and launch failures that are not in-band results.

use std::io;

use shellpipe_types::Failure;
use thiserror::Error;

/// Result type for engine operations.
pub type PipeResult<T> = Result<T, PipeError>;

/// Errors raised by the engine.
///
/// Process outcomes (bad exit code, timeout, undecodable output) travel
/// in-band as `ExecutionResult::Failure`; `Failed` carries the same value
/// when the caller asked for exceptional propagation.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process for {0} is inactive")]
    ProcessInactive(String),

    #[error("process for {command} is already running at pid {pid}")]
    AlreadyRunning { command: String, pid: u32 },

    #[error("stdout of {0} is already claimed by another consumer")]
    StdoutClaimed(String),

    /// An endpoint was used in a direction it does not support.
    #[error("{0}")]
    Impossible(String),

    #[error("segment {position}: {source}")]
    Segment {
        position: usize,
        #[source]
        source: Box<PipeError>,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Failed(#[from] Failure),
}

impl PipeError {
    /// Attach a chain position, unless one is already present.
    pub fn at_position(self, position: usize) -> Self {
        match self {
            PipeError::Segment { .. } => self,
            PipeError::Failed(failure) if failure.position.is_none() => {
                PipeError::Failed(failure.at_position(position))
            }
            other => PipeError::Segment {
                position,
                source: Box::new(other),
            },
        }
    }

    /// The carried failure, if this error wraps one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            PipeError::Failed(f) => Some(f),
            PipeError::Segment { source, .. } => source.failure(),
            _ => None,
        }
    }
}
