//! shellpipe-kernel: composable Unix pipelines without a shell.
//!
//! This crate provides:
//!
//! - **Command**: Shell-word tokenization into an argument vector
//! - **Process**: `ShellCommand`, one external process with timeout and exit-code policy
//! - **Pump**: `StreamPump`, a thread that moves bytes and counts them
//! - **Segment**: Literals, functions, I/O endpoints and processes as chain nodes
//! - **Chain**: `PipeChain` and the `|` operator
//! - **Resolve**: Raw process output into `ExecutionResult`
//! - **Exists**: Command-not-found probing with a caller-owned cache
//!
//! ```no_run
//! use shellpipe_kernel::ShellCommand;
//!
//! let mut chain = ShellCommand::new("df")? | ShellCommand::new("grep tmpfs")? | ShellCommand::new("sort")?;
//! let sorted = chain.result()?;
//! println!("{}", String::from_utf8_lossy(sorted.as_bytes().unwrap_or_default()));
//! # Ok::<(), shellpipe_kernel::PipeError>(())
//! ```

pub mod api;
pub mod chain;
pub mod command;
pub mod error;
pub mod exists;
pub mod process;
pub mod pump;
pub mod resolve;
pub mod segment;

pub use api::{run, run_with};
pub use chain::{ChainOutcome, PipeChain};
pub use command::{IntoArgv, display_argv, tokenize};
pub use error::{PipeError, PipeResult};
pub use exists::{ExistenceCache, command_exists};
pub use process::{CommandInfo, ShellCommand, StdoutChunks};
pub use pump::{ByteSink, ByteSource, CaptureBuffer, PumpOutcome, StreamPump};
pub use resolve::{RawOutput, resolve_output};
pub use segment::{FunctionStage, IntoSegments, IoEndpoint, PipeSegment, TransformError};

// Value types, so most callers need only this crate.
pub use shellpipe_types::{
    CommandConfig, DecodeAs, ExecutionResult, Failure, FailureKind, Output, ProcessStatus,
};
