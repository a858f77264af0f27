//! One-shot helpers for the common case of running a single command.

use shellpipe_types::{CommandConfig, ExecutionResult};

use crate::command::IntoArgv;
use crate::error::PipeResult;
use crate::process::ShellCommand;

/// Run `command` with no input and return its output decoded as text.
pub fn run(command: impl IntoArgv) -> PipeResult<ExecutionResult> {
    run_with(command, b"", CommandConfig::new().text())
}

/// Run `command`, feeding `stdin`, under an explicit configuration.
///
/// The process is scoped: if anything goes wrong it is killed before
/// returning.
pub fn run_with(command: impl IntoArgv, stdin: impl AsRef<[u8]>, config: CommandConfig) -> PipeResult<ExecutionResult> {
    let mut cmd = ShellCommand::with_config(command, config)?;
    cmd.scope(|cmd| cmd.run(stdin))
}
