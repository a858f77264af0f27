//! Command parsing: turning strings or lists into an argument vector.
//!
//! Strings are split with POSIX shell-word rules (quotes and backslashes are
//! honoured, nothing is expanded). Lists bypass tokenization entirely and are
//! the right choice for arguments containing spaces or metacharacters.

use crate::error::{PipeError, PipeResult};

/// Anything that can name a command.
pub trait IntoArgv {
    fn into_argv(self) -> PipeResult<Vec<String>>;
}

/// Split a command string into arguments.
///
/// No globbing, redirection or variable expansion happens here: `|`, `>`
/// and `*` are ordinary characters.
pub fn tokenize(command: &str) -> PipeResult<Vec<String>> {
    let argv = shell_words::split(command)
        .map_err(|e| PipeError::InvalidParameter(format!("cannot tokenize {:?}: {}", command, e)))?;
    validate(argv)
}

fn validate(argv: Vec<String>) -> PipeResult<Vec<String>> {
    if argv.is_empty() {
        return Err(PipeError::InvalidParameter("command is empty".into()));
    }
    if argv[0].is_empty() {
        return Err(PipeError::InvalidParameter("program name is empty".into()));
    }
    Ok(argv)
}

/// Render an argument vector for logs and messages.
pub fn display_argv(argv: &[String]) -> String {
    shell_words::join(argv)
}

impl IntoArgv for &str {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        tokenize(self)
    }
}

impl IntoArgv for String {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        tokenize(&self)
    }
}

impl IntoArgv for &String {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        tokenize(self)
    }
}

impl IntoArgv for Vec<String> {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        validate(self)
    }
}

impl IntoArgv for Vec<&str> {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        validate(self.into_iter().map(String::from).collect())
    }
}

impl IntoArgv for &[String] {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        validate(self.to_vec())
    }
}

impl IntoArgv for &[&str] {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        validate(self.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> IntoArgv for [&str; N] {
    fn into_argv(self) -> PipeResult<Vec<String>> {
        validate(self.iter().map(|s| s.to_string()).collect())
    }
}
