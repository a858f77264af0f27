//! Result resolution: raw process output to `ExecutionResult`.
//!
//! Pure: no I/O, no side effects. Decoding uses UTF-8 and never
//! substitutes replacement characters.

use std::time::Duration;

use shellpipe_types::{CommandConfig, DecodeAs, ExecutionResult, Failure, FailureKind};

/// What a finished process left behind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

/// Turn raw output into a decoded value or a failure.
pub fn resolve_output(raw: &RawOutput, command: &[String], config: &CommandConfig) -> ExecutionResult {
    if raw.timed_out {
        return Failure::timed_out(
            raw.exit_code,
            command.to_vec(),
            raw.stdout.clone(),
            raw.stderr.clone(),
            raw.elapsed,
        )
        .into();
    }

    if !config.is_accepted(raw.exit_code) {
        return Failure::exit(
            raw.exit_code,
            command.to_vec(),
            raw.stdout.clone(),
            raw.stderr.clone(),
            raw.elapsed,
        )
        .into();
    }

    match config.decode_as {
        DecodeAs::Bytes => ExecutionResult::Bytes(raw.stdout.clone()),
        DecodeAs::Text => match String::from_utf8(raw.stdout.clone()) {
            Ok(text) => ExecutionResult::Text(text),
            Err(e) => Failure::decode(
                raw.exit_code,
                command.to_vec(),
                raw.stdout.clone(),
                raw.stderr.clone(),
                raw.elapsed,
                format!("stdout is not valid UTF-8: {}", e.utf8_error()),
            )
            .into(),
        },
    }
}

/// Decode bytes handed between segments as text.
pub fn decode_text(bytes: Vec<u8>, stage: &str) -> ExecutionResult {
    match String::from_utf8(bytes) {
        Ok(text) => ExecutionResult::Text(text),
        Err(e) => {
            let detail = format!("input is not valid UTF-8: {}", e.utf8_error());
            let mut failure = Failure::io(stage, detail);
            failure.kind = FailureKind::Decode;
            failure.stdout = e.into_bytes();
            failure.into()
        }
    }
}
