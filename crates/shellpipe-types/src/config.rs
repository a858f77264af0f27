//! Per-command configuration: output decoding, accepted exit codes, timeout.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default read size for stdout chunks (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// How a successful stdout is handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeAs {
    /// Raw bytes, untouched.
    #[default]
    Bytes,
    /// UTF-8 text. Invalid UTF-8 is a decode failure, never replaced.
    Text,
}

/// Unknown decode mode name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown decode mode: {0:?} (expected \"bytes\" or \"text\")")]
pub struct ParseDecodeError(pub String);

impl FromStr for DecodeAs {
    type Err = ParseDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" | "raw" => Ok(DecodeAs::Bytes),
            "text" | "str" | "utf8" | "utf-8" => Ok(DecodeAs::Text),
            _ => Err(ParseDecodeError(s.to_string())),
        }
    }
}

impl std::fmt::Display for DecodeAs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeAs::Bytes => write!(f, "bytes"),
            DecodeAs::Text => write!(f, "text"),
        }
    }
}

/// Options recognized by a process stage.
///
/// Exit code 0 is always accepted; `accepted_exit_codes` lists the extra
/// codes that should still count as success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub decode_as: DecodeAs,
    pub accepted_exit_codes: BTreeSet<i32>,
    /// Hard wall-clock deadline, measured from spawn.
    pub timeout: Option<Duration>,
    /// Upper bound on a single stdout read.
    pub chunk_size: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            decode_as: DecodeAs::Bytes,
            accepted_exit_codes: BTreeSet::new(),
            timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl CommandConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return stdout as raw bytes.
    pub fn bytes(mut self) -> Self {
        self.decode_as = DecodeAs::Bytes;
        self
    }

    /// Return stdout as UTF-8 text.
    pub fn text(mut self) -> Self {
        self.decode_as = DecodeAs::Text;
        self
    }

    pub fn decode_as(mut self, mode: DecodeAs) -> Self {
        self.decode_as = mode;
        self
    }

    /// Treat `code` as success.
    pub fn accept(mut self, code: i32) -> Self {
        self.accepted_exit_codes.insert(code);
        self
    }

    /// Treat every code in `codes` as success.
    pub fn accept_all(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.accepted_exit_codes.extend(codes);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the read size for stdout chunks. Zero is clamped to one byte.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// True if `code` counts as a successful exit.
    pub fn is_accepted(&self, code: i32) -> bool {
        code == 0 || self.accepted_exit_codes.contains(&code)
    }
}
