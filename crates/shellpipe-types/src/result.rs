//! ExecutionResult: the resolved value of a stage or chain.

use std::borrow::Cow;

use crate::failure::Failure;

/// Successful output, decoded per the caller's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Bytes(Vec<u8>),
    Text(String),
}

impl Output {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Output::Bytes(b) => b,
            Output::Text(s) => s.as_bytes(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Output::Bytes(b) => b,
            Output::Text(s) => s.into_bytes(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Output::Bytes(_) => None,
            Output::Text(s) => Some(s),
        }
    }

    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            Output::Bytes(b) => String::from_utf8_lossy(b),
            Output::Text(s) => Cow::Borrowed(s),
        }
    }
}

/// The outcome of running a stage: decoded output or a failure.
///
/// Constructed once after the stage finishes and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Bytes(Vec<u8>),
    Text(String),
    Failure(Failure),
}

impl ExecutionResult {
    /// True unless this is a failure.
    pub fn ok(&self) -> bool {
        !matches!(self, ExecutionResult::Failure(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionResult::Failure(f) => Some(f),
            _ => None,
        }
    }

    /// Decoded text, if the stage was configured for text and succeeded.
    pub fn text(&self) -> Option<&str> {
        match self {
            ExecutionResult::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Output bytes for either success variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ExecutionResult::Bytes(b) => Some(b),
            ExecutionResult::Text(s) => Some(s.as_bytes()),
            ExecutionResult::Failure(_) => None,
        }
    }

    /// Switch from in-band failure to `Result`.
    pub fn into_result(self) -> Result<Output, Failure> {
        match self {
            ExecutionResult::Bytes(b) => Ok(Output::Bytes(b)),
            ExecutionResult::Text(s) => Ok(Output::Text(s)),
            ExecutionResult::Failure(f) => Err(f),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, Failure> {
        self.into_result().map(Output::into_bytes)
    }
}

impl From<Output> for ExecutionResult {
    fn from(output: Output) -> Self {
        match output {
            Output::Bytes(b) => ExecutionResult::Bytes(b),
            Output::Text(s) => ExecutionResult::Text(s),
        }
    }
}

impl From<Failure> for ExecutionResult {
    fn from(failure: Failure) -> Self {
        ExecutionResult::Failure(failure)
    }
}
