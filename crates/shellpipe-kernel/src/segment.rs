//! Pipe segments: the nodes a chain is made of.
//!
//! Every segment takes the bytes produced upstream (or nothing, at the head
//! of a chain) and produces the value handed downstream:
//!
//! | Variant         | Upstream input            | Output                         |
//! |-----------------|---------------------------|--------------------------------|
//! | `StaticBytes`   | replaces the literal      | the bytes                      |
//! | `StaticString`  | replaces the literal      | the bytes, decoded as UTF-8    |
//! | `Function`      | passed to the transform   | whatever the transform returns |
//! | `Endpoint`      | written to the writer     | everything read from the reader|
//! | `Process`       | fed to stdin              | stdout, resolved per config    |
//!
//! Literals are never mutated: re-resolving a chain that starts with one
//! yields the same head value.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use shellpipe_types::{ExecutionResult, Failure};

use crate::chain::PipeChain;
use crate::command::display_argv;
use crate::error::{PipeError, PipeResult};
use crate::process::ShellCommand;
use crate::pump::{ByteSink, ByteSource};
use crate::resolve::decode_text;

/// Error type a transform may return.
pub type TransformError = Box<dyn std::error::Error + Send + Sync>;

type TransformFn = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, TransformError> + Send>;

/// An in-process bytes → bytes transform.
pub struct FunctionStage {
    name: String,
    func: TransformFn,
}

impl FunctionStage {
    /// Wrap an infallible transform.
    pub fn new<F>(mut func: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self::try_new(move |input| Ok(func(input)))
    }

    /// Wrap a transform that can fail. Its error becomes a `Transform` failure.
    pub fn try_new<F>(func: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, TransformError> + Send + 'static,
    {
        Self {
            name: "function".to_string(),
            func: Box::new(func),
        }
    }

    /// Adapt a `&str -> String` transform. Input must be UTF-8.
    pub fn text<F>(mut func: F) -> Self
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        Self::try_new(move |input| {
            let text = std::str::from_utf8(input)?;
            Ok(func(text).into_bytes())
        })
        .named("text-function")
    }

    /// Passes bytes through unchanged.
    pub fn identity() -> Self {
        Self::new(|input| input.to_vec()).named("identity")
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&mut self, input: &[u8]) -> Result<Vec<u8>, Failure> {
        (self.func)(input).map_err(|e| Failure::transform(self.name.clone(), e.to_string()))
    }
}

impl std::fmt::Debug for FunctionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionStage").field("name", &self.name).finish()
    }
}

/// Adapter letting one `Arc<Mutex<T>>` act as both reader and writer.
struct SharedIo<T>(Arc<Mutex<T>>);

impl<T: Read> Read for SharedIo<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).read(buf)
    }
}

impl<T: Write> Write for SharedIo<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).flush()
    }
}

/// A caller-supplied reader, writer, or both.
pub struct IoEndpoint {
    name: String,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
}

impl IoEndpoint {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            name: "reader".to_string(),
            reader: Some(Box::new(reader)),
            writer: None,
        }
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            name: "writer".to_string(),
            reader: None,
            writer: Some(Box::new(writer)),
        }
    }

    /// One shared object used for both directions: upstream bytes are written
    /// to it, then whatever it yields is read back.
    pub fn duplex<T>(shared: Arc<Mutex<T>>) -> Self
    where
        T: Read + Write + Send + 'static,
    {
        Self {
            name: "duplex".to_string(),
            reader: Some(Box::new(SharedIo(shared.clone()))),
            writer: Some(Box::new(SharedIo(shared))),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_read(&self) -> bool {
        self.reader.is_some()
    }

    pub fn can_write(&self) -> bool {
        self.writer.is_some()
    }

    /// Read until end of stream.
    pub fn read_all(&mut self) -> PipeResult<Vec<u8>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PipeError::Impossible(format!("endpoint '{}' does not support reading", self.name)))?;
        let mut out = Vec::new();
        loop {
            let chunk = reader.read_chunk(crate::pump::PIPE_BUFFER_SIZE)?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Write all of `data` and flush.
    pub fn write_all(&mut self, data: &[u8]) -> PipeResult<u64> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PipeError::Impossible(format!("endpoint '{}' does not support writing", self.name)))?;
        let written = writer.write_chunk(data)?;
        writer.flush()?;
        Ok(written as u64)
    }
}

impl std::fmt::Debug for IoEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEndpoint")
            .field("name", &self.name)
            .field("can_read", &self.can_read())
            .field("can_write", &self.can_write())
            .finish()
    }
}

/// One node of a chain.
#[derive(Debug)]
pub enum PipeSegment {
    StaticBytes(Vec<u8>),
    StaticString(String),
    Function(FunctionStage),
    Endpoint(IoEndpoint),
    Process(ShellCommand),
}

/// What a segment produced.
#[derive(Debug)]
pub(crate) enum StageValue {
    Result(ExecutionResult),
    /// Terminal write-only endpoint: bytes written.
    Written(u64),
}

impl PipeSegment {
    pub fn kind(&self) -> &'static str {
        match self {
            PipeSegment::StaticBytes(_) => "bytes",
            PipeSegment::StaticString(_) => "string",
            PipeSegment::Function(_) => "function",
            PipeSegment::Endpoint(_) => "endpoint",
            PipeSegment::Process(_) => "process",
        }
    }

    /// Short human-readable description for logs and errors.
    pub fn label(&self) -> String {
        match self {
            PipeSegment::StaticBytes(b) => format!("<{} bytes>", b.len()),
            PipeSegment::StaticString(s) => format!("<{} chars>", s.chars().count()),
            PipeSegment::Function(f) => f.name().to_string(),
            PipeSegment::Endpoint(e) => e.name().to_string(),
            PipeSegment::Process(p) => display_argv(p.argv()),
        }
    }

    pub fn is_process(&self) -> bool {
        matches!(self, PipeSegment::Process(_))
    }

    pub fn as_process(&self) -> Option<&ShellCommand> {
        match self {
            PipeSegment::Process(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_process_mut(&mut self) -> Option<&mut ShellCommand> {
        match self {
            PipeSegment::Process(p) => Some(p),
            _ => None,
        }
    }

    /// Run this segment on its own, with no upstream input.
    pub fn resolve(&mut self) -> PipeResult<ExecutionResult> {
        match self.apply(None, false)? {
            StageValue::Result(result) => Ok(result),
            StageValue::Written(_) => Err(PipeError::Impossible(format!(
                "segment '{}' produces no output",
                self.label()
            ))),
        }
    }

    /// Feed `input` (None at the head of a chain) and produce this segment's value.
    pub(crate) fn apply(&mut self, input: Option<Vec<u8>>, terminal: bool) -> PipeResult<StageValue> {
        let label = self.label();
        let result = match self {
            PipeSegment::StaticBytes(bytes) => ExecutionResult::Bytes(input.unwrap_or_else(|| bytes.clone())),
            PipeSegment::StaticString(text) => match input {
                Some(bytes) => decode_text(bytes, &label),
                None => ExecutionResult::Text(text.clone()),
            },
            PipeSegment::Function(func) => match func.apply(input.as_deref().unwrap_or_default()) {
                Ok(bytes) => ExecutionResult::Bytes(bytes),
                Err(failure) => failure.into(),
            },
            PipeSegment::Endpoint(endpoint) => {
                if let Some(bytes) = input {
                    let written = match endpoint.write_all(&bytes) {
                        Ok(n) => n,
                        Err(PipeError::Io(e)) => return Ok(StageValue::Result(Failure::io(label, e.to_string()).into())),
                        Err(e) => return Err(e),
                    };
                    if !endpoint.can_read() {
                        if terminal {
                            return Ok(StageValue::Written(written));
                        }
                        return Err(PipeError::Impossible(format!(
                            "endpoint '{}' does not support reading; it can only end a chain",
                            endpoint.name()
                        )));
                    }
                }
                match endpoint.read_all() {
                    Ok(bytes) => ExecutionResult::Bytes(bytes),
                    Err(PipeError::Io(e)) => Failure::io(label, e.to_string()).into(),
                    Err(e) => return Err(e),
                }
            }
            PipeSegment::Process(cmd) => cmd.run(input.unwrap_or_default())?,
        };
        Ok(StageValue::Result(result))
    }
}

impl From<Vec<u8>> for PipeSegment {
    fn from(bytes: Vec<u8>) -> Self {
        PipeSegment::StaticBytes(bytes)
    }
}

impl From<&[u8]> for PipeSegment {
    fn from(bytes: &[u8]) -> Self {
        PipeSegment::StaticBytes(bytes.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for PipeSegment {
    fn from(bytes: &[u8; N]) -> Self {
        PipeSegment::StaticBytes(bytes.to_vec())
    }
}

impl From<String> for PipeSegment {
    fn from(text: String) -> Self {
        PipeSegment::StaticString(text)
    }
}

impl From<&str> for PipeSegment {
    fn from(text: &str) -> Self {
        PipeSegment::StaticString(text.to_string())
    }
}

impl From<FunctionStage> for PipeSegment {
    fn from(func: FunctionStage) -> Self {
        PipeSegment::Function(func)
    }
}

impl From<IoEndpoint> for PipeSegment {
    fn from(endpoint: IoEndpoint) -> Self {
        PipeSegment::Endpoint(endpoint)
    }
}

impl From<ShellCommand> for PipeSegment {
    fn from(cmd: ShellCommand) -> Self {
        PipeSegment::Process(cmd)
    }
}

/// Anything that can be appended to a chain: a single segment or a whole chain.
pub trait IntoSegments {
    fn into_segments(self) -> Vec<PipeSegment>;
}

macro_rules! single_segment {
    ($($ty:ty),* $(,)?) => {$(
        impl IntoSegments for $ty {
            fn into_segments(self) -> Vec<PipeSegment> {
                vec![PipeSegment::from(self)]
            }
        }
    )*};
}

single_segment!(Vec<u8>, &[u8], String, &str, FunctionStage, IoEndpoint, ShellCommand);

impl<const N: usize> IntoSegments for &[u8; N] {
    fn into_segments(self) -> Vec<PipeSegment> {
        vec![PipeSegment::from(self)]
    }
}

impl IntoSegments for PipeSegment {
    fn into_segments(self) -> Vec<PipeSegment> {
        vec![self]
    }
}

impl IntoSegments for PipeChain {
    fn into_segments(self) -> Vec<PipeSegment> {
        PipeChain::into_segments(self)
    }
}
