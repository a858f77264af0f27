//! Scripted readers and writers.

use std::io::{self, Read, Write};
use std::process::Command;

/// Run `script` through `sh -c` and return its stdout, whatever the exit code.
///
/// Reference output for comparing a chain against the real shell.
pub fn os_pipeline(script: &str) -> Vec<u8> {
    Command::new("sh")
        .args(["-c", script])
        .output()
        .map(|out| out.stdout)
        .unwrap_or_default()
}

/// Yields its data at most `chunk` bytes per read.
#[derive(Debug)]
pub struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
    pub reads: usize,
}

impl ChunkedReader {
    pub fn new(data: impl Into<Vec<u8>>, chunk: usize) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            chunk: chunk.max(1),
            reads: 0,
        }
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        let end = (self.pos + self.chunk.min(buf.len())).min(self.data.len());
        let n = end - self.pos;
        buf[..n].copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(n)
    }
}

/// Returns `prefix` and then fails with `kind`.
#[derive(Debug)]
pub struct FailingReader {
    prefix: Vec<u8>,
    kind: io::ErrorKind,
    served: bool,
}

impl FailingReader {
    pub fn new(prefix: impl Into<Vec<u8>>, kind: io::ErrorKind) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
            served: false,
        }
    }
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.served || self.prefix.is_empty() {
            return Err(io::Error::new(self.kind, "scripted read failure"));
        }
        let n = self.prefix.len().min(buf.len());
        buf[..n].copy_from_slice(&self.prefix[..n]);
        self.prefix.drain(..n);
        self.served = self.prefix.is_empty();
        Ok(n)
    }
}

/// Accepts `limit` bytes, then fails with `kind`.
#[derive(Debug)]
pub struct FailingWriter {
    pub accepted: Vec<u8>,
    limit: usize,
    kind: io::ErrorKind,
}

impl FailingWriter {
    pub fn new(limit: usize, kind: io::ErrorKind) -> Self {
        Self {
            accepted: Vec::new(),
            limit,
            kind,
        }
    }
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.limit - self.accepted.len();
        if room == 0 {
            return Err(io::Error::new(self.kind, "scripted write failure"));
        }
        let n = room.min(buf.len());
        self.accepted.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
