//! StreamPump: moves bytes from a source to a sink on a dedicated thread.
//!
//! ```text
//!   Read ──▶ [chunk buffer] ──▶ Write
//!             ├── counter updated after every chunk (AtomicU64)
//!             ├── progress callback runs on the pump thread
//!             ├── EOF (read returns 0) → flush, drop sink, finish
//!             └── I/O error → stored in the outcome, no retry
//! ```
//!
//! Dropping the sink when the transfer ends is what closes a child's stdin,
//! so a pump feeding a process also delivers its end-of-input.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{trace, warn};

/// Read size for stderr capture (matches the Linux kernel pipe default).
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Result of one finished transfer.
#[derive(Debug)]
pub struct PumpOutcome {
    /// Bytes written to the sink.
    pub bytes: u64,
    /// The error that stopped the transfer early, if any.
    pub error: Option<io::Error>,
}

impl PumpOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// True if the transfer stopped because the reading side went away.
    pub fn is_broken_pipe(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind() == io::ErrorKind::BrokenPipe)
    }

    pub fn into_result(self) -> io::Result<u64> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.bytes),
        }
    }
}

/// A running byte transfer.
pub struct StreamPump {
    label: String,
    moved: Arc<AtomicU64>,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<PumpOutcome>>,
}

impl StreamPump {
    /// Start pumping `source` into `sink` in chunks of at most `chunk_size` bytes.
    pub fn spawn<R, W>(label: impl Into<String>, source: R, sink: W, chunk_size: usize) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::spawn_with_progress(label, source, sink, chunk_size, |_| {})
    }

    /// Like `spawn`, calling `progress` with the running total after every chunk.
    pub fn spawn_with_progress<R, W, F>(
        label: impl Into<String>,
        source: R,
        sink: W,
        chunk_size: usize,
        progress: F,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        F: FnMut(u64) + Send + 'static,
    {
        let label = label.into();
        let moved = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let handle = thread::Builder::new().name(format!("pump:{}", label)).spawn({
            let moved = moved.clone();
            let finished = finished.clone();
            let label = label.clone();
            move || {
                let outcome = transfer(source, sink, chunk_size.max(1), &moved, progress);
                finished.store(true, Ordering::Release);
                trace!(pump = %label, bytes = outcome.bytes, ok = outcome.is_ok(), "pump finished");
                outcome
            }
        })?;

        Ok(Self {
            label,
            moved,
            finished,
            handle: Some(handle),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bytes written so far. Safe to poll from any thread.
    pub fn bytes_moved(&self) -> u64 {
        self.moved.load(Ordering::Acquire)
    }

    /// True once the worker has stopped, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait for the transfer to end.
    pub fn join(mut self) -> PumpOutcome {
        self.join_inner()
    }

    fn join_inner(&mut self) -> PumpOutcome {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(pump = %self.label, "pump thread panicked");
                    PumpOutcome {
                        bytes: self.bytes_moved(),
                        error: Some(io::Error::other("pump thread panicked")),
                    }
                }
            },
            None => PumpOutcome {
                bytes: self.bytes_moved(),
                error: None,
            },
        }
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let outcome = self.join_inner();
            if let Some(e) = outcome.error
                && e.kind() != io::ErrorKind::BrokenPipe
            {
                warn!(pump = %self.label, error = %e, "pump failed during cleanup");
            }
        }
    }
}

impl std::fmt::Debug for StreamPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPump")
            .field("label", &self.label)
            .field("bytes_moved", &self.bytes_moved())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn transfer<R, W, F>(mut source: R, mut sink: W, chunk_size: usize, moved: &AtomicU64, mut progress: F) -> PumpOutcome
where
    R: Read,
    W: Write,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return PumpOutcome { bytes: total, error: Some(e) },
        };

        if let Err(e) = sink.write_all(&buf[..n]) {
            return PumpOutcome { bytes: total, error: Some(e) };
        }

        total += n as u64;
        moved.store(total, Ordering::Release);
        trace!(chunk = n, total, "pumped chunk");
        progress(total);
    }

    let error = sink.flush().err();
    PumpOutcome { bytes: total, error }
}

/// Something that yields bytes in chunks. An empty chunk means end of stream.
pub trait ByteSource {
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>>;
}

/// Something that accepts whole chunks of bytes.
pub trait ByteSink {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize>;
}

impl<R: Read + ?Sized> ByteSource for R {
    fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max.max(1)];
        loop {
            match self.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<W: Write + ?Sized> ByteSink for W {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self.write_all(chunk)?;
        Ok(chunk.len())
    }
}

/// Cloneable in-memory sink. Every clone appends to the same buffer.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move everything written so far out, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    #[test]
    fn moves_everything_in_order() {
        let data: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let sink = CaptureBuffer::new();
        let pump = StreamPump::spawn("test", Cursor::new(data.clone()), sink.clone(), 97).unwrap();

        let outcome = pump.join();
        assert!(outcome.is_ok());
        assert_eq!(outcome.bytes, data.len() as u64);
        assert_eq!(sink.contents(), data);
    }

    #[test]
    fn progress_reports_running_total() {
        let (tx, rx) = mpsc::channel();
        let pump = StreamPump::spawn_with_progress(
            "progress",
            Cursor::new(vec![7u8; 25]),
            io::sink(),
            10,
            move |total| {
                let _ = tx.send(total);
            },
        )
        .unwrap();

        let outcome = pump.join();
        let totals: Vec<u64> = rx.iter().collect();
        assert_eq!(totals, vec![10, 20, 25]);
        assert_eq!(outcome.bytes, 25);
    }

    #[test]
    fn empty_source_finishes_with_zero() {
        let pump = StreamPump::spawn("empty", io::empty(), io::sink(), 16).unwrap();
        let outcome = pump.join();
        assert_eq!(outcome.into_result().unwrap(), 0);
    }

    struct Failing;

    impl Write for Failing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_error_is_stored_not_retried() {
        let pump = StreamPump::spawn("fail", Cursor::new(b"abc".to_vec()), Failing, 1).unwrap();
        let outcome = pump.join();
        assert!(outcome.is_broken_pipe());
        assert_eq!(outcome.bytes, 0);
    }

    #[test]
    fn counter_visible_after_finish() {
        let pump = StreamPump::spawn("count", Cursor::new(vec![1u8; 64]), io::sink(), 8).unwrap();
        while !pump.is_finished() {
            std::thread::yield_now();
        }
        assert_eq!(pump.bytes_moved(), 64);
        assert_eq!(pump.label(), "count");
    }

    #[test]
    fn byte_source_signals_end_with_empty_chunk() {
        let mut src = Cursor::new(b"hello world".to_vec());
        assert_eq!(src.read_chunk(5).unwrap(), b"hello");
        assert_eq!(src.read_chunk(100).unwrap(), b" world");
        assert!(src.read_chunk(100).unwrap().is_empty());

        let mut sink = CaptureBuffer::new();
        assert_eq!(sink.write_chunk(b"abc").unwrap(), 3);
        assert_eq!(sink.contents(), b"abc");
    }

    #[test]
    fn capture_buffer_take_empties() {
        let mut buf = CaptureBuffer::new();
        buf.write_all(b"xyz").unwrap();
        let clone = buf.clone();
        assert_eq!(clone.len(), 3);
        assert_eq!(clone.take(), b"xyz");
        assert!(buf.is_empty());
    }
}
