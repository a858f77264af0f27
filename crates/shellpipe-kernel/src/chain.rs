//! Chain execution.
//!
//! Runs a sequence of segments where the output of each becomes the input of
//! the next. Adjacent processes are connected by pump threads so they run
//! concurrently, exactly like an OS pipeline; every other transition hands the
//! upstream bytes over in memory.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::{BitOr, Range};
use std::path::Path;
use std::thread;
use std::time::Duration;

use shellpipe_types::{ExecutionResult, Failure};
use tracing::{debug, warn};

use crate::error::{PipeError, PipeResult};
use crate::process::ShellCommand;
use crate::pump::StreamPump;
use crate::segment::{FunctionStage, IntoSegments, IoEndpoint, PipeSegment, StageValue};

/// Bounds of the backoff used while polling a process stretch for exits.
const POLL_START: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(20);

/// What resolving a chain produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// The terminal segment's result.
    Output(ExecutionResult),
    /// The terminal segment was a write-only endpoint; this many bytes went in.
    Redirected(u64),
}

impl ChainOutcome {
    pub fn ok(&self) -> bool {
        match self {
            ChainOutcome::Output(result) => result.ok(),
            ChainOutcome::Redirected(_) => true,
        }
    }

    pub fn output(&self) -> Option<&ExecutionResult> {
        match self {
            ChainOutcome::Output(result) => Some(result),
            ChainOutcome::Redirected(_) => None,
        }
    }

    pub fn into_output(self) -> Option<ExecutionResult> {
        match self {
            ChainOutcome::Output(result) => Some(result),
            ChainOutcome::Redirected(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.output().and_then(ExecutionResult::failure)
    }

    pub fn bytes_written(&self) -> Option<u64> {
        match self {
            ChainOutcome::Redirected(n) => Some(*n),
            ChainOutcome::Output(_) => None,
        }
    }
}

/// An ordered, non-empty sequence of segments.
#[derive(Debug)]
pub struct PipeChain {
    segments: Vec<PipeSegment>,
}

impl PipeChain {
    pub fn new(first: impl IntoSegments) -> Self {
        Self {
            segments: first.into_segments(),
        }
    }

    /// Append a segment or another chain.
    pub fn pipe(mut self, next: impl IntoSegments) -> Self {
        self.segments.extend(next.into_segments());
        self
    }

    pub fn segments(&self) -> &[PipeSegment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [PipeSegment] {
        &mut self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn into_segments(self) -> Vec<PipeSegment> {
        self.segments
    }

    /// Execute every segment in order and return the terminal outcome.
    ///
    /// A failing non-terminal segment stops the chain: nothing further
    /// downstream is started, processes already running downstream are
    /// killed, and the outcome is that segment's failure with its position.
    #[tracing::instrument(level = "debug", skip(self), fields(segments = self.segments.len()))]
    pub fn resolve(&mut self) -> PipeResult<ChainOutcome> {
        let len = self.segments.len();
        if len == 0 {
            return Err(PipeError::InvalidParameter("cannot resolve an empty chain".into()));
        }

        let mut carried: Option<Vec<u8>> = None;
        let mut i = 0;
        while i < len {
            let (result, last) = if self.segments[i].is_process() {
                let end = (i..len).find(|&j| !self.segments[j].is_process()).unwrap_or(len);
                let result = self.run_processes(i..end, carried.take().unwrap_or_default())?;
                (result, end - 1)
            } else {
                let terminal = i == len - 1;
                debug!(position = i, segment = %self.segments[i].label(), "applying segment");
                match self.segments[i]
                    .apply(carried.take(), terminal)
                    .map_err(|e| e.at_position(i))?
                {
                    StageValue::Result(result) => (result, i),
                    StageValue::Written(n) => return Ok(ChainOutcome::Redirected(n)),
                }
            };

            if last == len - 1 {
                return Ok(ChainOutcome::Output(result));
            }
            match result.into_bytes() {
                Ok(bytes) => carried = Some(bytes),
                Err(failure) => {
                    debug!(position = last, "segment failed, stopping chain");
                    let position = failure.position.unwrap_or(last);
                    return Ok(ChainOutcome::Output(failure.at_position(position).into()));
                }
            }
            i = last + 1;
        }

        Err(PipeError::Impossible("chain ended without a terminal segment".into()))
    }

    /// Resolve and return the terminal result.
    pub fn result(&mut self) -> PipeResult<ExecutionResult> {
        match self.resolve()? {
            ChainOutcome::Output(result) => Ok(result),
            ChainOutcome::Redirected(_) => Err(PipeError::Impossible(
                "chain output was written to an endpoint".into(),
            )),
        }
    }

    /// Resolve, then write the terminal bytes into `sink`. Returns the byte count.
    ///
    /// A failed chain writes nothing and returns the failure as an error.
    pub fn redirect<W: Write>(&mut self, mut sink: W) -> PipeResult<u64> {
        match self.resolve()? {
            ChainOutcome::Redirected(n) => Ok(n),
            ChainOutcome::Output(result) => {
                let bytes = result.into_bytes()?;
                sink.write_all(&bytes)?;
                sink.flush()?;
                Ok(bytes.len() as u64)
            }
        }
    }

    /// Resolve, then create or truncate `path` and write the terminal bytes.
    ///
    /// The file is only touched if the chain succeeded.
    pub fn write_to_file(&mut self, path: impl AsRef<Path>) -> PipeResult<u64> {
        let bytes = self.result()?.into_bytes()?;
        let mut file = BufWriter::new(File::create(path.as_ref())?);
        file.write_all(&bytes)?;
        file.flush()?;
        debug!(path = %path.as_ref().display(), bytes = bytes.len(), "wrote chain output");
        Ok(bytes.len() as u64)
    }

    /// Run a contiguous stretch of processes as one OS-level pipeline.
    ///
    /// Stages are collected in the order they exit, so each one's deadline
    /// holds no matter how slow its neighbours are. The first non-terminal
    /// stage seen failing ends the stretch. Once the terminal stage is done,
    /// anything still running upstream is killed.
    fn run_processes(&mut self, range: Range<usize>, input: Vec<u8>) -> PipeResult<ExecutionResult> {
        let terminal_index = range.end - 1;

        for i in range.clone() {
            if let Err(e) = self.process_mut(i)?.start() {
                self.kill_range(range.start..i);
                return Err(e.at_position(i));
            }
        }

        let mut links: Vec<(usize, StreamPump)> = Vec::new();
        for i in range.start..range.end - 1 {
            let (left, right) = self.segments.split_at_mut(i + 1);
            if let (Some(up), Some(down)) = (left[i].as_process_mut(), right[0].as_process_mut()) {
                match up.link_to(down) {
                    Ok(Some(pump)) => links.push((i, pump)),
                    Ok(None) => {}
                    Err(e) => {
                        self.kill_range(range.clone());
                        drop(links);
                        return Err(e.at_position(i));
                    }
                }
            }
        }

        let mut head_input = Some(input);
        for i in range.clone() {
            let feed = head_input.take().unwrap_or_default();
            if let Err(e) = self.process_mut(i)?.begin_collect(feed) {
                self.kill_range(range.clone());
                drop(links);
                return Err(e.at_position(i));
            }
        }

        let mut waiting: Vec<usize> = range.clone().collect();
        let mut pause = POLL_START;
        let terminal = loop {
            let Some(i) = self.first_exited(&waiting) else {
                thread::sleep(pause);
                pause = (pause * 2).min(POLL_MAX);
                continue;
            };
            waiting.retain(|&j| j != i);
            pause = POLL_START;

            let result = match self.process_mut(i)?.finish() {
                Ok(result) => result,
                Err(e) => {
                    self.kill_range(range.clone());
                    drop(links);
                    return Err(e.at_position(i));
                }
            };
            if i == terminal_index {
                self.kill_range(range.start..i);
                break result;
            }
            if let ExecutionResult::Failure(failure) = result {
                warn!(position = i, code = failure.exit_code, "stage failed, stopping the rest");
                self.kill_range(range.clone());
                drop(links);
                return Ok(failure.at_position(i).into());
            }
        };

        for (position, link) in links {
            let label = link.label().to_string();
            let outcome = link.join();
            if terminal.ok()
                && let Some(e) = outcome.error
                && !matches!(e.kind(), std::io::ErrorKind::BrokenPipe)
            {
                return Ok(Failure::io(label, e.to_string()).at_position(position).into());
            }
        }

        Ok(terminal)
    }

    /// Lowest-positioned stage in `waiting` whose process has exited.
    fn first_exited(&self, waiting: &[usize]) -> Option<usize> {
        waiting.iter().copied().find(|&i| {
            self.segments[i]
                .as_process()
                .is_none_or(ShellCommand::has_exited)
        })
    }

    fn process_mut(&mut self, i: usize) -> PipeResult<&mut ShellCommand> {
        self.segments[i]
            .as_process_mut()
            .ok_or_else(|| PipeError::Impossible(format!("segment {} is not a process", i)))
    }

    fn kill_range(&mut self, range: Range<usize>) {
        for segment in &mut self.segments[range] {
            if let Some(cmd) = segment.as_process_mut()
                && cmd.is_running()
                && let Err(e) = cmd.kill()
            {
                warn!(segment = %segment_label(cmd), error = %e, "failed to kill downstream stage");
            }
        }
    }
}

fn segment_label(cmd: &ShellCommand) -> String {
    crate::command::display_argv(cmd.argv())
}

macro_rules! chain_operator {
    ($($ty:ty),* $(,)?) => {$(
        impl<R: IntoSegments> BitOr<R> for $ty {
            type Output = PipeChain;

            fn bitor(self, rhs: R) -> PipeChain {
                PipeChain::new(self).pipe(rhs)
            }
        }
    )*};
}

chain_operator!(PipeChain, PipeSegment, ShellCommand, FunctionStage, IoEndpoint);

// Literal data at the head of a chain: `b"input".to_vec() | cmd`, `"text" | cmd`.
macro_rules! data_head_operator {
    ($head:ty => $($rhs:ty),* $(,)?) => {$(
        impl BitOr<$rhs> for $head {
            type Output = PipeChain;

            fn bitor(self, rhs: $rhs) -> PipeChain {
                PipeChain::new(self).pipe(rhs)
            }
        }
    )*};
}

data_head_operator!(Vec<u8> => ShellCommand, FunctionStage, IoEndpoint, PipeSegment, PipeChain);
data_head_operator!(String => ShellCommand, FunctionStage, IoEndpoint, PipeSegment, PipeChain);
data_head_operator!(&str => ShellCommand, FunctionStage, IoEndpoint, PipeSegment, PipeChain);
data_head_operator!(&[u8] => ShellCommand, FunctionStage, IoEndpoint, PipeSegment, PipeChain);

impl<const N: usize> BitOr<ShellCommand> for &[u8; N] {
    type Output = PipeChain;

    fn bitor(self, rhs: ShellCommand) -> PipeChain {
        PipeChain::new(self).pipe(rhs)
    }
}

impl<const N: usize> BitOr<FunctionStage> for &[u8; N] {
    type Output = PipeChain;

    fn bitor(self, rhs: FunctionStage) -> PipeChain {
        PipeChain::new(self).pipe(rhs)
    }
}
