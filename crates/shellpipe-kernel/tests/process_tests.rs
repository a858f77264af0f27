//! Integration tests for single-process execution.
//!
//! These tests run real programs from PATH (`echo`, `cat`, `sleep`, ...) and
//! check exit-code policy, timeouts and the three ways of consuming stdout.

use std::io;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rstest::rstest;
use shellpipe_kernel::{
    CaptureBuffer, CommandConfig, ExecutionResult, FailureKind, PipeError, ProcessStatus, ShellCommand, run,
    run_with,
};

fn cmd(command: &str) -> ShellCommand {
    ShellCommand::new(command).expect("valid command")
}

// ============================================================================
// Exit Code Policy
// ============================================================================

#[test]
fn run_echo_hello() {
    assert_eq!(run("echo hello").unwrap(), ExecutionResult::Text("hello\n".into()));
}

#[test]
fn false_yields_exit_one() {
    let failure = cmd("false").result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.exit_code, 1);
    assert_eq!(failure.kind, FailureKind::ExitCode);
}

#[rstest]
#[case::zero("exit 0", &[], true)]
#[case::one_rejected("exit 1", &[], false)]
#[case::one_accepted("exit 1", &[1], true)]
#[case::two_not_in_set("exit 2", &[1, 3], false)]
#[case::three_in_set("exit 3", &[1, 3], true)]
fn accepted_exit_codes(#[case] script: &str, #[case] accept: &[i32], #[case] ok: bool) {
    let config = CommandConfig::new().accept_all(accept.iter().copied());
    let mut sh = ShellCommand::with_config(["sh", "-c", script], config).unwrap();
    assert_eq!(sh.result().unwrap().ok(), ok, "script {:?} accept {:?}", script, accept);
}

#[test]
fn failure_carries_exact_output() {
    let mut sh = ShellCommand::new(["sh", "-c", "printf out; printf err >&2; exit 4"]).unwrap();
    let failure = sh.result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.exit_code, 4);
    assert_eq!(failure.stdout, b"out");
    assert_eq!(failure.stderr, b"err");
    assert_eq!(failure.command, vec!["sh", "-c", "printf out; printf err >&2; exit 4"]);
    assert!(failure.time_used >= 0.0);
}

#[test]
fn not_found_is_127() {
    let failure = cmd("definitely_not_a_real_command_12345")
        .result()
        .unwrap()
        .failure()
        .cloned()
        .unwrap();
    assert_eq!(failure.exit_code, 127);
    assert!(failure.stderr_lossy().contains("not found"), "{}", failure.stderr_lossy());
}

#[rstest]
#[case::empty("")]
#[case::blank("   ")]
#[case::unbalanced("echo 'oops")]
fn invalid_commands_rejected(#[case] command: &str) {
    assert!(matches!(ShellCommand::new(command), Err(PipeError::InvalidParameter(_))));
}

// ============================================================================
// Decoding
// ============================================================================

#[test]
fn bytes_mode_keeps_raw_bytes() {
    let mut printf = ShellCommand::new(["printf", "\\377\\376"]).unwrap();
    assert_eq!(printf.result().unwrap(), ExecutionResult::Bytes(vec![0xff, 0xfe]));
}

#[test]
fn text_mode_rejects_invalid_utf8() {
    let result = run_with(["printf", "\\377"], b"", CommandConfig::new().text()).unwrap();
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Decode);
    assert_eq!(failure.exit_code, 0);
}

// ============================================================================
// Timeout
// ============================================================================

#[test]
fn timeout_kills_within_margin() {
    let config = CommandConfig::new().timeout(Duration::from_millis(300));
    let mut sleeper = ShellCommand::with_config(["sleep", "5"], config).unwrap();

    let started = Instant::now();
    let failure = sleeper.result().unwrap().failure().cloned().unwrap();
    let took = started.elapsed();

    assert!(failure.is_timeout());
    assert_eq!(sleeper.status(), ProcessStatus::TimedOut);
    assert!(took < Duration::from_secs(3), "took {:?}", took);
    assert!(took >= Duration::from_millis(300), "took {:?}", took);
}

#[test]
fn timeout_keeps_partial_output() {
    let config = CommandConfig::new().timeout(Duration::from_millis(500));
    let mut sh = ShellCommand::with_config(["sh", "-c", "echo early; sleep 5"], config).unwrap();
    let failure = sh.result().unwrap().failure().cloned().unwrap();
    assert!(failure.is_timeout());
    assert_eq!(failure.stdout, b"early\n");
}

#[test]
fn timeout_kills_grandchildren_holding_pipes() {
    // The shell forks sleep, which inherits stdout and stderr.
    let config = CommandConfig::new().timeout(Duration::from_millis(300));
    let mut sh = ShellCommand::with_config(["sh", "-c", "sleep 4; true"], config).unwrap();

    let started = Instant::now();
    let failure = sh.result().unwrap().failure().cloned().unwrap();
    let took = started.elapsed();

    assert!(failure.is_timeout());
    assert!(took < Duration::from_secs(2), "took {:?}", took);
}

#[test]
fn iter_stdout_ends_at_deadline() {
    let config = CommandConfig::new().timeout(Duration::from_millis(300));
    let mut sleeper = ShellCommand::with_config(["sleep", "3"], config).unwrap();

    let started = Instant::now();
    let chunks = sleeper.iter_stdout().unwrap().count();
    let took = started.elapsed();
    assert_eq!(chunks, 0);
    assert!(took < Duration::from_secs(2), "took {:?}", took);

    let failure = sleeper.finish().unwrap().failure().cloned().unwrap();
    assert!(failure.is_timeout());
    assert_eq!(sleeper.status(), ProcessStatus::TimedOut);
}

#[test]
fn stream_stdout_ends_at_deadline() {
    let config = CommandConfig::new().timeout(Duration::from_millis(300));
    let mut sh = ShellCommand::with_config(["sh", "-c", "echo early; sleep 3"], config).unwrap();
    let sink = CaptureBuffer::new();

    let started = Instant::now();
    sh.stream_stdout(sink.clone(), |_, _| {}).unwrap();
    let outcome = sh.wait_stream().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(outcome.bytes, 6);
    assert_eq!(sink.contents(), b"early\n");

    assert!(sh.finish().unwrap().failure().is_some_and(|f| f.is_timeout()));
}

#[test]
fn fast_command_unaffected_by_timeout() {
    let config = CommandConfig::new().timeout(Duration::from_secs(10));
    let mut echo = ShellCommand::with_config("echo quick", config).unwrap();
    assert!(echo.result().unwrap().ok());
    assert_eq!(echo.status(), ProcessStatus::Completed);
}

// ============================================================================
// Streaming stdout
// ============================================================================

#[test]
fn stream_stdout_total_matches_output() {
    let mut seq = cmd("seq 1 20000");
    let sink = CaptureBuffer::new();
    let (tx, rx) = mpsc::channel();

    seq.stream_stdout(sink.clone(), move |info, total| {
        assert_eq!(info.argv[0], "seq");
        let _ = tx.send(total);
    })
    .unwrap();

    let outcome = seq.wait_stream().unwrap();
    assert!(seq.finish().unwrap().ok());

    let totals: Vec<u64> = rx.iter().collect();
    let expected_len = sink.len() as u64;
    assert_eq!(outcome.bytes, expected_len);
    assert_eq!(totals.last().copied(), Some(expected_len));
    assert!(totals.windows(2).all(|w| w[0] < w[1]), "totals must increase");
}

#[test]
fn stream_then_finish_without_explicit_wait() {
    let mut echo = cmd("echo streamed");
    let sink = CaptureBuffer::new();
    echo.stream_stdout(sink.clone(), |_, _| {}).unwrap();
    echo.finish().unwrap();
    assert_eq!(sink.contents(), b"streamed\n");
    assert_eq!(echo.wait_stream().unwrap().bytes, 9);
}

#[test]
fn iter_stdout_chunks() {
    let config = CommandConfig::new().chunk_size(4);
    let mut printf = ShellCommand::with_config(["printf", "0123456789"], config).unwrap();
    let chunks: Vec<Vec<u8>> = printf.iter_stdout().unwrap().map(|c| c.unwrap()).collect();
    assert!(chunks.iter().all(|c| c.len() <= 4));
    assert_eq!(chunks.concat(), b"0123456789");
    assert!(printf.finish().unwrap().ok());
}

#[test]
fn stdout_claimed_once() {
    let mut echo = cmd("echo once");
    echo.stream_stdout(io::sink(), |_, _| {}).unwrap();
    assert!(matches!(echo.iter_stdout(), Err(PipeError::StdoutClaimed(_))));
    echo.finish().unwrap();
}

#[test]
fn streaming_after_finish_is_inactive() {
    let mut echo = cmd("echo done");
    echo.result().unwrap();
    assert!(matches!(echo.iter_stdout(), Err(PipeError::ProcessInactive(_))));
    assert!(matches!(echo.stream_stdin("late"), Err(PipeError::ProcessInactive(_))));
}

// ============================================================================
// Streaming stdin
// ============================================================================

#[test]
fn stream_stdin_chunks_then_finish() {
    let mut cat = ShellCommand::with_config("cat", CommandConfig::new().text()).unwrap();
    for chunk in ["alpha ", "beta ", "gamma"] {
        cat.stream_stdin(chunk).unwrap();
    }
    cat.close_stdin();
    assert_eq!(cat.finish().unwrap().text(), Some("alpha beta gamma"));
}

#[test]
fn stream_stdin_large_input_does_not_block() {
    // Larger than any OS pipe buffer; stdout must be drained concurrently.
    let block = vec![b'x'; 256 * 1024];
    let mut cat = cmd("cat");
    for _ in 0..4 {
        cat.stream_stdin(&block).unwrap();
    }
    let out = cat.finish().unwrap();
    assert_eq!(out.as_bytes().map(<[u8]>::len), Some(4 * block.len()));
}

#[test]
fn run_with_large_stdin() {
    let input: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let result = run_with("cat", &input, CommandConfig::new()).unwrap();
    assert_eq!(result.as_bytes(), Some(input.as_slice()));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn start_is_idempotent() {
    let mut cat = cmd("cat");
    cat.start().unwrap();
    let pid = cat.pid();
    cat.start().unwrap();
    assert_eq!(cat.pid(), pid);
    assert_eq!(cat.run_count(), 1);
    cat.finish().unwrap();
}

#[test]
fn kill_running_process() {
    let mut sleeper = ShellCommand::new(["sleep", "30"]).unwrap();
    sleeper.start().unwrap();
    assert!(sleeper.is_running());

    let started = Instant::now();
    let failure = sleeper.kill().unwrap().failure().cloned().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(failure.exit_code < 0);
    assert!(!sleeper.is_running());
}

#[test]
fn scope_finishes_on_success() {
    let mut cat = ShellCommand::with_config("cat", CommandConfig::new().text()).unwrap();
    cat.scope(|c| c.stream_stdin("scoped")).unwrap();
    assert_eq!(cat.status(), ProcessStatus::Completed);
    assert_eq!(cat.result().unwrap().text(), Some("scoped"));
}

#[test]
fn scope_kills_on_error() {
    let mut sleeper = ShellCommand::new(["sleep", "30"]).unwrap();
    let err = sleeper
        .scope(|_| -> Result<(), PipeError> { Err(PipeError::Impossible("caller bailed".into())) })
        .unwrap_err();
    assert!(matches!(err, PipeError::Impossible(_)));
    assert!(!sleeper.is_running());
    assert!(sleeper.exit_code().is_some_and(|c| c < 0));
}

#[test]
fn drop_kills_running_child() {
    let started = Instant::now();
    {
        let mut sleeper = ShellCommand::new(["sleep", "30"]).unwrap();
        sleeper.start().unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn result_is_stable_until_reset() {
    let mut date = ShellCommand::new(["date", "+%N"]).unwrap();
    let first = date.result().unwrap();
    assert_eq!(date.result().unwrap(), first);
    assert_eq!(date.run_count(), 1);

    date.reset().unwrap();
    date.result().unwrap();
    assert_eq!(date.run_count(), 2);
}
