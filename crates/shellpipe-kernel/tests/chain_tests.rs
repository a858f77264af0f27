//! Integration tests for chain composition and execution.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rstest::rstest;
use shellpipe_kernel::{
    ChainOutcome, CommandConfig, ExecutionResult, Failure, FailureKind, FunctionStage, IoEndpoint, PipeChain,
    PipeError, PipeSegment, ShellCommand,
};
use shellpipe_testutil::{ChunkedReader, FailingReader, FailingWriter, os_pipeline};

fn cmd(command: &str) -> ShellCommand {
    ShellCommand::new(command).expect("valid command")
}

fn bytes_of(chain: &mut PipeChain) -> Vec<u8> {
    chain.result().unwrap().into_bytes().expect("chain succeeds")
}

// ============================================================================
// Composition
// ============================================================================

#[test]
fn associativity() {
    let mut left = (cmd("seq 1 50") | cmd("grep 1")) | cmd("sort -r");
    let mut right = cmd("seq 1 50") | (cmd("grep 1") | cmd("sort -r"));
    assert_eq!(left.len(), 3);
    assert_eq!(right.len(), 3);
    assert_eq!(bytes_of(&mut left), bytes_of(&mut right));
}

#[test]
fn static_bytes_through_identity() {
    let data: Vec<u8> = (0..=255).collect();
    let mut chain = data.clone() | FunctionStage::identity();
    assert_eq!(bytes_of(&mut chain), data);
}

#[rstest]
#[case::bytes_head(PipeSegment::from(b"payload".to_vec()))]
#[case::string_head(PipeSegment::from("payload"))]
#[case::reader_head(PipeSegment::from(IoEndpoint::reader(ChunkedReader::new("payload", 2))))]
fn heads_feed_a_process(#[case] head: PipeSegment) {
    let mut chain = head | cmd("cat");
    assert_eq!(bytes_of(&mut chain), b"payload");
}

#[test]
fn text_function_stage() {
    let reverse = FunctionStage::text(|s| s.lines().rev().collect::<Vec<_>>().join("\n"));
    let mut chain = cmd("seq 3") | reverse;
    assert_eq!(bytes_of(&mut chain), b"3\n2\n1");
}

#[test]
fn static_tail_collects_upstream() {
    let mut chain = cmd("echo collected") | String::new();
    assert_eq!(chain.result().unwrap(), ExecutionResult::Text("collected\n".into()));
}

#[test]
fn duplex_endpoint_mid_chain() {
    let queue = Arc::new(Mutex::new(std::collections::VecDeque::new()));
    let mut chain = cmd("echo through") | IoEndpoint::duplex(queue) | cmd("tr a-z A-Z");
    assert_eq!(bytes_of(&mut chain), b"THROUGH\n");
}

#[test]
fn process_output_decoding_is_per_stage() {
    let text = ShellCommand::with_config("cat", CommandConfig::new().text()).unwrap();
    let mut chain = "abc" | text;
    assert_eq!(chain.result().unwrap(), ExecutionResult::Text("abc".into()));
}

// ============================================================================
// Against the OS pipeline
// ============================================================================

#[test]
fn df_grep_sort_matches_shell() {
    // grep exits 1 when nothing matches; both sides then produce no output.
    let grep = ShellCommand::with_config("grep tmpfs", CommandConfig::new().accept(1)).unwrap();
    let mut chain = cmd("df") | grep | cmd("sort");
    assert_eq!(bytes_of(&mut chain), os_pipeline("df | grep tmpfs | sort"));
}

#[rstest]
#[case::sort_uniq("seq 1 200 | sort | uniq -c | sort -n | tail -n 3", &["seq 1 200", "sort", "uniq -c", "sort -n", "tail -n 3"])]
#[case::tr_chain("echo Hello World | tr a-z A-Z | tr -d ' '", &["echo Hello World", "tr a-z A-Z", "tr -d ' '"])]
#[case::large("seq 1 200000 | cat | wc -l", &["seq 1 200000", "cat", "wc -l"])]
fn matches_shell(#[case] script: &str, #[case] stages: &[&str]) {
    let mut chain = PipeChain::new(cmd(stages[0]));
    for stage in &stages[1..] {
        chain = chain | cmd(stage);
    }
    assert_eq!(bytes_of(&mut chain), os_pipeline(script));
}

#[test]
fn large_transfer_between_processes() {
    // Well beyond pipe buffer sizes in both directions.
    let input: Vec<u8> = (0..2_000_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let mut chain = input.clone() | cmd("cat") | cmd("cat") | cmd("cat");
    assert_eq!(bytes_of(&mut chain), input);
}

// ============================================================================
// Failure Propagation
// ============================================================================

#[rstest]
#[case::first(vec!["false", "cat", "cat"], 0)]
#[case::middle(vec!["echo x", "false", "cat"], 1)]
#[case::not_found(vec!["echo x", "definitely_not_a_real_command_12345", "cat"], 1)]
fn mid_chain_failure_position(#[case] stages: Vec<&str>, #[case] position: usize) {
    let mut chain = PipeChain::new(cmd(stages[0]));
    for stage in &stages[1..] {
        chain = chain | cmd(stage);
    }
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.position, Some(position));
}

#[test]
fn downstream_killed_when_upstream_fails() {
    let upstream = ShellCommand::new(["sh", "-c", "exit 2"]).unwrap();
    let started = Instant::now();
    let mut chain = upstream | ShellCommand::new(["sleep", "30"]).unwrap();
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.exit_code, 2);
    assert_eq!(failure.position, Some(0));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn timeout_inside_chain() {
    let config = CommandConfig::new().timeout(Duration::from_millis(200));
    let slow = ShellCommand::with_config(["sleep", "5"], config).unwrap();
    let started = Instant::now();
    let mut chain = slow | cmd("cat");
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.kind, FailureKind::TimedOut);
    assert_eq!(failure.position, Some(0));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn terminal_timeout_does_not_wait_for_upstream() {
    let config = CommandConfig::new().timeout(Duration::from_millis(300));
    let terminal = ShellCommand::with_config(["sleep", "10"], config).unwrap();
    let mut chain = ShellCommand::new(["sleep", "4"]).unwrap() | terminal;

    let started = Instant::now();
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    let took = started.elapsed();

    assert!(took < Duration::from_secs(2), "took {:?}", took);
    assert_eq!(failure.kind, FailureKind::TimedOut);
    assert_eq!(failure.position, None);
    assert!(
        failure.time_used >= 0.3 && failure.time_used < 1.5,
        "time_used {}",
        failure.time_used
    );
    let upstream = chain.segments()[0].as_process().unwrap();
    assert!(!upstream.is_running());
}

#[test]
fn reader_error_is_in_band() {
    let reader = IoEndpoint::reader(FailingReader::new("partial", io::ErrorKind::ConnectionReset)).named("socket");
    let mut chain = reader | cmd("cat");
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    assert_eq!(failure.kind, FailureKind::Io);
    assert_eq!(failure.position, Some(0));
    assert_eq!(failure.command, vec!["socket"]);
}

#[test]
fn write_only_endpoint_mid_chain_is_impossible() {
    let mut chain = cmd("echo x") | IoEndpoint::writer(io::sink()) | cmd("cat");
    match chain.resolve() {
        Err(PipeError::Segment { position, source }) => {
            assert_eq!(position, 1);
            assert!(matches!(*source, PipeError::Impossible(_)));
        }
        other => panic!("expected positioned Impossible, got {:?}", other),
    }
}

#[test]
fn failure_serializes_to_json() {
    let mut chain = cmd("echo x") | cmd("false");
    let failure = chain.result().unwrap().failure().cloned().unwrap();
    let json = serde_json::to_value(&failure).unwrap();
    assert_eq!(json["exit_code"], 1);
    assert_eq!(json["kind"], "exit_code");
    assert_eq!(json["command"][0], "false");

    let back: Failure = serde_json::from_value(json).unwrap();
    assert_eq!(back, failure);
}

// ============================================================================
// Redirection
// ============================================================================

#[test]
fn write_to_file_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    std::fs::write(&path, "old content that is longer").unwrap();

    let mut chain = cmd("echo new") | cmd("cat");
    assert_eq!(chain.write_to_file(&path).unwrap(), 4);
    assert_eq!(std::fs::read(&path).unwrap(), b"new\n");
}

#[test]
fn write_to_file_skipped_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("untouched.txt");

    let mut chain = PipeChain::new(cmd("false"));
    assert!(chain.write_to_file(&path).is_err());
    assert!(!path.exists());
}

#[test]
fn terminal_writer_endpoint() {
    let sink = shellpipe_kernel::CaptureBuffer::new();
    let mut chain = b"ignored".to_vec() | cmd("wc -c") | IoEndpoint::writer(sink.clone());
    let outcome = chain.resolve().unwrap();
    assert_eq!(outcome.bytes_written(), Some(sink.len() as u64));
    assert!(matches!(outcome, ChainOutcome::Redirected(_)));
    assert_eq!(String::from_utf8(sink.contents()).unwrap().trim(), "7");
}

#[test]
fn redirect_into_failing_writer() {
    let mut chain = cmd("echo some output") | cmd("cat");
    let err = chain.redirect(FailingWriter::new(2, io::ErrorKind::StorageFull)).unwrap_err();
    assert!(matches!(err, PipeError::Io(_)));
}
