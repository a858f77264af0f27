//! shellpipe CLI entry point.
//!
//! Usage:
//!   shellpipe 'df' 'grep tmpfs' 'sort'     # Run a chain, one argument per segment
//!   shellpipe --input 'b\na' 'sort'        # Feed literal input to the first segment
//!   shellpipe --exists rg                  # Exit 0 if the command exists

use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use shellpipe_kernel::{
    CommandConfig, DecodeAs, ExecutionResult, Failure, FailureKind, IoEndpoint, PipeChain, PipeSegment, ShellCommand,
    command_exists,
};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Exit status used when a segment ran out of time, as `timeout(1)` does.
const EXIT_TIMED_OUT: u8 = 124;

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

/// Where the first segment's input comes from.
#[derive(Debug, Clone, PartialEq)]
enum Input {
    None,
    Literal(String),
    Stdin,
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Help,
    Version,
    Exists(String),
    Run {
        segments: Vec<String>,
        input: Input,
        json: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Options {
    mode: Mode,
    config: CommandConfig,
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().skip(1).collect();
    let env_timeout = env::var("SHELLPIPE_TIMEOUT").ok();
    let options = parse_args(&args, env_timeout.as_deref())?;
    debug!(?options, "parsed arguments");

    match options.mode {
        Mode::Help => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        Mode::Version => {
            println!("shellpipe {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Mode::Exists(command) => {
            if command_exists(command.as_str()) {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Mode::Run { segments, input, json } => run_chain(&segments, input, options.config, json),
    }
}

fn parse_args(args: &[String], env_timeout: Option<&str>) -> Result<Options> {
    let mut config = CommandConfig::new();
    if let Some(secs) = env_timeout {
        config = config.timeout(parse_timeout(secs).context("invalid SHELLPIPE_TIMEOUT")?);
    }

    let mut segments = Vec::new();
    let mut input = Input::None;
    let mut json = false;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Options { mode: Mode::Help, config }),
            "--version" | "-V" => return Ok(Options { mode: Mode::Version, config }),
            "--exists" => {
                let command = iter.next().context("--exists requires a command")?;
                return Ok(Options {
                    mode: Mode::Exists(command.clone()),
                    config,
                });
            }
            "--timeout" => {
                let secs = iter.next().context("--timeout requires seconds")?;
                config = config.timeout(parse_timeout(secs)?);
            }
            "--accept" => {
                let code = iter.next().context("--accept requires an exit code")?;
                let code: i32 = code.parse().with_context(|| format!("invalid exit code: {code}"))?;
                config = config.accept(code);
            }
            "--bytes" => config = config.bytes(),
            "--decode" => {
                let mode = iter.next().context("--decode requires bytes or text")?;
                let mode: DecodeAs = mode.parse()?;
                config = config.decode_as(mode);
            }
            "--input" => {
                let text = iter.next().context("--input requires text")?;
                input = Input::Literal(text.clone());
            }
            "--stdin" => input = Input::Stdin,
            "--json" => json = true,
            "--" => {
                segments.extend(iter.by_ref().cloned());
            }
            unknown if unknown.starts_with("--") => bail!("unknown option: {unknown} (try --help)"),
            segment => segments.push(segment.to_string()),
        }
    }

    if segments.is_empty() {
        return Ok(Options { mode: Mode::Help, config });
    }

    Ok(Options {
        mode: Mode::Run { segments, input, json },
        config,
    })
}

fn parse_timeout(secs: &str) -> Result<Duration> {
    let value: f64 = secs.parse().with_context(|| format!("not a number of seconds: {secs}"))?;
    if value <= 0.0 {
        bail!("timeout must be positive: {secs}");
    }
    Duration::try_from_secs_f64(value).with_context(|| format!("timeout out of range: {secs}"))
}

/// Build the chain: optional input head, then one process per segment.
fn build_chain(segments: &[String], input: Input, config: &CommandConfig) -> Result<PipeChain> {
    let mut parts: Vec<PipeSegment> = Vec::new();
    match input {
        Input::None => {}
        Input::Literal(text) => parts.push(PipeSegment::from(text)),
        Input::Stdin => parts.push(PipeSegment::from(IoEndpoint::reader(io::stdin()).named("stdin"))),
    }
    for segment in segments {
        let cmd = ShellCommand::with_config(segment.as_str(), config.clone())
            .with_context(|| format!("invalid segment: {segment}"))?;
        parts.push(cmd.into());
    }

    let mut parts = parts.into_iter();
    let first = parts.next().context("no segments to run")?;
    Ok(parts.fold(PipeChain::new(first), |chain, part| chain.pipe(part)))
}

fn run_chain(segments: &[String], input: Input, config: CommandConfig, json: bool) -> Result<ExitCode> {
    let mut chain = build_chain(segments, input, &config)?;
    let result = chain.result().context("failed to run chain")?;

    match result {
        ExecutionResult::Failure(failure) => {
            report_failure(&failure, json)?;
            Ok(ExitCode::from(exit_status(&failure)))
        }
        output => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(output.as_bytes().unwrap_or_default())?;
            stdout.flush()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_failure(failure: &Failure, json: bool) -> Result<()> {
    let mut stderr = io::stderr().lock();
    stderr.write_all(&failure.stderr)?;
    if json {
        let encoded = serde_json::to_string(failure).context("failed to encode failure")?;
        writeln!(stderr, "{encoded}")?;
    } else {
        writeln!(stderr, "shellpipe: {}", failure.describe())?;
    }
    Ok(())
}

/// Map a failure onto a process exit status the way a shell would.
fn exit_status(failure: &Failure) -> u8 {
    match failure.kind {
        FailureKind::TimedOut => EXIT_TIMED_OUT,
        _ if failure.exit_code < 0 => 128u8.saturating_add(failure.exit_code.unsigned_abs().min(127) as u8),
        _ if failure.exit_code == 0 => 1,
        _ => u8::try_from(failure.exit_code).unwrap_or(1),
    }
}

fn print_help() {
    println!(
        r#"shellpipe v{}

Usage:
  shellpipe [OPTIONS] <SEGMENT>...   Run segments as a pipeline
  shellpipe --exists <COMMAND>       Exit 0 if COMMAND exists, 1 if not

Each SEGMENT is one command, split into words like a POSIX shell would
(quotes are honoured; no globbing, variables or redirection).

Options:
  --timeout <SECS>       Per-segment wall-clock limit (default: $SHELLPIPE_TIMEOUT)
  --accept <CODE>        Treat exit CODE as success; repeatable
  --bytes                Pass output through as raw bytes (default)
  --decode <bytes|text>  Require the final output to be valid UTF-8 with 'text'
  --input <TEXT>         Feed TEXT to the first segment
  --stdin                Feed this process's stdin to the first segment
  --json                 Report failures as JSON on stderr
  -h, --help             Show this help
  -V, --version          Show version

Exit status:
  0 on success, the failing segment's exit code otherwise,
  124 on timeout, 128+N when a segment was killed by signal N.

Environment:
  RUST_LOG               Log filter (e.g. RUST_LOG=shellpipe_kernel=debug)
  SHELLPIPE_TIMEOUT      Default timeout in seconds

Examples:
  shellpipe 'df' 'grep tmpfs' 'sort'
  shellpipe --accept 1 'seq 100' 'grep 7'
  shellpipe --timeout 2 'sleep 10'
"#,
        env!("CARGO_PKG_VERSION")
    );
}
