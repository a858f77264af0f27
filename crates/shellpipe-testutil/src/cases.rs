//! Pipeline case file parser and runner.
//!
//! Each non-comment line is `PIPELINE  | EXPECTED`. The pipeline is
//! shell-word tokenized and split on bare `|` tokens, one `ShellCommand` per
//! piece. Expectations:
//!
//! ```text
//! echo hello                  | OUT(hello\n)
//! echo x | false | cat        | EXIT(1) AT(1)
//! shellpipe-missing           | EXIT(127)
//! echo 'open                  | ERROR: unbalanced quote
//! ```

use std::fmt;

use shellpipe_kernel::{ExecutionResult, PipeChain, PipeError, ShellCommand, tokenize};

use crate::{TestResult, TestSummary};

/// A single pipeline case.
#[derive(Debug, Clone)]
pub struct PipelineCase {
    /// Line number in the source file (1-indexed).
    pub line_number: usize,
    pub input: String,
    pub expected: CaseExpectation,
}

/// What a pipeline should produce.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseExpectation {
    /// Successful output, compared byte for byte after unescaping.
    Output(String),
    /// In-band failure with this exit code, at this chain position if given.
    Exit { code: i32, position: Option<usize> },
    /// Construction or execution error.
    Error(String),
    /// The expectation column could not be parsed.
    Malformed(String),
}

impl fmt::Display for CaseExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseExpectation::Output(s) => write!(f, "OUT({})", escape_for_display(s)),
            CaseExpectation::Exit { code, position: None } => write!(f, "EXIT({})", code),
            CaseExpectation::Exit {
                code,
                position: Some(p),
            } => write!(f, "EXIT({}) AT({})", code, p),
            CaseExpectation::Error(msg) => write!(f, "ERROR: {}", msg),
            CaseExpectation::Malformed(raw) => write!(f, "MALFORMED({})", raw),
        }
    }
}

/// Parse a case file into test cases.
pub fn parse_pipeline_cases(content: &str) -> Vec<PipelineCase> {
    let mut cases = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(sep_idx) = find_case_separator(line) {
            let input = line[..sep_idx].trim().to_string();
            let expected_str = line[sep_idx..].trim_start_matches([' ', '|']).trim();
            cases.push(PipelineCase {
                line_number: idx + 1,
                input,
                expected: parse_expectation(expected_str),
            });
        }
    }

    cases
}

/// The separator is the last `|` preceded by at least two spaces, so pipes
/// inside the pipeline column stay part of the input.
fn find_case_separator(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut found = None;

    for i in 0..bytes.len() {
        if bytes[i] == b'|' && bytes.get(i + 1).is_none_or(|&b| b == b' ') {
            let mut j = i;
            while j > 0 && bytes[j - 1] == b' ' {
                j -= 1;
            }
            if i - j >= 2 {
                found = Some(j);
            }
        }
    }

    found
}

fn parse_expectation(s: &str) -> CaseExpectation {
    if let Some(msg) = s.strip_prefix("ERROR:") {
        return CaseExpectation::Error(msg.trim().to_string());
    }
    if let Some(inner) = s.strip_prefix("OUT(").and_then(|r| r.strip_suffix(')')) {
        return CaseExpectation::Output(unescape(inner));
    }
    if let Some(rest) = s.strip_prefix("EXIT(") {
        let (code, tail) = match rest.split_once(')') {
            Some(parts) => parts,
            None => return CaseExpectation::Malformed(s.to_string()),
        };
        let Ok(code) = code.trim().parse() else {
            return CaseExpectation::Malformed(s.to_string());
        };
        let tail = tail.trim();
        if tail.is_empty() {
            return CaseExpectation::Exit { code, position: None };
        }
        return match tail
            .strip_prefix("AT(")
            .and_then(|r| r.strip_suffix(')'))
            .and_then(|p| p.trim().parse().ok())
        {
            Some(position) => CaseExpectation::Exit {
                code,
                position: Some(position),
            },
            None => CaseExpectation::Malformed(s.to_string()),
        };
    }
    CaseExpectation::Malformed(s.to_string())
}

fn unescape(s: &str) -> String {
    s.replace("\\n", "\n").replace("\\t", "\t").replace("\\r", "\r")
}

fn escape_for_display(s: &str) -> String {
    s.replace('\n', "\\n").replace('\t', "\\t").replace('\r', "\\r")
}

/// Build the chain a case line describes.
pub fn build_chain(input: &str) -> Result<PipeChain, PipeError> {
    let tokens = tokenize(input)?;
    let mut chain: Option<PipeChain> = None;
    for argv in tokens.split(|t| t == "|") {
        let cmd = ShellCommand::new(argv.to_vec())?;
        chain = Some(match chain {
            Some(chain) => chain | cmd,
            None => PipeChain::new(cmd),
        });
    }
    chain.ok_or_else(|| PipeError::InvalidParameter("empty pipeline".into()))
}

fn describe(result: &ExecutionResult) -> CaseExpectation {
    match result {
        ExecutionResult::Failure(f) => CaseExpectation::Exit {
            code: f.exit_code,
            position: f.position,
        },
        other => CaseExpectation::Output(String::from_utf8_lossy(other.as_bytes().unwrap_or_default()).into_owned()),
    }
}

impl PipelineCase {
    /// Run this case and compare against the expectation.
    pub fn run(&self) -> TestResult {
        let outcome = build_chain(&self.input).and_then(|mut chain| chain.result());
        match (outcome, &self.expected) {
            (Err(_), CaseExpectation::Error(_)) => TestResult::Pass,
            (Err(e), expected) => TestResult::Fail {
                expected: expected.to_string(),
                actual: format!("ERROR: {}", e),
            },
            (Ok(result), expected) => {
                let actual = describe(&result);
                if &actual == expected {
                    TestResult::Pass
                } else {
                    TestResult::Fail {
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    }
                }
            }
        }
    }
}

/// Run all cases and return a summary.
pub fn run_pipeline_cases(cases: &[PipelineCase]) -> TestSummary {
    let mut summary = TestSummary::new();

    for case in cases {
        let name = format!("pipeline:{}", case.input);
        summary.record(&name, case.line_number, case.run());
    }

    summary
}
