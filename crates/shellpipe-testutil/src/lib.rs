//! Test harness for shellpipe.
//!
//! - [`cases`]: table-driven pipeline tests read from a plain-text file
//! - [`fixtures`]: readers and writers with scripted behaviour, plus an OS
//!   pipeline runner to compare against

pub mod cases;
pub mod fixtures;

pub use cases::{CaseExpectation, PipelineCase, build_chain, parse_pipeline_cases, run_pipeline_cases};
pub use fixtures::{ChunkedReader, FailingReader, FailingWriter, os_pipeline};

/// Outcome of a single table-driven case.
#[derive(Debug, Clone, PartialEq)]
pub enum TestResult {
    Pass,
    Fail { expected: String, actual: String },
}

impl TestResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, TestResult::Pass)
    }

    pub fn is_fail(&self) -> bool {
        !self.is_pass()
    }
}

/// One failed case, as recorded in a summary.
#[derive(Debug, Clone)]
pub struct CaseFailure {
    pub name: String,
    pub line_number: usize,
    pub expected: String,
    pub actual: String,
}

/// Tally of a test file run.
#[derive(Debug, Default)]
pub struct TestSummary {
    pub passed: usize,
    pub failures: Vec<CaseFailure>,
}

impl TestSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, line_number: usize, result: TestResult) {
        match result {
            TestResult::Pass => self.passed += 1,
            TestResult::Fail { expected, actual } => self.failures.push(CaseFailure {
                name: name.to_string(),
                line_number,
                expected,
                actual,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failures.len()
    }

    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Human-readable list of failures, one block per case.
    pub fn report(&self) -> String {
        let mut out = format!("{}/{} passed\n", self.passed, self.total());
        for f in &self.failures {
            out.push_str(&format!(
                "line {}: {}\n  expected: {}\n  actual:   {}\n",
                f.line_number, f.name, f.expected, f.actual
            ));
        }
        out
    }
}
