//! TAP version 13 output.
//!
//! ```text
//! TAP version 13
//! 1..3
//! ok 1 - cl.basic.reachability
//! not ok 2 - docker.torcx-flag-file
//!   ---
//!   outcome: FAIL
//!   duration_ms: 4210
//!   diagnostics:
//!     - "docker version 1.12 does not match 20.10"
//!   ...
//! ok 3 - coreos.ignition.v2.once # SKIP no boot payload for distro cl
//! ```

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Reporter, write_report};
use crate::harness::{RunResult, TestOutcome, TestResult};
use crate::register::Test;

pub struct TapReporter {
    output_path: PathBuf,
}

impl TapReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }
}

/// Renders a whole run as a TAP 13 document.
pub fn render(run: &RunResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TAP version 13");
    let _ = writeln!(out, "1..{}", run.results.len());
    for (i, result) in run.results.iter().enumerate() {
        write_result(&mut out, i + 1, result);
    }
    out
}

fn write_result(out: &mut String, number: usize, result: &TestResult) {
    match result.outcome {
        TestOutcome::Passed => {
            let _ = writeln!(out, "ok {} - {}", number, result.name);
        }
        TestOutcome::Skipped => {
            let reason = result.diagnostics.last().map(String::as_str).unwrap_or("");
            let _ = writeln!(
                out,
                "ok {} - {} # SKIP {}",
                number,
                result.name,
                single_line(reason)
            );
        }
        TestOutcome::Failed | TestOutcome::Fatal => {
            let _ = writeln!(out, "not ok {} - {}", number, result.name);
            let _ = writeln!(out, "  ---");
            let _ = writeln!(out, "  outcome: {}", result.outcome);
            let _ = writeln!(out, "  duration_ms: {}", result.duration.as_millis());
            if !result.diagnostics.is_empty() {
                let _ = writeln!(out, "  diagnostics:");
                for d in &result.diagnostics {
                    // A JSON string is a valid double-quoted YAML scalar.
                    let quoted =
                        serde_json::to_string(d).unwrap_or_else(|_| "\"\"".to_string());
                    let _ = writeln!(out, "    - {}", quoted);
                }
            }
            let _ = writeln!(out, "  ...");
        }
    }
}

/// TAP directives end at the line break.
fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

#[async_trait]
impl Reporter for TapReporter {
    async fn on_selection_complete(&self, _tests: &[Arc<Test>]) {}

    async fn on_test_start(&self, _test: &Test) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        write_report(&self.output_path, &render(result), "TAP");
    }
}
