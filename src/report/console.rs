//! Terminal progress and final tally.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};

use super::Reporter;
use crate::harness::{RunResult, TestOutcome, TestResult};
use crate::register::Test;

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: Mutex<Option<ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&ProgressBar)) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            f(pb);
        }
    }
}

fn styled(outcome: TestOutcome) -> console::StyledObject<&'static str> {
    match outcome {
        TestOutcome::Passed => console::style("PASS").green(),
        TestOutcome::Failed => console::style("FAIL").red(),
        TestOutcome::Fatal => console::style("FATAL").red().bold(),
        TestOutcome::Skipped => console::style("SKIP").yellow(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_selection_complete(&self, tests: &[Arc<Test>]) {
        println!("Selected {} tests", tests.len());

        let pb = ProgressBar::new(tests.len() as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        pb.set_style(style);

        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb);
    }

    async fn on_test_start(&self, test: &Test) {
        let verbose = self.verbose;
        self.with_progress(|pb| {
            pb.set_message(test.name.clone());
            if verbose {
                pb.println(format!("=== RUN   {}", test.name));
            }
        });
    }

    async fn on_test_complete(&self, result: &TestResult) {
        let verbose = self.verbose;
        self.with_progress(|pb| {
            pb.inc(1);
            if verbose || result.outcome != TestOutcome::Passed {
                pb.println(format!(
                    "--- {} {} ({:.2}s)",
                    styled(result.outcome),
                    result.name,
                    result.duration.as_secs_f64()
                ));
                for line in &result.diagnostics {
                    pb.println(format!("        {}", console::style(line).dim()));
                }
            }
        });
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:   {}", result.total_tests);
        println!("  Passed:  {}", console::style(result.passed).green());
        println!("  Failed:  {}", console::style(result.failed).red());
        if result.fatal > 0 {
            println!("  Fatal:   {}", console::style(result.fatal).red().bold());
        }
        println!("  Skipped: {}", console::style(result.skipped).yellow());
        println!("  Duration: {:?}", result.duration);

        println!();
        if result.success() {
            println!("{}", console::style("PASS").green().bold());
            return;
        }

        println!("{}", console::style("FAIL").red().bold());
        println!();
        println!("Failed tests:");
        for r in result.results.iter().filter(|r| r.outcome.is_failure()) {
            println!("  - {} ({})", r.name, styled(r.outcome));
            if let Some(first) = r.diagnostics.first() {
                println!("    {}", console::style(first).dim());
            }
        }
    }
}
