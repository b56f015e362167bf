//! Test reporting and output generation.
//!
//! Reporters receive events while the harness runs. The console reporter
//! shows progress in the terminal; the TAP and JUnit reporters write result
//! files when the run completes.

pub mod console;
pub mod junit;
pub mod tap;

use std::sync::Arc;

use async_trait::async_trait;

use crate::harness::{RunResult, TestResult};
use crate::register::Test;

pub use self::console::ConsoleReporter;
pub use junit::JUnitReporter;
pub use tap::TapReporter;

/// A test reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the tests to run are known.
    async fn on_selection_complete(&self, tests: &[Arc<Test>]);

    async fn on_test_start(&self, test: &Test);

    async fn on_test_complete(&self, result: &TestResult);

    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_selection_complete(&self, _tests: &[Arc<Test>]) {}
    async fn on_test_start(&self, _test: &Test) {}
    async fn on_test_complete(&self, _result: &TestResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// Fans every event out to a list of reporters, in order.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_selection_complete(&self, tests: &[Arc<Test>]) {
        for reporter in &self.reporters {
            reporter.on_selection_complete(tests).await;
        }
    }

    async fn on_test_start(&self, test: &Test) {
        for reporter in &self.reporters {
            reporter.on_test_start(test).await;
        }
    }

    async fn on_test_complete(&self, result: &TestResult) {
        for reporter in &self.reporters {
            reporter.on_test_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Writes `contents` to `path`, creating parent directories.
fn write_report(path: &std::path::Path, contents: &str, kind: &str) {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::error!("Failed to create output directory: {}", e);
        return;
    }

    if let Err(e) = std::fs::write(path, contents) {
        tracing::error!("Failed to write {} report: {}", kind, e);
    } else {
        tracing::info!("{} report written to: {}", kind, path.display());
    }
}
