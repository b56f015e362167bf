//! Runs selected tests against a provider and collects their outcomes.
//!
//! # Execution Flow
//!
//! ```text
//!   Registry::select()
//!        │
//!        ▼
//!   queue of tests ──► min(parallel, n) workers (one tokio_scoped scope)
//!                          │
//!                          │ per test:
//!                          ▼
//!                  Provider::new_cluster()
//!                          │
//!                  Cluster::new_machines(cluster_size)
//!                          │
//!                  body in its own task, under the test timeout
//!                          │
//!                  console capture on failure
//!                          │
//!                  Cluster::destroy(), under the teardown timeout
//!                          │
//!                          ▼
//!                      TestResult ──► Reporter
//! ```
//!
//! Teardown runs on the worker after the body task has been joined, so it
//! happens the same way whether the body returned, aborted, panicked or
//! ran out of time. Every selected test yields exactly one [`TestResult`].

mod test_cluster;

use std::any::Any;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::conf::BootPayload;
use crate::config::Config;
use crate::platform::{Cluster, ClusterConfig, Provider};
use crate::register::Test;
use crate::report::Reporter;
use crate::util;

pub use test_cluster::TestCluster;
use test_cluster::Verdict;

/// How a test body ended early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TestAbort {
    /// Stop now and mark the test fatal.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The test does not apply here.
    #[error("skipped: {0}")]
    Skip(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestOutcome {
    Passed,
    Failed,
    Fatal,
    Skipped,
}

impl TestOutcome {
    pub fn is_failure(self) -> bool {
        matches!(self, TestOutcome::Failed | TestOutcome::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestOutcome::Passed => "PASS",
            TestOutcome::Failed => "FAIL",
            TestOutcome::Fatal => "FATAL",
            TestOutcome::Skipped => "SKIP",
        }
    }
}

impl std::fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub name: String,
    pub outcome: TestOutcome,
    pub duration: Duration,
    /// Error messages, notes and teardown problems, in the order they happened.
    pub diagnostics: Vec<String>,
}

/// Aggregated results of one run.
///
/// | Exit code | Meaning |
/// |-----------|---------|
/// | 0 | Nothing failed (skips are fine) |
/// | 1 | At least one test failed or was fatal |
#[derive(Debug, Clone)]
pub struct RunResult {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub fatal: usize,
    pub skipped: usize,
    pub duration: Duration,
    /// One result per selected test, in selection order.
    pub results: Vec<TestResult>,
}

impl RunResult {
    fn from_results(results: Vec<TestResult>, duration: Duration) -> Self {
        let count = |o: TestOutcome| results.iter().filter(|r| r.outcome == o).count();
        Self {
            total_tests: results.len(),
            passed: count(TestOutcome::Passed),
            failed: count(TestOutcome::Failed),
            fatal: count(TestOutcome::Fatal),
            skipped: count(TestOutcome::Skipped),
            duration,
            results,
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.fatal == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Drives a run: one provider, one reporter, a fixed worker pool.
pub struct Harness<P, R> {
    config: Config,
    provider: P,
    reporter: R,
}

impl<P, R> Harness<P, R>
where
    P: Provider,
    R: Reporter,
{
    pub fn new(config: Config, provider: P, reporter: R) -> Self {
        Self {
            config,
            provider,
            reporter,
        }
    }

    /// Runs `tests` with at most `parallel` clusters alive at once.
    ///
    /// Must be called on a multi-threaded runtime.
    pub async fn run(&self, tests: &[Arc<Test>]) -> anyhow::Result<RunResult> {
        let start = Instant::now();
        let output_dir = &self.config.kola.output_dir;
        std::fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        self.reporter.on_selection_complete(tests).await;
        if tests.is_empty() {
            warn!("No tests selected");
        }

        let workers = self.config.kola.parallel.max(1).min(tests.len());
        info!(
            "Running {} tests on {} with {} workers",
            tests.len(),
            self.provider.name(),
            workers
        );

        let queue: Mutex<VecDeque<(usize, &Arc<Test>)>> =
            Mutex::new(tests.iter().enumerate().collect());
        let finished: Mutex<Vec<(usize, TestResult)>> = Mutex::new(Vec::with_capacity(tests.len()));

        tokio_scoped::scope(|scope| {
            for worker in 0..workers {
                let queue = &queue;
                let finished = &finished;

                scope.spawn(async move {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                        let Some((index, test)) = next else {
                            break;
                        };
                        debug!("worker {} picked {}", worker, test.name);

                        self.reporter.on_test_start(test).await;
                        let result = self.run_test(test).await;
                        self.reporter.on_test_complete(&result).await;

                        finished
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((index, result));
                    }
                });
            }
        });

        let mut finished = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        finished.sort_by_key(|(index, _)| *index);
        let results = finished.into_iter().map(|(_, result)| result).collect();

        let run_result = RunResult::from_results(results, start.elapsed());
        self.reporter.on_run_complete(&run_result).await;
        Ok(run_result)
    }

    /// Runs one test from cluster creation to teardown.
    pub async fn run_test(&self, test: &Arc<Test>) -> TestResult {
        let span = info_span!("test", test = %test.name);
        self.execute(test).instrument(span).await
    }

    async fn execute(&self, test: &Arc<Test>) -> TestResult {
        let start = Instant::now();
        let kola = &self.config.kola;
        let finish = |outcome, diagnostics| TestResult {
            name: test.name.clone(),
            outcome,
            duration: start.elapsed(),
            diagnostics,
        };

        let Some(payload) = test.user_data.for_distro(&kola.distro).cloned() else {
            return finish(
                TestOutcome::Skipped,
                vec![format!("no boot payload for distro {}", kola.distro)],
            );
        };

        let cluster_config = ClusterConfig::for_label(&self.config, &test.name);
        let cluster: Arc<dyn Cluster> = match self.provider.new_cluster(&cluster_config).await {
            Ok(cluster) => cluster as Arc<dyn Cluster>,
            Err(e) => {
                error!("creating cluster: {}", e);
                return finish(TestOutcome::Failed, vec![format!("creating cluster: {}", e)]);
            }
        };
        info!("created cluster {}", cluster.name());

        let verdict = Arc::new(Verdict::default());
        let mut outcome = self.run_body(test, &cluster, payload, &verdict).await;

        if outcome.is_failure() {
            capture_consoles(cluster.as_ref()).await;
        }

        let teardown = util::with_timeout(kola.teardown_timeout(), cluster.destroy()).await;
        let teardown_errors: Vec<String> = match teardown {
            Ok(errors) => errors.iter().map(|e| format!("teardown: {}", e)).collect(),
            Err(elapsed) => vec![format!("teardown: {}", elapsed)],
        };
        if !teardown_errors.is_empty() {
            for e in &teardown_errors {
                warn!("{}", e);
                verdict.push(e.clone());
            }
            if kola.cleanup_errors_fatal && outcome == TestOutcome::Passed {
                outcome = TestOutcome::Failed;
            }
        }

        info!("{} {}", outcome, test.name);
        finish(outcome, verdict.take_diagnostics())
    }

    /// Provisions the initial machines and runs the body to completion.
    async fn run_body(
        &self,
        test: &Arc<Test>,
        cluster: &Arc<dyn Cluster>,
        payload: BootPayload,
        verdict: &Arc<Verdict>,
    ) -> TestOutcome {
        if test.cluster_size > 0 {
            if let Err(e) = cluster.new_machines(&payload, test.cluster_size).await {
                error!("{}", e);
                verdict.fail(format!("creating machines: {}", e));
                return TestOutcome::Failed;
            }
        }
        cluster.base().mark_running();

        let handle = TestCluster::new(
            &test.name,
            self.config.kola.platform,
            &self.config.kola.distro,
            payload,
            cluster.clone(),
            verdict.clone(),
        );
        let timeout = test.timeout.unwrap_or_else(|| self.config.kola.test_timeout());

        let mut task = tokio::spawn((test.run)(handle).in_current_span());
        let ended = match util::with_timeout(timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                // Wait for the aborted body to drop its handles.
                let _ = task.await;
                verdict.fail(format!("test timed out after {:?}", timeout));
                return TestOutcome::Fatal;
            }
        };

        match ended {
            Ok(Ok(())) if verdict.failed() => TestOutcome::Failed,
            Ok(Ok(())) => TestOutcome::Passed,
            Ok(Err(TestAbort::Fatal(message))) => {
                error!("fatal: {}", message);
                verdict.fail(message);
                TestOutcome::Fatal
            }
            Ok(Err(TestAbort::Skip(reason))) => {
                info!("skipped: {}", reason);
                verdict.push(reason);
                if verdict.failed() {
                    TestOutcome::Failed
                } else {
                    TestOutcome::Skipped
                }
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!("test panicked: {}", message);
                verdict.fail(format!("panicked: {}", message));
                TestOutcome::Fatal
            }
            Err(e) => {
                verdict.fail(format!("test task ended: {}", e));
                TestOutcome::Fatal
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Saves every machine's console to `<machine dir>/console.txt`.
async fn capture_consoles(cluster: &dyn Cluster) {
    for machine in cluster.machines() {
        let Some(dir) = cluster.base().machine_dir(machine.id()) else {
            continue;
        };
        let console = machine.console_output().await;
        if console.is_empty() {
            continue;
        }
        if let Err(e) = write_console(&dir, &console).await {
            warn!("could not save console of {}: {}", machine.id(), e);
        }
    }
}

async fn write_console(dir: &Path, console: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join("console.txt"), console).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::UserData;
    use crate::platform::fake::FakeProvider;
    use crate::report::NullReporter;

    fn config(dir: &Path, parallel: usize) -> Config {
        let mut config = Config::default();
        config.kola.output_dir = dir.to_path_buf();
        config.kola.parallel = parallel;
        config
    }

    fn ok_test(name: &str, size: usize) -> Arc<Test> {
        Arc::new(Test::new(name, |_c| async { Ok(()) }).cluster_size(size))
    }

    fn outcomes(result: &RunResult) -> Vec<(String, TestOutcome)> {
        result
            .results
            .iter()
            .map(|r| (r.name.clone(), r.outcome))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_outcome_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new();
        let harness = Harness::new(config(dir.path(), 2), provider.clone(), NullReporter);

        let tests = vec![
            ok_test("a.pass", 1),
            Arc::new(
                Test::new("b.error", |c: TestCluster| async move {
                    c.error("first");
                    c.error("second");
                    Ok(())
                })
                .cluster_size(1),
            ),
            Arc::new(Test::new("c.fatal", |c: TestCluster| async move {
                Err(c.fatal("cannot continue"))
            })),
            Arc::new(Test::new("d.skip", |c: TestCluster| async move {
                Err(c.skip("not applicable"))
            })),
            Arc::new(Test::new("e.panic", |_c| async { panic!("boom") })),
        ];

        let result = harness.run(&tests).await.unwrap();
        assert_eq!(
            outcomes(&result),
            vec![
                ("a.pass".to_string(), TestOutcome::Passed),
                ("b.error".to_string(), TestOutcome::Failed),
                ("c.fatal".to_string(), TestOutcome::Fatal),
                ("d.skip".to_string(), TestOutcome::Skipped),
                ("e.panic".to_string(), TestOutcome::Fatal),
            ]
        );
        assert_eq!(result.results[1].diagnostics, vec!["first", "second"]);
        assert!(result.results[4].diagnostics[0].contains("boom"));
        assert_eq!(result.exit_code(), 1);

        // Every machine ever created was torn down with its cluster.
        assert_eq!(provider.destroyed().len(), provider.machines_created());
        assert_eq!(provider.live_clusters(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new().create_delay(Duration::from_millis(50));
        let harness = Harness::new(config(dir.path(), 2), provider.clone(), NullReporter);

        let tests: Vec<_> = (0..6).map(|i| ok_test(&format!("t{}", i), 1)).collect();
        let result = harness.run(&tests).await.unwrap();

        assert_eq!(result.passed, 6);
        assert!(provider.max_live_clusters() <= 2);
        assert_eq!(provider.clusters_created(), 6);
        assert!(result.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cluster_creation_failure_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new().fail_cluster_creation();
        let harness = Harness::new(config(dir.path(), 1), provider, NullReporter);

        let result = harness.run(&[ok_test("x", 1)]).await.unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.results[0].diagnostics[0].contains("quota"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_machine_creation_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new().fail_create_at(2);
        let harness = Harness::new(config(dir.path(), 1), provider.clone(), NullReporter);

        let result = harness.run(&[ok_test("three", 3)]).await.unwrap();
        assert_eq!(result.results[0].outcome, TestOutcome::Failed);
        assert_eq!(provider.destroyed().len(), 1);

        // The failed test's console was kept.
        let consoles: Vec<_> = walk(dir.path())
            .into_iter()
            .filter(|p| p.ends_with("console.txt"))
            .collect();
        assert_eq!(consoles.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_is_fatal_and_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new();
        let harness = Harness::new(config(dir.path(), 1), provider.clone(), NullReporter);

        let slow = Arc::new(
            Test::new("slow", |_c| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .cluster_size(1)
            .timeout(Duration::from_millis(100)),
        );
        let result = harness.run(&[slow]).await.unwrap();

        assert_eq!(result.results[0].outcome, TestOutcome::Fatal);
        assert!(result.results[0].diagnostics[0].contains("timed out"));
        assert_eq!(provider.destroyed().len(), 1);
    }

    /// A body that waits up to 30s for a signal sent after `signal_after`.
    fn signal_test(name: &str, signal_after: Duration) -> Arc<Test> {
        Arc::new(Test::new(name, move |c: TestCluster| async move {
            let (tx, rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::time::sleep(signal_after).await;
                let _ = tx.send(());
            });
            util::wait_for(rx, Duration::from_secs(30))
                .await
                .map_err(|e| c.fatal(format!("waiting for signal: {}", e)))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_signal_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(config(dir.path(), 1), FakeProvider::new(), NullReporter);

        let result = harness
            .run_test(&signal_test("wait.signalled", Duration::from_secs(5)))
            .await;

        assert_eq!(result.outcome, TestOutcome::Passed);
        assert!(result.diagnostics.is_empty());
        assert!(result.duration >= Duration::from_secs(5));
        assert!(result.duration < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_deadline_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(config(dir.path(), 1), FakeProvider::new(), NullReporter);

        let result = harness
            .run_test(&signal_test("wait.silent", Duration::from_secs(60)))
            .await;

        assert_eq!(result.outcome, TestOutcome::Fatal);
        assert!(result.diagnostics[0].contains("no signal within 30s"));
        assert!(result.duration >= Duration::from_secs(30));
        assert!(result.duration < Duration::from_secs(31));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_teardown_errors_are_additive_unless_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new().fail_destroy_of(1);
        let harness = Harness::new(config(dir.path(), 1), provider, NullReporter);
        let result = harness.run(&[ok_test("leaky", 1)]).await.unwrap();
        assert_eq!(result.results[0].outcome, TestOutcome::Passed);
        assert!(result.results[0].diagnostics[0].starts_with("teardown:"));

        let mut strict = config(dir.path(), 1);
        strict.kola.cleanup_errors_fatal = true;
        let harness = Harness::new(strict, FakeProvider::new().fail_destroy_of(1), NullReporter);
        let result = harness.run(&[ok_test("leaky", 1)]).await.unwrap();
        assert_eq!(result.results[0].outcome, TestOutcome::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_distro_payload_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new();
        let harness = Harness::new(config(dir.path(), 1), provider.clone(), NullReporter);

        let test = Arc::new(
            Test::new("fcos.only", |_c| async { Ok(()) })
                .cluster_size(1)
                .user_data(UserData::per_distro([("fcos", BootPayload::ignition("{}"))])),
        );
        let result = harness.run(&[test]).await.unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(provider.clusters_created(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_selection_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(config(dir.path(), 4), FakeProvider::new(), NullReporter);
        let result = harness.run(&[]).await.unwrap();
        assert_eq!(result.total_tests, 0);
        assert_eq!(result.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inner_tasks_share_the_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeProvider::new();
        let harness = Harness::new(config(dir.path(), 1), provider.clone(), NullReporter);

        let test = Arc::new(Test::new("fanout", |c: TestCluster| async move {
            let mut tasks = Vec::new();
            for _ in 0..3 {
                let c = c.clone();
                tasks.push(tokio::spawn(async move {
                    c.new_machine(&BootPayload::empty()).await.map(|_| ())
                }));
            }
            for task in tasks {
                task.await
                    .map_err(|e| c.fatal(e.to_string()))?
                    .map_err(|e| c.fatal(e.to_string()))?;
            }
            if c.machines().len() != 3 {
                c.error(format!("expected 3 machines, got {}", c.machines().len()));
            }
            Ok(())
        }));
        let result = harness.run(&[test]).await.unwrap();
        assert_eq!(result.passed, 1);
        assert_eq!(provider.destroyed().len(), 3);
    }

    fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
        out
    }
}
