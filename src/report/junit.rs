//! JUnit XML report generation.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" skipped="0" time="12.500">
//!   <testsuite name="kola" tests="2" failures="1" errors="0" skipped="0" time="12.500">
//!     <testcase classname="cl" name="cl.basic.reachability" time="4.100"/>
//!     <testcase classname="docker" name="docker.torcx-flag-file" time="8.400">
//!       <failure message="docker version mismatch" type="Failed">...</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Failed tests become `<failure>`, fatal ones `<error>`. The classname is
//! the first dotted component of the test name.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, write_report};
use crate::harness::{RunResult, TestOutcome, TestResult};
use crate::register::Test;

pub struct JUnitReporter {
    output_path: PathBuf,
    testsuite_name: String,
    /// When the run started, RFC 3339.
    timestamp: String,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            testsuite_name: "kola".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    fn generate_xml(&self, run: &RunResult) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = run.results.len().to_string();
        let failures = run.failed.to_string();
        let errors = run.fatal.to_string();
        let skipped = run.skipped.to_string();
        let time = format!("{:.3}", run.duration.as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("skipped", skipped.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", skipped.as_str()));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", self.timestamp.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for result in &run.results {
            write_testcase(&mut writer, result)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
) -> anyhow::Result<()> {
    let classname = result.name.split('.').next().unwrap_or(&result.name);

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname));
    testcase.push_attribute(("name", result.name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    let element = match result.outcome {
        TestOutcome::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestOutcome::Skipped => {
            writer.write_event(Event::Start(testcase))?;
            let mut skipped = BytesStart::new("skipped");
            if let Some(reason) = result.diagnostics.last() {
                skipped.push_attribute(("message", reason.as_str()));
            }
            writer.write_event(Event::Empty(skipped))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
            return Ok(());
        }
        TestOutcome::Failed => ("failure", "Failed"),
        TestOutcome::Fatal => ("error", "Fatal"),
    };

    writer.write_event(Event::Start(testcase))?;
    let mut failure = BytesStart::new(element.0);
    if let Some(first) = result.diagnostics.first() {
        failure.push_attribute(("message", first.as_str()));
    }
    failure.push_attribute(("type", element.1));
    writer.write_event(Event::Start(failure))?;
    if !result.diagnostics.is_empty() {
        let body = result.diagnostics.join("\n");
        writer.write_event(Event::Text(BytesText::new(&body)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(element.0)))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_selection_complete(&self, _tests: &[Arc<Test>]) {}

    async fn on_test_start(&self, _test: &Test) {}

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match self.generate_xml(result) {
            Ok(xml) => write_report(&self.output_path, &xml, "JUnit"),
            Err(e) => tracing::error!("Failed to generate JUnit XML: {}", e),
        }
    }
}
