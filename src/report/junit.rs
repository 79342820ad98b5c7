//! JUnit XML report generation.
//!
//! One file per job, one `<testsuite>` per test package:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites name="3f2c...e1" tests="3" failures="1" errors="1" skipped="0" time="0.005">
//!   <testsuite name="pkgA" tests="3" failures="1" errors="1" skipped="0" time="0.005">
//!     <testcase classname="ClassX" name="Method1" time="0.005"/>
//!     <testcase classname="ClassX" name="Method2" time="0.000">
//!       <failure message="oops" type="Failed"/>
//!     </testcase>
//!     <testcase classname="ClassX" name="Method3" time="0.000">
//!       <error message="No result reported by the device" type="Unknown"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use super::Reporter;
use crate::parser::Completion;
use crate::result::{MethodResult, PackageResult, StatusCounts, TestStatus};
use crate::store::JobDescriptor;

/// Writes `<output_dir>/<testId>.xml` when a job completes.
pub struct JUnitReporter {
    output_dir: PathBuf,
}

impl JUnitReporter {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn output_path(&self, job: &JobDescriptor) -> PathBuf {
        self.output_dir.join(format!("{}.xml", job.test_id))
    }
}

/// Renders package results as a JUnit document.
pub fn generate_xml(name: &str, results: &[PackageResult]) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut totals = StatusCounts::default();
    for result in results {
        totals += result.counts();
    }
    let errored = results.iter().filter(|r| r.error.is_some()).count();
    let time: f64 = results.iter().map(|r| r.duration_ms).sum::<f64>() / 1000.0;

    let mut testsuites = BytesStart::new("testsuites");
    testsuites.push_attribute(("name", clean(name).as_str()));
    push_counts(&mut testsuites, &totals, errored, time);
    writer.write_event(Event::Start(testsuites))?;

    for result in results {
        write_testsuite(&mut writer, result)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

/// `errors` counts synthetic `(job)` cases, which are also tests.
fn push_counts(element: &mut BytesStart<'_>, counts: &StatusCounts, errors: usize, time: f64) {
    element.push_attribute(("tests", (counts.total() + errors).to_string().as_str()));
    element.push_attribute(("failures", counts.failed.to_string().as_str()));
    element.push_attribute(("errors", (counts.unknown + errors).to_string().as_str()));
    element.push_attribute(("skipped", counts.ignored.to_string().as_str()));
    element.push_attribute(("time", format!("{:.3}", time).as_str()));
}

fn write_testsuite<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &PackageResult,
) -> anyhow::Result<()> {
    let errors = usize::from(result.error.is_some());

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", clean(&result.name).as_str()));
    push_counts(&mut testsuite, &result.counts(), errors, result.duration_ms / 1000.0);
    if let Some(timestamp) = result.timestamp {
        testsuite.push_attribute(("timestamp", timestamp.to_rfc3339().as_str()));
    }
    writer.write_event(Event::Start(testsuite))?;

    // A package that never ran still shows up as an errored case.
    if let Some(error) = &result.error {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("classname", clean(&result.name).as_str()));
        testcase.push_attribute(("name", "(job)"));
        testcase.push_attribute(("time", "0.000"));
        writer.write_event(Event::Start(testcase))?;
        let mut element = BytesStart::new("error");
        element.push_attribute(("message", clean(error).as_str()));
        element.push_attribute(("type", "PipelineError"));
        writer.write_event(Event::Empty(element))?;
        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    }

    for class in &result.classes {
        for method in &class.methods {
            write_testcase(writer, &class.name, method)?;
        }
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    Ok(())
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    classname: &str,
    method: &MethodResult,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", clean(classname).as_str()));
    testcase.push_attribute(("name", clean(&method.name).as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", method.duration_ms / 1000.0).as_str(),
    ));

    let (tag, kind, default_message) = match method.status {
        TestStatus::Passed => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        TestStatus::Failed => ("failure", "Failed", ""),
        TestStatus::Ignored => ("skipped", "Ignored", ""),
        TestStatus::Unknown => ("error", "Unknown", "No result reported by the device"),
    };

    writer.write_event(Event::Start(testcase))?;
    let mut element = BytesStart::new(tag);
    let message = method.message.as_deref().unwrap_or(default_message);
    if !message.is_empty() {
        element.push_attribute(("message", clean(message).as_str()));
    }
    if tag != "skipped" {
        element.push_attribute(("type", kind));
    }
    writer.write_event(Event::Empty(element))?;
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Drops characters XML 1.0 cannot carry. Escaping is left to the writer.
fn clean(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_job_start(&self, _job: &JobDescriptor) {}

    async fn on_package_complete(
        &self,
        _job: &JobDescriptor,
        _result: &PackageResult,
        _completion: Completion,
    ) {
    }

    async fn on_job_complete(&self, job: &JobDescriptor, results: &[PackageResult]) {
        let xml = match generate_xml(&job.test_id.to_string(), results) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }

        let path = self.output_path(job);
        if let Err(e) = tokio::fs::write(&path, xml).await {
            tracing::error!("Failed to write JUnit XML: {}", e);
        } else {
            tracing::info!("JUnit XML written to: {}", path.display());
        }
    }
}
