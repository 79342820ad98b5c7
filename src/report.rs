//! Job reporting and console output.

pub mod junit;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::parser::Completion;
use crate::result::{PackageResult, StatusCounts, TestStatus};
use crate::store::JobDescriptor;

pub use junit::JUnitReporter;

/// Receives events while a job executes.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called before the pipeline touches the device.
    async fn on_job_start(&self, job: &JobDescriptor);

    /// Called once per package, after its device output was observed.
    async fn on_package_complete(
        &self,
        job: &JobDescriptor,
        result: &PackageResult,
        completion: Completion,
    );

    /// Called with the final results, including error-path results.
    async fn on_job_complete(&self, job: &JobDescriptor, results: &[PackageResult]);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_job_start(&self, _job: &JobDescriptor) {}
    async fn on_package_complete(
        &self,
        _job: &JobDescriptor,
        _result: &PackageResult,
        _completion: Completion,
    ) {
    }
    async fn on_job_complete(&self, _job: &JobDescriptor, _results: &[PackageResult]) {}
}

/// A reporter that forwards every event to several reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_job_start(&self, job: &JobDescriptor) {
        for reporter in &self.reporters {
            reporter.on_job_start(job).await;
        }
    }

    async fn on_package_complete(
        &self,
        job: &JobDescriptor,
        result: &PackageResult,
        completion: Completion,
    ) {
        for reporter in &self.reporters {
            reporter.on_package_complete(job, result, completion).await;
        }
    }

    async fn on_job_complete(&self, job: &JobDescriptor, results: &[PackageResult]) {
        for reporter in &self.reporters {
            reporter.on_job_complete(job, results).await;
        }
    }
}

/// Shows a spinner while a job runs and a colored summary when it ends.
pub struct ConsoleReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

fn status_label(status: TestStatus) -> console::StyledObject<&'static str> {
    match status {
        TestStatus::Passed => console::style("PASS").green(),
        TestStatus::Failed => console::style("FAIL").red(),
        TestStatus::Ignored => console::style("SKIP").yellow(),
        TestStatus::Unknown => console::style("????").red().bold(),
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_job_start(&self, job: &JobDescriptor) {
        println!(
            "Job {} on {} ({}): {}",
            job.test_id,
            job.device_name,
            job.device_type,
            job.test_packages.join(", ")
        );

        let pb = indicatif::ProgressBar::new_spinner();
        if let Ok(style) =
            indicatif::ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            pb.set_style(style);
        }
        pb.set_message("waiting for device output");
        pb.enable_steady_tick(Duration::from_millis(120));

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_package_complete(
        &self,
        _job: &JobDescriptor,
        result: &PackageResult,
        completion: Completion,
    ) {
        let mut line = format!("{} {}", status_label(result.status), result.name);
        if !completion.is_clean() {
            line.push_str(&format!(" {}", console::style("(timed out)").yellow()));
        }
        self.println(line);

        for class in &result.classes {
            for method in &class.methods {
                if self.verbose || matches!(method.status, TestStatus::Failed | TestStatus::Unknown) {
                    self.println(format!(
                        "  {} {}.{}",
                        status_label(method.status),
                        class.name,
                        method.name
                    ));
                    if let Some(message) = &method.message {
                        self.println(format!("       {}", console::style(message).dim()));
                    }
                }
            }
        }
    }

    async fn on_job_complete(&self, _job: &JobDescriptor, results: &[PackageResult]) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        print_summary(results);
    }
}

/// Prints pass/fail counts for a set of package results.
pub fn print_summary(results: &[PackageResult]) {
    let mut counts = StatusCounts::default();
    for result in results {
        counts += result.counts();
    }
    let duration: f64 = results.iter().map(|r| r.duration_ms).sum();

    println!();
    println!("Test Results:");
    println!("  Total:   {}", counts.total());
    println!("  Passed:  {}", console::style(counts.passed).green());
    println!("  Failed:  {}", console::style(counts.failed).red());
    println!("  Ignored: {}", console::style(counts.ignored).yellow());
    if counts.unknown > 0 {
        println!("  Unknown: {}", console::style(counts.unknown).red().bold());
    }
    println!("  Device time: {:.3}s", duration / 1000.0);

    for result in results {
        if let Some(error) = &result.error {
            println!(
                "  {} {}",
                console::style(&result.name).red(),
                console::style(error).dim()
            );
        }
    }

    println!();
    if results.iter().any(|r| r.error.is_some()) {
        println!("{}", console::style("Job failed before completing.").red().bold());
    } else if counts.failed > 0 {
        println!("{}", console::style("Some tests failed.").red().bold());
    } else if counts.unknown > 0 {
        println!(
            "{}",
            console::style("Some tests did not report a result.").red().bold()
        );
    } else {
        println!("{}", console::style("All tests passed!").green().bold());
    }
}
