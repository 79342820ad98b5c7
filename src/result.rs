//! Hierarchical test results: package → class → method.
//!
//! A [`ResultTree`] is built once as a *skeleton* from the statically
//! inspected package metadata, with every method slot starting at
//! [`TestStatus::Unknown`]. The slots never move or grow after that; the
//! streaming parser only replaces slot contents. Lookups by name return typed
//! ids ([`PackageId`], [`ClassId`], [`MethodId`]), so a name the skeleton does
//! not know surfaces as an explicit `None` rather than a silent insert.
//!
//! ```text
//! ResultTree
//! └── PackageResult (pkgA)          status/duration rolled up from classes
//!     └── ClassResult (ClassX)      status/duration rolled up from methods
//!         ├── MethodResult (Method1)
//!         └── MethodResult (Method2)
//! ```
//!
//! # Roll-up
//!
//! A parent's status is derived from its children by [`TestStatus::roll_up`]:
//!
//! | Children | Parent |
//! |----------|--------|
//! | any `Failed` | `Failed` |
//! | all `Unknown` (nothing reported yet) | `Unknown` |
//! | every reported child `Ignored` | `Ignored` |
//! | otherwise | `Passed` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single test method, or the aggregate of a class or package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestStatus {
    /// Not executed yet, or no result line was seen.
    #[default]
    Unknown,
    /// Executed without a failure.
    Passed,
    /// Executed and threw.
    Failed,
    /// Skipped by an ignore marker on the method or its class.
    Ignored,
}

impl TestStatus {
    /// Derives a parent status from its children's statuses.
    pub fn roll_up<I>(children: I) -> TestStatus
    where
        I: IntoIterator<Item = TestStatus>,
    {
        let mut reported = 0usize;
        let mut ignored = 0usize;

        for status in children {
            match status {
                TestStatus::Failed => return TestStatus::Failed,
                TestStatus::Unknown => {}
                TestStatus::Ignored => {
                    reported += 1;
                    ignored += 1;
                }
                TestStatus::Passed => reported += 1,
            }
        }

        if reported == 0 {
            TestStatus::Unknown
        } else if ignored == reported {
            TestStatus::Ignored
        } else {
            TestStatus::Passed
        }
    }

    /// Returns true for outcomes that carry a message.
    pub fn has_message(&self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Ignored)
    }
}

/// Result of one test method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodResult {
    /// Method name, unique within its class.
    pub name: String,

    pub status: TestStatus,

    /// Elapsed device ticks converted to milliseconds. Zero unless passed.
    pub duration_ms: f64,

    /// Failure or ignore message; present iff the status is `Failed` or `Ignored`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MethodResult {
    /// A skeleton slot that has not been reported yet.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Unknown,
            duration_ms: 0.0,
            message: None,
        }
    }

    pub fn passed(name: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Passed,
            duration_ms,
            message: None,
        }
    }

    pub fn failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Failed,
            duration_ms: 0.0,
            message: Some(message.into()),
        }
    }

    pub fn ignored(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: TestStatus::Ignored,
            duration_ms: 0.0,
            message: Some(message.into()),
        }
    }
}

/// Aggregated results of one test class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassResult {
    /// Fully-qualified class name, unique within its package.
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: f64,
    pub methods: Vec<MethodResult>,
}

impl ClassResult {
    /// Creates a class with one pending slot per method name.
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            status: TestStatus::Unknown,
            duration_ms: 0.0,
            methods: methods.into_iter().map(MethodResult::pending).collect(),
        }
    }

    fn roll_up(&mut self) {
        self.status = TestStatus::roll_up(self.methods.iter().map(|m| m.status));
        self.duration_ms = self.methods.iter().map(|m| m.duration_ms).sum();
    }
}

/// Aggregated results of one deployed test package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageResult {
    /// Package (module) name; matches the name the device prints.
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    /// When the device reported that it started running this package.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    pub status: TestStatus,
    pub duration_ms: f64,

    /// Whether the device reported the end of this package.
    ///
    /// Stays `false` when the observation ended on a timeout.
    #[serde(default)]
    pub finished: bool,

    /// Set when the job failed before or while running this package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub classes: Vec<ClassResult>,
}

impl PackageResult {
    pub fn new(name: impl Into<String>, version: Option<String>, classes: Vec<ClassResult>) -> Self {
        let mut package = Self {
            name: name.into(),
            version,
            timestamp: None,
            status: TestStatus::Unknown,
            duration_ms: 0.0,
            finished: false,
            error: None,
            classes,
        };
        package.roll_up();
        package
    }

    /// A package that never ran because the job failed.
    pub fn errored(name: impl Into<String>, error: impl Into<String>) -> Self {
        let mut package = Self::new(name, None, Vec::new());
        package.status = TestStatus::Failed;
        package.error = Some(error.into());
        package
    }

    /// Counts method outcomes across all classes.
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for method in self.classes.iter().flat_map(|c| c.methods.iter()) {
            counts.add(method.status);
        }
        counts
    }

    fn roll_up(&mut self) {
        self.status = TestStatus::roll_up(self.classes.iter().map(|c| c.status));
        self.duration_ms = self.classes.iter().map(|c| c.duration_ms).sum();
    }
}

/// Number of methods per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TestStatus) {
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Ignored => self.ignored += 1,
            TestStatus::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.ignored + self.unknown
    }
}

impl std::ops::AddAssign for StatusCounts {
    fn add_assign(&mut self, other: Self) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.ignored += other.ignored;
        self.unknown += other.unknown;
    }
}

/// Slot id of a package inside a [`ResultTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(usize);

/// Slot id of a class inside a [`ResultTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId {
    package: usize,
    class: usize,
}

impl ClassId {
    pub fn package(&self) -> PackageId {
        PackageId(self.package)
    }
}

/// Slot id of a method inside a [`ResultTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId {
    package: usize,
    class: usize,
    method: usize,
}

impl MethodId {
    pub fn class(&self) -> ClassId {
        ClassId {
            package: self.package,
            class: self.class,
        }
    }
}

/// Fixed-shape arena of package results.
///
/// Ids handed out by the lookup methods are only valid for the tree that
/// produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTree {
    packages: Vec<PackageResult>,
}

impl ResultTree {
    /// Wraps pre-built skeletons. The shape is frozen from here on.
    pub fn new(packages: Vec<PackageResult>) -> Self {
        Self { packages }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package_id(&self, name: &str) -> Option<PackageId> {
        self.packages
            .iter()
            .position(|p| p.name == name)
            .map(PackageId)
    }

    pub fn class_id(&self, package: PackageId, name: &str) -> Option<ClassId> {
        self.packages[package.0]
            .classes
            .iter()
            .position(|c| c.name == name)
            .map(|class| ClassId {
                package: package.0,
                class,
            })
    }

    pub fn method_id(&self, class: ClassId, name: &str) -> Option<MethodId> {
        self.packages[class.package].classes[class.class]
            .methods
            .iter()
            .position(|m| m.name == name)
            .map(|method| MethodId {
                package: class.package,
                class: class.class,
                method,
            })
    }

    pub fn package(&self, id: PackageId) -> &PackageResult {
        &self.packages[id.0]
    }

    pub fn class(&self, id: ClassId) -> &ClassResult {
        &self.packages[id.package].classes[id.class]
    }

    pub fn method(&self, id: MethodId) -> &MethodResult {
        &self.packages[id.package].classes[id.class].methods[id.method]
    }

    /// Marks a package as started by the device.
    pub fn start_package(&mut self, id: PackageId, version: Option<&str>, at: DateTime<Utc>) {
        let package = &mut self.packages[id.0];
        package.timestamp = Some(at);
        if package.version.is_none()
            && let Some(version) = version.filter(|v| !v.is_empty())
        {
            package.version = Some(version.to_string());
        }
    }

    pub fn finish_package(&mut self, id: PackageId) {
        self.packages[id.0].finished = true;
    }

    /// Replaces a method slot and rolls status and duration up to its class and package.
    pub fn record(&mut self, id: MethodId, result: MethodResult) {
        let package = &mut self.packages[id.package];
        let class = &mut package.classes[id.class];
        class.methods[id.method] = result;
        class.roll_up();
        package.roll_up();
    }

    /// Marks every method of a class as ignored with the same message.
    pub fn ignore_class(&mut self, id: ClassId, message: &str) {
        let package = &mut self.packages[id.package];
        let class = &mut package.classes[id.class];
        for method in &mut class.methods {
            *method = MethodResult::ignored(method.name.clone(), message);
        }
        class.roll_up();
        package.roll_up();
    }

    pub fn packages(&self) -> &[PackageResult] {
        &self.packages
    }

    pub fn into_packages(self) -> Vec<PackageResult> {
        self.packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ResultTree {
        ResultTree::new(vec![PackageResult::new(
            "pkgA",
            Some("1.0.0.0".to_string()),
            vec![
                ClassResult::new("ClassX", ["Method1", "Method2"]),
                ClassResult::new("ClassY", ["Method3"]),
            ],
        )])
    }

    fn method_id(tree: &ResultTree, class: &str, method: &str) -> MethodId {
        let pkg = tree.package_id("pkgA").unwrap();
        let class = tree.class_id(pkg, class).unwrap();
        tree.method_id(class, method).unwrap()
    }

    #[test]
    fn test_roll_up_rules() {
        use TestStatus::*;

        assert_eq!(TestStatus::roll_up([]), Unknown);
        assert_eq!(TestStatus::roll_up([Unknown, Unknown]), Unknown);
        assert_eq!(TestStatus::roll_up([Passed, Passed]), Passed);
        assert_eq!(TestStatus::roll_up([Passed, Failed, Ignored]), Failed);
        assert_eq!(TestStatus::roll_up([Ignored, Ignored]), Ignored);
        assert_eq!(TestStatus::roll_up([Ignored, Unknown]), Ignored);
        assert_eq!(TestStatus::roll_up([Passed, Ignored]), Passed);
        assert_eq!(TestStatus::roll_up([Passed, Unknown]), Passed);
    }

    #[test]
    fn test_skeleton_starts_unknown() {
        let tree = sample_tree();
        let package = &tree.packages()[0];

        assert_eq!(package.status, TestStatus::Unknown);
        assert!(!package.finished);
        assert_eq!(package.counts().unknown, 3);
        assert!(
            package
                .classes
                .iter()
                .all(|c| c.status == TestStatus::Unknown)
        );
    }

    #[test]
    fn test_record_rolls_up_status_and_duration() {
        let mut tree = sample_tree();

        let m1 = method_id(&tree, "ClassX", "Method1");
        tree.record(m1, MethodResult::passed("Method1", 5.0));

        let pkg = tree.package_id("pkgA").unwrap();
        assert_eq!(tree.package(pkg).status, TestStatus::Passed);
        assert_eq!(tree.class(m1.class()).status, TestStatus::Passed);
        assert_eq!(tree.package(pkg).duration_ms, 5.0);

        let m2 = method_id(&tree, "ClassX", "Method2");
        tree.record(m2, MethodResult::failed("Method2", "oops"));

        assert_eq!(tree.class(m2.class()).status, TestStatus::Failed);
        assert_eq!(tree.package(pkg).status, TestStatus::Failed);
        assert_eq!(tree.method(m2).message.as_deref(), Some("oops"));
    }

    #[test]
    fn test_record_replaces_slot_without_double_counting() {
        let mut tree = sample_tree();
        let m1 = method_id(&tree, "ClassX", "Method1");

        tree.record(m1, MethodResult::passed("Method1", 5.0));
        tree.record(m1, MethodResult::passed("Method1", 7.5));

        assert_eq!(tree.class(m1.class()).methods.len(), 2);
        assert_eq!(tree.class(m1.class()).duration_ms, 7.5);
        assert_eq!(tree.package(m1.class().package()).duration_ms, 7.5);
    }

    #[test]
    fn test_unknown_names_are_lookup_failures() {
        let tree = sample_tree();
        let pkg = tree.package_id("pkgA").unwrap();
        let class = tree.class_id(pkg, "ClassX").unwrap();

        assert!(tree.package_id("pkgB").is_none());
        assert!(tree.class_id(pkg, "ClassZ").is_none());
        assert!(tree.method_id(class, "Method3").is_none());
    }

    #[test]
    fn test_ignore_class_marks_every_method() {
        let mut tree = sample_tree();
        let pkg = tree.package_id("pkgA").unwrap();
        let class = tree.class_id(pkg, "ClassY").unwrap();

        tree.ignore_class(class, "not on this board");

        let class = tree.class(class);
        assert_eq!(class.status, TestStatus::Ignored);
        assert!(class.methods.iter().all(|m| m.status == TestStatus::Ignored
            && m.message.as_deref() == Some("not on this board")));
        assert_eq!(tree.package(pkg).status, TestStatus::Ignored);
    }

    #[test]
    fn test_start_package_keeps_skeleton_version() {
        let mut tree = ResultTree::new(vec![
            PackageResult::new("pkgA", Some("1.0.0.0".to_string()), Vec::new()),
            PackageResult::new("pkgB", None, Vec::new()),
        ]);
        let now = Utc::now();

        let a = tree.package_id("pkgA").unwrap();
        let b = tree.package_id("pkgB").unwrap();
        tree.start_package(a, Some("2.0.0.0"), now);
        tree.start_package(b, Some("3.1.0.0"), now);

        assert_eq!(tree.package(a).version.as_deref(), Some("1.0.0.0"));
        assert_eq!(tree.package(b).version.as_deref(), Some("3.1.0.0"));
        assert_eq!(tree.package(b).timestamp, Some(now));
    }

    #[test]
    fn test_package_result_json_shape() {
        let mut tree = sample_tree();
        let m1 = method_id(&tree, "ClassX", "Method1");
        tree.record(m1, MethodResult::passed("Method1", 5.0));

        let json = serde_json::to_value(tree.packages()).unwrap();
        let package = &json[0];
        assert_eq!(package["name"], "pkgA");
        assert_eq!(package["status"], "Passed");
        assert_eq!(package["durationMs"], 5.0);
        assert_eq!(package["classes"][0]["methods"][0]["status"], "Passed");
        assert!(package["classes"][0]["methods"][0].get("message").is_none());
        assert!(package.get("error").is_none());
    }
}
