//! Deployable package resolution and static metadata inspection.
//!
//! A package lives in its own directory under the package root:
//!
//! ```text
//! <root>/
//! ├── mscorlib/
//! │   └── mscorlib.pe
//! └── NFUnitTest/
//!     ├── NFUnitTest.pe
//!     └── NFUnitTest.manifest.json
//! ```
//!
//! The `.pe` file is the blob sent to the device. The manifest lists the
//! package's dependencies and the test classes and methods it contains, which
//! is what the result skeleton is built from before the device runs anything.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::result::{ClassResult, PackageResult};

/// Errors raised while locating or reading packages.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// No blob exists for the requested package.
    #[error("Package not found: {name} (looked in {path})")]
    NotFound { name: String, path: PathBuf },

    /// The package name cannot be mapped to a directory.
    #[error("Invalid package name: '{0}'")]
    InvalidName(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest exists but is not valid JSON for the expected shape.
    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The manifest describes a different package than its directory.
    #[error("Manifest {path} declares package '{found}', expected '{expected}'")]
    NameMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
}

/// Static description of a test package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    /// Names of packages that must be deployed alongside this one.
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub classes: Vec<ClassManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassManifest {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

impl PackageManifest {
    /// Builds the result skeleton: every method pending, classes without
    /// methods left out.
    pub fn skeleton(&self) -> PackageResult {
        let classes = self
            .classes
            .iter()
            .filter(|c| !c.methods.is_empty())
            .map(|c| ClassResult::new(c.name.clone(), c.methods.iter().cloned()))
            .collect();

        PackageResult::new(self.name.clone(), self.version.clone(), classes)
    }
}

/// A package blob together with the names it depends on.
#[derive(Debug, Clone)]
pub struct ResolvedPackage {
    pub name: String,
    pub blob: Vec<u8>,
    pub dependencies: Vec<String>,
}

/// One blob ready to be sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployable {
    pub name: String,
    pub blob: Vec<u8>,
}

impl Deployable {
    /// Hex-encoded SHA-256 of the blob.
    pub fn digest(&self) -> String {
        Sha256::digest(&self.blob)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }
}

/// Maps a package name to its blob and direct dependencies.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<ResolvedPackage, PackageError>;
}

/// Reads the static test metadata of a package.
#[async_trait]
pub trait MetadataInspector: Send + Sync {
    async fn inspect(&self, name: &str) -> Result<PackageManifest, PackageError>;
}

/// Resolves `roots` and their transitive dependencies into a deployment list.
///
/// `always` packages come first. Each package appears once, after the
/// packages it depends on. Dependency cycles are cut at the first revisit.
pub async fn resolve_closure<R>(
    resolver: &R,
    always: &[String],
    roots: &[String],
) -> Result<Vec<Deployable>, PackageError>
where
    R: PackageResolver + ?Sized,
{
    enum Frame {
        Enter(String),
        Emit(Deployable),
    }

    let mut seen = HashSet::new();
    let mut deployables = Vec::new();

    for root in always.iter().chain(roots) {
        let mut stack = vec![Frame::Enter(root.clone())];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter(name) => {
                    if !seen.insert(name.clone()) {
                        continue;
                    }

                    let resolved = resolver.resolve(&name).await?;
                    stack.push(Frame::Emit(Deployable {
                        name: resolved.name,
                        blob: resolved.blob,
                    }));
                    for dependency in resolved.dependencies.into_iter().rev() {
                        if !seen.contains(&dependency) {
                            stack.push(Frame::Enter(dependency));
                        }
                    }
                }
                Frame::Emit(deployable) => deployables.push(deployable),
            }
        }
    }

    Ok(deployables)
}

/// Package store laid out as one directory per package.
///
/// Several roots may be searched; the first one containing a directory for
/// the package wins.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    roots: Vec<PathBuf>,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
        }
    }

    /// Searches `root` before every root added so far.
    pub fn with_overlay(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(0, root.into());
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn package_dir(&self, name: &str) -> Result<PathBuf, PackageError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.contains('\0');
        if !valid {
            return Err(PackageError::InvalidName(name.to_string()));
        }

        let fallback = self.roots.last().map(|root| root.join(name));
        Ok(self
            .roots
            .iter()
            .map(|root| root.join(name))
            .find(|dir| dir.is_dir())
            .or(fallback)
            .unwrap_or_else(|| PathBuf::from(name)))
    }

    pub fn blob_path(&self, name: &str) -> Result<PathBuf, PackageError> {
        Ok(self.package_dir(name)?.join(format!("{name}.pe")))
    }

    pub fn manifest_path(&self, name: &str) -> Result<PathBuf, PackageError> {
        Ok(self.package_dir(name)?.join(format!("{name}.manifest.json")))
    }

    async fn read_manifest(&self, name: &str) -> Result<Option<PackageManifest>, PackageError> {
        let path = self.manifest_path(name)?;
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PackageError::Io { path, source }),
        };

        let manifest: PackageManifest = serde_json::from_slice(&content)
            .map_err(|source| PackageError::Manifest {
                path: path.clone(),
                source,
            })?;

        if manifest.name != name {
            return Err(PackageError::NameMismatch {
                path,
                expected: name.to_string(),
                found: manifest.name,
            });
        }

        Ok(Some(manifest))
    }
}

#[async_trait]
impl PackageResolver for DirectoryResolver {
    async fn resolve(&self, name: &str) -> Result<ResolvedPackage, PackageError> {
        let path = self.blob_path(name)?;
        let blob = match tokio::fs::read(&path).await {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PackageError::NotFound {
                    name: name.to_string(),
                    path,
                });
            }
            Err(source) => return Err(PackageError::Io { path, source }),
        };

        // Support packages such as the core library ship without a manifest.
        let dependencies = self
            .read_manifest(name)
            .await?
            .map(|m| m.dependencies)
            .unwrap_or_default();

        debug!(
            "Resolved package {} ({} bytes, {} dependencies)",
            name,
            blob.len(),
            dependencies.len()
        );

        Ok(ResolvedPackage {
            name: name.to_string(),
            blob,
            dependencies,
        })
    }
}

#[async_trait]
impl MetadataInspector for DirectoryResolver {
    async fn inspect(&self, name: &str) -> Result<PackageManifest, PackageError> {
        match self.read_manifest(name).await? {
            Some(manifest) => Ok(manifest),
            None => Err(PackageError::NotFound {
                name: name.to_string(),
                path: self.manifest_path(name)?,
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::result::TestStatus;
    use std::path::Path;
    use tempfile::TempDir;

    /// Writes `<root>/<name>/<name>.pe` and, when given, its manifest.
    pub(crate) fn write_package(root: &Path, manifest: Option<&PackageManifest>, name: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.pe")), format!("PE:{name}")).unwrap();
        if let Some(manifest) = manifest {
            std::fs::write(
                dir.join(format!("{name}.manifest.json")),
                serde_json::to_vec_pretty(manifest).unwrap(),
            )
            .unwrap();
        }
    }

    pub(crate) fn manifest(name: &str, deps: &[&str], classes: &[(&str, &[&str])]) -> PackageManifest {
        PackageManifest {
            name: name.to_string(),
            version: Some("1.0.0.0".to_string()),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            classes: classes
                .iter()
                .map(|(class, methods)| ClassManifest {
                    name: class.to_string(),
                    methods: methods.iter().map(|m| m.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn names(deployables: &[Deployable]) -> Vec<&str> {
        deployables.iter().map(|d| d.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_closure_orders_dependencies_first() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), None, "mscorlib");
        write_package(dir.path(), Some(&manifest("Engine", &["mscorlib"], &[])), "Engine");
        write_package(dir.path(), Some(&manifest("Util", &["mscorlib"], &[])), "Util");
        write_package(
            dir.path(),
            Some(&manifest("pkgA", &["Util", "Engine"], &[])),
            "pkgA",
        );

        let resolver = DirectoryResolver::new(dir.path());
        let always = vec!["mscorlib".to_string(), "Engine".to_string()];
        let deployables = resolve_closure(&resolver, &always, &["pkgA".to_string()])
            .await
            .unwrap();

        assert_eq!(names(&deployables), ["mscorlib", "Engine", "Util", "pkgA"]);
        assert_eq!(deployables[3].blob, b"PE:pkgA");
    }

    #[tokio::test]
    async fn test_closure_survives_cycles() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), Some(&manifest("A", &["B"], &[])), "A");
        write_package(dir.path(), Some(&manifest("B", &["A"], &[])), "B");

        let resolver = DirectoryResolver::new(dir.path());
        let deployables = resolve_closure(&resolver, &[], &["A".to_string()])
            .await
            .unwrap();

        assert_eq!(names(&deployables), ["B", "A"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_is_not_found() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), Some(&manifest("A", &["Ghost"], &[])), "A");

        let resolver = DirectoryResolver::new(dir.path());
        let err = resolve_closure(&resolver, &[], &["A".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, PackageError::NotFound { ref name, .. } if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let resolver = DirectoryResolver::new("/tmp");
        for name in ["", "..", "a/b", "a\\b"] {
            let err = resolver.resolve(name).await.unwrap_err();
            assert!(matches!(err, PackageError::InvalidName(_)), "{name:?}");
        }
    }

    #[tokio::test]
    async fn test_inspect_checks_manifest_name() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), Some(&manifest("Other", &[], &[])), "pkgA");

        let resolver = DirectoryResolver::new(dir.path());
        let err = resolver.inspect("pkgA").await.unwrap_err();
        assert!(matches!(err, PackageError::NameMismatch { .. }));
    }

    #[tokio::test]
    async fn test_inspect_requires_manifest() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), None, "mscorlib");

        let resolver = DirectoryResolver::new(dir.path());
        assert!(matches!(
            resolver.inspect("mscorlib").await,
            Err(PackageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_overlay_root_is_searched_first() {
        let base = TempDir::new().unwrap();
        let download = TempDir::new().unwrap();
        write_package(base.path(), None, "mscorlib");
        write_package(base.path(), Some(&manifest("pkgA", &[], &[])), "pkgA");
        std::fs::create_dir_all(download.path().join("pkgA")).unwrap();
        std::fs::write(download.path().join("pkgA/pkgA.pe"), b"fresh").unwrap();

        let resolver = DirectoryResolver::new(base.path()).with_overlay(download.path());

        assert_eq!(resolver.resolve("pkgA").await.unwrap().blob, b"fresh");
        assert_eq!(resolver.resolve("mscorlib").await.unwrap().blob, b"PE:mscorlib");
    }

    #[test]
    fn test_skeleton_skips_classes_without_methods() {
        let manifest = manifest(
            "pkgA",
            &[],
            &[("ClassX", &["Method1", "Method2"]), ("Helpers", &[])],
        );
        let skeleton = manifest.skeleton();

        assert_eq!(skeleton.classes.len(), 1);
        assert_eq!(skeleton.classes[0].name, "ClassX");
        assert_eq!(skeleton.version.as_deref(), Some("1.0.0.0"));
        assert_eq!(skeleton.status, TestStatus::Unknown);
        assert_eq!(skeleton.counts().unknown, 2);
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        let deployable = Deployable {
            name: "empty".to_string(),
            blob: Vec::new(),
        };
        assert_eq!(
            deployable.digest(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
