//! Output targets and the existence-based completion oracle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A named output artifact: a primary path plus any companion files.
///
/// A target is ready iff every one of its paths exists. Readiness is always
/// evaluated against the filesystem at call time and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    path: PathBuf,
    #[serde(default)]
    companions: Vec<PathBuf>,
}

impl Target {
    /// Creates a target for a single path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            companions: Vec::new(),
        }
    }

    /// Creates a target for a data file and its index, where the index path
    /// is the data path with `suffix` appended (`x.vcf.gz` + `.tbi`).
    #[must_use]
    pub fn indexed(path: impl Into<PathBuf>, suffix: &str) -> Self {
        let path = path.into();
        let mut index = path.clone().into_os_string();
        index.push(suffix);
        Self {
            path,
            companions: vec![PathBuf::from(index)],
        }
    }

    /// Adds a companion path that must exist alongside the primary.
    #[must_use]
    pub fn with_companion(mut self, path: impl Into<PathBuf>) -> Self {
        self.companions.push(path.into());
        self
    }

    /// Returns the primary path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the companion paths.
    #[must_use]
    pub fn companions(&self) -> &[PathBuf] {
        &self.companions
    }

    /// Returns every path of the target, primary first.
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        std::iter::once(self.path.as_path())
            .chain(self.companions.iter().map(PathBuf::as_path))
            .collect()
    }

    /// Returns true if every path of the target exists.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.paths().into_iter().all(Path::exists)
    }

    /// Returns the paths that do not exist yet.
    #[must_use]
    pub fn missing(&self) -> Vec<PathBuf> {
        self.paths()
            .into_iter()
            .filter(|p| !p.exists())
            .map(Path::to_path_buf)
            .collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        for companion in &self.companions {
            write!(f, " (+{})", companion.display())?;
        }
        Ok(())
    }
}

impl From<PathBuf> for Target {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for Target {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&PathBuf> for Target {
    fn from(path: &PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&str> for Target {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Decides stage completion purely from filesystem existence.
///
/// There is no content hashing and no timestamp comparison: a stage whose
/// outputs exist is complete even if its inputs changed since.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOracle;

impl CompletionOracle {
    /// Returns true if the outputs mark a stage as already done.
    ///
    /// A stage without declared outputs is never complete.
    #[must_use]
    pub fn is_complete(outputs: &[Target]) -> bool {
        !outputs.is_empty() && outputs.iter().all(Target::is_ready)
    }

    /// Returns every missing path across the outputs.
    #[must_use]
    pub fn missing(outputs: &[Target]) -> Vec<PathBuf> {
        outputs.iter().flat_map(Target::missing).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_single_path_readiness() {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().join("a.txt"));
        assert!(!target.is_ready());

        fs::write(dir.path().join("a.txt"), "x").unwrap();
        assert!(target.is_ready());
    }

    #[test]
    fn test_partial_pair_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let vcf = dir.path().join("calls.vcf.gz");
        let target = Target::indexed(&vcf, ".tbi");

        assert_eq!(target.companions(), &[dir.path().join("calls.vcf.gz.tbi")]);

        fs::write(&vcf, "").unwrap();
        assert!(!target.is_ready());
        assert_eq!(target.missing(), vec![dir.path().join("calls.vcf.gz.tbi")]);

        fs::write(dir.path().join("calls.vcf.gz.tbi"), "").unwrap();
        assert!(target.is_ready());
    }

    #[test]
    fn test_directory_target() {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().join("intervals"));
        assert!(!target.is_ready());
        fs::create_dir(dir.path().join("intervals")).unwrap();
        assert!(target.is_ready());
    }

    #[test]
    fn test_paths_order() {
        let target = Target::new("/data/x.cram").with_companion("/data/x.cram.crai");
        assert_eq!(
            target.paths(),
            vec![Path::new("/data/x.cram"), Path::new("/data/x.cram.crai")]
        );
        assert_eq!(target.to_string(), "/data/x.cram (+/data/x.cram.crai)");
    }

    #[test]
    fn test_oracle_requires_declared_outputs() {
        assert!(!CompletionOracle::is_complete(&[]));
    }

    #[test]
    fn test_oracle_ignores_content() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("stale.txt");
        fs::write(&out, "stale content").unwrap();

        let outputs = vec![Target::new(&out)];
        assert!(CompletionOracle::is_complete(&outputs));

        fs::write(&out, "").unwrap();
        assert!(CompletionOracle::is_complete(&outputs));
    }
}
