//! Naming helpers: stage identity, matched identifiers and run ids.
//!
//! Output paths in a pipeline are derived from input names, so the helpers
//! here must be deterministic: the same inputs always yield the same names.

use crate::errors::{ConfigError, ShellflowError};
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

const ID_INCLUDE_PARAMS: usize = 3;
const ID_TRUNCATE_PARAMS: usize = 16;
const ID_TRUNCATE_HASH: usize = 10;

/// Identity of a stage within a graph.
///
/// Two stage instances with equal ids are the same graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    /// Creates an id from a literal string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id from a stage family and its parameters.
    ///
    /// The result reads `Family_p1_p2_p3_<hash>`: the first three parameter
    /// values in key order (truncated to 16 characters, non-word characters
    /// replaced by `_`) followed by the first 10 hex digits of the MD5 of the
    /// canonical JSON encoding of all parameters.
    pub fn derive<I, K, V>(family: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let canonical = serde_json::to_string(&params).unwrap_or_default();
        let digest = hex::encode(Md5::digest(canonical.as_bytes()));

        let summary = params
            .values()
            .take(ID_INCLUDE_PARAMS)
            .map(|v| v.chars().take(ID_TRUNCATE_PARAMS).collect::<String>())
            .collect::<Vec<_>>()
            .join("_")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();

        Self(format!("{family}_{summary}_{}", &digest[..ID_TRUNCATE_HASH]))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for StageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A naming key derived from a pair of related inputs, such as a tumor and
/// its matched normal sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchedId(String);

impl MatchedId {
    /// Derives the id for an ordered (foreground, background) pair.
    ///
    /// File stems are split on `.`. When the last fragments differ, the id is
    /// every foreground fragment followed by every background fragment.
    /// Otherwise the shared trailing fragments are written once, after the
    /// foreground-specific ones: `tumor.markdup.cram` and
    /// `normal.markdup.cram` give `tumor.normal.markdup`. At least one
    /// foreground fragment is always kept: `sample.cram` against
    /// `x.sample.cram` gives `sample.x.sample`, not `x.sample`.
    #[must_use]
    pub fn new(foreground: impl AsRef<Path>, background: impl AsRef<Path>) -> Self {
        let fg = stem_fragments(foreground.as_ref());
        let bg = stem_fragments(background.as_ref());

        if fg.last() != bg.last() {
            return Self([fg, bg].concat().join("."));
        }

        let shortest = fg.len().min(bg.len());
        let mut n_common = 1;
        while n_common < shortest.saturating_sub(1)
            && fg[fg.len() - 1 - n_common] == bg[bg.len() - 1 - n_common]
        {
            n_common += 1;
        }
        let n_common = n_common.min(fg.len().saturating_sub(1));
        let fragments: Vec<&str> = fg[..fg.len() - n_common]
            .iter()
            .chain(bg.iter())
            .map(String::as_str)
            .collect();
        Self(fragments.join("."))
    }

    /// Derives the id for a pair whose order carries no meaning.
    #[must_use]
    pub fn unordered(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Self {
        let (a, b) = (a.as_ref(), b.as_ref());
        if a <= b {
            Self::new(a, b)
        } else {
            Self::new(b, a)
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MatchedId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn stem_fragments(path: &Path) -> Vec<String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split('.').map(String::from).collect()
}

/// Drops the last `n` dotted fragments of a file name.
///
/// `strip_suffixes("x.mutect2.vcf.gz", 3)` returns `x`.
#[must_use]
pub fn strip_suffixes(name: &str, n: usize) -> String {
    let fragments: Vec<&str> = name.split('.').collect();
    let keep = fragments.len().saturating_sub(n);
    fragments[..keep].join(".")
}

/// Returns the file name of `path` with its last `n` fragments dropped.
#[must_use]
pub fn run_id_from_path(path: impl AsRef<Path>, n: usize) -> String {
    path.as_ref()
        .file_name()
        .map(|s| strip_suffixes(&s.to_string_lossy(), n))
        .unwrap_or_default()
}

/// Replaces the part of `path` matched by `pattern` with `replacement`.
///
/// Used to derive output paths from input paths, e.g. `\.vcf\.gz$` to
/// `.filtered.vcf.gz`.
pub fn replace_suffix(
    path: impl AsRef<Path>,
    pattern: &str,
    replacement: &str,
) -> Result<PathBuf, ShellflowError> {
    let re = Regex::new(pattern)
        .map_err(|e| ConfigError::new("pattern", format!("invalid pattern '{pattern}': {e}")))?;
    let path = path.as_ref().to_string_lossy();
    Ok(PathBuf::from(re.replace(&path, replacement).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_is_deterministic() {
        let a = StageId::derive("CallVariants", [("cram", "/data/t.cram"), ("ref", "hg38.fa")]);
        let b = StageId::derive("CallVariants", [("ref", "hg38.fa"), ("cram", "/data/t.cram")]);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("CallVariants__data_t_cram_hg38_fa_"));
    }

    #[test]
    fn test_stage_id_distinguishes_params() {
        let a = StageId::derive("Align", [("fq", "a.fq")]);
        let b = StageId::derive("Align", [("fq", "b.fq")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stage_id_hash_length() {
        let id = StageId::derive("Fetch", Vec::<(String, String)>::new());
        let hash = id.as_str().rsplit('_').next().unwrap();
        assert_eq!(hash.len(), ID_TRUNCATE_HASH);
    }

    #[test]
    fn test_matched_id_shared_suffix() {
        let id = MatchedId::new("/x/tumor.markdup.bqsr.cram", "/x/normal.markdup.bqsr.cram");
        assert_eq!(id.as_str(), "tumor.normal.markdup.bqsr");
    }

    #[test]
    fn test_matched_id_disjoint() {
        let id = MatchedId::new("tumor.cram", "normal.bam");
        assert_eq!(id.as_str(), "tumor.normal");

        let id = MatchedId::new("t.a.cram", "n.b.cram");
        assert_eq!(id.as_str(), "t.a.n.b");
    }

    #[test]
    fn test_matched_id_order() {
        let fwd = MatchedId::new("tumor.dedup.cram", "normal.dedup.cram");
        let rev = MatchedId::new("normal.dedup.cram", "tumor.dedup.cram");
        assert_ne!(fwd, rev);

        let a = MatchedId::unordered("tumor.dedup.cram", "normal.dedup.cram");
        let b = MatchedId::unordered("normal.dedup.cram", "tumor.dedup.cram");
        assert_eq!(a, b);
    }

    #[test]
    fn test_matched_id_keeps_a_foreground_fragment() {
        let fwd = MatchedId::new("sample.cram", "x.sample.cram");
        let rev = MatchedId::new("x.sample.cram", "sample.cram");
        assert_eq!(fwd.as_str(), "sample.x.sample");
        assert_eq!(rev.as_str(), "x.sample");
        assert_ne!(fwd, rev);
    }

    #[test]
    fn test_matched_id_empty_stems() {
        assert_eq!(MatchedId::new("/", "/").as_str(), ".");
        assert_eq!(MatchedId::new("/", "normal.cram").as_str(), ".normal");
    }

    #[test]
    fn test_strip_suffixes() {
        assert_eq!(strip_suffixes("x.mutect2.vcf.gz", 3), "x");
        assert_eq!(strip_suffixes("a.b", 5), "");
        assert_eq!(run_id_from_path("/o/t.n.contamination.table", 2), "t.n");
    }

    #[test]
    fn test_replace_suffix() {
        let out = replace_suffix("/o/x.vcf.gz", r"\.vcf\.gz$", ".filtered.vcf.gz").unwrap();
        assert_eq!(out, PathBuf::from("/o/x.filtered.vcf.gz"));

        assert!(replace_suffix("/o/x", "(", "").is_err());
    }
}
