//! Input catalog and stratum derivation.
//!
//! The stratification is discovered, not declared: a file's stratum is the
//! second-to-last segment of its path. An empty or malformed path (fewer
//! than two segments) falls into the `""` stratum.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl FileRecord {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    /// `stratum(path) = second-to-last path segment`.
    pub fn stratum(&self) -> String {
        stratum_of(&self.path)
    }
}

pub fn stratum_of(path: &Path) -> String {
    let segments: Vec<_> = path.iter().collect();
    if segments.len() < 2 {
        tracing::warn!(path = %path.display(), "path too short to derive a stratum, using \"\"");
        return String::new();
    }
    segments[segments.len() - 2].to_string_lossy().into_owned()
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub files: Vec<FileRecord>,
}

impl Catalog {
    pub fn new(files: Vec<FileRecord>) -> Self {
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Index files by their discovered stratum. Insertion order within a
    /// stratum is preserved but otherwise irrelevant.
    pub fn by_stratum(&self) -> BTreeMap<String, Vec<usize>> {
        let mut index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, file) in self.files.iter().enumerate() {
            index.entry(file.stratum()).or_default().push(i);
        }
        index
    }

    pub fn strata(&self) -> Vec<String> {
        self.by_stratum().into_keys().collect()
    }
}
