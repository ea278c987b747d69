// Artifact Discovery
// Finds files whose exact names depend on the toolchain version

use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of a lookup: the chosen path and whether it exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub path: PathBuf,
    pub found: bool,
}

/// A file looked up first by its expected path, then by a name pattern
#[derive(Debug, Clone)]
pub struct Query {
    /// Preferred path (e.g. `bin/clang-21`)
    pub expected: PathBuf,
    /// Directory searched when the expected path is missing
    pub dir: PathBuf,
    /// File-name pattern for candidates in `dir`
    pub pattern: Regex,
    /// Returned (with `found = false`) when nothing matches
    pub fallback: PathBuf,
}

/// Filesystem queries used by postconditions and stage recipes
pub trait Discovery: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Size in bytes, None when the file is missing
    fn file_size(&self, path: &Path) -> Option<u64>;

    /// Entries of `dir` whose file name matches `pattern`, in no particular
    /// order. A missing directory has no entries.
    fn list(&self, dir: &Path, pattern: &Regex) -> Vec<PathBuf>;

    /// Number of entries in `dir`, zero when it is missing
    fn entry_count(&self, dir: &Path) -> usize;

    /// Entries of `dir` matching `pattern`, highest version first
    fn newest(&self, dir: &Path, pattern: &Regex) -> Option<PathBuf> {
        let mut candidates = self.list(dir, pattern);
        candidates.sort_by(|a, b| version_key(b).cmp(&version_key(a)));
        candidates.into_iter().next()
    }

    fn locate(&self, query: &Query) -> Located {
        if self.exists(&query.expected) {
            return Located {
                path: query.expected.clone(),
                found: true,
            };
        }

        match self.newest(&query.dir, &query.pattern) {
            Some(path) => Located { path, found: true },
            None => Located {
                path: query.fallback.clone(),
                found: false,
            },
        }
    }
}

/// Numeric groups of the file name followed by the name itself, so that
/// `clang-21` sorts above `clang-9`
fn version_key(path: &Path) -> (Vec<u64>, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let numbers = name
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse::<u64>().ok())
        .collect();

    (numbers, name)
}

/// Discovery over the real filesystem
#[derive(Debug, Clone, Default)]
pub struct FsDiscovery;

impl Discovery for FsDiscovery {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().map(|m| m.len())
    }

    fn list(&self, dir: &Path, pattern: &Regex) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| pattern.is_match(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
            .collect()
    }

    fn entry_count(&self, dir: &Path) -> usize {
        fs::read_dir(dir)
            .map(|entries| entries.filter_map(|entry| entry.ok()).count())
            .unwrap_or(0)
    }
}

/// In-memory discovery for exercising lookups without real files
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscovery {
    files: BTreeMap<PathBuf, u64>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.files.insert(path.into(), size);
        self
    }

    fn children(&self, dir: &Path) -> Vec<PathBuf> {
        let mut children: Vec<PathBuf> = self
            .files
            .keys()
            .filter_map(|file| {
                let rest = file.strip_prefix(dir).ok()?;
                let first = rest.components().next()?;
                Some(dir.join(first.as_os_str()))
            })
            .collect();
        children.dedup();
        children
    }
}

impl Discovery for MemoryDiscovery {
    fn exists(&self, path: &Path) -> bool {
        self.files.keys().any(|file| file == path || file.starts_with(path))
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        self.files.get(path).copied()
    }

    fn list(&self, dir: &Path, pattern: &Regex) -> Vec<PathBuf> {
        self.children(dir)
            .into_iter()
            .filter(|child| {
                child
                    .file_name()
                    .map(|n| pattern.is_match(&n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn entry_count(&self, dir: &Path) -> usize {
        self.children(dir).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn clang_query(bin: &Path) -> Query {
        Query {
            expected: bin.join("clang-21"),
            dir: bin.to_path_buf(),
            pattern: Regex::new(r"^clang-\d+$").unwrap(),
            fallback: bin.join("clang"),
        }
    }

    #[test]
    fn test_locate_expected_binary() {
        let discovery = MemoryDiscovery::new()
            .with_file("/install/bin/clang-21", 10)
            .with_file("/install/bin/clang-20", 10);

        let located = discovery.locate(&clang_query(Path::new("/install/bin")));

        assert_eq!(
            located,
            Located {
                path: PathBuf::from("/install/bin/clang-21"),
                found: true
            }
        );
    }

    #[test]
    fn test_locate_newest_versioned_candidate() {
        let discovery = MemoryDiscovery::new()
            .with_file("/install/bin/clang-9", 10)
            .with_file("/install/bin/clang-22", 10)
            .with_file("/install/bin/clang-format", 10);

        let located = discovery.locate(&clang_query(Path::new("/install/bin")));

        assert_eq!(located.path, PathBuf::from("/install/bin/clang-22"));
        assert!(located.found);
    }

    #[test]
    fn test_locate_falls_back() {
        let discovery = MemoryDiscovery::new().with_file("/install/bin/lld", 10);

        let located = discovery.locate(&clang_query(Path::new("/install/bin")));

        assert_eq!(located.path, PathBuf::from("/install/bin/clang"));
        assert!(!located.found);
    }

    #[test]
    fn test_memory_list_returns_direct_children() {
        let discovery = MemoryDiscovery::new()
            .with_file("/install/lib/clang/21/include/stddef.h", 10)
            .with_file("/install/lib/clang/21/lib/libclang_rt.a", 10);

        let dirs = discovery.list(
            Path::new("/install/lib/clang"),
            &Regex::new(r"^\d+").unwrap(),
        );

        assert_eq!(dirs, vec![PathBuf::from("/install/lib/clang/21")]);
    }

    #[test]
    fn test_fs_discovery_lists_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prof.101"), "a").unwrap();
        fs::write(dir.path().join("prof.102"), "b").unwrap();
        fs::write(dir.path().join("other"), "c").unwrap();

        let discovery = FsDiscovery;
        let mut found = discovery.list(dir.path(), &Regex::new(r"^prof\.").unwrap());
        found.sort();

        assert_eq!(
            found,
            vec![dir.path().join("prof.101"), dir.path().join("prof.102")]
        );
        assert_eq!(discovery.file_size(&dir.path().join("other")), Some(1));
        assert!(discovery
            .list(&dir.path().join("missing"), &Regex::new(".*").unwrap())
            .is_empty());
    }
}
