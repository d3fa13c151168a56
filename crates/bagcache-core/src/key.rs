//! Bag identity
//!
//! A [`BagKey`] fingerprints what is on disk for a bag path: the canonical
//! path plus the size and modification time of its data file. Any rewrite of
//! the data that changes either yields a different key, which is how the
//! handle pool detects stale handles.
//!
//! Bags come in two shapes:
//! - a single data file (`run.bag`, `run.mcap`)
//! - a directory holding exactly one data file (`run/run_0.db3` next to a
//!   `metadata.yaml`)
//!
//! For directories the inner data file is stat'ed. Directory metadata does
//! not change when a file inside it is rewritten in place.

use bagcache_common::{Error, Result};
use serde::Serialize;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// File extensions recognised as bag data files inside a bag directory
pub const DATA_FILE_EXTENSIONS: &[&str] = &["bag", "db3", "mcap"];

/// Identity of a bag on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BagKey {
    /// Canonical path of the bag (file or directory) as requested
    pub realpath: PathBuf,
    /// Size of the data file in bytes
    pub size_bytes: u64,
    /// Modification time of the data file, nanoseconds since the Unix epoch
    pub mtime_ns: i64,
}

impl BagKey {
    /// Create a key from its parts
    pub fn new(realpath: impl Into<PathBuf>, size_bytes: u64, mtime_ns: i64) -> Self {
        Self {
            realpath: realpath.into(),
            size_bytes,
            mtime_ns,
        }
    }

    /// Resolve the current identity of the bag at `path`
    ///
    /// Fails with [`Error::NotFound`] if the path does not exist and with
    /// [`Error::AmbiguousBag`] if it is a directory without exactly one data
    /// file.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let realpath = canonicalize(path.as_ref())?;
        let data_file = data_file_of(&realpath)?;
        let meta = stat(&data_file)?;

        Ok(Self {
            realpath,
            size_bytes: meta.len(),
            mtime_ns: mtime_ns(&meta),
        })
    }

    /// Whether `other` names the same bag, possibly with different content
    #[must_use]
    pub fn same_bag(&self, other: &Self) -> bool {
        self.realpath == other.realpath
    }
}

/// Locate the data file backing the bag at `path`
///
/// Returns the canonical file path for single-file bags and the single
/// candidate data file for directory bags.
pub fn locate_data_file(path: impl AsRef<Path>) -> Result<PathBuf> {
    let realpath = canonicalize(path.as_ref())?;
    data_file_of(&realpath)
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn canonicalize(path: &Path) -> Result<PathBuf> {
    let expanded = expand_home(path);
    std::fs::canonicalize(&expanded).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound { path: expanded },
        _ => Error::Io(e),
    })
}

fn stat(path: &Path) -> Result<Metadata> {
    std::fs::metadata(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound {
            path: path.to_path_buf(),
        },
        _ => Error::Io(e),
    })
}

fn data_file_of(realpath: &Path) -> Result<PathBuf> {
    if !stat(realpath)?.is_dir() {
        return Ok(realpath.to_path_buf());
    }

    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(realpath)? {
        let candidate = entry?.path();
        if is_data_file(&candidate) && candidate.is_file() {
            candidates.push(candidate);
        }
    }

    if candidates.len() == 1 {
        return Ok(candidates.remove(0));
    }

    candidates.sort();
    Err(Error::AmbiguousBag {
        path: realpath.to_path_buf(),
        candidates,
    })
}

fn is_data_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| DATA_FILE_EXTENSIONS.contains(&ext))
}

fn mtime_ns(meta: &Metadata) -> i64 {
    let Ok(modified) = meta.modified() else {
        return 0;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos()).map_or(i64::MIN, |ns| -ns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn write_file(path: &Path, bytes: &[u8]) {
        std::fs::write(path, bytes).unwrap();
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_key_equality() {
        let a = BagKey::new("/data/run.bag", 1000, 123_456_789);
        let b = BagKey::new("/data/run.bag", 1000, 123_456_789);
        let c = BagKey::new("/data/run.bag", 1001, 123_456_789);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.same_bag(&c));
        assert!(!a.same_bag(&BagKey::new("/data/other.bag", 1000, 123_456_789)));
    }

    #[test]
    fn test_resolve_single_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.mcap");
        write_file(&path, &[0u8; 64]);
        set_mtime(&path, 1_700_000_000);

        let key = BagKey::resolve(&path).unwrap();
        assert_eq!(key.realpath, std::fs::canonicalize(&path).unwrap());
        assert_eq!(key.size_bytes, 64);
        assert_eq!(key.mtime_ns, 1_700_000_000 * 1_000_000_000);
    }

    #[test]
    fn test_resolve_unchanged_file_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.bag");
        write_file(&path, b"payload");

        assert_eq!(BagKey::resolve(&path).unwrap(), BagKey::resolve(&path).unwrap());
    }

    #[test]
    fn test_resolve_detects_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.bag");
        write_file(&path, b"payload");
        set_mtime(&path, 1_000);
        let before = BagKey::resolve(&path).unwrap();

        write_file(&path, b"payload, longer");
        set_mtime(&path, 2_000);
        let after = BagKey::resolve(&path).unwrap();

        assert_ne!(before, after);
        assert!(before.same_bag(&after));
    }

    #[test]
    fn test_resolve_missing_path() {
        let dir = tempdir().unwrap();
        let err = BagKey::resolve(dir.path().join("missing.bag")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_through_symlink() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("run.bag");
        write_file(&target, b"payload");
        let link = dir.path().join("latest.bag");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(BagKey::resolve(&link).unwrap(), BagKey::resolve(&target).unwrap());
    }

    #[test]
    fn test_resolve_directory_uses_inner_data_file() {
        let dir = tempdir().unwrap();
        let bag_dir = dir.path().join("run");
        std::fs::create_dir(&bag_dir).unwrap();
        write_file(&bag_dir.join("metadata.yaml"), b"rosbag2_bagfile_information: {}");
        let data = bag_dir.join("run_0.db3");
        write_file(&data, &[1u8; 128]);
        set_mtime(&data, 5_000);

        let key = BagKey::resolve(&bag_dir).unwrap();
        assert_eq!(key.realpath, std::fs::canonicalize(&bag_dir).unwrap());
        assert_eq!(key.size_bytes, 128);
        assert_eq!(key.mtime_ns, 5_000 * 1_000_000_000);
        assert_eq!(
            locate_data_file(&bag_dir).unwrap(),
            std::fs::canonicalize(&data).unwrap()
        );

        // Rewriting the inner file changes the key even though the
        // directory entry list is untouched.
        write_file(&data, &[1u8; 256]);
        let rewritten = BagKey::resolve(&bag_dir).unwrap();
        assert_ne!(key, rewritten);
        assert_eq!(rewritten.size_bytes, 256);
    }

    #[test]
    fn test_resolve_directory_without_data_file() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("metadata.yaml"), b"{}");

        let err = BagKey::resolve(dir.path()).unwrap_err();
        match err {
            Error::AmbiguousBag { candidates, .. } => assert!(candidates.is_empty()),
            other => panic!("expected AmbiguousBag, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_directory_with_split_files() {
        let dir = tempdir().unwrap();
        write_file(&dir.path().join("run_1.db3"), b"b");
        write_file(&dir.path().join("run_0.db3"), b"a");

        let err = BagKey::resolve(dir.path()).unwrap_err();
        match err {
            Error::AmbiguousBag { candidates, .. } => {
                let names: Vec<_> = candidates
                    .iter()
                    .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                    .collect();
                assert_eq!(names, vec!["run_0.db3", "run_1.db3"]);
            }
            other => panic!("expected AmbiguousBag, got {other:?}"),
        }
    }

    #[test]
    fn test_subdirectory_with_data_extension_is_ignored() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested.mcap")).unwrap();
        write_file(&dir.path().join("run.mcap"), b"a");

        assert!(BagKey::resolve(dir.path()).is_ok());
    }

    #[test]
    fn test_expand_home() {
        let plain = Path::new("/data/run.bag");
        assert_eq!(expand_home(plain), plain);

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/run.bag")), home.join("run.bag"));
        }
    }
}
