//! File system utilities for the cache directories

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::Result;

/// Ensures a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("Path exists but is not a directory: {:?}", path),
        )
        .into());
    }
    Ok(())
}

/// Writes `contents` so that either the old or the new file is visible, never a torn one.
///
/// The bytes go to a temporary sibling which is synced, renamed over `path`,
/// and the parent directory is synced afterwards so the rename survives a crash.
pub fn write_file_durable<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Path has no parent directory: {}", path.display()),
        )
    })?;
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Lists all files in a directory with a specific extension.
///
/// A missing directory yields an empty list.
pub fn list_files_with_extension<P: AsRef<Path>>(dir: P, extension: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();

    if !dir.exists() {
        return Ok(files);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == extension) {
            files.push(path);
        }
    }

    // read_dir order is platform dependent
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_dir() {
        let temp_dir = tempdir().unwrap();
        let test_dir = temp_dir.path().join("test_dir");

        ensure_dir(&test_dir).unwrap();
        assert!(test_dir.is_dir());

        // Already existing is fine
        ensure_dir(&test_dir).unwrap();

        let file = temp_dir.path().join("plain");
        File::create(&file).unwrap();
        assert!(ensure_dir(&file).is_err());
    }

    #[test]
    fn test_write_file_durable_replaces_content() {
        let temp_dir = tempdir().unwrap();
        let target = temp_dir.path().join("nested").join("entry.json");

        write_file_durable(&target, b"first").unwrap();
        write_file_durable(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        // No temporary siblings left behind
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_list_files_with_extension() {
        let temp_dir = tempdir().unwrap();
        for file in ["b.json", "a.json", "c.log"] {
            let mut f = File::create(temp_dir.path().join(file)).unwrap();
            write!(f, "{{}}").unwrap();
        }

        let json_files = list_files_with_extension(temp_dir.path(), "json").unwrap();
        assert_eq!(json_files.len(), 2);
        assert!(json_files[0].ends_with("a.json"));

        let missing = list_files_with_extension(temp_dir.path().join("nope"), "json").unwrap();
        assert!(missing.is_empty());
    }
}
