//! Crash-safe snapshot writes.

use super::bucket::temp_path;
use crate::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Replaces `path` with `contents` so readers see either the old or the new file.
///
/// Writes a sibling temp file, syncs it, then renames it over `path`. A crash
/// before the rename leaves the previous snapshot intact and an orphaned
/// temp file behind.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_path(path);

    let mut file = File::create(&tmp).map_err(|e| io_error("create_temp_file", &tmp, &e))?;
    file.write_all(contents)
        .map_err(|e| io_error("write_temp_file", &tmp, &e))?;
    file.sync_all()
        .map_err(|e| io_error("sync_temp_file", &tmp, &e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_error("rename_temp_file", path, &e))?;

    Ok(())
}

fn io_error(operation: &str, path: &Path, err: &std::io::Error) -> Error {
    Error::OperationFailed {
        operation: operation.to_string(),
        cause: format!("{}: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_contents() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bucket.bloom");

        atomic_write(&path, b"first").expect("write");
        atomic_write(&path, b"second").expect("write");

        assert_eq!(fs::read(&path).expect("read"), b"second");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_atomic_write_fails_without_directory() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("missing").join("bucket.bloom");

        let err = atomic_write(&path, b"data").expect_err("must fail");
        assert!(err.to_string().contains("create_temp_file"));
    }
}
