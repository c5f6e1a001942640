//! mockprep-store: File-backed persistence.
//!
//! Session checkpoints and the submission spool each live in a directory of
//! JSON files, one per key. Every write goes to a temporary file in the same
//! directory and is renamed into place, so a crash never leaves a torn file.

pub mod progress;
pub mod spool;

use std::path::Path;

use mockprep_core::error::StoreError;

pub use progress::FileProgressStore;
pub use spool::FileSpool;

/// Map an arbitrary key onto a safe file name.
pub(crate) fn file_name(key: &str) -> String {
    let stem: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "_.json".to_string()
    } else {
        format!("{stem}.json")
    }
}

/// Write `bytes` to `dir/name` via a temp file and rename.
pub(crate) fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;

    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| StoreError::Io(e.error.to_string()))?;
    Ok(())
}

/// Read `path`, treating a missing file as `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove `path`, treating a missing file as success.
pub(crate) fn remove_optional(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Run blocking filesystem work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_are_flattened() {
        assert_eq!(file_name("s-1_a.b"), "s-1_a.b.json");
        assert_eq!(file_name("../etc/passwd"), "_etc_passwd.json");
        assert_eq!(file_name("a/b c"), "a_b_c.json");
        assert_eq!(file_name(""), "_.json");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path(), "x.json", b"one").unwrap();
        write_atomic(dir.path(), "x.json", b"two").unwrap();
        assert_eq!(std::fs::read(dir.path().join("x.json")).unwrap(), b"two");

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_files_are_not_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
        remove_optional(&dir.path().join("nope")).unwrap();
    }
}
