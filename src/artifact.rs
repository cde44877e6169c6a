//! Request-scoped temporary files.
//!
//! Every file a request writes is wrapped in a [`TransientArtifact`]. Dropping
//! the artifact deletes the file, so an early return or `?` anywhere in the
//! handler still frees the disk. Deletion failures are logged and swallowed.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::{Builder, NamedTempFile, TempPath};

#[derive(Debug)]
pub struct TransientArtifact {
    path: Option<TempPath>,
}

impl TransientArtifact {
    /// Create an empty file named `<prefix><random><suffix>` inside `dir`.
    pub fn create(dir: &Path, prefix: &str, suffix: &str) -> Result<(Self, std::fs::File)> {
        let file = Self::named(dir, prefix, suffix)?;
        let (handle, path) = file.into_parts();
        Ok((Self { path: Some(path) }, handle))
    }

    /// Create a file inside `dir` holding `bytes`.
    pub fn write(dir: &Path, prefix: &str, suffix: &str, bytes: &[u8]) -> Result<Self> {
        let mut file = Self::named(dir, prefix, suffix)?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", file.path().display()))?;
        file.flush()?;
        Ok(Self {
            path: Some(file.into_temp_path()),
        })
    }

    fn named(dir: &Path, prefix: &str, suffix: &str) -> Result<NamedTempFile> {
        Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)
            .with_context(|| format!("failed to create temporary file in {}", dir.display()))
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for TransientArtifact {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let display = path.display().to_string();
            if let Err(err) = path.close() {
                log::warn!("failed to remove temporary file {}: {}", display, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let artifact = TransientArtifact::write(dir.path(), "temp_", ".jpg", b"frame").unwrap();
        let path = artifact.path().to_path_buf();

        assert!(path.starts_with(dir.path()));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("temp_"));
        assert_eq!(std::fs::read(&path).unwrap(), b"frame");

        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn already_deleted_file_does_not_panic() {
        let dir = tempdir().unwrap();
        let (artifact, _handle) = TransientArtifact::create(dir.path(), "annotated_", ".jpg").unwrap();
        std::fs::remove_file(artifact.path()).unwrap();
        drop(artifact);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(TransientArtifact::write(&missing, "temp_", ".jpg", b"x").is_err());
    }
}
