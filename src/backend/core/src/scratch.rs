//! Per-run scratch directories.

use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

/// A uniquely named directory that is removed when dropped, on success and
/// failure paths alike.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub async fn create(parent: &Path, label: &str) -> Result<Self> {
        let path = parent.join(format!("{}-{}", label, Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scratch_dir_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(parent.path(), "backup").await.unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.is_dir());
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("backup-"));

        drop(scratch);
        for _ in 0..50 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("scratch directory still present");
    }
}
