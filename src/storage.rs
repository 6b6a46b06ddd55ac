use async_trait::async_trait;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::StorageError;

/// Durable home for extracted package content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Copy `source` in as the content of `package_id`; returns the storage
    /// location recorded on the package.
    async fn save(&self, package_id: Uuid, source: &Path) -> Result<String, StorageError>;

    /// Remove a package's content. Missing content is not an error.
    async fn delete(&self, package_id: Uuid) -> Result<(), StorageError>;
}

/// Stores each package under `<data_dir>/packages/<uuid>`.
#[derive(Clone, Debug)]
pub struct FsContentStore {
    data_dir: PathBuf,
}

impl FsContentStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        FsContentStore { data_dir: data_dir.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn relative(package_id: Uuid) -> String {
        format!("packages/{package_id}")
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn save(&self, package_id: Uuid, source: &Path) -> Result<String, StorageError> {
        let rel = Self::relative(package_id);
        let dest = self.data_dir.join(&rel);
        let staging = self.data_dir.join(format!("packages/.{package_id}.partial"));
        let source = source.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            copy_tree(&source, &staging)?;
            // publish the finished copy in one step
            std::fs::rename(&staging, &dest)?;
            Ok(())
        })
        .await??;

        tracing::debug!(%package_id, location = %rel, "package content stored");
        Ok(rel)
    }

    async fn delete(&self, package_id: Uuid) -> Result<(), StorageError> {
        let dir = self.data_dir.join(Self::relative(package_id));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry.path().strip_prefix(from).map_err(std::io::Error::other)?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
