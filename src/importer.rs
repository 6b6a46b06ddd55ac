use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{ImportError, ManifestError};
use crate::manifest::{self, DocNode};
use crate::models::{Activity, Package};
use crate::packages::PackageRepo;
use crate::storage::ContentStore;
use crate::structure::build_manifest;

/// A successfully published package.
#[derive(Debug, Clone, Serialize)]
pub struct ImportOutcome {
    pub package: Package,
    pub activities: Vec<Activity>,
    pub warnings: Vec<String>,
    pub storage_location: String,
}

#[derive(Clone)]
pub struct PackageImporter {
    packages: PackageRepo,
    store: Arc<dyn ContentStore>,
    max_bytes: u64,
}

impl PackageImporter {
    pub fn new(packages: PackageRepo, store: Arc<dyn ContentStore>, max_bytes: u64) -> Self {
        PackageImporter { packages, store, max_bytes }
    }

    /// Validate, unpack and publish a cmi5 zip.
    ///
    /// Nothing is visible to readers until the final database commit; an
    /// import abandoned or failed before then leaves no package behind.
    pub async fn import_package(
        &self,
        archive: Vec<u8>,
        course_id: Option<Uuid>,
        uploaded_by: Uuid,
    ) -> Result<ImportOutcome, ImportError> {
        let size = archive.len() as u64;
        if size > self.max_bytes {
            return Err(ImportError::TooLarge { size, max: self.max_bytes });
        }
        tracing::info!(bytes = size, "importing cmi5 package");

        let (workdir, content_root, doc) = tokio::task::spawn_blocking(move || unpack(&archive))
            .await
            .map_err(|e| ImportError::Storage(e.into()))??;

        let package_id = Uuid::new_v4();
        let built = build_manifest(&doc, package_id)?;

        let storage_location = self.store.save(package_id, &content_root).await?;
        drop(workdir);

        let course = &built.manifest.course;
        let activities: Vec<&Activity> = course.activities_in_order();
        let package = Package {
            id: package_id,
            title: built.manifest.title.clone(),
            description: built.manifest.description.clone(),
            course_id,
            storage_location: storage_location.clone(),
            byte_size: size as i64,
            uploaded_by,
            version: built.manifest.version.clone(),
            is_valid: built.errors.is_empty(),
            validation_errors: built.errors.clone(),
            warnings: built.warnings.clone(),
            created_at: Utc::now(),
            manifest: built.manifest.clone(),
        };

        if let Err(e) = self.packages.insert(&package, &activities).await {
            tracing::error!(%package_id, error = %e, "package publish failed; removing content");
            if let Err(cleanup) = self.store.delete(package_id).await {
                tracing::warn!(%package_id, error = %cleanup, "content cleanup failed");
            }
            return Err(e.into());
        }

        tracing::info!(
            %package_id,
            activities = activities.len(),
            warnings = built.warnings.len(),
            valid = package.is_valid,
            "package imported"
        );
        let activities = activities.into_iter().cloned().collect();
        Ok(ImportOutcome { package, activities, warnings: built.warnings, storage_location })
    }

    /// Rebind a package to another course.
    pub async fn assign_package_to_course(&self, package_id: Uuid, course_id: Uuid) -> Result<(), ImportError> {
        if !self.packages.set_course(package_id, course_id).await? {
            return Err(ImportError::NotFound(package_id));
        }
        tracing::info!(%package_id, %course_id, "package assigned to course");
        Ok(())
    }

    /// Remove the record first so new launches fail, then the content.
    /// Launches that already hold their descriptor are unaffected.
    ///
    /// Deleting an id with no record still sweeps its content, so retrying a
    /// delete whose content removal failed finishes the job before reporting
    /// `NotFound`.
    pub async fn delete_package(&self, package_id: Uuid) -> Result<(), ImportError> {
        if !self.packages.delete(package_id).await? {
            self.store.delete(package_id).await?;
            return Err(ImportError::NotFound(package_id));
        }
        self.store.delete(package_id).await?;
        tracing::info!(%package_id, "package deleted");
        Ok(())
    }

    pub async fn get_activities(&self, package_id: Uuid) -> Result<Vec<Activity>, ImportError> {
        if self.packages.get(package_id).await?.is_none() {
            return Err(ImportError::NotFound(package_id));
        }
        Ok(self.packages.activities(package_id).await?)
    }
}

/// Extract into a scratch directory and parse the manifest. The returned
/// content root is the directory holding `cmi5.xml`.
fn unpack(archive: &[u8]) -> Result<(tempfile::TempDir, std::path::PathBuf, DocNode), ImportError> {
    let workdir = tempfile::tempdir().map_err(ManifestError::Io)?;
    manifest::extract_zip_to_dir(archive, workdir.path())?;
    let manifest_path = manifest::find_manifest(workdir.path())?;
    let doc = manifest::parse_manifest_file(&manifest_path)?;
    let content_root = manifest_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| workdir.path().to_path_buf());
    Ok((workdir, content_root, doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::FsContentStore;
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Filesystem store whose first `delete` fails.
    struct FailsFirstDelete {
        inner: FsContentStore,
        deletes: AtomicU32,
    }

    #[async_trait]
    impl ContentStore for FailsFirstDelete {
        async fn save(&self, package_id: Uuid, source: &Path) -> Result<String, StorageError> {
            self.inner.save(package_id, source).await
        }

        async fn delete(&self, package_id: Uuid) -> Result<(), StorageError> {
            if self.deletes.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StorageError::Io(std::io::Error::other("disk went away")));
            }
            self.inner.delete(package_id).await
        }
    }

    fn archive() -> Vec<u8> {
        let manifest = r#"<courseStructure><course id="https://example.com/c"><title>C</title></course>
            <au id="https://example.com/au/a" moveOn="Completed"><title>A</title><url>a.html</url></au></courseStructure>"#;
        let mut bytes = Vec::new();
        {
            let mut zw = zip::ZipWriter::new(std::io::Cursor::new(&mut bytes));
            let opts = zip::write::FileOptions::default();
            zw.start_file("cmi5.xml", opts).unwrap();
            zw.write_all(manifest.as_bytes()).unwrap();
            zw.start_file("a.html", opts).unwrap();
            zw.write_all(b"<html/>").unwrap();
            zw.finish().unwrap();
        }
        bytes
    }

    #[tokio::test]
    async fn retried_delete_removes_content_left_by_a_failed_one() {
        let db = crate::db::connect_in_memory().await.unwrap();
        let data = tempfile::tempdir().unwrap();
        let store = Arc::new(FailsFirstDelete { inner: FsContentStore::new(data.path()), deletes: AtomicU32::new(0) });
        let importer = PackageImporter::new(PackageRepo::new(db), store.clone(), 1024 * 1024);

        let out = importer.import_package(archive(), None, Uuid::new_v4()).await.unwrap();
        let id = out.package.id;
        let content = data.path().join(&out.storage_location);
        assert!(content.join("a.html").is_file());

        let err = importer.delete_package(id).await.unwrap_err();
        assert!(matches!(err, ImportError::Storage(_)));
        assert!(content.exists());

        let err = importer.delete_package(id).await.unwrap_err();
        assert!(matches!(err, ImportError::NotFound(_)));
        assert!(!content.exists());
        assert_eq!(store.deletes.load(Ordering::SeqCst), 2);
    }
}
