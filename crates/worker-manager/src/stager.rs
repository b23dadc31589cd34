//! Staging of model artifacts into the local model directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use worker_core::{Error, ModelVariant, ObjectStorage, ObjectUrl, Result};

/// Result of [`ArtifactStager::ensure_staged`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Directory was already present; nothing was fetched
    Cached(PathBuf),
    /// Artifacts were downloaded
    Downloaded { path: PathBuf, files: usize },
}

impl StageOutcome {
    pub fn path(&self) -> &Path {
        match self {
            StageOutcome::Cached(path) => path,
            StageOutcome::Downloaded { path, .. } => path,
        }
    }
}

/// Makes sure a variant's artifacts exist under `<model_dir>/<variant>/`.
///
/// Downloads land in a uniquely named partial directory that is renamed into
/// place, so a variant directory is either complete or absent.
pub struct ArtifactStager {
    storage: Arc<dyn ObjectStorage>,
    model_dir: PathBuf,
    repository: ObjectUrl,
}

impl ArtifactStager {
    pub fn new(storage: Arc<dyn ObjectStorage>, model_dir: impl Into<PathBuf>, repository: ObjectUrl) -> Self {
        Self {
            storage,
            model_dir: model_dir.into(),
            repository,
        }
    }

    pub fn variant_dir(&self, variant: &ModelVariant) -> PathBuf {
        self.model_dir.join(variant.as_str())
    }

    pub async fn ensure_staged(&self, variant: &ModelVariant) -> Result<StageOutcome> {
        let target = self.variant_dir(variant);
        if tokio::fs::try_exists(&target).await? {
            debug!(variant = %variant, "Artifacts already staged");
            return Ok(StageOutcome::Cached(target));
        }

        let prefix = self.repository.join(variant.as_str());
        let keys = self.storage.list(&prefix).await?;
        if keys.is_empty() {
            return Err(Error::upstream(format!(
                "no artifacts for {} under {}",
                variant, prefix
            )));
        }

        let partial = self
            .model_dir
            .join(format!(".partial-{}-{}", variant, Uuid::new_v4()));
        tokio::fs::create_dir_all(&partial).await?;

        if let Err(e) = self
            .storage
            .download(prefix.bucket(), &prefix.dir_key(), &keys, &partial)
            .await
        {
            remove_partial(&partial).await;
            return Err(e);
        }

        match tokio::fs::rename(&partial, &target).await {
            Ok(()) => {
                info!(variant = %variant, files = keys.len(), "Staged model artifacts");
                Ok(StageOutcome::Downloaded {
                    path: target,
                    files: keys.len(),
                })
            }
            Err(_) if tokio::fs::try_exists(&target).await.unwrap_or(false) => {
                // Another load of the same variant finished staging first.
                remove_partial(&partial).await;
                Ok(StageOutcome::Cached(target))
            }
            Err(e) => {
                remove_partial(&partial).await;
                Err(Error::Io(e))
            }
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove partial staging directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker_core::InMemoryObjectStorage;

    fn stager(storage: Arc<InMemoryObjectStorage>, model_dir: &Path) -> ArtifactStager {
        ArtifactStager::new(storage, model_dir, ObjectUrl::parse("mem://models").unwrap())
    }

    #[tokio::test]
    async fn test_second_stage_is_cached() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        storage.put("models", "resnet50_4/1/model.pt", b"weights".to_vec());
        storage.put("models", "resnet50_4/labels.txt", b"cat".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(storage.clone(), dir.path());
        let variant = ModelVariant::new("resnet50_4").unwrap();

        let first = stager.ensure_staged(&variant).await.unwrap();
        assert!(matches!(first, StageOutcome::Downloaded { files: 2, .. }));
        assert!(first.path().join("1/model.pt").exists());
        assert_eq!(storage.download_calls(), 1);

        let second = stager.ensure_staged(&variant).await.unwrap();
        assert_eq!(second, StageOutcome::Cached(dir.path().join("resnet50_4")));
        assert_eq!(storage.download_calls(), 1);
        assert_eq!(storage.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(storage, dir.path());
        let variant = ModelVariant::new("absent_1").unwrap();

        let err = stager.ensure_staged(&variant).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert!(!stager.variant_dir(&variant).exists());
    }

    #[tokio::test]
    async fn test_concurrent_staging_converges() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        storage.put("models", "mobilenet_2/saved_model.pb", b"graph".to_vec());
        let dir = tempfile::tempdir().unwrap();
        let stager = stager(storage, dir.path());
        let variant = ModelVariant::new("mobilenet_2").unwrap();

        let (a, b) = tokio::join!(stager.ensure_staged(&variant), stager.ensure_staged(&variant));
        assert!(a.is_ok() && b.is_ok());
        assert!(dir.path().join("mobilenet_2/saved_model.pb").exists());

        let mut leftovers = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["mobilenet_2"]);
    }
}
