// locating model and dataset artifacts on disk, fetching them when absent.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use mlworker_core::{is_valid_project_key, ArtifactRef};
use tokio::fs;
use tracing::{debug, info};

use crate::error::ArtifactError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Model,
    Dataset,
}

impl ArtifactKind {
    // directory holding artifacts of this kind inside a project
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Model => "models",
            ArtifactKind::Dataset => "datasets",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Model => "model",
            ArtifactKind::Dataset => "dataset",
        })
    }
}

// downloads an artifact into `dest` when it is not available locally
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(
        &self,
        kind: ArtifactKind,
        artifact: &ArtifactRef,
        dest: &Path,
    ) -> Result<(), ArtifactError>;
}

// fetcher copying artifacts out of another projects tree (a shared mount)
#[derive(Debug, Clone)]
pub struct MirrorFetcher {
    root: PathBuf,
}

impl MirrorFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactFetcher for MirrorFetcher {
    async fn fetch(
        &self,
        kind: ArtifactKind,
        artifact: &ArtifactRef,
        dest: &Path,
    ) -> Result<(), ArtifactError> {
        let source = artifact_path(&self.root, kind, artifact);
        if !fs::try_exists(&source).await? {
            return Err(ArtifactError::NotFound {
                kind,
                project_key: artifact.project_key.clone(),
                id: artifact.id,
            });
        }
        fs::create_dir_all(dest).await?;
        let mut entries = fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::copy(entry.path(), dest.join(entry.file_name())).await?;
            }
        }
        Ok(())
    }
}

fn artifact_path(root: &Path, kind: ArtifactKind, artifact: &ArtifactRef) -> PathBuf {
    root.join(&artifact.project_key)
        .join(kind.dir_name())
        .join(artifact.id.to_string())
}

// maps artifact references to local directories
#[derive(Clone)]
pub struct ArtifactResolver {
    projects_dir: PathBuf,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
}

impl fmt::Debug for ArtifactResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactResolver")
            .field("projects_dir", &self.projects_dir)
            .field("fetcher", &self.fetcher.is_some())
            .finish()
    }
}

impl ArtifactResolver {
    pub fn new(projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            fetcher: None,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    // unchecked path; resolve rejects keys outside the projects dir
    pub fn local_dir(&self, kind: ArtifactKind, artifact: &ArtifactRef) -> PathBuf {
        artifact_path(&self.projects_dir, kind, artifact)
    }

    pub async fn resolve(
        &self,
        kind: ArtifactKind,
        artifact: &ArtifactRef,
    ) -> Result<PathBuf, ArtifactError> {
        if !is_valid_project_key(&artifact.project_key) {
            return Err(ArtifactError::InvalidProjectKey(artifact.project_key.clone()));
        }
        let dir = self.local_dir(kind, artifact);
        if fs::try_exists(&dir).await? {
            debug!(%kind, id = %artifact.id, path = %dir.display(), "artifact found locally");
            return Ok(dir);
        }

        let Some(fetcher) = &self.fetcher else {
            return Err(ArtifactError::NotFound {
                kind,
                project_key: artifact.project_key.clone(),
                id: artifact.id,
            });
        };

        info!(%kind, id = %artifact.id, project = %artifact.project_key, "fetching artifact");
        // download next to the final location, then move it in place
        let staging = dir.with_extension("partial");
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        if let Err(err) = fetcher.fetch(kind, artifact, &staging).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        fs::rename(&staging, &dir).await?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn missing_artifact_without_fetcher() {
        let home = tempfile::tempdir().expect("tempdir");
        let resolver = ArtifactResolver::new(home.path());
        let artifact = ArtifactRef::new("credit", Uuid::from_u128(5));
        let err = resolver
            .resolve(ArtifactKind::Dataset, &artifact)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { kind: ArtifactKind::Dataset, .. }));
    }

    #[tokio::test]
    async fn project_keys_cannot_leave_the_projects_dir() {
        let home = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let mirror = tempfile::tempdir().expect("tempdir");
        let resolver = ArtifactResolver::new(home.path())
            .with_fetcher(Arc::new(MirrorFetcher::new(mirror.path())));

        let outside_key = outside.path().to_string_lossy().into_owned();
        for key in [outside_key.as_str(), "..", "", "credit/../.."] {
            let artifact = ArtifactRef::new(key, Uuid::from_u128(5));
            let err = resolver
                .resolve(ArtifactKind::Model, &artifact)
                .await
                .unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidProjectKey(_)), "{key:?}: {err}");
        }
        assert_eq!(std::fs::read_dir(outside.path()).expect("read_dir").count(), 0);
    }

    #[tokio::test]
    async fn local_artifact_resolves_in_place() {
        let home = tempfile::tempdir().expect("tempdir");
        let resolver = ArtifactResolver::new(home.path());
        let artifact = ArtifactRef::new("credit", Uuid::from_u128(5));
        let dir = resolver.local_dir(ArtifactKind::Model, &artifact);
        std::fs::create_dir_all(&dir).expect("mkdir");

        let resolved = resolver
            .resolve(ArtifactKind::Model, &artifact)
            .await
            .expect("resolve");
        assert_eq!(resolved, dir);
        assert!(resolved.ends_with(format!("credit/models/{}", artifact.id)));
    }

    #[tokio::test]
    async fn mirror_fetcher_copies_into_place() {
        let mirror = tempfile::tempdir().expect("tempdir");
        let home = tempfile::tempdir().expect("tempdir");
        let artifact = ArtifactRef::new("credit", Uuid::from_u128(9));

        let source = artifact_path(mirror.path(), ArtifactKind::Dataset, &artifact);
        std::fs::create_dir_all(&source).expect("mkdir");
        std::fs::write(source.join("data.csv"), "a\n1\n").expect("write");

        let resolver = ArtifactResolver::new(home.path())
            .with_fetcher(Arc::new(MirrorFetcher::new(mirror.path())));
        let dir = resolver
            .resolve(ArtifactKind::Dataset, &artifact)
            .await
            .expect("resolve");
        assert_eq!(
            std::fs::read_to_string(dir.join("data.csv")).expect("read"),
            "a\n1\n"
        );
    }
}
