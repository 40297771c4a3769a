//! The artifact store is the persistence collaborator of the scheduler: it
//! maps file references to source paths, owns the on-disk layout of derived
//! artifacts and answers "which files are still missing kind X".

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;
use walkdir::WalkDir;

use crate::artifact::{ArtifactKind, FileRef};

/// Source containers picked up when scanning the media root.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "mov", "avi", "m4v", "wmv", "flv", "ts",
];

/// What a finished plan hands to the store.
#[derive(Debug)]
pub enum ArtifactOutput {
    /// The artifact was captured from the tool's stdout.
    Bytes(Vec<u8>),
    /// The tool wrote the artifact to a staging path next to its final
    /// location.
    Staged(PathBuf),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Absolute path of the source media file.
    fn resolve(&self, file: &FileRef) -> PathBuf;

    /// Final location of the artifact. Parent directories are created.
    async fn output_path(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
    ) -> std::io::Result<PathBuf>;

    /// Atomically install the artifact at its final location.
    async fn persist(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
        output: ArtifactOutput,
    ) -> std::io::Result<PathBuf>;

    /// Up to `limit` files that do not have `kind` yet.
    async fn missing(
        &self,
        kind: ArtifactKind,
        limit: usize,
    ) -> std::io::Result<Vec<FileRef>>;
}

/// Content-addressed artifact cache on the local filesystem:
/// `<cache>/<kind>/<sha[..2]>/<sha>.<ext>`, keyed by the file reference.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    media_root: Option<PathBuf>,
    cache_root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(media_root: Option<PathBuf>, cache_root: PathBuf) -> Self {
        Self {
            media_root,
            cache_root,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn media_root(&self) -> Option<&Path> {
        self.media_root.as_deref()
    }

    pub fn artifact_path(&self, file: &FileRef, kind: ArtifactKind) -> PathBuf {
        artifact_path(&self.cache_root, file, kind)
    }

    /// Create one directory per artifact kind under the cache root.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for kind in ArtifactKind::ALL {
            std::fs::create_dir_all(self.cache_root.join(kind.as_str()))?;
        }
        Ok(())
    }
}

fn artifact_path(cache_root: &Path, file: &FileRef, kind: ArtifactKind) -> PathBuf {
    let digest = hex::encode(Sha256::digest(file.as_str().as_bytes()));
    cache_root
        .join(kind.as_str())
        .join(&digest[..2])
        .join(format!("{digest}.{}", kind.extension()))
}

fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn resolve(&self, file: &FileRef) -> PathBuf {
        let path = file.as_path();
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.media_root {
            Some(root) => root.join(path),
            None => path.to_path_buf(),
        }
    }

    async fn output_path(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
    ) -> std::io::Result<PathBuf> {
        let path = self.artifact_path(file, kind);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    async fn persist(
        &self,
        file: &FileRef,
        kind: ArtifactKind,
        output: ArtifactOutput,
    ) -> std::io::Result<PathBuf> {
        let path = self.output_path(file, kind).await?;
        match output {
            ArtifactOutput::Staged(staged) => {
                tokio::fs::rename(&staged, &path).await?;
            }
            ArtifactOutput::Bytes(bytes) => {
                let target = path.clone();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    let dir = target.parent().unwrap_or(Path::new("."));
                    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
                    tmp.write_all(&bytes)?;
                    tmp.persist(&target).map_err(|err| err.error)?;
                    Ok(())
                })
                .await
                .map_err(std::io::Error::other)??;
            }
        }
        debug!(file = %file, kind = %kind, path = %path.display(), "artifact stored");
        Ok(path)
    }

    async fn missing(
        &self,
        kind: ArtifactKind,
        limit: usize,
    ) -> std::io::Result<Vec<FileRef>> {
        let Some(root) = self.media_root.clone() else {
            return Ok(Vec::new());
        };
        let cache_root = self.cache_root.clone();

        tokio::task::spawn_blocking(move || {
            let mut missing = Vec::new();
            for entry in WalkDir::new(&root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
            {
                if missing.len() >= limit {
                    break;
                }
                if !entry.file_type().is_file() || !is_video(entry.path()) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let Some(file) = FileRef::new(relative.to_string_lossy()) else {
                    continue;
                };
                if !artifact_path(&cache_root, &file, kind).exists() {
                    missing.push(file);
                }
            }
            missing
        })
        .await
        .map_err(std::io::Error::other)
    }
}
