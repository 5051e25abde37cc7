//! Per-job working directories.

use conduit_core::artifact::{MaterializedArtifact, ProducedFile};
use conduit_core::ids::{JobInstanceId, RunId};
use conduit_core::{Error, Result};
use conduit_workspace::normalize_path;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Scratch directory a job's steps run in. Removed on drop unless kept.
#[derive(Debug)]
pub struct JobDirectory {
    path: PathBuf,
    temp: Option<TempDir>,
}

impl JobDirectory {
    /// Kept directories are `<root>/<run>/<job>-<attempt>`; others are
    /// temp dirs, under `<root>/<run>` when a root is set.
    pub async fn create(
        root: Option<&Path>,
        run_id: RunId,
        job: &JobInstanceId,
        attempt: u32,
        keep: bool,
    ) -> Result<Self> {
        if keep {
            let parent = root
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir)
                .join(run_id.to_string());
            let path = parent.join(format!("{}-{}", job, attempt));
            tokio::fs::create_dir_all(&path).await?;
            return Ok(Self { path, temp: None });
        }

        let prefix = format!("conduit-{}-", job);
        let temp = match root {
            Some(root) => {
                let parent = root.join(run_id.to_string());
                tokio::fs::create_dir_all(&parent).await?;
                tempfile::Builder::new().prefix(&prefix).tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix(&prefix).tempdir()?,
        };
        Ok(Self {
            path: temp.path().to_path_buf(),
            temp: Some(temp),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Write attached workspace files into the directory. Absolute attach
    /// roots land inside it too.
    pub async fn materialize(&self, attachments: &[MaterializedArtifact]) -> Result<()> {
        for file in attachments {
            let relative = normalize_path(file.path.trim_start_matches('/'))?;
            let target = self.path.join(&relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.contents).await?;
        }
        if !attachments.is_empty() {
            info!(files = attachments.len(), "attached workspace files");
        }
        Ok(())
    }

    /// Collect `paths` under `root` for persisting. Directories are walked
    /// recursively; stored paths are relative to `root`.
    pub async fn collect(&self, root: &str, paths: &[String]) -> Result<Vec<ProducedFile>> {
        let base = match root.trim() {
            "" | "." => self.path.clone(),
            root => self.path.join(normalize_path(root)?),
        };

        let mut produced = Vec::new();
        for path in paths {
            let relative = normalize_path(path)?;
            let target = base.join(&relative);
            let metadata = tokio::fs::metadata(&target).await.map_err(|e| {
                Error::Storage(format!("cannot persist '{}' from '{}': {}", path, root, e))
            })?;
            if metadata.is_dir() {
                walk(&base, &target, &mut produced).await?;
            } else {
                let contents = tokio::fs::read(&target).await?;
                produced.push(ProducedFile::new(relative, contents));
            }
        }
        debug!(root, files = produced.len(), "collected files to persist");
        Ok(produced)
    }
}

async fn walk(base: &Path, dir: &Path, out: &mut Vec<ProducedFile>) -> Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    let mut found = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    for path in found {
        let relative = path
            .strip_prefix(base)
            .map_err(|e| Error::Internal(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let contents = tokio::fs::read(&path).await?;
        out.push(ProducedFile::new(relative, contents));
    }
    Ok(())
}
