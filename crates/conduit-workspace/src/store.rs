//! Run-scoped workspace artifacts with ancestry-based visibility.

use crate::blob::MemoryBlobStore;
use crate::keys::{blob_key, digest, normalize_path, rebase};
use chrono::Utc;
use conduit_core::artifact::{MaterializedArtifact, ProducedFile, WorkspaceArtifact};
use conduit_core::ids::{ArtifactId, JobInstanceId, RunId};
use conduit_core::ports::{BlobStore, Lineage};
use conduit_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct RunWorkspace {
    lineage: Arc<dyn Lineage>,
    /// Keyed by (producer, normalized path).
    artifacts: BTreeMap<(JobInstanceId, String), WorkspaceArtifact>,
}

#[derive(Default)]
struct StoreState {
    runs: HashMap<RunId, RunWorkspace>,
    /// Number of artifacts, across runs, pointing at each blob.
    blob_refs: HashMap<String, usize>,
}

/// Workspace store shared by all runs of a scheduler.
///
/// Writes for one key happen at most once: every mutation runs under the
/// store's write lock.
pub struct WorkspaceStore {
    blobs: Arc<dyn BlobStore>,
    state: RwLock<StoreState>,
}

impl WorkspaceStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    /// Register a run and the ancestry relation used for visibility.
    pub async fn open_run(&self, run_id: RunId, lineage: Arc<dyn Lineage>) {
        let mut state = self.state.write().await;
        state.runs.insert(
            run_id,
            RunWorkspace {
                lineage,
                artifacts: BTreeMap::new(),
            },
        );
        debug!(run_id = %run_id, "workspace opened");
    }

    /// Persist files produced by `producer`.
    ///
    /// All-or-nothing: a duplicate or invalid path rejects the whole call.
    pub async fn persist(
        &self,
        run_id: RunId,
        producer: &JobInstanceId,
        files: Vec<ProducedFile>,
    ) -> Result<Vec<WorkspaceArtifact>> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get(&run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

        let mut seen = HashSet::new();
        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let path = normalize_path(&file.path)?;
            let key = (producer.clone(), path.clone());
            if run.artifacts.contains_key(&key) || !seen.insert(path.clone()) {
                return Err(Error::ArtifactAlreadyExists {
                    producer: producer.to_string(),
                    path,
                });
            }
            staged.push((path, file.contents));
        }

        let written = match self.write_blobs(run_id, producer, staged).await {
            Ok(written) => written,
            Err((e, created)) => {
                // Nothing references the blobs this call created yet.
                for key in &created {
                    if let Err(cleanup) = self.blobs.delete(key).await {
                        warn!(key = %key, error = %cleanup, "failed to remove unreferenced blob");
                    }
                }
                return Err(e);
            }
        };

        for artifact in &written {
            *state.blob_refs.entry(artifact.blob_key.clone()).or_insert(0) += 1;
        }
        if let Some(run) = state.runs.get_mut(&run_id) {
            for artifact in &written {
                run.artifacts.insert(
                    (producer.clone(), artifact.path.clone()),
                    artifact.clone(),
                );
            }
        }

        info!(
            run_id = %run_id,
            producer = %producer,
            artifacts = written.len(),
            bytes = written.iter().map(|a| a.size_bytes).sum::<u64>(),
            "persisted workspace artifacts"
        );
        Ok(written)
    }

    /// Store each file's bytes. On failure, returns the keys of blobs written
    /// by this call so the caller can remove them.
    async fn write_blobs(
        &self,
        run_id: RunId,
        producer: &JobInstanceId,
        staged: Vec<(String, Vec<u8>)>,
    ) -> std::result::Result<Vec<WorkspaceArtifact>, (Error, Vec<String>)> {
        let mut created = Vec::new();
        let mut written = Vec::with_capacity(staged.len());
        for (path, contents) in staged {
            let checksum = digest(&contents);
            let key = blob_key(&checksum);
            let size_bytes = contents.len() as u64;
            let exists = match self.blobs.exists(&key).await {
                Ok(exists) => exists,
                Err(e) => return Err((e, created)),
            };
            if !exists {
                if let Err(e) = self.blobs.put(&key, contents).await {
                    return Err((e, created));
                }
                created.push(key.clone());
            }
            written.push(WorkspaceArtifact {
                id: ArtifactId::new(),
                run_id,
                producer: producer.clone(),
                path,
                blob_key: key,
                size_bytes,
                checksum_sha256: checksum,
                created_at: Utc::now(),
            });
        }
        Ok(written)
    }

    /// Fetch every artifact written by an ancestor of `consumer`, rebased
    /// under `root`, in topological-then-path order.
    ///
    /// Two ancestors that persisted the same path fail the attach with
    /// [`Error::ArtifactConflict`] rather than letting one overwrite the other.
    pub async fn attach(
        &self,
        run_id: RunId,
        consumer: &JobInstanceId,
        root: &str,
    ) -> Result<Vec<MaterializedArtifact>> {
        let visible: Vec<WorkspaceArtifact> = {
            let state = self.state.read().await;
            let run = state
                .runs
                .get(&run_id)
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
            let mut visible: Vec<_> = run
                .artifacts
                .values()
                .filter(|a| run.lineage.is_ancestor(&a.producer, consumer))
                .cloned()
                .collect();
            visible.sort_by(|a, b| {
                let pa = run.lineage.position(&a.producer);
                let pb = run.lineage.position(&b.producer);
                pa.cmp(&pb).then_with(|| a.path.cmp(&b.path))
            });
            visible
        };

        if visible.is_empty() {
            return Err(Error::ArtifactNotVisible {
                consumer: consumer.to_string(),
            });
        }
        let mut producers: BTreeMap<&str, Vec<&JobInstanceId>> = BTreeMap::new();
        for artifact in &visible {
            producers
                .entry(artifact.path.as_str())
                .or_default()
                .push(&artifact.producer);
        }
        if let Some((path, jobs)) = producers.into_iter().find(|(_, jobs)| jobs.len() > 1) {
            return Err(Error::ArtifactConflict {
                consumer: consumer.to_string(),
                path: path.to_string(),
                producers: jobs.iter().map(|j| j.to_string()).collect(),
            });
        }

        let mut materialized = Vec::with_capacity(visible.len());
        for artifact in visible {
            let contents = self.blobs.get(&artifact.blob_key).await?.ok_or_else(|| {
                Error::Storage(format!("missing blob {}", artifact.blob_key))
            })?;
            materialized.push(MaterializedArtifact {
                path: rebase(root, &artifact.path),
                contents,
                artifact,
            });
        }
        debug!(
            run_id = %run_id,
            consumer = %consumer,
            root,
            artifacts = materialized.len(),
            "attached workspace"
        );
        Ok(materialized)
    }

    /// Artifacts of a run, ordered by producer then path.
    pub async fn artifacts(&self, run_id: RunId) -> Vec<WorkspaceArtifact> {
        let state = self.state.read().await;
        state
            .runs
            .get(&run_id)
            .map(|run| run.artifacts.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a run's metadata and delete blobs no other run references.
    /// Returns the number of blobs deleted.
    pub async fn retire(&self, run_id: RunId) -> Result<usize> {
        let mut state = self.state.write().await;
        let Some(run) = state.runs.remove(&run_id) else {
            return Ok(0);
        };

        let mut orphaned = Vec::new();
        for artifact in run.artifacts.values() {
            if let Some(count) = state.blob_refs.get_mut(&artifact.blob_key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.blob_refs.remove(&artifact.blob_key);
                    orphaned.push(artifact.blob_key.clone());
                }
            }
        }
        for key in &orphaned {
            self.blobs.delete(key).await?;
        }
        info!(run_id = %run_id, blobs_deleted = orphaned.len(), "workspace retired");
        Ok(orphaned.len())
    }
}
