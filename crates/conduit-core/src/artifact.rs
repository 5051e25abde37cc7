//! Workspace artifact types.

use crate::ids::{ArtifactId, JobInstanceId, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An immutable file persisted by a job for its dependents.
///
/// Keyed by `(run_id, producer, path)`; the bytes live in the blob store
/// under `blob_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct WorkspaceArtifact {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub producer: JobInstanceId,
    /// Normalized, relative to the persist root.
    pub path: String,
    pub blob_key: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
    pub created_at: DateTime<Utc>,
}

/// A file a worker reports for `persist_to_workspace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub path: String,
    pub contents: Vec<u8>,
}

impl ProducedFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// An artifact fetched for a consumer, rebased under its attach root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedArtifact {
    pub artifact: WorkspaceArtifact,
    pub path: String,
    pub contents: Vec<u8>,
}
