//! Workspace artifact store for Conduit.
//!
//! Jobs do not share process state; files handed from a producer to its
//! dependents go through this store. Metadata is kept per run, the bytes are
//! content-addressed in a [`BlobStore`](conduit_core::ports::BlobStore).

pub mod blob;
pub mod compression;
pub mod keys;
pub mod store;

pub use blob::{FilesystemBlobStore, MemoryBlobStore};
pub use compression::{CompressionType, compress, decompress};
pub use keys::{blob_key, normalize_path, rebase, sanitize_key};
pub use store::WorkspaceStore;
