use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use slatedb::object_store::{ObjectStore, PutPayload, path::Path as ObjectPath};
use thiserror::Error;

use crate::settings::Backend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object store location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    ObjectStore(#[from] slatedb::object_store::Error),
}

/// Result of resolving an object store, includes the canonical path used
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub canonical_path: String,
}

pub fn resolve_object_store(backend: &Backend, path: &str) -> Result<ResolvedStore, StorageError> {
    match backend {
        Backend::Fs => {
            let root = Path::new(path);
            if !root.exists() {
                fs::create_dir_all(root).map_err(|e| {
                    StorageError::InvalidLocation(format!("failed to create fs root {}: {}", path, e))
                })?;
            }
            // Canonicalize so relative paths resolve the same way on every open
            let canonical_path = root.canonicalize().map_err(|e| {
                StorageError::InvalidLocation(format!("failed to canonicalize path {}: {}", path, e))
            })?;
            let canonical_str = canonical_path.to_string_lossy().to_string();
            let fs = slatedb::object_store::local::LocalFileSystem::new_with_prefix(&canonical_str)
                .map_err(|e| StorageError::InvalidLocation(e.to_string()))?;
            Ok(ResolvedStore {
                store: Arc::new(fs),
                canonical_path: canonical_str,
            })
        }
        Backend::Memory => Ok(ResolvedStore {
            store: Arc::new(slatedb::object_store::memory::InMemory::new()),
            canonical_path: path.to_string(),
        }),
    }
}

/// Object path for `key` inside `bucket`; buckets map to top-level prefixes.
pub fn object_path(bucket: &str, key: &str) -> ObjectPath {
    ObjectPath::from(format!("{}/{}", bucket.trim_matches('/'), key.trim_start_matches('/')))
}

pub async fn put_object(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    body: Bytes,
) -> Result<(), StorageError> {
    store
        .put(&object_path(bucket, key), PutPayload::from(body))
        .await?;
    Ok(())
}
