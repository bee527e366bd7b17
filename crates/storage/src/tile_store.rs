//! Byte store for rendered tiles (S3, local disk or in-memory).

use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path, ObjectStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use tiles_common::{TileError, TileResult};

/// Tile storage backend selection. Which backend runs is a deployment
/// concern; all of them expose the same byte-addressed contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum TileStoreConfig {
    /// S3-compatible object storage (AWS or MinIO).
    S3 {
        endpoint: String,
        bucket: String,
        access_key_id: String,
        secret_access_key: String,
        region: String,
        allow_http: bool,
    },
    /// Local filesystem rooted at a directory.
    Disk { root: String },
    /// In-memory map; used by tests.
    Memory,
}

/// Byte store for rendered tile payloads.
///
/// A dumb key→bytes map: key construction (and with it all cache-coherence
/// semantics) belongs to the caller. Absence is a normal return value.
pub struct TileStore {
    store: Arc<dyn ObjectStore>,
}

impl TileStore {
    /// Build a store from config.
    pub fn new(config: &TileStoreConfig) -> TileResult<Self> {
        let store: Arc<dyn ObjectStore> = match config {
            TileStoreConfig::S3 {
                endpoint,
                bucket,
                access_key_id,
                secret_access_key,
                region,
                allow_http,
            } => {
                let mut builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_bucket_name(bucket)
                    .with_access_key_id(access_key_id)
                    .with_secret_access_key(secret_access_key)
                    .with_region(region);

                if *allow_http {
                    builder = builder.with_allow_http(true);
                }

                Arc::new(builder.build().map_err(|e| {
                    TileError::Storage(format!("Failed to create S3 client: {}", e))
                })?)
            }
            TileStoreConfig::Disk { root } => {
                Arc::new(LocalFileSystem::new_with_prefix(root).map_err(|e| {
                    TileError::Storage(format!("Failed to open tile directory {}: {}", root, e))
                })?)
            }
            TileStoreConfig::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self { store })
    }

    /// In-memory store shorthand for tests.
    pub fn memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }

    /// Read tile bytes; `Ok(None)` when the key does not exist.
    pub async fn get(&self, key: &str) -> TileResult<Option<Bytes>> {
        let location = Path::from(key);

        match self.store.get(&location).await {
            Ok(result) => {
                let bytes = result
                    .bytes()
                    .await
                    .map_err(|e| TileError::Storage(format!("Failed to read {}: {}", key, e)))?;
                debug!(key = %key, size = bytes.len(), "Tile cache hit");
                Ok(Some(bytes))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(TileError::Storage(format!(
                "Failed to read {}: {}",
                key, e
            ))),
        }
    }

    /// Write tile bytes under a key, overwriting any previous payload.
    pub async fn put(&self, key: &str, data: Bytes) -> TileResult<()> {
        let location = Path::from(key);
        debug!(key = %key, size = data.len(), "Writing tile");

        self.store
            .put(&location, data.into())
            .await
            .map_err(|e| TileError::Storage(format!("Failed to write {}: {}", key, e)))?;

        Ok(())
    }

    /// Delete a tile. Deleting an absent key is not an error.
    pub async fn delete(&self, key: &str) -> TileResult<()> {
        let location = Path::from(key);

        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(TileError::Storage(format!(
                "Failed to delete {}: {}",
                key, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = TileStore::memory();
        assert!(store.get("raster_tile:a:1:2:3.png").await.unwrap().is_none());

        store
            .put("raster_tile:a:1:2:3.png", Bytes::from_static(b"png-bytes"))
            .await
            .unwrap();

        let loaded = store.get("raster_tile:a:1:2:3.png").await.unwrap().unwrap();
        assert_eq!(&loaded[..], b"png-bytes");

        store.delete("raster_tile:a:1:2:3.png").await.unwrap();
        assert!(store.get("raster_tile:a:1:2:3.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disk_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = TileStore::new(&TileStoreConfig::Disk {
            root: dir.path().to_string_lossy().into_owned(),
        })
        .unwrap();

        store
            .put("vector_tile:layer:4:5:6.pbf", Bytes::from_static(b"pbf"))
            .await
            .unwrap();

        let loaded = store.get("vector_tile:layer:4:5:6.pbf").await.unwrap();
        assert_eq!(loaded.unwrap().as_ref(), b"pbf");
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let store = TileStore::memory();
        store.delete("never-written").await.unwrap();
    }
}
