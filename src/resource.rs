//! Opaque resource blob catalog
//!
//! Containers carry a catalog of named binary blobs (textures, audio,
//! arbitrary data) uploaded by adapters. The engine never interprets the
//! bytes; sizes count against the container's memory budget.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Coarse blob classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Texture,
    Audio,
    Mesh,
    Data,
}

/// A stored blob
#[derive(Debug, Clone)]
pub struct ResourceBlob {
    pub id: u64,
    pub name: String,
    pub kind: ResourceKind,
    pub bytes: Vec<u8>,
}

/// Listing entry without the payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: u64,
    pub name: String,
    pub kind: ResourceKind,
    pub size_bytes: usize,
}

/// Container-scoped blob store.
#[derive(Debug, Default)]
pub struct ResourceCatalog {
    by_id: AHashMap<u64, ResourceBlob>,
    next_id: u64,
    total_bytes: usize,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self { by_id: AHashMap::new(), next_id: 1, total_bytes: 0 }
    }

    pub fn upload(&mut self, name: impl Into<String>, kind: ResourceKind, bytes: Vec<u8>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.total_bytes += bytes.len();
        let name = name.into();
        debug!(id, name = %name, size = bytes.len(), "resource uploaded");
        self.by_id.insert(id, ResourceBlob { id, name, kind, bytes });
        id
    }

    pub fn get(&self, id: u64) -> Result<&ResourceBlob> {
        self.by_id.get(&id).ok_or(EngineError::ResourceNotFound(id))
    }

    pub fn delete(&mut self, id: u64) -> Result<()> {
        let blob = self
            .by_id
            .remove(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        self.total_bytes -= blob.bytes.len();
        Ok(())
    }

    pub fn list(&self) -> Vec<ResourceInfo> {
        let mut out: Vec<ResourceInfo> = self
            .by_id
            .values()
            .map(|blob| ResourceInfo {
                id: blob.id,
                name: blob.name.clone(),
                kind: blob.kind,
                size_bytes: blob.bytes.len(),
            })
            .collect();
        out.sort_by_key(|info| info.id);
        out
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_get_delete() -> Result<()> {
        let mut catalog = ResourceCatalog::new();
        let id = catalog.upload("tileset", ResourceKind::Texture, vec![1, 2, 3]);

        let blob = catalog.get(id)?;
        assert_eq!(blob.name, "tileset");
        assert_eq!(blob.bytes, vec![1, 2, 3]);
        assert_eq!(catalog.total_bytes(), 3);

        catalog.delete(id)?;
        assert_eq!(catalog.total_bytes(), 0);
        assert!(matches!(catalog.get(id), Err(EngineError::ResourceNotFound(_))));
        Ok(())
    }

    #[test]
    fn test_listing_omits_payload() {
        let mut catalog = ResourceCatalog::new();
        catalog.upload("a", ResourceKind::Data, vec![0; 16]);
        catalog.upload("b", ResourceKind::Audio, vec![0; 8]);

        let listing = catalog.list();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].name, "a");
        assert_eq!(listing[0].size_bytes, 16);
    }
}
