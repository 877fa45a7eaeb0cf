//! JSON-file state store.
//!
//! Each record lives at `<root>/<kind>/<id>.json`. Writes go to a temporary
//! sibling first and are renamed into place so a crash never leaves a
//! half-written record behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::domain::models::{Load, LoadStatus};
use crate::domain::ports::{EntityKind, StateStore, StoreError, StoredEntity};

#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, kind: EntityKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn path(&self, kind: EntityKind, id: &str) -> PathBuf {
        self.dir(kind).join(format!("{}.json", sanitize(id)))
    }
}

/// Keep ids usable as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, kind: EntityKind, id: &str) -> Result<Option<StoredEntity>, StoreError> {
        let path = self.path(kind, id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entity: &StoredEntity) -> Result<(), StoreError> {
        let kind = entity.kind();
        fs::create_dir_all(self.dir(kind)).await?;

        let path = self.path(kind, &entity.id());
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(entity)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(kind, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_unassigned_loads(&self) -> Result<Vec<Load>, StoreError> {
        let dir = self.dir(EntityKind::Load);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut loads = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            if let StoredEntity::Load(load) = serde_json::from_slice(&bytes)? {
                if load.status == LoadStatus::Unassigned {
                    loads.push(load);
                }
            }
        }
        loads.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(loads)
    }
}
