//! Sandbox registry.

use std::fs;
use std::io::{ErrorKind, Write};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imgvol_common::{ImgvolError, ImgvolPaths, ImgvolResult, SandboxId};
use serde::{Deserialize, Serialize};

/// Looks up which runtime handler a sandbox was created with.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Runtime handler of `id`.
    ///
    /// Fails with [`ImgvolError::NotFound`] for unknown sandboxes.
    async fn runtime_handler(&self, id: &SandboxId) -> ImgvolResult<String>;
}

/// Registration record of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    /// Sandbox ID.
    pub id: SandboxId,
    /// Runtime handler the sandbox runs under.
    pub runtime_handler: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// Sandbox records kept as `sandbox.json` in each sandbox state directory.
#[derive(Debug, Clone)]
pub struct FileSandboxStore {
    paths: ImgvolPaths,
}

impl FileSandboxStore {
    /// Create a store over `paths`.
    #[must_use]
    pub fn new(paths: ImgvolPaths) -> Self {
        Self { paths }
    }

    /// Register a sandbox, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn register(&self, id: &SandboxId, runtime_handler: &str) -> ImgvolResult<SandboxRecord> {
        if runtime_handler.is_empty() {
            return Err(ImgvolError::Config {
                message: "runtime handler must not be empty".to_string(),
            });
        }

        let record = SandboxRecord {
            id: id.clone(),
            runtime_handler: runtime_handler.to_string(),
            created_at: Utc::now(),
        };

        let dir = self.paths.sandbox(id);
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(&record)?)?;
        tmp.persist(self.paths.sandbox_record(id))
            .map_err(|e| ImgvolError::Io(e.error))?;

        tracing::info!(sandbox = %id, runtime_handler, "Sandbox registered");
        Ok(record)
    }

    /// Load a sandbox record.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::NotFound`] for unknown sandboxes.
    pub fn load(&self, id: &SandboxId) -> ImgvolResult<SandboxRecord> {
        match fs::read(self.paths.sandbox_record(id)) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("sandbox {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a sandbox's state directory.
    ///
    /// Image volumes must be swept first; a directory that still holds
    /// targets is refused.
    ///
    /// # Errors
    ///
    /// Returns [`ImgvolError::NotFound`] for unknown sandboxes, or an error if
    /// image volumes remain.
    pub fn remove(&self, id: &SandboxId) -> ImgvolResult<()> {
        let base = self.paths.image_volume_base_dir(id);
        if base.exists() {
            return Err(ImgvolError::InvalidRequest {
                reason: format!("sandbox {id} still has image volumes, sweep it first"),
            });
        }

        match fs::remove_dir_all(self.paths.sandbox(id)) {
            Ok(()) => {
                tracing::info!(sandbox = %id, "Sandbox removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ImgvolError::not_found(format!("sandbox {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SandboxStore for FileSandboxStore {
    async fn runtime_handler(&self, id: &SandboxId) -> ImgvolResult<String> {
        let store = self.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.load(&id).map(|r| r.runtime_handler))
            .await
            .map_err(|e| ImgvolError::Internal {
                message: format!("sandbox task failed: {e}"),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_lookup() {
        let temp = tempfile::tempdir().unwrap();
        let store = FileSandboxStore::new(ImgvolPaths::with_root(temp.path()));
        let id = SandboxId::new("pod-1").unwrap();

        assert!(store.runtime_handler(&id).await.unwrap_err().is_not_found());

        store.register(&id, "runc").unwrap();
        assert_eq!(store.runtime_handler(&id).await.unwrap(), "runc");

        store.remove(&id).unwrap();
        assert!(store.load(&id).unwrap_err().is_not_found());
        assert!(store.remove(&id).unwrap_err().is_not_found());
    }

    #[test]
    fn remove_refuses_unswept_sandboxes() {
        let temp = tempfile::tempdir().unwrap();
        let paths = ImgvolPaths::with_root(temp.path());
        let store = FileSandboxStore::new(paths.clone());
        let id = SandboxId::new("pod-1").unwrap();

        store.register(&id, "runc").unwrap();
        fs::create_dir_all(paths.image_volume_base_dir(&id)).unwrap();

        let err = store.remove(&id).unwrap_err();
        assert!(matches!(err, ImgvolError::InvalidRequest { .. }));
        assert!(store.load(&id).is_ok());
    }
}
