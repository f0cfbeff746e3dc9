//! Durable key/value store: one JSON file per key under a base directory.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to access {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{key} is corrupted: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Whether the stored bytes exist but are not valid for the requested type.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Parse { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StorageService {
    base: PathBuf,
}

impl StorageService {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn item_path(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    /// Create the base directory if needed.
    pub async fn init(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base)
            .await
            .map_err(|source| StorageError::Io {
                key: self.base.display().to_string(),
                source,
            })
    }

    /// Read `key`. A missing file is `Ok(None)`; undecodable content is
    /// [`StorageError::Parse`].
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let path = self.item_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(key, "No stored value");
                return Ok(None);
            }
            Err(source) => {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Parse {
                key: key.to_string(),
                source,
            })
    }

    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.init().await?;
        tokio::fs::write(self.item_path(key), bytes)
            .await
            .map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;
        trace!(key, "Stored value");
        Ok(())
    }

    /// Byte-identical copy of `from` to `to`.
    pub async fn copy_item(&self, from: &str, to: &str) -> Result<(), StorageError> {
        tokio::fs::copy(self.item_path(from), self.item_path(to))
            .await
            .map(|_| ())
            .map_err(|source| StorageError::Io {
                key: from.to_string(),
                source,
            })
    }

    pub async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.item_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}
