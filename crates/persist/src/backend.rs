//! Backend selection.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{PersistError, S3Backend, SnapshotBackend, SqliteBackend};

pub const DEFAULT_S3_KEY_PREFIX: &str = "xp-tracker";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: String,
    pub key_prefix: String,
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack); enables path-style addressing.
    pub endpoint: Option<String>,
}

impl S3Settings {
    /// Validate and normalise the key prefix.
    pub fn normalized(mut self) -> Result<Self, PersistError> {
        if self.bucket.trim().is_empty() {
            return Err(PersistError::Config("S3 bucket is required for the s3 backend".into()));
        }
        if self.key_prefix.contains("..") {
            return Err(PersistError::Config(format!(
                "S3 key prefix must not contain '..', got {:?}",
                self.key_prefix
            )));
        }
        self.key_prefix = self.key_prefix.trim_matches('/').to_string();
        if self.key_prefix.is_empty() {
            self.key_prefix = DEFAULT_S3_KEY_PREFIX.to_string();
        }
        if self.region.is_empty() {
            self.region = DEFAULT_S3_REGION.to_string();
        }
        Ok(self)
    }

    pub fn object_key(&self) -> String {
        format!("{}/snapshot.json", self.key_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// No persistence.
    Memory,
    Sqlite { path: String },
    S3(S3Settings),
}

/// Open the configured backend; `None` for the memory-only mode.
pub async fn open_backend(cfg: &BackendConfig) -> Result<Option<Arc<dyn SnapshotBackend>>> {
    let backend: Arc<dyn SnapshotBackend> = match cfg {
        BackendConfig::Memory => return Ok(None),
        BackendConfig::Sqlite { path } => Arc::new(SqliteBackend::open(path)?),
        BackendConfig::S3(settings) => Arc::new(S3Backend::new(settings.clone().normalized()?).await),
    };
    info!(location = %backend.location(), "snapshot backend ready");
    Ok(Some(backend))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(prefix: &str) -> S3Settings {
        S3Settings {
            bucket: "bucket".into(),
            key_prefix: prefix.into(),
            region: String::new(),
            endpoint: None,
        }
    }

    #[test]
    fn key_prefix_is_trimmed_and_defaulted() {
        let s = settings("/team/xp/").normalized().unwrap();
        assert_eq!(s.object_key(), "team/xp/snapshot.json");
        assert_eq!(s.region, DEFAULT_S3_REGION);
        assert_eq!(settings("//").normalized().unwrap().object_key(), "xp-tracker/snapshot.json");
    }

    #[test]
    fn key_prefix_rejects_parent_segments() {
        assert!(matches!(settings("a/../b").normalized(), Err(PersistError::Config(_))));
        let mut s = settings("x");
        s.bucket = String::new();
        assert!(s.normalized().is_err());
    }
}
