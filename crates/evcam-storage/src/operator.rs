//! OpenDAL Operator factory for evcam storage backends

use anyhow::{Context, Result};
use evcam_core::config::{StorageBackend, StorageConfig};
use opendal::{Builder, Operator};
use std::path::Path;

/// Access credentials for S3-compatible endpoints.
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Credentials {
    /// Read `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok()?,
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok()?,
        })
    }
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Wrap a service builder with the logging and retry layers every backend gets.
pub fn build_operator<B: Builder>(builder: B) -> Result<Operator> {
    let op = Operator::new(builder)
        .context("creating OpenDAL operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

/// Build the configured backend.
///
/// For S3, a plaintext `http://` endpoint is refused when `enforce_tls` is set
/// and logged as a warning otherwise.
pub fn build_from_core_config(
    storage: &StorageConfig,
    data_dir: &Path,
    credentials: Option<&S3Credentials>,
) -> Result<Operator> {
    match storage.backend {
        StorageBackend::Fs => {
            let root = storage.fs_root(data_dir);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating store root {}", root.display()))?;
            tracing::debug!(root = %root.display(), "using filesystem object store");
            build_operator(opendal::services::Fs::default().root(&root.to_string_lossy()))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory object store; footage is lost on restart");
            build_operator(opendal::services::Memory::default())
        }
        StorageBackend::S3 => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false for local testing.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; footage and credentials travel unencrypted"
                );
            }
            let creds = credentials
                .context("S3 backend needs AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY")?;
            let builder = opendal::services::S3::default()
                .endpoint(&storage.endpoint)
                .region(&storage.region)
                .bucket(&storage.bucket)
                .access_key_id(&creds.access_key_id)
                .secret_access_key(&creds.secret_access_key);
            build_operator(builder)
        }
    }
}
