//! OpenDAL Operator factory for the remote record store

use anyhow::{Context, Result};
use examsync_core::config::{RemoteBackend, RemoteConfig};
use opendal::Operator;

/// Minimal S3 config needed to build an operator
/// (full config lives in examsync-core's RemoteConfig)
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub root: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for any S3-compatible endpoint.
///
/// Path-style addressing is the opendal default, so self-hosted endpoints
/// such as MinIO work without extra flags.
pub fn build_s3_operator(cfg: &S3Config) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .root(&cfg.root)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build an operator rooted at a local directory.
pub fn build_fs_operator(root: &str) -> Result<Operator> {
    let builder = opendal::services::Fs::default().root(root);
    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// Build an in-process operator. Contents vanish when the process exits.
pub fn build_memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .finish())
}

/// Build the operator selected by `remote.backend`.
///
/// S3 credentials are only consulted for the S3 backend. If `enforce_tls`
/// is set and the endpoint is plaintext HTTP this returns an error;
/// otherwise a warning is logged.
pub fn build_from_core_config(
    remote: &RemoteConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    match remote.backend {
        RemoteBackend::Memory => build_memory_operator(),
        RemoteBackend::Fs => build_fs_operator(&remote.root),
        RemoteBackend::S3 => {
            if remote.endpoint.starts_with("http://") {
                if remote.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set remote.enforce_tls = false for local development.",
                        remote.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %remote.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
                );
            }

            build_s3_operator(&S3Config {
                endpoint: remote.endpoint.clone(),
                region: remote.region.clone(),
                bucket: remote.bucket.clone(),
                root: remote.root.clone(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            })
        }
    }
}
