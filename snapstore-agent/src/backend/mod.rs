pub mod azure;
pub mod directory;

use std::sync::Arc;

use tracing::info;

use snapstore_common::backend::ContainerClient;
use snapstore_common::{Result, SnapstoreError};

use self::azure::AbsContainer;
use self::directory::DirectoryContainer;
use crate::config::{Provider, SnapstoreConfig};
use crate::credentials::{construct_abs_uri, resolve_credentials, AbsEnv};
use crate::snapstore::{SnapStore, PROVIDER_CONNECTION_TIMEOUT};
use crate::uploader::with_deadline;

/// Construct the container client for the configured provider.
///
/// For Azure the credentials are resolved from `env` and the container must
/// already exist. A local container directory is created if missing.
pub async fn from_config(
    config: &SnapstoreConfig,
    env: &AbsEnv,
) -> Result<Arc<dyn ContainerClient>> {
    match config.provider {
        Provider::Abs => {
            let credentials = resolve_credentials(env)
                .map_err(|e| e.context("get storage account credentials"))?;
            let endpoint = construct_abs_uri(&credentials.storage_account, env)?;
            let container = AbsContainer::new(&endpoint, &credentials, &config.container)?;
            with_deadline(
                format!("check existence of container {}", config.container),
                PROVIDER_CONNECTION_TIMEOUT,
                container.ensure_exists(),
            )
            .await?;
            info!(
                account = %credentials.storage_account,
                container = %container.name(),
                "Connected to Azure Blob Storage"
            );
            Ok(Arc::new(container))
        }
        Provider::Local => {
            tokio::fs::create_dir_all(&config.container)
                .await
                .map_err(|e| {
                    SnapstoreError::from(e)
                        .context(format!("create container directory {}", config.container))
                })?;
            info!(path = %config.container, "Using local directory snapshot store");
            Ok(Arc::new(DirectoryContainer::new(&config.container)))
        }
    }
}

/// Validate `config`, read the provider environment and build a store.
pub async fn new_snapstore(config: &SnapstoreConfig) -> Result<SnapStore> {
    config
        .validate()
        .map_err(|e| SnapstoreError::Configuration(format!("{:#}", e)))?;
    let env = AbsEnv::from_env(config.is_source);
    let container = from_config(config, &env).await?;
    Ok(SnapStore::new(config, container))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_provider_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("backups");
        let config = SnapstoreConfig::new(Provider::Local, base.to_string_lossy(), "etcd/v2");

        let container = from_config(&config, &AbsEnv::default()).await.unwrap();
        assert!(base.is_dir());
        assert!(container.list_blobs_flat("etcd/").more());
    }

    #[tokio::test]
    async fn test_abs_provider_without_credentials() {
        let config = SnapstoreConfig::new(Provider::Abs, "backups", "etcd/v2");
        let err = from_config(&config, &AbsEnv::default()).await.err().unwrap();
        assert!(matches!(err.root(), SnapstoreError::CredentialsUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = SnapstoreConfig::new(Provider::Local, "", "etcd/v2");
        let err = new_snapstore(&config).await.err().unwrap();
        assert!(matches!(err, SnapstoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_untagged_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SnapstoreConfig::new(Provider::Local, dir.path().to_string_lossy(), "etcd-main");
        let err = new_snapstore(&config).await.err().unwrap();
        assert!(matches!(err, SnapstoreError::Configuration(ref msg) if msg.contains("etcd-main")));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
