//! Managed Storage Backend Client
//!
//! Managed pools provision a dedicated addressable unit per volume. The
//! driver talks to the backend through [`ManagedStorageClient`]; the client
//! has an explicit lifecycle and must be opened before use.

use crate::domain::model::{StoragePool, VolumeFormat};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Client Contract
// =============================================================================

/// Request to provision a backend volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVolumeRequest {
    pub name: String,
    pub size_bytes: u64,
    pub format: VolumeFormat,
}

/// A provisioned backend volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedVolume {
    /// Opaque target name hosts attach with
    pub locator: String,
    pub size_bytes: u64,
}

/// Backend capacity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedStats {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Client for a managed storage backend
#[async_trait]
pub trait ManagedStorageClient: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Connect to the backend; calling it on an open client is a no-op
    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn create_volume(&self, request: &ManagedVolumeRequest) -> Result<ManagedVolume>;

    /// `false` when the backend has no such volume
    async fn delete_volume(&self, locator: &str) -> Result<bool>;

    /// Allow `initiator` to attach, returning the target it attaches to
    async fn grant_access(&self, locator: &str, initiator: &str) -> Result<String>;

    async fn revoke_access(&self, locator: &str, initiator: &str) -> Result<bool>;

    async fn stats(&self) -> Result<ManagedStats>;
}

pub type ManagedStorageClientRef = Arc<dyn ManagedStorageClient>;

// =============================================================================
// HTTP Client
// =============================================================================

#[derive(Debug, Serialize)]
struct AccessRequest<'a> {
    initiator: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    target: String,
}

/// JSON/HTTP client for a managed backend's REST API
pub struct HttpManagedStorageClient {
    backend: String,
    base_url: Url,
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpManagedStorageClient {
    pub fn new(backend: impl Into<String>, base_url: Url, timeout: Duration) -> Self {
        Self {
            backend: backend.into(),
            base_url,
            timeout,
            client: RwLock::new(None),
        }
    }

    /// Client for the backend API served at the pool's address and port
    pub fn for_pool(pool: &StoragePool, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(&format!("http://{}:{}", pool.host_address, pool.port))
            .map_err(|e| Error::Configuration(format!("pool {}: {}", pool.id, e)))?;
        Ok(Self::new(pool.name.clone(), base_url, timeout))
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| self.backend_error(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| self.backend_error("client is not open"))
    }

    fn backend_error(&self, reason: impl Into<String>) -> Error {
        Error::ManagedBackend {
            backend: self.backend.clone(),
            reason: reason.into(),
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.backend_error(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl ManagedStorageClient for HttpManagedStorageClient {
    fn backend_name(&self) -> &str {
        &self.backend
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let response = client.get(self.url(&["health"])?).send().await?;
        self.check(response).await?;

        info!("Connected to managed backend {} at {}", self.backend, self.base_url);
        *self.client.write() = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.client.write().take().is_some() {
            info!("Closed managed backend {}", self.backend);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.client.read().is_some()
    }

    async fn create_volume(&self, request: &ManagedVolumeRequest) -> Result<ManagedVolume> {
        debug!("Creating {} on {}", request.name, self.backend);
        let response = self
            .client()?
            .post(self.url(&["volumes"])?)
            .json(request)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    async fn delete_volume(&self, locator: &str) -> Result<bool> {
        let response = self
            .client()?
            .delete(self.url(&["volumes", locator])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            warn!("Volume {} not present on {}", locator, self.backend);
            return Ok(false);
        }
        self.check(response).await?;
        Ok(true)
    }

    async fn grant_access(&self, locator: &str, initiator: &str) -> Result<String> {
        let response = self
            .client()?
            .post(self.url(&["volumes", locator, "access"])?)
            .json(&AccessRequest { initiator })
            .send()
            .await?;
        let access: AccessResponse = self.check(response).await?.json().await?;
        Ok(access.target)
    }

    async fn revoke_access(&self, locator: &str, initiator: &str) -> Result<bool> {
        let response = self
            .client()?
            .delete(self.url(&["volumes", locator, "access", initiator])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        self.check(response).await?;
        Ok(true)
    }

    async fn stats(&self) -> Result<ManagedStats> {
        let response = self.client()?.get(self.url(&["stats"])?).send().await?;
        Ok(self.check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pool;
    use assert_matches::assert_matches;

    fn client() -> HttpManagedStorageClient {
        HttpManagedStorageClient::for_pool(&pool("m1", true), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_url_escapes_locator() {
        let url = client()
            .url(&["volumes", "iqn.2024-01.test:vol/1", "access"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://10.0.0.5:3260/api/v1/volumes/iqn.2024-01.test:vol%2F1/access"
        );
    }

    #[tokio::test]
    async fn test_calls_before_open_fail() {
        let client = client();
        assert!(!client.is_open());

        let err = client.delete_volume("iqn.x").await.unwrap_err();
        assert_matches!(err, Error::ManagedBackend { ref backend, .. } if backend == "m1");

        client.close().await.unwrap();
    }
}
