//! Managed primary storage driver
//!
//! Each managed pool gets its own driver instance wrapping the client for
//! that pool's backend. Access is granted per host initiator.

use super::{CreatedVolume, ManagedStorageClientRef, ManagedVolumeRequest, PrimaryStorageDriver};
use crate::dispatch::{CommandOutcome, CompletionCallback};
use crate::domain::model::{Host, SharedVolume, StoragePool, Volume};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Driver for pools backed by a managed storage system
#[derive(Clone)]
pub struct ManagedPrimaryDriver {
    client: ManagedStorageClientRef,
}

impl ManagedPrimaryDriver {
    pub fn new(client: ManagedStorageClientRef) -> Self {
        Self { client }
    }

    pub fn backend(&self) -> &str {
        self.client.backend_name()
    }

    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    async fn ensure_open(&self) -> Result<()> {
        if !self.client.is_open() {
            self.client.open().await?;
        }
        Ok(())
    }

    fn locator<'a>(&self, volume: &'a Volume) -> Result<&'a str> {
        volume
            .locator
            .as_deref()
            .ok_or_else(|| Error::ManagedBackend {
                backend: self.backend().to_string(),
                reason: format!("volume {} has no backend locator", volume.id),
            })
    }

    fn initiator<'a>(&self, host: &'a Host) -> Result<&'a str> {
        host.initiator
            .as_deref()
            .ok_or_else(|| Error::ManagedBackend {
                backend: self.backend().to_string(),
                reason: format!("host {} has no storage initiator", host.id),
            })
    }
}

#[async_trait]
impl PrimaryStorageDriver for ManagedPrimaryDriver {
    fn name(&self) -> &'static str {
        "managed"
    }

    async fn create_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume> {
        self.ensure_open().await?;
        info!("Provisioning volume {} on managed pool {}", volume.id, pool.id);

        let created = self
            .client
            .create_volume(&ManagedVolumeRequest {
                name: volume.name.clone(),
                size_bytes: volume.size_bytes,
                format: volume.format,
            })
            .await?;

        Ok(CreatedVolume {
            path: created.locator.clone(),
            locator: Some(created.locator),
            size_bytes: created.size_bytes,
        })
    }

    fn create_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = volume.lock().clone();
            let outcome = match this.create_volume(&snapshot, &pool).await {
                Ok(created) => {
                    let mut volume = volume.lock();
                    volume.path = Some(created.path.clone());
                    volume.locator = created.locator;
                    volume.size_bytes = created.size_bytes;
                    CommandOutcome::with_path(created.path)
                }
                Err(e) => CommandOutcome::failed(e.to_string()),
            };
            callback.complete(outcome);
        });
    }

    async fn delete_volume(&self, volume: &Volume, pool: &StoragePool) -> Result<bool> {
        self.ensure_open().await?;
        let locator = self.locator(volume)?;
        info!("Deleting managed volume {} ({}) from pool {}", volume.id, locator, pool.id);

        let deleted = self.client.delete_volume(locator).await?;
        if !deleted {
            warn!("Managed backend {} did not delete {}", self.backend(), locator);
        }
        Ok(deleted)
    }

    fn delete_volume_async(
        &self,
        volume: SharedVolume,
        pool: StoragePool,
        callback: CompletionCallback<CommandOutcome>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = volume.lock().clone();
            let outcome = match this.delete_volume(&snapshot, &pool).await {
                Ok(true) => {
                    let mut volume = volume.lock();
                    volume.path = None;
                    volume.locator = None;
                    CommandOutcome::completed()
                }
                Ok(false) => CommandOutcome::failed(format!(
                    "managed backend {} refused to delete volume {}",
                    this.backend(),
                    snapshot.id
                )),
                Err(e) => CommandOutcome::failed(e.to_string()),
            };
            callback.complete(outcome);
        });
    }

    async fn grant_access(
        &self,
        volume: &Volume,
        host: &Host,
        _pool: &StoragePool,
    ) -> Result<String> {
        self.ensure_open().await?;
        let locator = self.locator(volume)?;
        let initiator = self.initiator(host)?;
        info!("Granting {} access to {}", host.id, locator);
        self.client.grant_access(locator, initiator).await
    }

    async fn revoke_access(
        &self,
        volume: &Volume,
        host: &Host,
        _pool: &StoragePool,
    ) -> Result<bool> {
        self.ensure_open().await?;
        let locator = self.locator(volume)?;
        let initiator = self.initiator(host)?;
        info!("Revoking {} access to {}", host.id, locator);
        self.client.revoke_access(locator, initiator).await
    }

    async fn capacity(&self, _pool: &StoragePool) -> Result<u64> {
        self.ensure_open().await?;
        Ok(self.client.stats().await?.capacity_bytes)
    }

    async fn available_capacity(&self, _pool: &StoragePool) -> Result<u64> {
        self.ensure_open().await?;
        let stats = self.client.stats().await?;
        Ok(stats.capacity_bytes.saturating_sub(stats.used_bytes))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::super::{ManagedStats, ManagedStorageClient, ManagedVolume, ManagedVolumeRequest};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend call as seen by the fake
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BackendCall {
        Create(String),
        Delete(String),
        Grant(String, String),
        Revoke(String, String),
    }

    /// In-memory managed backend recording every call
    pub struct FakeManagedClient {
        pub locator_prefix: String,
        pub fail_create: bool,
        pub fail_revoke: bool,
        pub fail_delete: bool,
        open: AtomicBool,
        calls: Mutex<Vec<BackendCall>>,
    }

    impl FakeManagedClient {
        pub fn new(locator_prefix: &str) -> Self {
            Self {
                locator_prefix: locator_prefix.to_string(),
                fail_create: false,
                fail_revoke: false,
                fail_delete: false,
                open: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_create: true,
                ..Self::new("iqn.fail")
            }
        }

        pub fn with_failing_revoke(mut self) -> Self {
            self.fail_revoke = true;
            self
        }

        pub fn with_failing_delete(mut self) -> Self {
            self.fail_delete = true;
            self
        }

        fn injected(&self, reason: &str) -> Error {
            Error::ManagedBackend {
                backend: "fake".into(),
                reason: reason.into(),
            }
        }

        pub fn calls(&self) -> Vec<BackendCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ManagedStorageClient for FakeManagedClient {
        fn backend_name(&self) -> &str {
            "fake"
        }

        async fn open(&self) -> Result<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn create_volume(&self, request: &ManagedVolumeRequest) -> Result<ManagedVolume> {
            self.calls.lock().push(BackendCall::Create(request.name.clone()));
            if self.fail_create {
                return Err(Error::ManagedBackend {
                    backend: "fake".into(),
                    reason: "out of space".into(),
                });
            }
            Ok(ManagedVolume {
                locator: format!("{}:{}", self.locator_prefix, request.name),
                size_bytes: request.size_bytes,
            })
        }

        async fn delete_volume(&self, locator: &str) -> Result<bool> {
            self.calls.lock().push(BackendCall::Delete(locator.to_string()));
            if self.fail_delete {
                return Err(self.injected("volume busy"));
            }
            Ok(true)
        }

        async fn grant_access(&self, locator: &str, initiator: &str) -> Result<String> {
            self.calls
                .lock()
                .push(BackendCall::Grant(locator.to_string(), initiator.to_string()));
            Ok(locator.to_string())
        }

        async fn revoke_access(&self, locator: &str, initiator: &str) -> Result<bool> {
            self.calls
                .lock()
                .push(BackendCall::Revoke(locator.to_string(), initiator.to_string()));
            if self.fail_revoke {
                return Err(self.injected("session still logged in"));
            }
            Ok(true)
        }

        async fn stats(&self) -> Result<ManagedStats> {
            Ok(ManagedStats {
                capacity_bytes: 1000,
                used_bytes: 250,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{BackendCall, FakeManagedClient};
    use super::*;
    use crate::domain::model::shared;
    use crate::driver::ManagedStorageClient;
    use crate::testing::{host, managed_volume, pool, volume};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_opens_client_and_returns_locator() {
        let client = Arc::new(FakeManagedClient::new("iqn.2024-01.test"));
        let driver = ManagedPrimaryDriver::new(client.clone());

        let created = driver
            .create_volume(&volume("vol-1", "m1"), &pool("m1", true))
            .await
            .unwrap();
        assert!(client.is_open());
        assert_eq!(created.locator.as_deref(), Some("iqn.2024-01.test:vol-1-disk"));
        assert_eq!(created.path, "iqn.2024-01.test:vol-1-disk");
    }

    #[tokio::test]
    async fn test_access_uses_host_initiator() {
        let client = Arc::new(FakeManagedClient::new("iqn.x"));
        let driver = ManagedPrimaryDriver::new(client.clone());
        let vol = managed_volume("vol-1", "m1");
        let h1 = host("h1", "c1");

        driver.grant_access(&vol, &h1, &pool("m1", true)).await.unwrap();
        assert!(driver.revoke_access(&vol, &h1, &pool("m1", true)).await.unwrap());

        assert_eq!(
            client.calls(),
            vec![
                BackendCall::Grant(
                    "iqn.2023-01.src:vol-1".into(),
                    "iqn.1994-05.com.redhat:h1".into()
                ),
                BackendCall::Revoke(
                    "iqn.2023-01.src:vol-1".into(),
                    "iqn.1994-05.com.redhat:h1".into()
                ),
            ]
        );

        let mut bare = host("h2", "c1");
        bare.initiator = None;
        let err = driver.grant_access(&vol, &bare, &pool("m1", true)).await.unwrap_err();
        assert_matches!(err, Error::ManagedBackend { .. });
    }

    #[tokio::test]
    async fn test_delete_requires_locator() {
        let driver = ManagedPrimaryDriver::new(Arc::new(FakeManagedClient::new("iqn.x")));
        let err = driver
            .delete_volume(&volume("vol-1", "m1"), &pool("m1", true))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ManagedBackend { .. });
    }

    #[tokio::test]
    async fn test_async_create_completes_once_with_failure() {
        let driver = ManagedPrimaryDriver::new(Arc::new(FakeManagedClient::failing()));
        let vol = shared(volume("vol-1", "m1"));
        let (callback, completion) = CompletionCallback::channel("create");

        driver.create_volume_async(vol.clone(), pool("m1", true), callback);
        let outcome = completion.wait().await.unwrap();

        assert!(!outcome.is_success());
        assert!(outcome.detail().unwrap().contains("out of space"));
        assert_eq!(vol.lock().path.as_deref(), Some("/old/vol-1"));
    }

    #[tokio::test]
    async fn test_available_capacity_from_backend_stats() {
        let driver = ManagedPrimaryDriver::new(Arc::new(FakeManagedClient::new("iqn.x")));
        assert_eq!(driver.capacity(&pool("m1", true)).await.unwrap(), 1000);
        assert_eq!(driver.available_capacity(&pool("m1", true)).await.unwrap(), 750);
    }
}
