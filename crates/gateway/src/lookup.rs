// Ownership lookups the gateway consults but does not own.
//
// Production deployments back these with the device/alert store; the
// in-memory directory serves local runs and tests.

use std::{collections::HashMap, future::Future, path::Path, pin::Pin, sync::Arc};

use anyhow::Context;
use serde::Deserialize;
use tokio::sync::RwLock;

pub type LookupFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>>;

/// Does `user_id` own `device_id`? Must be idempotent; results are cached.
pub trait DeviceLookup: Send + Sync {
    fn is_device_owned_by_user<'a>(&'a self, user_id: &'a str, device_id: &'a str)
        -> LookupFuture<'a>;
}

/// Was `alert_id` raised against `device_id`?
pub trait AlertLookup: Send + Sync {
    fn alert_belongs_to_device<'a>(&'a self, alert_id: &'a str, device_id: &'a str)
        -> LookupFuture<'a>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySeed {
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
    #[serde(default)]
    pub alerts: Vec<AlertSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSeed {
    pub id: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSeed {
    pub id: String,
    pub device_id: String,
}

#[derive(Debug, Default)]
struct DirectoryState {
    /// device id -> owner user id
    device_owners: HashMap<String, String>,
    /// alert id -> device id
    alert_devices: HashMap<String, String>,
}

/// In-memory device/alert directory implementing both lookups.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn from_seed(seed: DirectorySeed) -> Self {
        let state = DirectoryState {
            device_owners: seed
                .devices
                .into_iter()
                .map(|device| (device.id, device.owner_id))
                .collect(),
            alert_devices: seed
                .alerts
                .into_iter()
                .map(|alert| (alert.id, alert.device_id))
                .collect(),
        };
        Self { state: Arc::new(RwLock::new(state)) }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let seed: DirectorySeed = serde_json::from_str(&raw)
            .with_context(|| format!("invalid directory file {}", path.display()))?;
        Ok(Self::from_seed(seed))
    }

    pub async fn insert_device(&self, device_id: impl Into<String>, owner_id: impl Into<String>) {
        self.state.write().await.device_owners.insert(device_id.into(), owner_id.into());
    }

    pub async fn insert_alert(&self, alert_id: impl Into<String>, device_id: impl Into<String>) {
        self.state.write().await.alert_devices.insert(alert_id.into(), device_id.into());
    }

    pub async fn device_count(&self) -> usize {
        self.state.read().await.device_owners.len()
    }
}

impl DeviceLookup for MemoryDirectory {
    fn is_device_owned_by_user<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> LookupFuture<'a> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.device_owners.get(device_id).is_some_and(|owner| owner == user_id))
        })
    }
}

impl AlertLookup for MemoryDirectory {
    fn alert_belongs_to_device<'a>(
        &'a self,
        alert_id: &'a str,
        device_id: &'a str,
    ) -> LookupFuture<'a> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.alert_devices.get(alert_id).is_some_and(|owner| owner == device_id))
        })
    }
}
