// Subscription router: room membership and the authorization in front of it.
//
// Lock order is rooms, then registry. The registry's record and the room
// index are updated under the rooms write lock so a concurrent removal can
// never leave one side pointing at the other.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cache::{AccessCache, AccessKey};
use crate::error::{GatewayError, Result};
use crate::lookup::DeviceLookup;
use crate::registry::{ConnectionId, ConnectionRegistry, Room};

/// A bulk subscribe that stopped part way.
///
/// Devices listed in `subscribed` stay subscribed; nothing is rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscribe stopped at device {device_id}: {source}")]
pub struct BulkSubscribeError {
    pub device_id: String,
    pub subscribed: Vec<String>,
    #[source]
    pub source: GatewayError,
}

#[derive(Clone)]
pub struct SubscriptionRouter {
    rooms: Arc<RwLock<HashMap<Room, HashSet<ConnectionId>>>>,
    registry: ConnectionRegistry,
    cache: Arc<AccessCache>,
    devices: Arc<dyn DeviceLookup>,
}

impl SubscriptionRouter {
    pub fn new(
        registry: ConnectionRegistry,
        cache: Arc<AccessCache>,
        devices: Arc<dyn DeviceLookup>,
    ) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), registry, cache, devices }
    }

    pub async fn authorize(&self, user_id: &str, device_id: &str) -> Result<()> {
        self.authorize_at(user_id, device_id, Utc::now()).await
    }

    /// Cache first; on a miss ask the device lookup and remember the answer.
    ///
    /// A lookup failure denies without caching anything.
    pub async fn authorize_at(
        &self,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = AccessKey::new(user_id, device_id);
        let authorized = match self.cache.get_at(&key, now) {
            Some(authorized) => authorized,
            None => match self.devices.is_device_owned_by_user(user_id, device_id).await {
                Ok(authorized) => {
                    self.cache.set_at(key, authorized, now);
                    authorized
                }
                Err(lookup_error) => {
                    error!(
                        error = ?lookup_error,
                        user_id,
                        device_id,
                        "device lookup failed, denying access"
                    );
                    return Err(GatewayError::Internal("device lookup unavailable".to_string()));
                }
            },
        };

        if authorized {
            Ok(())
        } else {
            warn!(user_id, device_id, "device access denied");
            Err(GatewayError::unauthorized(device_id))
        }
    }

    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        device_id: &str,
    ) -> Result<()> {
        self.authorize(user_id, device_id).await?;
        self.join(connection_id, Room::Device(device_id.to_string())).await?;
        info!(connection_id = %connection_id, user_id, device_id, "subscribed to device");
        Ok(())
    }

    /// Subscribe in order and stop at the first failure.
    pub async fn subscribe_many(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        device_ids: &[String],
    ) -> std::result::Result<Vec<String>, BulkSubscribeError> {
        let mut subscribed = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            if let Err(source) = self.subscribe(connection_id, user_id, device_id).await {
                return Err(BulkSubscribeError {
                    device_id: device_id.clone(),
                    subscribed,
                    source,
                });
            }
            subscribed.push(device_id.clone());
        }
        Ok(subscribed)
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, device_id: &str) {
        self.leave(connection_id, &Room::Device(device_id.to_string())).await;
        info!(connection_id = %connection_id, device_id, "unsubscribed from device");
    }

    pub async fn unsubscribe_many(&self, connection_id: ConnectionId, device_ids: &[String]) {
        for device_id in device_ids {
            self.unsubscribe(connection_id, device_id).await;
        }
    }

    /// Leave every room in `rooms`. Called with the joined-rooms set of a
    /// connection that was just removed from the registry.
    pub async fn cleanup_all(&self, connection_id: ConnectionId, rooms: &HashSet<Room>) {
        for room in rooms {
            self.leave(connection_id, room).await;
        }
        debug!(connection_id = %connection_id, rooms = rooms.len(), "connection rooms released");
    }

    /// Add a registered connection to `room` without an authorization check.
    pub(crate) async fn join(&self, connection_id: ConnectionId, room: Room) -> Result<()> {
        let mut rooms = self.rooms.write().await;
        if !self.registry.add_room(connection_id, room.clone()).await {
            return Err(GatewayError::NotFound(format!("connection {connection_id}")));
        }
        rooms.entry(room).or_default().insert(connection_id);
        Ok(())
    }

    pub(crate) async fn leave(&self, connection_id: ConnectionId, room: &Room) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        self.registry.remove_room(connection_id, room).await;
    }

    /// Point-in-time copy of a room's members.
    pub async fn subscribers(&self, room: &Room) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_subscribed(&self, connection_id: ConnectionId, device_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(&Room::Device(device_id.to_string()))
            .is_some_and(|members| members.contains(&connection_id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn has_room(&self, room: &Room) -> bool {
        self.rooms.read().await.contains_key(room)
    }

    /// True if `connection_id` appears in any room.
    pub async fn is_member_anywhere(&self, connection_id: ConnectionId) -> bool {
        self.rooms.read().await.values().any(|members| members.contains(&connection_id))
    }
}
