// Connection registry: every live connection and the context attached to it.
//
// The registry owns each connection's context outright. Nothing is stashed
// on the transport handle; callers look the context up by connection id.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::sink::ConnectionSink;

pub type ConnectionId = Uuid;

/// A broadcast group: everyone watching one device, or every connection of one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Room {
    Device(String),
    User(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(device_id) => write!(f, "device:{device_id}"),
            Self::User(user_id) => write!(f, "user:{user_id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: String,
    /// Device named in the handshake.
    pub device_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub rooms: HashSet<Room>,
    pub sink: ConnectionSink,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub unique_devices: usize,
    pub connections_by_user: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        device_id: &str,
        sink: ConnectionSink,
    ) -> Result<ConnectionRecord> {
        self.register_at(connection_id, user_id, device_id, sink, Utc::now()).await
    }

    /// Register (or re-register) a connection.
    ///
    /// Re-registering an id overwrites identity, sink and timestamps in place
    /// but keeps the rooms it already joined, so the room index never points
    /// at memberships the record has forgotten.
    pub async fn register_at(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        device_id: &str,
        sink: ConnectionSink,
        now: DateTime<Utc>,
    ) -> Result<ConnectionRecord> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::InvalidIdentity("userId is empty".to_string()));
        }
        if device_id.trim().is_empty() {
            return Err(GatewayError::InvalidIdentity("deviceId is empty".to_string()));
        }

        let mut guard = self.connections.write().await;
        let rooms = guard.remove(&connection_id).map(|previous| previous.rooms).unwrap_or_default();
        let record = ConnectionRecord {
            connection_id,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            connected_at: now,
            last_activity_at: now,
            rooms,
            sink,
        };
        guard.insert(connection_id, record.clone());
        info!(
            connection_id = %connection_id,
            user_id,
            device_id,
            total_connections = guard.len(),
            "connection registered"
        );

        Ok(record)
    }

    pub async fn touch(&self, connection_id: ConnectionId) {
        self.touch_at(connection_id, Utc::now()).await;
    }

    /// Unknown ids are ignored; the reaper may have won the race.
    pub async fn touch_at(&self, connection_id: ConnectionId, now: DateTime<Utc>) {
        if let Some(record) = self.connections.write().await.get_mut(&connection_id) {
            record.last_activity_at = now;
        }
    }

    /// Remove the record and hand it back so the caller can release its
    /// room memberships. Unknown ids return `None`.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let mut guard = self.connections.write().await;
        let removed = guard.remove(&connection_id);
        if removed.is_some() {
            info!(
                connection_id = %connection_id,
                remaining_connections = guard.len(),
                "connection removed"
            );
        }
        removed
    }

    /// Close and remove the connection only if it is still idle for longer
    /// than `threshold` under the write lock. Activity recorded after an
    /// earlier stale scan keeps the connection alive.
    pub async fn remove_if_stale(
        &self,
        connection_id: ConnectionId,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Option<ConnectionRecord> {
        let mut guard = self.connections.write().await;
        let idle = guard.get(&connection_id).map(|record| now - record.last_activity_at)?;
        if idle <= threshold {
            debug!(connection_id = %connection_id, "connection active again, skipping reap");
            return None;
        }

        let record = guard.remove(&connection_id)?;
        record.sink.close();
        info!(
            connection_id = %connection_id,
            idle_secs = idle.num_seconds(),
            remaining_connections = guard.len(),
            "stale connection removed"
        );
        Some(record)
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    pub async fn contains(&self, connection_id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// All four figures come from one read of the map.
    pub async fn stats(&self) -> RegistryStats {
        let guard = self.connections.read().await;
        let mut connections_by_user = BTreeMap::new();
        let mut devices = HashSet::new();
        for record in guard.values() {
            *connections_by_user.entry(record.user_id.clone()).or_insert(0) += 1;
            devices.insert(record.device_id.as_str());
        }

        RegistryStats {
            total_connections: guard.len(),
            unique_users: connections_by_user.len(),
            unique_devices: devices.len(),
            connections_by_user,
        }
    }

    /// Connections idle for strictly longer than `threshold`.
    pub async fn stale_connections(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> Vec<(ConnectionId, ConnectionSink)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|record| now - record.last_activity_at > threshold)
            .map(|record| (record.connection_id, record.sink.clone()))
            .collect()
    }

    pub async fn sinks(&self) -> Vec<(ConnectionId, ConnectionSink)> {
        self.connections
            .read()
            .await
            .values()
            .map(|record| (record.connection_id, record.sink.clone()))
            .collect()
    }

    pub async fn sinks_for(
        &self,
        connection_ids: &[ConnectionId],
    ) -> Vec<(ConnectionId, ConnectionSink)> {
        let guard = self.connections.read().await;
        connection_ids
            .iter()
            .filter_map(|connection_id| {
                guard.get(connection_id).map(|record| (*connection_id, record.sink.clone()))
            })
            .collect()
    }

    pub async fn rooms_for(&self, connection_id: ConnectionId) -> Option<HashSet<Room>> {
        self.connections.read().await.get(&connection_id).map(|record| record.rooms.clone())
    }

    /// Record a joined room on the connection. Returns false for unknown ids.
    pub(crate) async fn add_room(&self, connection_id: ConnectionId, room: Room) -> bool {
        match self.connections.write().await.get_mut(&connection_id) {
            Some(record) => {
                debug!(connection_id = %connection_id, room = %room, "room recorded on connection");
                record.rooms.insert(room);
                true
            }
            None => false,
        }
    }

    pub(crate) async fn remove_room(&self, connection_id: ConnectionId, room: &Room) {
        if let Some(record) = self.connections.write().await.get_mut(&connection_id) {
            record.rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 7, 12, 0, 0).single().expect("valid timestamp")
    }

    fn sink() -> ConnectionSink {
        ConnectionSink::channel(4).0
    }

    #[tokio::test]
    async fn register_stamps_both_timestamps() {
        let registry = ConnectionRegistry::default();
        let id = Uuid::new_v4();
        let record = registry
            .register_at(id, "user-1", "d1", sink(), t0())
            .await
            .expect("registration should succeed");

        assert_eq!(record.connected_at, t0());
        assert_eq!(record.last_activity_at, t0());
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn register_rejects_empty_identity() {
        let registry = ConnectionRegistry::default();
        let error = registry
            .register(Uuid::new_v4(), "", "d1", sink())
            .await
            .expect_err("empty user should fail");
        assert!(matches!(error, GatewayError::InvalidIdentity(_)));

        let error = registry
            .register(Uuid::new_v4(), "user-1", " ", sink())
            .await
            .expect_err("blank device should fail");
        assert!(matches!(error, GatewayError::InvalidIdentity(_)));
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn re_register_overwrites_in_place_and_keeps_rooms() {
        let registry = ConnectionRegistry::default();
        let id = Uuid::new_v4();
        registry.register_at(id, "user-1", "d1", sink(), t0()).await.expect("first register");
        assert!(registry.add_room(id, Room::Device("d1".into())).await);

        let later = t0() + Duration::minutes(5);
        let record =
            registry.register_at(id, "user-1", "d2", sink(), later).await.expect("re-register");

        assert_eq!(registry.len().await, 1);
        assert_eq!(record.device_id, "d2");
        assert_eq!(record.connected_at, later);
        assert!(record.rooms.contains(&Room::Device("d1".into())));
    }

    #[tokio::test]
    async fn touch_unknown_id_is_a_no_op() {
        let registry = ConnectionRegistry::default();
        registry.touch(Uuid::new_v4()).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn remove_if_stale_rechecks_last_activity() {
        let registry = ConnectionRegistry::default();
        let id = Uuid::new_v4();
        registry.register_at(id, "user-1", "d1", sink(), t0()).await.expect("register");
        let now = t0() + Duration::minutes(31);
        let threshold = Duration::minutes(30);
        assert_eq!(registry.stale_connections(now, threshold).await.len(), 1);

        registry.touch_at(id, now - Duration::minutes(1)).await;
        assert!(registry.remove_if_stale(id, now, threshold).await.is_none());
        assert!(registry.contains(id).await);

        let removed = registry
            .remove_if_stale(id, now + Duration::minutes(30), threshold)
            .await
            .expect("idle connection should be removed");
        assert_eq!(removed.connection_id, id);
        assert!(!registry.contains(id).await);
        assert!(registry.remove_if_stale(id, now + Duration::hours(2), threshold).await.is_none());
    }

    #[tokio::test]
    async fn touch_moves_last_activity_only() {
        let registry = ConnectionRegistry::default();
        let id = Uuid::new_v4();
        registry.register_at(id, "user-1", "d1", sink(), t0()).await.expect("register");

        registry.touch_at(id, t0() + Duration::seconds(90)).await;
        let record = registry.get(id).await.expect("record should exist");

        assert_eq!(record.connected_at, t0());
        assert_eq!(record.last_activity_at, t0() + Duration::seconds(90));
    }

    #[tokio::test]
    async fn stats_are_consistent() {
        let registry = ConnectionRegistry::default();
        registry.register(Uuid::new_v4(), "alice", "d1", sink()).await.expect("register");
        registry.register(Uuid::new_v4(), "alice", "d2", sink()).await.expect("register");
        registry.register(Uuid::new_v4(), "bob", "d2", sink()).await.expect("register");

        let stats = registry.stats().await;

        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.unique_devices, 2);
        assert_eq!(stats.connections_by_user.get("alice"), Some(&2));
        assert_eq!(stats.connections_by_user.get("bob"), Some(&1));
    }

    #[tokio::test]
    async fn stale_connections_uses_strict_threshold() {
        let registry = ConnectionRegistry::default();
        let idle = Uuid::new_v4();
        let boundary = Uuid::new_v4();
        registry.register_at(idle, "u", "d1", sink(), t0()).await.expect("register");
        registry
            .register_at(boundary, "u", "d2", sink(), t0() + Duration::seconds(1))
            .await
            .expect("register");

        let now = t0() + Duration::minutes(30) + Duration::seconds(1);
        let stale = registry.stale_connections(now, Duration::minutes(30)).await;

        assert_eq!(stale.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![idle]);
    }

    #[test]
    fn room_names_are_prefixed() {
        assert_eq!(Room::Device("d1".into()).to_string(), "device:d1");
        assert_eq!(Room::User("u1".into()).to_string(), "user:u1");
    }
}
