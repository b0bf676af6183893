// The long-lived gateway: owns the registry, the access cache and the room
// index, and drives the handshake and every inbound event against them.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use freemonitor_common::{
    payload::{AlertPayload, DeviceSelection, TelemetryPayload},
    protocol::events::{self, Ack, DecodeError, InboundEvent, OutboundEvent},
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::auth::Identity;
use crate::cache::{AccessCache, AccessCacheConfig, CacheStats};
use crate::error::{GatewayError, Result};
use crate::fanout::BroadcastFanout;
use crate::lookup::{AlertLookup, DeviceLookup};
use crate::rate_limit::{
    ConnectionRateLimits, DEFAULT_CONTROL_PER_MINUTE, DEFAULT_TELEMETRY_PER_MINUTE,
};
use crate::reaper::{BackgroundTasks, InactivityReaper};
use crate::registry::{ConnectionId, ConnectionRecord, ConnectionRegistry, RegistryStats, Room};
use crate::router::SubscriptionRouter;
use crate::sink::{ConnectionSink, DEFAULT_OUTBOUND_BUFFER};

/// Reason sent when the handshake's device check fails.
pub const UNAUTHORIZED_REASON: &str = "unauthorized";

pub const DEFAULT_INACTIVITY_SECS: i64 = 30 * 60;
pub const DEFAULT_REAPER_INTERVAL: StdDuration = StdDuration::from_secs(60);
pub const DEFAULT_CACHE_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authorized,
    Active,
    Disconnected,
}

impl ConnectionState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authorized)
                | (Self::Connecting, Self::Disconnected)
                | (Self::Authorized, Self::Active)
                | (Self::Authorized, Self::Disconnected)
                | (Self::Active, Self::Disconnected)
        )
    }

    pub fn advance(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(GatewayError::Internal(format!(
                "invalid connection transition {self:?} -> {next:?}"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub cache: AccessCacheConfig,
    pub inactivity_threshold: Duration,
    pub reaper_interval: StdDuration,
    pub cache_sweep_interval: StdDuration,
    pub outbound_buffer: usize,
    pub telemetry_per_minute: usize,
    pub control_per_minute: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            cache: AccessCacheConfig::default(),
            inactivity_threshold: Duration::seconds(DEFAULT_INACTIVITY_SECS),
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            telemetry_per_minute: DEFAULT_TELEMETRY_PER_MINUTE,
            control_per_minute: DEFAULT_CONTROL_PER_MINUTE,
        }
    }
}

impl GatewaySettings {
    pub fn rate_limits(&self) -> ConnectionRateLimits {
        ConnectionRateLimits::per_minute(self.telemetry_per_minute, self.control_per_minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub connections: RegistryStats,
    pub cache: CacheStats,
    pub rooms: usize,
}

#[derive(Clone)]
pub struct Gateway {
    settings: GatewaySettings,
    registry: ConnectionRegistry,
    cache: Arc<AccessCache>,
    router: SubscriptionRouter,
    fanout: BroadcastFanout,
    alerts: Arc<dyn AlertLookup>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        devices: Arc<dyn DeviceLookup>,
        alerts: Arc<dyn AlertLookup>,
    ) -> Self {
        let registry = ConnectionRegistry::default();
        let cache = Arc::new(AccessCache::new(settings.cache));
        let router = SubscriptionRouter::new(registry.clone(), Arc::clone(&cache), devices);
        let fanout = BroadcastFanout::new(registry.clone(), router.clone());
        Self { settings, registry, cache, router, fanout, alerts }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn fanout(&self) -> &BroadcastFanout {
        &self.fanout
    }

    pub fn cache(&self) -> &Arc<AccessCache> {
        &self.cache
    }

    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        device_id: &str,
        sink: ConnectionSink,
    ) -> Result<ConnectionRecord> {
        self.connect_at(connection_id, identity, device_id, sink, Utc::now()).await
    }

    /// Run the handshake for an already verified identity.
    ///
    /// On success the connection is registered and has joined its own device
    /// room and user room. On failure nothing is left behind.
    pub async fn connect_at(
        &self,
        connection_id: ConnectionId,
        identity: &Identity,
        device_id: &str,
        sink: ConnectionSink,
        now: DateTime<Utc>,
    ) -> Result<ConnectionRecord> {
        let user_id = identity.user_id.as_str();
        let state = ConnectionState::Connecting;

        if let Err(denied) = self.router.authorize_at(user_id, device_id, now).await {
            state.advance(ConnectionState::Disconnected)?;
            warn!(
                connection_id = %connection_id,
                user_id,
                device_id,
                error = %denied,
                "handshake rejected"
            );
            return Err(denied);
        }
        let state = state.advance(ConnectionState::Authorized)?;

        let record = self.registry.register_at(connection_id, user_id, device_id, sink, now).await?;
        let default_rooms = [Room::Device(device_id.to_string()), Room::User(user_id.to_string())];
        for room in default_rooms {
            if let Err(join_error) = self.router.join(connection_id, room).await {
                self.disconnect(connection_id).await;
                state.advance(ConnectionState::Disconnected)?;
                return Err(join_error);
            }
        }
        state.advance(ConnectionState::Active)?;

        info!(connection_id = %connection_id, user_id, device_id, "connection active");
        Ok(self.registry.get(connection_id).await.unwrap_or(record))
    }

    /// Remove the connection, then release its rooms. Returns false if the
    /// connection was already gone.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(record) = self.registry.remove(connection_id).await else {
            debug!(connection_id = %connection_id, "disconnect for unknown connection");
            return false;
        };
        self.release(&record).await;
        true
    }

    /// Reaper path: like `disconnect`, but only while the connection is still
    /// idle past `threshold`. Its transport is told to close first.
    pub(crate) async fn disconnect_if_idle(
        &self,
        connection_id: ConnectionId,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> bool {
        let Some(record) = self.registry.remove_if_stale(connection_id, now, threshold).await
        else {
            return false;
        };
        self.release(&record).await;
        true
    }

    async fn release(&self, record: &ConnectionRecord) {
        self.router.cleanup_all(record.connection_id, &record.rooms).await;
        info!(
            connection_id = %record.connection_id,
            user_id = %record.user_id,
            device_id = %record.device_id,
            "connection disconnected"
        );
    }

    pub async fn handle_event(
        &self,
        connection_id: ConnectionId,
        event: InboundEvent,
    ) -> Vec<OutboundEvent> {
        self.handle_event_at(connection_id, event, Utc::now()).await
    }

    /// Apply one inbound event and return the replies for its sender.
    pub async fn handle_event_at(
        &self,
        connection_id: ConnectionId,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> Vec<OutboundEvent> {
        let name = event.name();
        self.registry.touch_at(connection_id, now).await;
        let Some(record) = self.registry.get(connection_id).await else {
            warn!(connection_id = %connection_id, event = name, "event from unknown connection");
            let missing = GatewayError::NotFound(format!("connection {connection_id}"));
            return vec![reject(name, &missing)];
        };
        let user_id = record.user_id.as_str();

        match event {
            InboundEvent::TelemetrySubmit(payload) => {
                match self.submit_telemetry(user_id, payload, now).await {
                    Ok(()) => Vec::new(),
                    Err(rejected) => vec![reject(name, &rejected)],
                }
            }
            InboundEvent::AlertTrigger(payload) => {
                match self.trigger_alert(user_id, payload, now).await {
                    Ok(()) => vec![OutboundEvent::Ack(Ack::ok(name))],
                    Err(rejected) => vec![reject(name, &rejected)],
                }
            }
            InboundEvent::DeviceSubscribe(selection) => {
                vec![self.subscribe_devices(connection_id, user_id, selection).await]
            }
            InboundEvent::DeviceUnsubscribe(selection) => {
                if let Err(invalid) = selection.validate() {
                    return vec![reject(name, &invalid.into())];
                }
                self.router.unsubscribe_many(connection_id, &selection.device_ids).await;
                vec![OutboundEvent::Ack(Ack::ok(name))]
            }
            InboundEvent::Ping => vec![OutboundEvent::Pong { timestamp: now }],
        }
    }

    async fn submit_telemetry(
        &self,
        user_id: &str,
        payload: TelemetryPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        payload.validate()?;
        self.router.authorize_at(user_id, &payload.device_id, now).await?;
        let device_id = payload.device_id.clone();
        self.fanout.publish_to_device(&device_id, &OutboundEvent::MetricsRealtime(payload)).await;
        Ok(())
    }

    async fn trigger_alert(
        &self,
        user_id: &str,
        payload: AlertPayload,
        now: DateTime<Utc>,
    ) -> Result<()> {
        payload.validate()?;
        self.router.authorize_at(user_id, &payload.device_id, now).await?;

        let belongs = self
            .alerts
            .alert_belongs_to_device(&payload.alert_id, &payload.device_id)
            .await
            .map_err(|lookup_error| {
                error!(
                    error = ?lookup_error,
                    alert_id = %payload.alert_id,
                    device_id = %payload.device_id,
                    "alert lookup failed, rejecting trigger"
                );
                GatewayError::Internal("alert lookup unavailable".to_string())
            })?;
        if !belongs {
            return Err(GatewayError::AlertAuthorization {
                alert_id: payload.alert_id,
                device_id: payload.device_id,
            });
        }

        info!(
            alert_id = %payload.alert_id,
            device_id = %payload.device_id,
            severity = ?payload.severity,
            "alert triggered"
        );
        self.fanout.publish_global(&OutboundEvent::AlertRealtime(payload)).await;
        Ok(())
    }

    async fn subscribe_devices(
        &self,
        connection_id: ConnectionId,
        user_id: &str,
        selection: DeviceSelection,
    ) -> OutboundEvent {
        if let Err(invalid) = selection.validate() {
            return reject(events::DEVICE_SUBSCRIBE, &invalid.into());
        }
        match self.router.subscribe_many(connection_id, user_id, &selection.device_ids).await {
            Ok(_) => OutboundEvent::Ack(Ack::ok(events::DEVICE_SUBSCRIBE)),
            Err(failed) => OutboundEvent::Ack(
                Ack::rejected(events::DEVICE_SUBSCRIBE, failed.source.to_string())
                    .with_device_id(failed.device_id),
            ),
        }
    }

    pub async fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.registry.stats().await,
            cache: self.cache.stats(),
            rooms: self.router.room_count().await,
        }
    }

    /// Start the inactivity reaper and the cache sweeper.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let reaper = InactivityReaper::new(self.clone(), self.settings.inactivity_threshold);
        BackgroundTasks::spawn(
            reaper,
            self.settings.reaper_interval,
            Arc::clone(&self.cache),
            self.settings.cache_sweep_interval,
        )
    }
}

/// First frame sent on an active connection.
pub fn connection_established(record: &ConnectionRecord) -> OutboundEvent {
    OutboundEvent::ConnectionEstablished {
        connection_id: record.connection_id.to_string(),
        timestamp: record.connected_at,
    }
}

/// Reply sent before closing a connection whose handshake failed.
pub fn handshake_rejection(failure: &GatewayError) -> OutboundEvent {
    let reason = match failure {
        GatewayError::InvalidIdentity(_) => failure.to_string(),
        _ => UNAUTHORIZED_REASON.to_string(),
    };
    OutboundEvent::Ack(Ack::rejected(events::CONNECT, reason))
}

/// Reply for a frame that could not be decoded.
pub fn decode_rejection(failure: &DecodeError) -> OutboundEvent {
    OutboundEvent::Ack(Ack::rejected(failure.event(), failure.to_string()))
}

/// Reply for a throttled event. Telemetry is dropped without one.
pub fn rate_limited_reply(event: &InboundEvent) -> Option<OutboundEvent> {
    match event {
        InboundEvent::TelemetrySubmit(_) => None,
        _ => Some(reject(event.name(), &GatewayError::RateLimited)),
    }
}

fn reject(event: &str, error: &GatewayError) -> OutboundEvent {
    OutboundEvent::Ack(Ack::rejected(event, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::MemoryDirectory;
    use crate::sink::SinkReceiver;
    use freemonitor_common::payload::{AlertSeverity, AlertType};
    use serde_json::Value;
    use uuid::Uuid;

    async fn gateway() -> Gateway {
        let directory = MemoryDirectory::default();
        directory.insert_device("d1", "alice").await;
        directory.insert_device("d2", "bob").await;
        directory.insert_device("d3", "alice").await;
        directory.insert_alert("alert-1", "d1").await;
        directory.insert_alert("alert-2", "d2").await;
        let directory = Arc::new(directory);
        Gateway::new(GatewaySettings::default(), directory.clone(), directory)
    }

    async fn connect(gateway: &Gateway, user: &str, device: &str) -> (ConnectionId, SinkReceiver) {
        let id = Uuid::new_v4();
        let (sink, receiver) = ConnectionSink::channel(16);
        gateway.connect(id, &Identity::new(user), device, sink).await.expect("handshake");
        (id, receiver)
    }

    fn frames(receiver: &mut SinkReceiver) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.frames.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("frame should be json"));
        }
        frames
    }

    fn alert(alert_id: &str, device_id: &str) -> AlertPayload {
        AlertPayload {
            alert_id: alert_id.to_string(),
            device_id: device_id.to_string(),
            alert_type: AlertType::Cpu,
            severity: AlertSeverity::Critical,
            message: "cpu above threshold".to_string(),
            threshold: 90.0,
            current_value: 97.5,
            triggered_at: Utc::now(),
            resolved_at: None,
            acknowledged_by: None,
            metadata: None,
        }
    }

    fn ack(replies: &[OutboundEvent]) -> &Ack {
        match replies {
            [OutboundEvent::Ack(ack)] => ack,
            other => panic!("expected a single ack, got {other:?}"),
        }
    }

    #[test]
    fn state_machine_rejects_backwards_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Authorized));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Authorized.can_transition_to(Active));
        assert!(Active.can_transition_to(Disconnected));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Active));
        assert!(Active.advance(Authorized).is_err());
    }

    #[tokio::test]
    async fn handshake_joins_device_and_user_rooms() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;

        let rooms = gateway.registry().rooms_for(id).await.expect("connection registered");
        assert!(rooms.contains(&Room::Device("d1".into())));
        assert!(rooms.contains(&Room::User("alice".into())));
        assert_eq!(gateway.router().room_count().await, 2);
    }

    #[tokio::test]
    async fn unauthorized_handshake_leaves_nothing_behind() {
        let gateway = gateway().await;
        let (sink, _rx) = ConnectionSink::channel(4);

        let error = gateway
            .connect(Uuid::new_v4(), &Identity::new("alice"), "d2", sink)
            .await
            .expect_err("bob owns d2");

        assert_eq!(error, GatewayError::unauthorized("d2"));
        assert_eq!(gateway.registry().len().await, 0);
        assert_eq!(gateway.router().room_count().await, 0);
        match handshake_rejection(&error) {
            OutboundEvent::Ack(ack) => {
                assert_eq!(ack.event, "connect");
                assert_eq!(ack.reason.as_deref(), Some(UNAUTHORIZED_REASON));
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_cascades_into_room_cleanup() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;
        let selection = DeviceSelection { device_ids: vec!["d3".into()] };
        gateway.handle_event(id, InboundEvent::DeviceSubscribe(selection)).await;

        assert!(gateway.disconnect(id).await);
        assert!(!gateway.disconnect(id).await, "second disconnect is a no-op");
        assert!(!gateway.registry().contains(id).await);
        assert!(!gateway.router().is_member_anywhere(id).await);
        assert_eq!(gateway.router().room_count().await, 0);
    }

    #[tokio::test]
    async fn telemetry_reaches_device_subscribers_without_ack() {
        let gateway = gateway().await;
        let (agent, mut agent_rx) = connect(&gateway, "alice", "d1").await;
        let (_other, mut other_rx) = connect(&gateway, "alice", "d3").await;

        let payload = TelemetryPayload::new("d1", 75.5, 60.2, 45.8);
        let replies = gateway.handle_event(agent, InboundEvent::TelemetrySubmit(payload)).await;

        assert!(replies.is_empty());
        let received = frames(&mut agent_rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["event"], "metrics.realtime");
        assert_eq!(received[0]["data"]["cpu"], 75.5);
        assert!(frames(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn invalid_telemetry_is_rejected_before_fanout() {
        let gateway = gateway().await;
        let (agent, mut agent_rx) = connect(&gateway, "alice", "d1").await;

        let payload = TelemetryPayload::new("d1", 120.0, 1.0, 1.0);
        let replies = gateway.handle_event(agent, InboundEvent::TelemetrySubmit(payload)).await;

        let ack = ack(&replies);
        assert_eq!(ack.event, "telemetry.submit");
        assert!(!ack.success);
        assert!(frames(&mut agent_rx).is_empty());
    }

    #[tokio::test]
    async fn telemetry_for_foreign_device_is_rejected() {
        let gateway = gateway().await;
        let (agent, _rx) = connect(&gateway, "alice", "d1").await;

        let payload = TelemetryPayload::new("d2", 1.0, 1.0, 1.0);
        let replies = gateway.handle_event(agent, InboundEvent::TelemetrySubmit(payload)).await;

        assert_eq!(ack(&replies).reason.as_deref(), Some("not authorized for device d2"));
    }

    #[tokio::test]
    async fn bulk_subscribe_reports_offending_device() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;
        let selection = DeviceSelection { device_ids: vec!["d3".into(), "d2".into()] };

        let replies = gateway.handle_event(id, InboundEvent::DeviceSubscribe(selection)).await;

        let ack = ack(&replies);
        assert!(!ack.success);
        assert_eq!(ack.device_id.as_deref(), Some("d2"));
        assert!(gateway.router().is_subscribed(id, "d3").await);
        assert!(!gateway.router().is_subscribed(id, "d2").await);
    }

    #[tokio::test]
    async fn empty_selection_is_a_validation_error() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;

        let selection = DeviceSelection { device_ids: vec![] };
        let replies = gateway.handle_event(id, InboundEvent::DeviceUnsubscribe(selection)).await;

        assert!(!ack(&replies).success);
        assert!(gateway.router().is_subscribed(id, "d1").await);
    }

    #[tokio::test]
    async fn unsubscribe_acks_and_leaves_room() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;

        let selection = DeviceSelection { device_ids: vec!["d1".into(), "d9".into()] };
        let replies = gateway.handle_event(id, InboundEvent::DeviceUnsubscribe(selection)).await;

        assert!(ack(&replies).success);
        assert!(!gateway.router().is_subscribed(id, "d1").await);
    }

    #[tokio::test]
    async fn alert_is_broadcast_globally_and_acked() {
        let gateway = gateway().await;
        let (agent, mut agent_rx) = connect(&gateway, "alice", "d1").await;
        let (_viewer, mut viewer_rx) = connect(&gateway, "bob", "d2").await;

        let replies =
            gateway.handle_event(agent, InboundEvent::AlertTrigger(alert("alert-1", "d1"))).await;

        assert!(ack(&replies).success);
        assert_eq!(frames(&mut agent_rx)[0]["event"], "alert.realtime");
        assert_eq!(frames(&mut viewer_rx)[0]["data"]["alertId"], "alert-1");
    }

    #[tokio::test]
    async fn alert_for_another_device_is_rejected() {
        let gateway = gateway().await;
        let (agent, mut agent_rx) = connect(&gateway, "alice", "d1").await;

        let replies =
            gateway.handle_event(agent, InboundEvent::AlertTrigger(alert("alert-2", "d1"))).await;

        let ack = ack(&replies);
        assert!(!ack.success);
        assert_eq!(ack.reason.as_deref(), Some("alert alert-2 does not belong to device d1"));
        assert!(frames(&mut agent_rx).is_empty());
    }

    #[tokio::test]
    async fn events_refresh_activity_and_ping_pongs() {
        let gateway = gateway().await;
        let (id, _rx) = connect(&gateway, "alice", "d1").await;
        let later = Utc::now() + Duration::minutes(10);

        let replies = gateway.handle_event_at(id, InboundEvent::Ping, later).await;

        assert_eq!(replies, vec![OutboundEvent::Pong { timestamp: later }]);
        let record = gateway.registry().get(id).await.expect("connection registered");
        assert_eq!(record.last_activity_at, later);
    }

    #[tokio::test]
    async fn unknown_connection_gets_rejection() {
        let gateway = gateway().await;
        let replies = gateway.handle_event(Uuid::new_v4(), InboundEvent::Ping).await;
        assert!(!ack(&replies).success);
    }

    #[test]
    fn throttled_telemetry_is_dropped_silently() {
        let telemetry = InboundEvent::TelemetrySubmit(TelemetryPayload::new("d1", 1.0, 1.0, 1.0));
        assert!(rate_limited_reply(&telemetry).is_none());
        let subscribe =
            InboundEvent::DeviceSubscribe(DeviceSelection { device_ids: vec!["d1".to_string()] });
        match rate_limited_reply(&subscribe) {
            Some(OutboundEvent::Ack(ack)) => {
                assert_eq!(ack.reason.as_deref(), Some("rate limited"))
            }
            other => panic!("expected rate limited ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_combine_every_structure() {
        let gateway = gateway().await;
        connect(&gateway, "alice", "d1").await;
        connect(&gateway, "bob", "d2").await;

        let stats = gateway.stats().await;

        assert_eq!(stats.connections.total_connections, 2);
        assert_eq!(stats.connections.unique_users, 2);
        assert_eq!(stats.rooms, 4);
        assert_eq!(stats.cache.size, 2);
    }
}
