// Broadcast fanout: encode once, deliver to a snapshot of recipients.

use std::time::{Duration, Instant};

use freemonitor_common::protocol::events::OutboundEvent;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::registry::{ConnectionId, ConnectionRegistry, Room};
use crate::router::SubscriptionRouter;
use crate::sink::{ConnectionSink, Frame};

/// Fanouts slower than this are logged at warn.
pub const SLOW_FANOUT_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct BroadcastFanout {
    registry: ConnectionRegistry,
    router: SubscriptionRouter,
}

impl BroadcastFanout {
    pub fn new(registry: ConnectionRegistry, router: SubscriptionRouter) -> Self {
        Self { registry, router }
    }

    /// Deliver to every connection subscribed to `device_id` at call time.
    pub async fn publish_to_device(&self, device_id: &str, event: &OutboundEvent) -> FanoutReport {
        self.publish_to_room(&Room::Device(device_id.to_string()), event).await
    }

    /// Deliver to every live connection of `user_id`.
    pub async fn publish_to_user(&self, user_id: &str, event: &OutboundEvent) -> FanoutReport {
        self.publish_to_room(&Room::User(user_id.to_string()), event).await
    }

    /// Deliver to every registered connection.
    pub async fn publish_global(&self, event: &OutboundEvent) -> FanoutReport {
        let started = Instant::now();
        let recipients = self.registry.sinks().await;
        self.deliver("global", event, recipients, started)
    }

    async fn publish_to_room(&self, room: &Room, event: &OutboundEvent) -> FanoutReport {
        let started = Instant::now();
        // Membership is read and released before any sink is touched.
        let members = self.router.subscribers(room).await;
        if members.is_empty() {
            debug!(room = %room, event = event.name(), "no subscribers for room");
            return FanoutReport::default();
        }
        let recipients = self.registry.sinks_for(&members).await;
        let target = room.to_string();
        self.deliver(&target, event, recipients, started)
    }

    fn deliver(
        &self,
        target: &str,
        event: &OutboundEvent,
        recipients: Vec<(ConnectionId, ConnectionSink)>,
        started: Instant,
    ) -> FanoutReport {
        let mut report = FanoutReport { recipients: recipients.len(), ..FanoutReport::default() };
        if recipients.is_empty() {
            return report;
        }

        let frame: Frame = match event.encode() {
            Ok(encoded) => Frame::from(encoded),
            Err(encode_error) => {
                error!(
                    error = %encode_error,
                    event = event.name(),
                    target,
                    "failed to encode event"
                );
                report.failed = report.recipients;
                return report;
            }
        };

        for (connection_id, sink) in recipients {
            match sink.try_deliver(Frame::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(delivery_error) => {
                    report.failed += 1;
                    warn!(
                        connection_id = %connection_id,
                        event = event.name(),
                        target,
                        error = %delivery_error,
                        "dropped frame for recipient"
                    );
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_FANOUT_THRESHOLD {
            warn!(
                event = event.name(),
                target,
                recipients = report.recipients,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow fanout"
            );
        } else {
            debug!(
                event = event.name(),
                target,
                recipients = report.recipients,
                delivered = report.delivered,
                "fanout complete"
            );
        }

        report
    }
}
