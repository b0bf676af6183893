// Event envelopes for the freemonitor realtime protocol.
//
// Every frame is `{"event": <name>, "data": <payload>}`. Inbound frames are
// decoded in two stages so a bad payload can still be acknowledged against
// the event that carried it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::payload::{AlertPayload, DeviceSelection, TelemetryPayload};

pub const TELEMETRY_SUBMIT: &str = "telemetry.submit";
pub const ALERT_TRIGGER: &str = "alert.trigger";
pub const DEVICE_SUBSCRIBE: &str = "device.subscribe";
pub const DEVICE_UNSUBSCRIBE: &str = "device.unsubscribe";
pub const PING: &str = "ping";

pub const CONNECTION_ESTABLISHED: &str = "connection.established";
pub const METRICS_REALTIME: &str = "metrics.realtime";
pub const ALERT_REALTIME: &str = "alert.realtime";
pub const PONG: &str = "pong";
pub const ACK: &str = "ack";

/// Pseudo event name used when acknowledging the handshake itself.
pub const CONNECT: &str = "connect";
/// Pseudo event name used when a frame could not be attributed to an event.
pub const UNKNOWN: &str = "unknown";

/// Raw envelope before the payload is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Client -> Server events.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TelemetrySubmit(TelemetryPayload),
    AlertTrigger(AlertPayload),
    DeviceSubscribe(DeviceSelection),
    DeviceUnsubscribe(DeviceSelection),
    Ping,
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TelemetrySubmit(_) => TELEMETRY_SUBMIT,
            Self::AlertTrigger(_) => ALERT_TRIGGER,
            Self::DeviceSubscribe(_) => DEVICE_SUBSCRIBE,
            Self::DeviceUnsubscribe(_) => DEVICE_UNSUBSCRIBE,
            Self::Ping => PING,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            Self::TelemetrySubmit(payload) => serde_json::to_value(payload)?,
            Self::AlertTrigger(payload) => serde_json::to_value(payload)?,
            Self::DeviceSubscribe(selection) | Self::DeviceUnsubscribe(selection) => {
                serde_json::to_value(selection)?
            }
            Self::Ping => Value::Null,
        };
        serde_json::to_string(&Envelope { event: self.name().to_string(), data })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid {event} payload: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Event name an acknowledgement for this failure should carry.
    pub fn event(&self) -> &str {
        match self {
            Self::Envelope(_) | Self::UnknownEvent(_) => UNKNOWN,
            Self::Payload { event, .. } => event,
        }
    }
}

pub fn decode_inbound(raw: &str) -> Result<InboundEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(DecodeError::Envelope)?;
    let Envelope { event, data } = envelope;

    match event.as_str() {
        TELEMETRY_SUBMIT => payload(TELEMETRY_SUBMIT, data).map(InboundEvent::TelemetrySubmit),
        ALERT_TRIGGER => payload(ALERT_TRIGGER, data).map(InboundEvent::AlertTrigger),
        DEVICE_SUBSCRIBE => payload(DEVICE_SUBSCRIBE, data).map(InboundEvent::DeviceSubscribe),
        DEVICE_UNSUBSCRIBE => {
            payload(DEVICE_UNSUBSCRIBE, data).map(InboundEvent::DeviceUnsubscribe)
        }
        PING => Ok(InboundEvent::Ping),
        _ => Err(DecodeError::UnknownEvent(event)),
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    event: &'static str,
    data: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Payload { event, source })
}

/// Outcome of a request-style event (subscribe, unsubscribe, trigger, connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub event: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Device a failed bulk request stopped at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Ack {
    pub fn ok(event: impl Into<String>) -> Self {
        Self { event: event.into(), success: true, reason: None, device_id: None }
    }

    pub fn rejected(event: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { event: event.into(), success: false, reason: Some(reason.into()), device_id: None }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "connection.established", rename_all = "camelCase")]
    ConnectionEstablished { connection_id: String, timestamp: DateTime<Utc> },
    #[serde(rename = "metrics.realtime")]
    MetricsRealtime(TelemetryPayload),
    #[serde(rename = "alert.realtime")]
    AlertRealtime(AlertPayload),
    #[serde(rename = "ack")]
    Ack(Ack),
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => CONNECTION_ESTABLISHED,
            Self::MetricsRealtime(_) => METRICS_REALTIME,
            Self::AlertRealtime(_) => ALERT_REALTIME,
            Self::Ack(_) => ACK,
            Self::Pong { .. } => PONG,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
