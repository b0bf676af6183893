// Telemetry and alert payloads carried over the gateway protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Lower bound for percentage gauges (cpu, memory, disk).
pub const PERCENT_MIN: f64 = 0.0;
/// Upper bound for percentage gauges (cpu, memory, disk).
pub const PERCENT_MAX: f64 = 100.0;

/// A payload that deserialized but violates a field constraint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
}

/// One telemetry sample pushed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TelemetryPayload {
    pub device_id: String,
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_out: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
}

impl TelemetryPayload {
    /// Sample with only the required gauges set.
    pub fn new(device_id: impl Into<String>, cpu: f64, memory: f64, disk: f64) -> Self {
        Self {
            device_id: device_id.into(),
            cpu,
            memory,
            disk,
            network_in: None,
            network_out: None,
            uptime: None,
            temperature: None,
            custom: None,
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        require_non_empty("deviceId", &self.device_id)?;
        require_percent("cpu", self.cpu)?;
        require_percent("memory", self.memory)?;
        require_percent("disk", self.disk)?;
        require_non_negative_opt("networkIn", self.network_in)?;
        require_non_negative_opt("networkOut", self.network_out)?;
        require_non_negative_opt("uptime", self.uptime)?;
        require_non_negative_opt("temperature", self.temperature)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Cpu,
    Memory,
    Disk,
    Network,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Critical,
    Warning,
    Info,
}

/// An alert raised by an agent against one of its devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlertPayload {
    pub alert_id: String,
    pub device_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl AlertPayload {
    pub fn validate(&self) -> Result<(), PayloadError> {
        require_non_empty("alertId", &self.alert_id)?;
        require_non_empty("deviceId", &self.device_id)?;
        require_non_negative("threshold", self.threshold)?;
        require_non_negative("currentValue", self.current_value)?;
        Ok(())
    }
}

/// Device ids named by a bulk subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeviceSelection {
    pub device_ids: Vec<String>,
}

impl DeviceSelection {
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.device_ids.is_empty() {
            return Err(PayloadError::Empty { field: "deviceIds" });
        }
        for device_id in &self.device_ids {
            require_non_empty("deviceIds[]", device_id)?;
        }
        Ok(())
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        return Err(PayloadError::Empty { field });
    }
    Ok(())
}

fn require_percent(field: &'static str, value: f64) -> Result<(), PayloadError> {
    // NaN fails the range check as well.
    if !(PERCENT_MIN..=PERCENT_MAX).contains(&value) {
        return Err(PayloadError::OutOfRange { field, value, min: PERCENT_MIN, max: PERCENT_MAX });
    }
    Ok(())
}

fn require_non_negative(field: &'static str, value: f64) -> Result<(), PayloadError> {
    if value.is_nan() || value < 0.0 {
        return Err(PayloadError::Negative { field, value });
    }
    Ok(())
}

fn require_non_negative_opt(field: &'static str, value: Option<f64>) -> Result<(), PayloadError> {
    match value {
        Some(value) => require_non_negative(field, value),
        None => Ok(()),
    }
}
