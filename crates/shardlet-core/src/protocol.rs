//! Versioned telemetry messages exchanged with a remote coordination node
//!
//! Only the schema lives here; moving the bytes is the transport's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClusterError, ClusterResult, DeviceId, DeviceMetrics, GpuDevice};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Announces a device and its capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Host the device is attached to
    pub hostname: String,
    /// Port the host's worker listens on
    pub port: u16,
    /// Capability descriptor
    pub device: GpuDevice,
}

/// Periodic status report for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Device the heartbeat is about
    pub device_id: DeviceId,
    /// Current metrics
    pub metrics: DeviceMetrics,
    /// Whether the device accepts new work
    pub is_available: bool,
    /// Last error reported by the host, if any
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Closed set of telemetry message kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Registration(DeviceRegistration),
    Heartbeat(Heartbeat),
}

impl TelemetryMessage {
    /// Device the message concerns
    pub fn device_id(&self) -> &str {
        match self {
            TelemetryMessage::Registration(r) => &r.device.id,
            TelemetryMessage::Heartbeat(h) => &h.device_id,
        }
    }

    /// Check the payload after deserialization
    pub fn validate(&self) -> ClusterResult<()> {
        match self {
            TelemetryMessage::Registration(r) => {
                if r.hostname.trim().is_empty() {
                    return Err(ClusterError::Validation(
                        "registration must name a hostname".to_string(),
                    ));
                }
                r.device.validate()
            }
            TelemetryMessage::Heartbeat(h) => {
                if h.device_id != h.metrics.device_id {
                    return Err(ClusterError::Validation(format!(
                        "heartbeat for {} carries metrics for {}",
                        h.device_id, h.metrics.device_id
                    )));
                }
                h.metrics.validate()
            }
        }
    }
}

/// Message wrapped with its schema version and send time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub version: u32,
    pub sent_at: DateTime<Utc>,
    pub message: TelemetryMessage,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl TelemetryEnvelope {
    /// Wrap a message at the current schema version
    pub fn new(message: TelemetryMessage) -> Self {
        Self {
            version: SCHEMA_VERSION,
            sent_at: Utc::now(),
            message,
        }
    }

    /// Serialize to JSON
    pub fn encode(&self) -> ClusterResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a JSON envelope
    ///
    /// The version is checked before the payload so that a newer schema is
    /// reported as unsupported rather than as a parse failure.
    pub fn decode(json: &str) -> ClusterResult<Self> {
        let probe: VersionProbe = serde_json::from_str(json)?;
        if probe.version != SCHEMA_VERSION {
            return Err(ClusterError::UnsupportedSchema(probe.version));
        }
        let envelope: Self = serde_json::from_str(json)?;
        envelope.message.validate()?;
        Ok(envelope)
    }
}
