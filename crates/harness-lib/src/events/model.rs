//! Cloud event records as written to the consumer's event store
//!
//! The store holds one JSON event per line. Events captured from the
//! consumer's initial current-state pull carry `currentState: true`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type URIs published by the PTP event framework
pub mod event_types {
    pub const PTP_STATE_CHANGE: &str = "event.sync.ptp-status.ptp-state-change";
    pub const PTP_CLOCK_CLASS_CHANGE: &str = "event.sync.ptp-status.ptp-clock-class-change";
    pub const OS_CLOCK_SYNC_STATE_CHANGE: &str = "event.sync.sync-status.os-clock-sync-state-change";
    pub const GNSS_STATE_CHANGE: &str = "event.sync.gnss-status.gnss-state-change";
    pub const SYNC_STATE_CHANGE: &str = "event.sync.sync-status.synchronization-state-change";
}

/// Synchronisation state carried by enumeration values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncState {
    Locked,
    Freerun,
    Holdover,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Locked => "LOCKED",
            SyncState::Freerun => "FREERUN",
            SyncState::Holdover => "HOLDOVER",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub source: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub data: EventData,
    #[serde(default, rename = "currentState")]
    pub current_state: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub values: Vec<EventValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventValue {
    #[serde(rename = "ResourceAddress", default)]
    pub resource_address: String,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub value_type: String,
    /// Enumerations arrive as strings, metrics as numbers
    pub value: serde_json::Value,
}

impl EventValue {
    pub fn value_string(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_enumeration(&self) -> bool {
        self.value_type == "enumeration"
    }
}

impl CloudEvent {
    pub fn values(&self) -> impl Iterator<Item = &EventValue> {
        self.data.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_change_event() {
        let raw = r#"{
            "id": "c8f2",
            "type": "event.sync.ptp-status.ptp-state-change",
            "source": "/sync/ptp-status/lock-state",
            "time": "2026-03-01T10:00:00.5Z",
            "data": {
                "version": "1.0",
                "values": [
                    {"ResourceAddress": "/cluster/node/n0/ens1f0", "data_type": "notification", "value_type": "enumeration", "value": "LOCKED"},
                    {"ResourceAddress": "/cluster/node/n0/ens1f0", "data_type": "metric", "value_type": "decimal64.3", "value": -3}
                ]
            }
        }"#;

        let event: CloudEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.type_, event_types::PTP_STATE_CHANGE);
        assert!(!event.current_state);
        assert_eq!(event.data.values.len(), 2);
        assert_eq!(event.data.values[0].value_string(), "LOCKED");
        assert_eq!(event.data.values[1].value_string(), "-3");
    }

    #[test]
    fn test_sync_state_serde() {
        assert_eq!(serde_json::to_string(&SyncState::Holdover).unwrap(), "\"HOLDOVER\"");
        assert_eq!(SyncState::Locked.to_string(), "LOCKED");
    }
}
