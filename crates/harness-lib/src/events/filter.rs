//! Composable event predicates

use super::{CloudEvent, SyncState};
use serde::{Deserialize, Serialize};

/// Boolean algebra over cloud-event predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventFilter {
    IsType(String),
    /// Some value equals this string (numbers compared by their JSON text)
    HasValue(String),
    /// Some resource address ends with `/<interface>`
    OnInterface(String),
    /// Some resource address contains this fragment
    ContainingResource(String),
    /// Some enumeration value equals the sync state
    WithSyncState(SyncState),
    /// `true` rejects events from the consumer's initial current-state pull
    WithoutCurrentState(bool),
    All(Vec<EventFilter>),
    Any(Vec<EventFilter>),
}

impl EventFilter {
    pub fn matches(&self, event: &CloudEvent) -> bool {
        match self {
            EventFilter::IsType(t) => event.type_ == *t,
            EventFilter::HasValue(v) => event.values().any(|value| value.value_string() == *v),
            EventFilter::OnInterface(iface) => {
                let suffix = format!("/{}", iface);
                event.values().any(|value| value.resource_address.ends_with(&suffix))
            }
            EventFilter::ContainingResource(resource) => event
                .values()
                .any(|value| value.resource_address.contains(resource.as_str())),
            EventFilter::WithSyncState(state) => event
                .values()
                .any(|value| value.is_enumeration() && value.value_string() == state.as_str()),
            EventFilter::WithoutCurrentState(true) => !event.current_state,
            EventFilter::WithoutCurrentState(false) => true,
            EventFilter::All(filters) => filters.iter().all(|f| f.matches(event)),
            EventFilter::Any(filters) => filters.iter().any(|f| f.matches(event)),
        }
    }

    pub fn and(self, other: EventFilter) -> EventFilter {
        match self {
            EventFilter::All(mut filters) => {
                filters.push(other);
                EventFilter::All(filters)
            }
            first => EventFilter::All(vec![first, other]),
        }
    }

    /// `event_type` carrying `state`
    pub fn state_change(event_type: &str, state: SyncState) -> Self {
        EventFilter::All(vec![
            EventFilter::IsType(event_type.to_string()),
            EventFilter::WithSyncState(state),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_types, EventData, EventValue};
    use chrono::Utc;
    use serde_json::json;

    fn event(current_state: bool) -> CloudEvent {
        CloudEvent {
            id: "1".into(),
            type_: event_types::PTP_STATE_CHANGE.into(),
            source: "/sync/ptp-status/lock-state".into(),
            time: Utc::now(),
            data: EventData {
                version: "1.0".into(),
                values: vec![
                    EventValue {
                        resource_address: "/cluster/node/n0/ens1f0".into(),
                        data_type: "notification".into(),
                        value_type: "enumeration".into(),
                        value: json!("LOCKED"),
                    },
                    EventValue {
                        resource_address: "/cluster/node/n0/ens1f0".into(),
                        data_type: "metric".into(),
                        value_type: "decimal64.3".into(),
                        value: json!(6),
                    },
                ],
            },
            current_state,
        }
    }

    #[test]
    fn test_leaf_predicates() {
        let e = event(false);
        assert!(EventFilter::IsType(event_types::PTP_STATE_CHANGE.into()).matches(&e));
        assert!(!EventFilter::IsType(event_types::GNSS_STATE_CHANGE.into()).matches(&e));
        assert!(EventFilter::HasValue("6".into()).matches(&e));
        assert!(EventFilter::OnInterface("ens1f0".into()).matches(&e));
        assert!(!EventFilter::OnInterface("f0".into()).matches(&e));
        assert!(EventFilter::ContainingResource("node/n0".into()).matches(&e));
        assert!(EventFilter::WithSyncState(SyncState::Locked).matches(&e));
        assert!(!EventFilter::WithSyncState(SyncState::Freerun).matches(&e));
    }

    #[test]
    fn test_current_state_filtering() {
        let snapshot = event(true);
        assert!(!EventFilter::WithoutCurrentState(true).matches(&snapshot));
        assert!(EventFilter::WithoutCurrentState(false).matches(&snapshot));
        assert!(EventFilter::WithoutCurrentState(true).matches(&event(false)));
    }

    #[test]
    fn test_composition() {
        let e = event(false);
        let filter = EventFilter::state_change(event_types::PTP_STATE_CHANGE, SyncState::Locked)
            .and(EventFilter::Any(vec![
                EventFilter::OnInterface("ens2f0".into()),
                EventFilter::OnInterface("ens1f0".into()),
            ]));
        assert!(filter.matches(&e));

        assert!(EventFilter::All(vec![]).matches(&e));
        assert!(!EventFilter::Any(vec![]).matches(&e));
    }
}
