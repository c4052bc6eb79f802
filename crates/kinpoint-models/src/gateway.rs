use serde::{Deserialize, Serialize};

// Client -> server verbs
pub const VERB_LOCATION_UPDATE: &str = "location_update";
pub const VERB_PING: &str = "ping";
pub const VERB_JOIN_FAMILY: &str = "join_family";
pub const VERB_LEAVE_FAMILY: &str = "leave_family";
pub const VERB_GHOST_MODE: &str = "ghost_mode";
pub const VERB_USER_ADDED_TO_FAMILY: &str = "user_added_to_family";
pub const VERB_USER_REMOVED_FROM_FAMILY: &str = "user_removed_from_family";
pub const VERB_FAMILY_DELETED: &str = "family_deleted";
pub const VERB_MEMBER_ROLE_UPDATED: &str = "member_role_updated";
pub const VERB_REFRESH_FAMILY_CACHE: &str = "refresh_family_cache";

// Server -> client events
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_ACK: &str = "ack";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_LOCATION_UPDATE: &str = "location_update";
pub const EVENT_PRESENCE_UPDATE: &str = "presence_update";
pub const EVENT_GHOST_MODE: &str = "ghost_mode";
pub const EVENT_GEOFENCE_ALERT: &str = "geofence_alert";
pub const EVENT_NOTIFICATION: &str = "notification";
pub const EVENT_FAMILY_MEMBER_ADDED: &str = "family_member_added";
pub const EVENT_FAMILY_MEMBER_REMOVED: &str = "family_member_removed";
pub const EVENT_FAMILY_DELETED: &str = "family_deleted";
pub const EVENT_MEMBER_ROLE_UPDATED: &str = "member_role_updated";
pub const EVENT_CACHE_REFRESHED: &str = "cache_refreshed";

/// One frame on the gateway socket, both directions: an event name plus its
/// JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GatewayFrame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_data_defaults_to_null() {
        let frame: GatewayFrame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(frame.event, "ping");
        assert!(frame.data.is_null());
    }
}
