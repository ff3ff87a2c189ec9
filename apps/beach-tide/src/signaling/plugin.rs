//! Message bodies understood by the SFU plugin.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use super::SignalingError;

pub type RoomId = String;
pub type UserId = String;

pub const SFU_PLUGIN: &str = "janus.plugin.sfu";

/// Which traffic the gateway should push to this connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSpec {
    /// Room-wide notifications such as user joins and leaves.
    pub notifications: bool,
    /// Data channel traffic in the joined room.
    pub data: bool,
    /// Audio and video from a single user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<UserId>,
}

impl SubscriptionSpec {
    pub fn publisher(data: bool) -> Self {
        Self {
            notifications: true,
            data,
            media: None,
        }
    }

    pub fn media_from(user_id: impl Into<UserId>) -> Self {
        Self {
            notifications: false,
            data: false,
            media: Some(user_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PluginRequest {
    Join {
        room_id: RoomId,
        user_id: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscribe: Option<SubscriptionSpec>,
    },
    Subscribe {
        what: SubscriptionSpec,
    },
    Block {
        whom: UserId,
    },
    Unblock {
        whom: UserId,
    },
}

impl PluginRequest {
    pub fn to_body(&self) -> Result<Value, SignalingError> {
        serde_json::to_value(self)
            .map_err(|err| SignalingError::Protocol(format!("encode plugin request: {err}")))
    }
}

/// Users already present in each room, as returned by a successful join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub users: HashMap<RoomId, BTreeSet<UserId>>,
}

impl JoinResponse {
    pub fn from_response(response: Option<&Value>) -> Result<Self, SignalingError> {
        match response {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| SignalingError::Protocol(format!("malformed join response: {err}"))),
            None => Ok(JoinResponse::default()),
        }
    }

    pub fn members_of(&self, room_id: &str) -> BTreeSet<UserId> {
        self.users.get(room_id).cloned().unwrap_or_default()
    }
}

/// Unsolicited plugin events pushed to a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    Join { room_id: RoomId, user_id: UserId },
    Leave { room_id: RoomId, user_id: UserId },
    Blocked { by: UserId },
    Unblocked { by: UserId },
    Data { body: Value },
    Unrecognized(Value),
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum KnownPluginEvent {
    Join { room_id: RoomId, user_id: UserId },
    Leave { room_id: RoomId, user_id: UserId },
    Blocked { by: UserId },
    Unblocked { by: UserId },
    Data { body: Value },
}

impl PluginEvent {
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<KnownPluginEvent>(value.clone()) {
            Ok(KnownPluginEvent::Join { room_id, user_id }) => {
                PluginEvent::Join { room_id, user_id }
            }
            Ok(KnownPluginEvent::Leave { room_id, user_id }) => {
                PluginEvent::Leave { room_id, user_id }
            }
            Ok(KnownPluginEvent::Blocked { by }) => PluginEvent::Blocked { by },
            Ok(KnownPluginEvent::Unblocked { by }) => PluginEvent::Unblocked { by },
            Ok(KnownPluginEvent::Data { body }) => PluginEvent::Data { body },
            Err(_) => PluginEvent::Unrecognized(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_body_matches_plugin_shape() {
        let body = PluginRequest::Join {
            room_id: "lobby".into(),
            user_id: "42".into(),
            subscribe: Some(SubscriptionSpec::publisher(true)),
        }
        .to_body()
        .unwrap();
        assert_eq!(
            body,
            json!({
                "kind": "join",
                "room_id": "lobby",
                "user_id": "42",
                "subscribe": {"notifications": true, "data": true}
            })
        );
    }

    #[test]
    fn media_subscription_names_the_publisher() {
        let body = PluginRequest::Subscribe {
            what: SubscriptionSpec::media_from("steve"),
        }
        .to_body()
        .unwrap();
        assert_eq!(body["what"]["media"], "steve");
        assert_eq!(body["what"]["data"], false);
    }

    #[test]
    fn parses_room_events() {
        let event =
            PluginEvent::from_value(json!({"event": "join", "room_id": "r", "user_id": "7"}));
        assert_eq!(
            event,
            PluginEvent::Join {
                room_id: "r".into(),
                user_id: "7".into()
            }
        );
        let event = PluginEvent::from_value(json!({"event": "blocked", "by": "9"}));
        assert_eq!(event, PluginEvent::Blocked { by: "9".into() });
    }

    #[test]
    fn unknown_event_is_kept_for_reporting() {
        let raw = json!({"event": "fiddle", "x": 1});
        assert_eq!(
            PluginEvent::from_value(raw.clone()),
            PluginEvent::Unrecognized(raw)
        );
    }

    #[test]
    fn join_response_lists_room_members() {
        let response = json!({"users": {"lobby": ["1", "2"], "other": ["3"]}});
        let parsed = JoinResponse::from_response(Some(&response)).unwrap();
        let members: Vec<_> = parsed.members_of("lobby").into_iter().collect();
        assert_eq!(members, vec!["1".to_string(), "2".to_string()]);
        assert!(parsed.members_of("missing").is_empty());
    }
}
