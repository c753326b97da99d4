use serde::Deserialize;
use serde_json::Value;

use crate::error::NotificationError;

/// Subset of the user object carried by friend notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushUser {
    pub id: Option<String>,
    pub display_name: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushNotification {
    FriendOnline {
        user_id: String,
        user: Option<PushUser>,
        location: Option<String>,
        traveling_to: Option<String>,
    },
    FriendActive {
        user_id: String,
        user: Option<PushUser>,
    },
    FriendOffline {
        user_id: String,
    },
    FriendLocation {
        user_id: String,
        user: Option<PushUser>,
        location: Option<String>,
        traveling_to: Option<String>,
    },
    FriendUpdate {
        user_id: String,
        user: Option<PushUser>,
    },
    UserUpdate {
        user_id: String,
        user: Option<PushUser>,
    },
    Unknown {
        kind: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Content {
    user_id: Option<String>,
    user: Option<PushUser>,
    location: Option<String>,
    traveling_to_location: Option<String>,
}

impl PushNotification {
    /// Parses one `{type, content}` envelope. `content` may be an object or a
    /// JSON document encoded as a string.
    pub fn parse(raw: &str) -> Result<Self, NotificationError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        let content: Content = match envelope.content {
            Value::String(encoded) if encoded.trim().is_empty() => Content::default(),
            Value::String(encoded) => serde_json::from_str(&encoded)?,
            Value::Null => Content::default(),
            object => serde_json::from_value(object)?,
        };

        let known = matches!(
            envelope.kind.as_str(),
            "friend-online"
                | "friend-active"
                | "friend-offline"
                | "friend-location"
                | "friend-update"
                | "user-update"
        );
        if !known {
            return Ok(Self::Unknown {
                kind: envelope.kind,
            });
        }

        let Content {
            user_id,
            user,
            location,
            traveling_to_location,
        } = content;
        let user_id = user_id
            .or_else(|| user.as_ref().and_then(|user| user.id.clone()))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NotificationError::MissingUserId {
                kind: envelope.kind.clone(),
            })?;
        let location = location.filter(|value| !value.is_empty());
        let traveling_to = traveling_to_location.filter(|value| !value.is_empty());

        Ok(match envelope.kind.as_str() {
            "friend-online" => Self::FriendOnline {
                user_id,
                user,
                location,
                traveling_to,
            },
            "friend-active" => Self::FriendActive { user_id, user },
            "friend-offline" => Self::FriendOffline { user_id },
            "friend-location" => Self::FriendLocation {
                user_id,
                user,
                location,
                traveling_to,
            },
            "friend-update" => Self::FriendUpdate { user_id, user },
            _ => Self::UserUpdate { user_id, user },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::FriendOnline { .. } => "friend-online",
            Self::FriendActive { .. } => "friend-active",
            Self::FriendOffline { .. } => "friend-offline",
            Self::FriendLocation { .. } => "friend-location",
            Self::FriendUpdate { .. } => "friend-update",
            Self::UserUpdate { .. } => "user-update",
            Self::Unknown { kind } => kind,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::FriendOnline { user_id, .. }
            | Self::FriendActive { user_id, .. }
            | Self::FriendOffline { user_id }
            | Self::FriendLocation { user_id, .. }
            | Self::FriendUpdate { user_id, .. }
            | Self::UserUpdate { user_id, .. } => Some(user_id),
            Self::Unknown { .. } => None,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::FriendOnline { user, .. }
            | Self::FriendActive { user, .. }
            | Self::FriendLocation { user, .. }
            | Self::FriendUpdate { user, .. }
            | Self::UserUpdate { user, .. } => user
                .as_ref()
                .map(|user| user.display_name.as_str())
                .filter(|name| !name.is_empty()),
            Self::FriendOffline { .. } | Self::Unknown { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_content() {
        let raw = r#"{"type":"friend-online","content":{"userId":"usr_a","location":"wrld_1:1","user":{"id":"usr_a","displayName":"Alice","state":"online"}}}"#;
        let parsed = PushNotification::parse(raw).expect("parse");
        assert_eq!(
            parsed,
            PushNotification::FriendOnline {
                user_id: "usr_a".to_string(),
                user: Some(PushUser {
                    id: Some("usr_a".to_string()),
                    display_name: "Alice".to_string(),
                    state: Some("online".to_string()),
                }),
                location: Some("wrld_1:1".to_string()),
                traveling_to: None,
            }
        );
        assert_eq!(parsed.display_name(), Some("Alice"));
    }

    #[test]
    fn parses_string_encoded_content() {
        let raw = r#"{"type":"friend-location","content":"{\"userId\":\"usr_b\",\"location\":\"traveling\",\"travelingToLocation\":\"wrld_2:9\"}"}"#;
        let parsed = PushNotification::parse(raw).expect("parse");
        assert_eq!(
            parsed,
            PushNotification::FriendLocation {
                user_id: "usr_b".to_string(),
                user: None,
                location: Some("traveling".to_string()),
                traveling_to: Some("wrld_2:9".to_string()),
            }
        );
    }

    #[test]
    fn user_id_falls_back_to_user_object() {
        let raw = r#"{"type":"friend-update","content":{"user":{"id":"usr_c","displayName":"Carol"}}}"#;
        let parsed = PushNotification::parse(raw).expect("parse");
        assert_eq!(parsed.user_id(), Some("usr_c"));
        assert_eq!(parsed.kind(), "friend-update");
    }

    #[test]
    fn unknown_types_are_not_errors() {
        let parsed = PushNotification::parse(r#"{"type":"notification-v2","content":{}}"#)
            .expect("parse");
        assert_eq!(
            parsed,
            PushNotification::Unknown {
                kind: "notification-v2".to_string()
            }
        );
        assert_eq!(parsed.user_id(), None);
    }

    #[test]
    fn missing_user_id_is_reported() {
        let err = PushNotification::parse(r#"{"type":"friend-offline","content":{}}"#)
            .expect_err("missing id");
        assert!(matches!(err, NotificationError::MissingUserId { ref kind } if kind == "friend-offline"));
    }

    #[test]
    fn malformed_json_is_reported() {
        let err = PushNotification::parse("{not json").expect_err("bad json");
        assert!(matches!(err, NotificationError::Json(_)));
    }
}
