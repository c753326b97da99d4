use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single normalized timestamp representation used for every event leaving the classifier.
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_iso(ts: DateTime<Utc>) -> String {
    ts.format(ISO_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub source_file: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LogEventKind,
}

impl LogEvent {
    pub fn new(source_file: impl Into<String>, timestamp: DateTime<Utc>, kind: LogEventKind) -> Self {
        Self {
            source_file: source_file.into(),
            timestamp,
            kind,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn iso_timestamp(&self) -> String {
        format_iso(self.timestamp)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.iso_timestamp(), self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    /// Built-in player resolving a URL before playback.
    Resolver,
    /// Udon world player that logs who requested the video.
    UdonPlayer,
    /// Legacy SDK2 player announcing a user-submitted URL.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogEventKind {
    Location {
        location: String,
        world_name: String,
    },
    LocationDestination {
        location: String,
    },
    PlayerJoined {
        display_name: String,
        user_id: Option<String>,
    },
    PlayerLeft {
        display_name: String,
        user_id: Option<String>,
    },
    PortalSpawn,
    PortalDestroy,
    Notification {
        payload: String,
    },
    ApiRequest {
        url: String,
    },
    VideoPlay {
        url: String,
        requested_by: Option<String>,
        source: VideoSource,
    },
    VideoError {
        message: String,
    },
    Event {
        text: String,
    },
    AvatarPedestal {
        display_name: String,
    },
    AudioDeviceChanged {
        device: String,
    },
    VrcQuit,
    OpenvrInit,
    DesktopMode,
}

impl LogEventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Location { .. } => "location",
            Self::LocationDestination { .. } => "location-destination",
            Self::PlayerJoined { .. } => "player-joined",
            Self::PlayerLeft { .. } => "player-left",
            Self::PortalSpawn => "portal-spawn",
            Self::PortalDestroy => "portal-destroy",
            Self::Notification { .. } => "notification",
            Self::ApiRequest { .. } => "api-request",
            Self::VideoPlay { .. } => "video-play",
            Self::VideoError { .. } => "video-error",
            Self::Event { .. } => "event",
            Self::AvatarPedestal { .. } => "avatar-pedestal",
            Self::AudioDeviceChanged { .. } => "audio-device-changed",
            Self::VrcQuit => "vrc-quit",
            Self::OpenvrInit => "openvr-init",
            Self::DesktopMode => "desktop-mode",
        }
    }
}

impl fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Location {
                location,
                world_name,
            } => write!(f, "location {world_name} ({location})"),
            Self::LocationDestination { location } => write!(f, "location-destination {location}"),
            Self::PlayerJoined { display_name, .. } => write!(f, "player-joined {display_name}"),
            Self::PlayerLeft { display_name, .. } => write!(f, "player-left {display_name}"),
            Self::Notification { payload } => write!(f, "notification {payload}"),
            Self::ApiRequest { url } => write!(f, "api-request {url}"),
            Self::VideoPlay {
                url, requested_by, ..
            } => match requested_by {
                Some(name) => write!(f, "video-play {url} by {name}"),
                None => write!(f, "video-play {url}"),
            },
            Self::VideoError { message } => write!(f, "video-error {message}"),
            Self::Event { text } => write!(f, "event {text}"),
            Self::AvatarPedestal { display_name } => write!(f, "avatar-pedestal {display_name}"),
            Self::AudioDeviceChanged { device } => write!(f, "audio-device-changed {device}"),
            other => f.write_str(other.event_type()),
        }
    }
}

/// Persistent user record resolved through the external user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.user_id)
    }
}

/// Ephemeral per-session participant number. Meaningless outside the session that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u32);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_iso(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_flat_tuple_with_millisecond_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 18, 4, 5).single().expect("ts");
        let event = LogEvent::new(
            "output_log_2024-03-09_18-00-00.txt",
            ts,
            LogEventKind::PlayerJoined {
                display_name: "Alice".to_string(),
                user_id: None,
            },
        );

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "player-joined");
        assert_eq!(value["timestamp"], "2024-03-09T18:04:05.000Z");
        assert_eq!(value["display_name"], "Alice");
        assert_eq!(value["source_file"], "output_log_2024-03-09_18-00-00.txt");

        let back: LogEvent = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let kind = LogEventKind::LocationDestination {
            location: "wrld_1:1".to_string(),
        };
        let value = serde_json::to_value(&kind).expect("serialize");
        assert_eq!(value["type"], kind.event_type());
        assert_eq!(
            serde_json::to_value(LogEventKind::OpenvrInit).expect("serialize")["type"],
            "openvr-init"
        );
    }
}
