//! Ordered rule chain turning raw client log lines into typed events.
//!
//! The client prefixes every entry with `yyyy.MM.dd HH:mm:ss <Level> -  `, then an
//! optional bracketed component tag. Tags are sometimes rendered with unstable
//! obfuscated glyphs, so rules only ever look at the message body after the tag.
//! Lines without the prefix continue a multi-line block of the previous entry.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};

use crate::event::{LogEventKind, VideoSource};

const TIMESTAMP_LEN: usize = 19;
const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";
const LEVEL_SEPARATOR_AT: usize = 31;
const MESSAGE_AT: usize = 34;

const SHADER_LIMIT_TEXT: &str = "Shader keyword limit has been reached";
const JOIN_BLOCKED_TEXT: &str = "Joining instance blocked by master";

/// Per-file scratch state the rules read and update while a file is parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseContext {
    pub recent_world_name: String,
    pub pending_destination: String,
    pub last_audio_device: Option<String>,
    pub audio_reconfigure_pending: bool,
    pub last_video_error: Option<String>,
    /// A player in the current instance asked for a video, so bare `ERROR:` lines are theirs.
    pub video_requested: bool,
    pub shader_keyword_limit_seen: bool,
    pub last_line_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A rule claimed the line; it may or may not produce an event.
    Handled(Option<LogEventKind>),
    NotMatched,
}

impl Classification {
    pub fn into_event(self) -> Option<LogEventKind> {
        match self {
            Self::Handled(kind) => kind,
            Self::NotMatched => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub timestamp: DateTime<Utc>,
    /// False for continuation lines of a multi-line block.
    pub prefixed: bool,
    pub body: &'a str,
}

/// Timezone the client wrote its timestamps in.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogClock {
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl LogClock {
    fn to_utc(self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

type Matcher = fn(&str) -> bool;
type Extractor = fn(&str, &mut ParseContext) -> Option<LogEventKind>;

struct Rule {
    name: &'static str,
    matches: Matcher,
    extract: Extractor,
}

pub struct LineClassifier {
    clock: LogClock,
    rules: Vec<Rule>,
    continuation_rules: Vec<Rule>,
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(LogClock::Local)
    }
}

impl LineClassifier {
    pub fn new(clock: LogClock) -> Self {
        Self {
            clock,
            rules: standard_rules(),
            continuation_rules: continuation_rules(),
        }
    }

    /// Splits the fixed-width prefix off a raw line.
    ///
    /// A prefixed line whose timestamp fails to parse is stamped with the current time
    /// instead of being dropped. Continuation lines inherit the last prefixed timestamp.
    pub fn split<'a>(&self, line: &'a str, ctx: &mut ParseContext) -> ParsedLine<'a> {
        let line = line.trim_end_matches(['\r', '\n']);
        let prefixed = line.len() > MESSAGE_AT
            && line.as_bytes().get(LEVEL_SEPARATOR_AT) == Some(&b'-')
            && line.is_char_boundary(MESSAGE_AT);

        if !prefixed {
            let timestamp = ctx.last_line_at.unwrap_or_else(Utc::now);
            return ParsedLine {
                timestamp,
                prefixed: false,
                body: line.trim(),
            };
        }

        let timestamp = line
            .get(..TIMESTAMP_LEN)
            .and_then(|raw| NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).ok())
            .and_then(|naive| self.clock.to_utc(naive))
            .unwrap_or_else(Utc::now);
        ctx.last_line_at = Some(timestamp);

        ParsedLine {
            timestamp,
            prefixed: true,
            body: strip_component_tag(line[MESSAGE_AT..].trim()),
        }
    }

    /// Runs the rule chain in fixed priority order; the first matching rule wins.
    pub fn classify(&self, parsed: &ParsedLine<'_>, ctx: &mut ParseContext) -> Classification {
        let rules = if parsed.prefixed {
            &self.rules
        } else {
            &self.continuation_rules
        };
        for rule in rules {
            if (rule.matches)(parsed.body) {
                tracing::trace!(rule = rule.name, "log line matched");
                return Classification::Handled((rule.extract)(parsed.body, ctx));
            }
        }
        Classification::NotMatched
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|rule| rule.name)
    }
}

/// Drops a leading `[Tag] ` so rules never depend on the tag's rendering.
fn strip_component_tag(message: &str) -> &str {
    if message.starts_with('[')
        && let Some(end) = message.find("] ")
    {
        return message[end + 2..].trim_start();
    }
    message
}

fn standard_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "location-entered",
            matches: |body| body.starts_with("Entering Room: "),
            extract: |body, ctx| {
                ctx.recent_world_name = after(body, "Entering Room: ").trim().to_string();
                None
            },
        },
        Rule {
            name: "location",
            matches: |body| {
                body.starts_with("Joining ")
                    && !body.starts_with("Joining or Creating Room")
                    && !body.starts_with("Joining friend")
            },
            extract: |body, ctx| {
                ctx.video_requested = false;
                Some(LogEventKind::Location {
                    location: after(body, "Joining ").trim().to_string(),
                    world_name: ctx.recent_world_name.clone(),
                })
            },
        },
        Rule {
            name: "location-destination-set",
            matches: |body| body.starts_with("Destination set: "),
            extract: |body, ctx| {
                ctx.pending_destination = after(body, "Destination set: ").trim().to_string();
                None
            },
        },
        Rule {
            name: "location-destination-cleared",
            matches: |body| body == "OnLeftRoom",
            extract: |_, ctx| {
                Some(LogEventKind::LocationDestination {
                    location: std::mem::take(&mut ctx.pending_destination),
                })
            },
        },
        Rule {
            name: "player-joined",
            matches: |body| body.starts_with("OnPlayerJoined "),
            extract: |body, _| {
                let (display_name, user_id) = split_player(after(body, "OnPlayerJoined "));
                Some(LogEventKind::PlayerJoined {
                    display_name,
                    user_id,
                })
            },
        },
        Rule {
            name: "player-left",
            matches: |body| body.starts_with("OnPlayerLeft "),
            extract: |body, _| {
                let (display_name, user_id) = split_player(after(body, "OnPlayerLeft "));
                Some(LogEventKind::PlayerLeft {
                    display_name,
                    user_id,
                })
            },
        },
        Rule {
            name: "portal-spawn",
            matches: |body| {
                body.starts_with("Instantiated a (Clone [")
                    && body.contains("Portals/PortalInternalDynamic")
            },
            extract: |_, _| Some(LogEventKind::PortalSpawn),
        },
        Rule {
            name: "portal-destroy",
            matches: |body| {
                body.contains("PortalInternalDynamic")
                    && (body.starts_with("Destroying ") || body.ends_with("destroyed"))
            },
            extract: |_, _| Some(LogEventKind::PortalDestroy),
        },
        Rule {
            name: "notification",
            matches: |body| body.starts_with("Received Notification: <"),
            extract: |body, _| {
                let rest = after(body, "Received Notification: <");
                let payload = rest
                    .rfind("> received at ")
                    .map(|end| &rest[..end])
                    .unwrap_or_else(|| rest.trim_end_matches('>'));
                Some(LogEventKind::Notification {
                    payload: payload.to_string(),
                })
            },
        },
        Rule {
            name: "api-request",
            matches: |body| body.contains("Sending Get request to "),
            extract: |body, _| {
                Some(LogEventKind::ApiRequest {
                    url: after(body, "Sending Get request to ").trim().to_string(),
                })
            },
        },
        Rule {
            name: "video-play-resolver",
            matches: |body| body.starts_with("Attempting to resolve URL '"),
            extract: |body, ctx| {
                ctx.video_requested = true;
                let rest = after(body, "Attempting to resolve URL '");
                let url = rest.rfind('\'').map_or(rest, |end| &rest[..end]);
                Some(LogEventKind::VideoPlay {
                    url: url.to_string(),
                    requested_by: None,
                    source: VideoSource::Resolver,
                })
            },
        },
        Rule {
            name: "video-play-udon",
            matches: |body| body.starts_with("Started video load for URL: "),
            extract: |body, ctx| {
                ctx.video_requested = true;
                let rest = after(body, "Started video load for URL: ");
                let (url, requested_by) = match rest.rsplit_once(", requested by ") {
                    Some((url, name)) => (url, Some(name.trim().to_string())),
                    None => (rest, None),
                };
                Some(LogEventKind::VideoPlay {
                    url: url.trim().to_string(),
                    requested_by,
                    source: VideoSource::UdonPlayer,
                })
            },
        },
        Rule {
            name: "video-play-legacy",
            matches: |body| body.starts_with("User ") && body.contains(" added URL "),
            extract: |body, ctx| {
                ctx.video_requested = true;
                let (name, url) = after(body, "User ").split_once(" added URL ")?;
                Some(LogEventKind::VideoPlay {
                    url: url.trim().to_string(),
                    requested_by: Some(name.trim().to_string()),
                    source: VideoSource::Legacy,
                })
            },
        },
        Rule {
            name: "video-error",
            matches: |body| body.starts_with("ERROR: "),
            extract: |body, ctx| {
                if !ctx.video_requested {
                    return None;
                }
                let message = after(body, "ERROR: ").trim().to_string();
                if ctx.last_video_error.as_deref() == Some(message.as_str()) {
                    return None;
                }
                ctx.last_video_error = Some(message.clone());
                Some(LogEventKind::VideoError { message })
            },
        },
        Rule {
            name: "shader-keyword-limit",
            matches: |body| {
                body.starts_with("Maximum number (")
                    && body.contains("of shader global keywords exceeded")
            },
            extract: |_, ctx| {
                if ctx.shader_keyword_limit_seen {
                    return None;
                }
                ctx.shader_keyword_limit_seen = true;
                Some(LogEventKind::Event {
                    text: SHADER_LIMIT_TEXT.to_string(),
                })
            },
        },
        Rule {
            name: "join-blocked",
            matches: |body| {
                body.starts_with("Master is not sending any events! Moving to a new instance.")
            },
            extract: |_, _| {
                Some(LogEventKind::Event {
                    text: JOIN_BLOCKED_TEXT.to_string(),
                })
            },
        },
        Rule {
            name: "avatar-pedestal",
            matches: |body| body.starts_with("RPC invoked SwitchAvatar on AvatarPedestal for "),
            extract: |body, _| {
                Some(LogEventKind::AvatarPedestal {
                    display_name: after(body, "RPC invoked SwitchAvatar on AvatarPedestal for ")
                        .trim()
                        .to_string(),
                })
            },
        },
        Rule {
            name: "audio-configuration-changed",
            matches: |body| body.starts_with("uSpeak: OnAudioConfigurationChanged"),
            extract: |body, ctx| {
                if body.contains("devicesChanged = True") {
                    ctx.audio_reconfigure_pending = true;
                }
                None
            },
        },
        Rule {
            name: "audio-device",
            matches: |body| body.starts_with("uSpeak: SetInputDevice 0"),
            extract: |body, ctx| {
                let start = body.find('\'')?;
                let end = body.rfind('\'').filter(|end| *end > start)?;
                let device = body[start + 1..end].to_string();
                ctx.last_audio_device = Some(device.clone());
                // Device lines are also logged at startup; only a preceding
                // reconfiguration marker makes this a real change.
                if !std::mem::take(&mut ctx.audio_reconfigure_pending) {
                    return None;
                }
                Some(LogEventKind::AudioDeviceChanged { device })
            },
        },
        Rule {
            name: "vrc-quit",
            matches: |body| body.contains("OnApplicationQuit"),
            extract: |_, _| Some(LogEventKind::VrcQuit),
        },
        Rule {
            name: "openvr-init",
            matches: |body| body.starts_with("OpenVR initialized!") || body.starts_with("Initializing VRSDK"),
            extract: |_, _| Some(LogEventKind::OpenvrInit),
        },
    ]
}

fn continuation_rules() -> Vec<Rule> {
    vec![Rule {
        name: "desktop-mode",
        matches: |body| body.starts_with("VR Disabled"),
        extract: |_, _| Some(LogEventKind::DesktopMode),
    }]
}

fn after<'a>(body: &'a str, marker: &str) -> &'a str {
    body.find(marker)
        .map_or("", |start| &body[start + marker.len()..])
}

/// Newer clients append ` (usr_...)` after the display name.
fn split_player(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if raw.ends_with(')')
        && let Some(open) = raw.rfind(" (usr_")
    {
        let user_id = raw[open + 2..raw.len() - 1].to_string();
        return (raw[..open].trim().to_string(), Some(user_id));
    }
    (raw.to_string(), None)
}
