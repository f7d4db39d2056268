//! Pusher-compatible wire protocol: frames, control events, channel names and
//! the broadcasting auth handshake.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher:subscription_succeeded";
pub const EVENT_INTERNAL_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_ERROR: &str = "pusher:error";

/// Client events must carry this prefix or the server drops them.
pub const CLIENT_EVENT_PREFIX: &str = "client-";
pub const CLIENT_TYPING_EVENT: &str = "client-typing";
pub const CLIENT_MESSAGE_READ_EVENT: &str = "client-message-read";

/// Close code we send on an intentional `disconnect()`.
pub const MANUAL_CLOSE_CODE: u16 = 1000;
/// Reported when the socket dies without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

const PRIVATE_PREFIX: &str = "private-";
const PRESENCE_PREFIX: &str = "presence-";

/// Logical prefixes that are private by convention.
const PRIVATE_CONVENTIONS: [&str; 3] = ["organization.", "inbox.", "conversation."];

// --- Frames ---

/// One framed event in either direction: `{event, data, channel}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value, channel: Option<String>) -> Self {
        Self {
            event: event.into(),
            data,
            channel,
        }
    }

    /// Decode a text frame.
    ///
    /// Pusher servers double-encode `data` as a JSON string; such strings are
    /// decoded in place when they hold an object or array.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::InvalidJson("expected a JSON object".to_string()));
        };

        let event = match obj.remove("event") {
            Some(Value::String(event)) if !event.is_empty() => event,
            _ => return Err(ProtocolError::MissingEvent),
        };
        let data = obj.remove("data").map(decode_data).unwrap_or(Value::Null);
        let channel = match obj.remove("channel") {
            Some(Value::String(channel)) if !channel.is_empty() => Some(channel),
            _ => None,
        };

        Ok(Self {
            event,
            data,
            channel,
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn subscribe(channel: &ChannelName, grant: Option<&AuthGrant>) -> Self {
        let mut data = Map::new();
        data.insert("channel".to_string(), Value::String(channel.wire()));
        if let Some(grant) = grant {
            data.insert("auth".to_string(), Value::String(grant.auth.clone()));
            if let Some(channel_data) = &grant.channel_data {
                data.insert(
                    "channel_data".to_string(),
                    Value::String(channel_data.clone()),
                );
            }
        }
        Self::new(EVENT_SUBSCRIBE, Value::Object(data), None)
    }

    pub fn unsubscribe(channel: &ChannelName) -> Self {
        let mut data = Map::new();
        data.insert("channel".to_string(), Value::String(channel.wire()));
        Self::new(EVENT_UNSUBSCRIBE, Value::Object(data), None)
    }

    pub fn ping() -> Self {
        Self::new(EVENT_PING, Value::Object(Map::new()), None)
    }

    pub fn pong() -> Self {
        Self::new(EVENT_PONG, Value::Object(Map::new()), None)
    }

    /// A client-originated event (whisper) scoped to a channel.
    pub fn client_event(channel: &ChannelName, event: &str, data: Value) -> Self {
        let event = if event.starts_with(CLIENT_EVENT_PREFIX) {
            event.to_string()
        } else {
            format!("{CLIENT_EVENT_PREFIX}{event}")
        };
        Self::new(event, data, Some(channel.wire()))
    }

    /// Transport/control traffic, never forwarded to consumers.
    pub fn is_control(&self) -> bool {
        self.event.starts_with("pusher:") || self.event.starts_with("pusher_internal:")
    }

    /// The logical channel this frame is addressed to, if any.
    pub fn channel_name(&self) -> Option<ChannelName> {
        self.channel.as_deref().map(ChannelName::parse)
    }
}

fn decode_data(data: Value) -> Value {
    if let Value::String(raw) = &data {
        if let Ok(decoded @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(raw) {
            return decoded;
        }
    }
    data
}

// --- Control events ---

/// Protocol-level events consumed by the connection itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    ConnectionEstablished {
        socket_id: String,
        /// Seconds of silence the server tolerates before it pings us.
        activity_timeout: Option<u64>,
    },
    SubscriptionSucceeded {
        channel: ChannelName,
    },
    SubscriptionError {
        channel: Option<ChannelName>,
        status: Option<u16>,
        message: Option<String>,
    },
    Ping,
    Pong,
    Error {
        code: Option<u16>,
        message: Option<String>,
    },
    /// Presence membership updates and anything else in the control namespace.
    Other {
        event: String,
    },
}

impl ControlEvent {
    /// Classify a control frame. Returns `None` for domain frames.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if !frame.is_control() {
            return None;
        }
        let str_field = |key: &str| {
            frame
                .data
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let u16_field = |key: &str| {
            frame
                .data
                .get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u16::try_from(n).ok())
        };

        let event = match frame.event.as_str() {
            EVENT_CONNECTION_ESTABLISHED => match str_field("socket_id") {
                Some(socket_id) => ControlEvent::ConnectionEstablished {
                    socket_id,
                    activity_timeout: frame.data.get("activity_timeout").and_then(Value::as_u64),
                },
                None => ControlEvent::Other {
                    event: frame.event.clone(),
                },
            },
            EVENT_SUBSCRIPTION_SUCCEEDED | EVENT_INTERNAL_SUBSCRIPTION_SUCCEEDED => {
                match frame.channel_name() {
                    Some(channel) => ControlEvent::SubscriptionSucceeded { channel },
                    None => ControlEvent::Other {
                        event: frame.event.clone(),
                    },
                }
            }
            EVENT_SUBSCRIPTION_ERROR => ControlEvent::SubscriptionError {
                channel: frame.channel_name(),
                status: u16_field("status"),
                message: str_field("error").or_else(|| str_field("message")),
            },
            EVENT_PING => ControlEvent::Ping,
            EVENT_PONG => ControlEvent::Pong,
            EVENT_ERROR => ControlEvent::Error {
                code: u16_field("code"),
                message: str_field("message"),
            },
            other => ControlEvent::Other {
                event: other.to_string(),
            },
        };
        Some(event)
    }
}

// --- Channels ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

/// A channel identified by its logical name (`conversation.42`).
///
/// The kind decides the wire name (`private-conversation.42`) and whether a
/// subscribe needs a signed grant first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    logical: String,
    kind: ChannelKind,
}

impl ChannelName {
    /// Accepts logical or wire names. Explicit prefixes win over conventions.
    pub fn parse(name: &str) -> Self {
        if let Some(logical) = name.strip_prefix(PRESENCE_PREFIX) {
            return Self::with_kind(logical, ChannelKind::Presence);
        }
        if let Some(logical) = name.strip_prefix(PRIVATE_PREFIX) {
            return Self::with_kind(logical, ChannelKind::Private);
        }
        let kind = if PRIVATE_CONVENTIONS.iter().any(|p| name.starts_with(p)) {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        };
        Self::with_kind(name, kind)
    }

    pub fn with_kind(logical: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            logical: logical.into(),
            kind,
        }
    }

    pub fn organization(organization_id: impl fmt::Display) -> Self {
        Self::with_kind(format!("organization.{organization_id}"), ChannelKind::Private)
    }

    pub fn inbox(organization_id: impl fmt::Display) -> Self {
        Self::with_kind(format!("inbox.{organization_id}"), ChannelKind::Private)
    }

    pub fn conversation(session_id: impl fmt::Display) -> Self {
        Self::with_kind(format!("conversation.{session_id}"), ChannelKind::Private)
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn requires_auth(&self) -> bool {
        self.kind != ChannelKind::Public
    }

    /// Name used in subscribe frames and auth requests.
    pub fn wire(&self) -> String {
        match self.kind {
            ChannelKind::Public => self.logical.clone(),
            ChannelKind::Private => format!("{PRIVATE_PREFIX}{}", self.logical),
            ChannelKind::Presence => format!("{PRESENCE_PREFIX}{}", self.logical),
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.logical)
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

// --- Auth handshake ---

/// Body of `POST /broadcasting/auth`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthRequest {
    pub channel_name: String,
    pub socket_id: String,
}

/// Signed credential for one (channel, socket id) pair. Single use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthGrant {
    pub auth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

impl AuthGrant {
    /// Parse either a bare `{auth, channel_data?}` or an envelope
    /// `{success, data: {auth, ...}}`.
    pub fn from_response(body: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let grant = match value.get("data") {
            Some(inner) if value.get("auth").is_none() => {
                if value.get("success").and_then(Value::as_bool) == Some(false) {
                    return Err(ProtocolError::Rejected);
                }
                inner
            }
            _ => &value,
        };

        let auth = grant
            .get("auth")
            .and_then(Value::as_str)
            .filter(|auth| !auth.is_empty())
            .ok_or_else(|| ProtocolError::InvalidAuthResponse(body.chars().take(200).collect()))?;

        // Presence grants carry channel_data as a JSON string; tolerate objects.
        let channel_data = match grant.get("channel_data") {
            None | Some(Value::Null) => None,
            Some(Value::String(data)) => Some(data.clone()),
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            auth: auth.to_string(),
            channel_data,
        })
    }
}
