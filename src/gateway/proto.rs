//! Wire format: the `{op, d, s, t}` envelope, opcode and close-code tables,
//! and builders for every payload the client sends.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Gateway opcodes.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const PRESENCE_UPDATE: u8 = 3;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
    /// Per-guild subscription to typing, activity and channel feeds.
    pub const SUBSCRIBE: u8 = 14;
}

/// Websocket close codes the gateway uses to end a session.
pub mod close_code {
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Returns `true` when reconnecting after this close code can never succeed.
    pub fn is_unrecoverable(code: u16) -> bool {
        matches!(
            code,
            AUTHENTICATION_FAILED
                | INVALID_SHARD
                | SHARDING_REQUIRED
                | INVALID_API_VERSION
                | INVALID_INTENTS
                | DISALLOWED_INTENTS
        )
    }
}

/// Wire envelope shared by every gateway message in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Builds a non-dispatch payload.
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }

    /// Builds a named dispatch with its sequence number.
    pub fn dispatch(event_name: impl Into<String>, sequence: u64, d: Value) -> Self {
        Self {
            op: opcode::DISPATCH,
            d: Some(d),
            s: Some(sequence),
            t: Some(event_name.into()),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Data of the HELLO opcode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

/// Response body of the endpoint-resolution request.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayUrlResponse {
    pub url: String,
}

/// Client metadata reported in IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
    pub system_locale: String,
    pub browser_user_agent: String,
    pub browser_version: String,
    pub os_version: String,
    pub release_channel: String,
    pub client_build_number: u64,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "Chrome".to_string(),
            device: String::new(),
            system_locale: "en-US".to_string(),
            browser_user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36".to_string(),
            browser_version: "128.0.0.0".to_string(),
            os_version: String::new(),
            release_channel: "stable".to_string(),
            client_build_number: 0,
        }
    }
}

/// Rich presence activity attached to a presence update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Activity type the gateway reserves for a free-text custom status.
pub const CUSTOM_STATUS_ACTIVITY: u8 = 4;

/// Outbound presence: status string, optional custom status text and activities.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub status: String,
    pub custom_status: Option<String>,
    pub activities: Vec<Activity>,
}

impl PresenceUpdate {
    /// A bare status with no custom text or activities.
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            custom_status: None,
            activities: Vec::new(),
        }
    }

    fn to_value(&self) -> Value {
        let mut activities = Vec::with_capacity(self.activities.len() + 1);
        if let Some(text) = self.custom_status.as_deref().filter(|text| !text.is_empty()) {
            activities.push(json!({
                "name": "Custom Status",
                "type": CUSTOM_STATUS_ACTIVITY,
                "state": text,
            }));
        }
        for activity in &self.activities {
            activities.push(serde_json::to_value(activity).unwrap_or(Value::Null));
        }
        json!({
            "status": self.status,
            "since": 0,
            "activities": activities,
            "afk": false,
        })
    }
}

/// IDENTIFY: authenticates a new session.
pub fn identify(
    token: &str,
    capabilities: u64,
    properties: &ClientProperties,
    presence: &PresenceUpdate,
) -> GatewayPayload {
    GatewayPayload::new(
        opcode::IDENTIFY,
        json!({
            "token": token,
            "capabilities": capabilities,
            "properties": properties,
            "presence": presence.to_value(),
            "compress": false,
            "client_state": { "guild_versions": {} },
        }),
    )
}

/// RESUME: replays missed dispatches after `sequence` on an existing session.
pub fn resume(token: &str, session_id: &str, sequence: u64) -> GatewayPayload {
    GatewayPayload::new(
        opcode::RESUME,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

/// HEARTBEAT carrying the last seen sequence, or `null` before any dispatch.
pub fn heartbeat(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: opcode::HEARTBEAT,
        d: sequence.map(Value::from),
        s: None,
        t: None,
    }
}

/// PRESENCE_UPDATE for the account.
pub fn presence_update(presence: &PresenceUpdate) -> GatewayPayload {
    GatewayPayload::new(opcode::PRESENCE_UPDATE, presence.to_value())
}

/// Subscribes to typing, activity and member-list feeds of one channel.
pub fn subscribe(guild_id: &str, channel_id: &str) -> GatewayPayload {
    let mut channels = Map::new();
    channels.insert(channel_id.to_string(), json!([[0, 99]]));
    GatewayPayload::new(
        opcode::SUBSCRIBE,
        json!({
            "guild_id": guild_id,
            "typing": true,
            "activities": true,
            "threads": true,
            "channels": channels,
        }),
    )
}

/// REQUEST_MEMBERS for specific members of one guild.
pub fn request_members(guild_id: &str, member_ids: &[String]) -> GatewayPayload {
    GatewayPayload::new(
        opcode::REQUEST_MEMBERS,
        json!({
            "guild_id": guild_id,
            "user_ids": member_ids,
            "presences": false,
        }),
    )
}

/// Appends the negotiated protocol query to a gateway or resume base URL.
pub fn gateway_query_url(base: &str, api_version: u8) -> String {
    format!(
        "{}/?encoding=json&v={api_version}&compress=zlib-stream",
        base.trim().trim_end_matches('/')
    )
}

/// Accepts only websocket URLs with a non-empty host part.
pub fn is_valid_resume_url(url: &str) -> bool {
    let url = url.trim();
    (url.starts_with("wss://") || url.starts_with("ws://")) && url.len() > "wss://".len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_without_sequence_serializes_null_payload() {
        let text = heartbeat(None).to_text().expect("encode");
        let value: Value = serde_json::from_str(&text).expect("decode");
        assert_eq!(value["op"], 1);
        assert!(value["d"].is_null());
        assert!(value.get("s").is_none());
        assert!(value.get("t").is_none());
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        let payload = heartbeat(Some(42));
        assert_eq!(payload.d, Some(Value::from(42)));
    }

    #[test]
    fn dispatch_envelope_parses_sequence_and_name() {
        let payload = GatewayPayload::from_text(
            r#"{"op":0,"s":7,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#,
        )
        .expect("parse dispatch");
        assert_eq!(payload.op, opcode::DISPATCH);
        assert_eq!(payload.s, Some(7));
        assert_eq!(payload.t.as_deref(), Some("MESSAGE_CREATE"));
    }

    #[test]
    fn invalid_session_keeps_boolean_payload() {
        let payload = GatewayPayload::from_text(r#"{"op":9,"d":false}"#).expect("parse");
        assert_eq!(payload.d, Some(Value::Bool(false)));
        assert_eq!(payload.s, None);
    }

    #[test]
    fn presence_update_prepends_custom_status_activity() {
        let presence = PresenceUpdate {
            status: "dnd".to_string(),
            custom_status: Some("busy".to_string()),
            activities: vec![Activity {
                name: "editor".to_string(),
                kind: 0,
                state: None,
                details: Some("src/lib.rs".to_string()),
                url: None,
            }],
        };
        let payload = presence_update(&presence);
        let d = payload.d.expect("payload data");
        assert_eq!(payload.op, opcode::PRESENCE_UPDATE);
        assert_eq!(d["status"], "dnd");
        assert_eq!(d["activities"][0]["type"], CUSTOM_STATUS_ACTIVITY);
        assert_eq!(d["activities"][0]["state"], "busy");
        assert_eq!(d["activities"][1]["name"], "editor");
    }

    #[test]
    fn resume_carries_session_and_sequence() {
        let d = resume("tok", "sess", 99).d.expect("payload data");
        assert_eq!(d["session_id"], "sess");
        assert_eq!(d["seq"], 99);
        assert_eq!(d["token"], "tok");
    }

    #[test]
    fn subscribe_keys_channel_range_by_id() {
        let d = subscribe("10", "20").d.expect("payload data");
        assert_eq!(d["guild_id"], "10");
        assert_eq!(d["channels"]["20"][0][1], 99);
    }

    #[test]
    fn query_url_strips_trailing_slash() {
        assert_eq!(
            gateway_query_url("wss://gateway.example/", 9),
            "wss://gateway.example/?encoding=json&v=9&compress=zlib-stream"
        );
    }

    #[test]
    fn resume_url_must_be_websocket_scheme() {
        assert!(is_valid_resume_url("wss://resume.example"));
        assert!(is_valid_resume_url("ws://127.0.0.1:9000"));
        assert!(!is_valid_resume_url("https://resume.example"));
        assert!(!is_valid_resume_url("wss://"));
    }

    #[test]
    fn authentication_close_code_is_unrecoverable() {
        assert!(close_code::is_unrecoverable(close_code::AUTHENTICATION_FAILED));
        assert!(!close_code::is_unrecoverable(4000));
        assert!(!close_code::is_unrecoverable(1001));
    }
}
