use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known terminal id of the host relay.
pub const HOST_TERMINAL_ID: &str = "@host";

/// One wire message of the terminal protocol.
///
/// All messages belonging to one logical request/response exchange share a
/// `trace_id`; `seq_id` increments per message within that trace and is only
/// used as an advisory ack marker by the receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalMessage {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub source_terminal_id: String,
    pub target_terminal_id: String,
    #[serde(default)]
    pub seq_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<ResponsePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<HostEvent>,
}

impl TerminalMessage {
    /// A message is a request iff `method` and `req` are present and neither
    /// `frame` nor `res` is set.
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.req.is_some() && self.frame.is_none() && self.res.is_none()
    }

    /// A message is terminal for its trace when `res` is present or `done` is
    /// set.
    pub fn is_terminal(&self) -> bool {
        self.res.is_some() || self.done == Some(true)
    }
}

/// Final response payload of a trace: numeric code plus message, optional data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponsePayload {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: 0,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// The cheap-to-inspect first line of every wire frame. Forwarding decisions
/// only ever look at this header, never at the full body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingHeader {
    pub source_terminal_id: String,
    pub target_terminal_id: String,
}

/// A service advertised by a terminal. `schema` is the structural predicate
/// over request bodies; services sharing a `method` are disambiguated at
/// routing time by which schema matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub method: String,
    pub schema: Value,
}

/// The unit of topology synchronization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_info: BTreeMap<String, ServiceInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subscriptions: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Incremental topology event pushed by the host.
///
/// `seq_id` forms one monotonically increasing sequence per host; a consumer
/// that observes a gap must resync via `GetTerminalInfos` rather than apply
/// the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEvent {
    pub seq_id: u64,
    #[serde(rename = "type")]
    pub kind: HostEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TerminalChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEventKind {
    #[serde(rename = "INIT")]
    Init,
    #[serde(rename = "TERMINAL_CHANGE")]
    TerminalChange,
}

/// `old` only: leave. `new` only: join. Both (same terminal id): update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<TerminalInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<TerminalInfo>,
}

/// Join path segments into a method path, escaping the separator so segment
/// boundaries survive arbitrary ids.
pub fn encode_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.replace('%', "%25").replace('/', "%2F"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Milliseconds since the unix epoch, for `created_at`/`updated_at` stamps.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_classification() {
        let mut msg = TerminalMessage {
            trace_id: "t1".into(),
            method: Some("SubmitOrder".into()),
            source_terminal_id: "a".into(),
            target_terminal_id: "b".into(),
            req: Some(json!({"x": 1})),
            ..Default::default()
        };
        assert!(msg.is_request());
        assert!(!msg.is_terminal());

        msg.res = Some(ResponsePayload::ok("OK"));
        assert!(!msg.is_request());
        assert!(msg.is_terminal());
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let msg = TerminalMessage {
            trace_id: "t1".into(),
            source_terminal_id: "a".into(),
            target_terminal_id: "b".into(),
            done: Some(true),
            ..Default::default()
        };
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("method"));
        assert!(!text.contains("req"));
        assert!(text.contains("done"));
    }

    #[test]
    fn encode_path_escapes_separators() {
        assert_eq!(encode_path(&["HandShake", "a/b"]), "HandShake/a%2Fb");
        assert_eq!(
            encode_path(&["SubscribeChannel", "HostEvent"]),
            "SubscribeChannel/HostEvent"
        );
    }
}
