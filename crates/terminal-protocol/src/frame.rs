//! Header-line wire framing.
//!
//! Each frame is two JSON documents separated by a single `\n`: a small
//! routing header followed by the full message. The host forwards frames by
//! parsing only the header line, so relaying cost is independent of payload
//! size.

use crate::error::ProtocolError;
use crate::model::{RoutingHeader, TerminalMessage};

/// Encode a message into its two-line wire form.
pub fn encode(msg: &TerminalMessage) -> Result<String, ProtocolError> {
    let header = RoutingHeader {
        source_terminal_id: msg.source_terminal_id.clone(),
        target_terminal_id: msg.target_terminal_id.clone(),
    };
    let header = serde_json::to_string(&header)
        .map_err(|_| ProtocolError::MalformedFrame("header encode"))?;
    let body =
        serde_json::to_string(msg).map_err(|_| ProtocolError::MalformedFrame("body encode"))?;
    Ok(format!("{header}\n{body}"))
}

/// Decode a full frame into its message. Frames carrying no newline are
/// treated as bare messages for compatibility with direct tunnel delivery.
pub fn decode(raw: &str) -> Result<TerminalMessage, ProtocolError> {
    let body = match raw.split_once('\n') {
        Some((_, body)) => body,
        None => raw,
    };
    serde_json::from_str(body).map_err(|_| ProtocolError::MalformedFrame("body decode"))
}

/// Read only the routing header from a frame, without touching the body. A
/// headerless tunnel frame works too: the message body itself carries the same
/// addressing fields.
pub fn peek_header(raw: &str) -> Result<RoutingHeader, ProtocolError> {
    let header = raw.split_once('\n').map(|(h, _)| h).unwrap_or(raw);
    serde_json::from_str(header).map_err(|_| ProtocolError::MalformedFrame("header decode"))
}

pub fn peek_target(raw: &str) -> Result<String, ProtocolError> {
    Ok(peek_header(raw)?.target_terminal_id)
}

pub fn peek_source(raw: &str) -> Result<String, ProtocolError> {
    Ok(peek_header(raw)?.source_terminal_id)
}
