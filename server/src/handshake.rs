//! WebSocket opening handshake: HTTP upgrade parsing and the 101 response.
//!
//! The caller accumulates raw bytes until the blank line terminating the
//! HTTP header block, then hands the header text to [`respond`]. Session
//! identity piggybacks on the handshake as a cookie set by the login flow
//! upstream; it is extracted here and attached to the connection so a later
//! `hello` can resolve it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID every WebSocket server concatenates with the client key when
/// deriving the accept token (RFC 6455 section 4.2.2).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// No Sec-WebSocket-Key header: not a WebSocket upgrade. The connection
    /// is closed without any response.
    #[error("request has no Sec-WebSocket-Key header")]
    MissingKey,
}

/// Outcome of a successful handshake: the raw 101 response to write back
/// and the session identifier found in the cookies, if any.
#[derive(Debug)]
pub struct HandshakeReply {
    pub response: String,
    pub session_id: Option<String>,
}

/// Derives the Sec-WebSocket-Accept token for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validates an upgrade request and builds the switching-protocols response.
///
/// `cookie_name` is the name of the session cookie the upstream web app
/// issues; a matching cookie value rides along in the reply.
pub fn respond(headers: &str, cookie_name: &str) -> Result<HandshakeReply, HandshakeError> {
    let key = header_value(headers, "Sec-WebSocket-Key").ok_or(HandshakeError::MissingKey)?;
    let accept = accept_key(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    Ok(HandshakeReply {
        response,
        session_id: extract_session_id(headers, cookie_name),
    })
}

/// Pulls the session identifier out of the Cookie header, if present.
/// Values are restricted to alphanumerics, matching what the upstream
/// session layer generates.
pub fn extract_session_id(headers: &str, cookie_name: &str) -> Option<String> {
    let cookies = header_value(headers, "Cookie")?;
    for pair in cookies.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(cookie_name) {
            if let Some(value) = value.strip_prefix('=') {
                let id: String = value.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
                if !id.is_empty() {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Case-insensitive lookup of a header value in a raw header block.
fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.lines() {
        if let Some((field, value)) = line.split_once(':') {
            if field.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /sync HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Cookie: theme=dark; sessionid=a1B2c3D4; lang=en\r\n\r\n";

    #[test]
    fn test_accept_key_known_answer() {
        // Fixed vector from RFC 6455.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_respond_builds_switching_protocols() {
        let reply = respond(SAMPLE_REQUEST, "sessionid").unwrap();
        assert!(reply.response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(reply
            .response
            .contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(reply.response.ends_with("\r\n\r\n"));
        assert_eq!(reply.session_id.as_deref(), Some("a1B2c3D4"));
    }

    #[test]
    fn test_missing_key_fails() {
        let headers = "GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        assert_eq!(
            respond(headers, "sessionid").unwrap_err(),
            HandshakeError::MissingKey
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let headers = "GET / HTTP/1.1\r\nsec-websocket-key: abc\r\n\r\n";
        assert!(respond(headers, "sessionid").is_ok());
    }

    #[test]
    fn test_session_cookie_absent() {
        let headers = "GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let reply = respond(headers, "sessionid").unwrap();
        assert!(reply.session_id.is_none());
    }

    #[test]
    fn test_session_cookie_value_stops_at_non_alphanumeric() {
        let headers = "GET / HTTP/1.1\r\nCookie: sessionid=abc123;x=y\r\n\r\n";
        assert_eq!(
            extract_session_id(headers, "sessionid").as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_other_cookies_do_not_match() {
        let headers = "GET / HTTP/1.1\r\nCookie: xsessionid=nope\r\n\r\n";
        assert!(extract_session_id(headers, "sessionid").is_none());
    }
}
