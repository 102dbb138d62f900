//! Outbound wire protocol: the payloads handed back through the host's
//! reply primitive.
//!
//! # Design
//! Success replies carry either a JSON response head, raw body bytes (for
//! incremental reads), or a bare decimal handle. Errors are a distinct JSON
//! shape paired with a non-zero return code, so the host can tell the two
//! apart without sniffing fields.

use std::collections::HashMap;

use base64::Engine as _;
use http::{HeaderMap, StatusCode, Version};
use serde::Serialize;

/// The JSON head of an HTTP response, buffered or streaming.
#[derive(Debug, Default, Serialize)]
pub struct ResponseHead {
    pub status: u16,
    pub proto_major: u16,
    pub proto_minor: u16,
    pub headers: HashMap<String, Vec<String>>,
    /// Base64 of the full body; buffered mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Stream id for incremental reads; streaming mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
    /// Trailer headers, when the server sent any and they are known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailer: Option<HashMap<String, Vec<String>>>,
    /// Negotiated TLS version, when the transport surfaces it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<String>,
}

impl ResponseHead {
    pub fn from_parts(status: StatusCode, version: Version, headers: &HeaderMap) -> Self {
        let (proto_major, proto_minor) = proto_pair(version);
        ResponseHead {
            status: status.as_u16(),
            proto_major,
            proto_minor,
            headers: wire_headers(headers),
            ..ResponseHead::default()
        }
    }

    pub fn set_body(&mut self, raw: &[u8]) {
        self.body = Some(base64::engine::general_purpose::STANDARD.encode(raw));
    }
}

/// Split an HTTP version into the wire's major/minor pair.
pub fn proto_pair(version: Version) -> (u16, u16) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

/// Flatten a header map into name → values, preserving repeats.
pub fn wire_headers(map: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut wire: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in map {
        wire.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    wire
}

/// The error reply shape.
pub fn error_payload(msg: &str) -> Vec<u8> {
    serde_json::json!({ "error": msg }).to_string().into_bytes()
}

/// Serialize a success reply, degrading to an error reply if serialization
/// itself fails.
pub fn encode<T: Serialize>(value: &T) -> (i32, Vec<u8>) {
    match serde_json::to_vec(value) {
        Ok(bytes) => (0, bytes),
        Err(err) => (1, error_payload(&err.to_string())),
    }
}
