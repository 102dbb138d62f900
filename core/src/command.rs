//! Inbound wire protocol: the commands the host feeds the dispatcher.
//!
//! # Design
//! The wire format is one flat JSON object with a numeric `cmd` tag and a
//! handful of optional fields. Decoding goes through a private `RawCommand`
//! mirror of that shape and immediately converts into the `Command` enum,
//! one variant per kind carrying only the fields that kind needs. A field
//! the kind requires but the payload omits is a decode error, which the
//! dispatcher treats as fatal.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::EngineError;

/// Process-unique handle of one logical HTTP client.
pub type ClientHandle = u64;
/// Client-unique id of one in-flight body stream.
pub type StreamId = u64;

/// Worker-pool size used when the configuration does not name one.
pub const DEFAULT_WORKERS: usize = 10;

/// Configuration applied once when a client is created.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Preferred HTTP major version: 1 or 2. Absent means negotiate.
    pub version: Option<u32>,
    /// Worker-pool size, fixed at creation.
    pub workers: Option<usize>,
    /// Idle pooled connections kept per host.
    pub max_idle_per_host: Option<usize>,
    /// Advertise `Accept-Encoding: gzip`. Bodies are delivered as received;
    /// decompression is the host's concern.
    #[serde(default)]
    pub compression: bool,
    /// Allow ALPN to negotiate past HTTP/1.1 when no version is pinned.
    #[serde(default = "default_upgrade")]
    pub upgrade: bool,
    /// Extra PEM trust files, unioned with the system trust store.
    #[serde(default)]
    pub ssl_verify: Vec<String>,
    /// TLS SNI override presented instead of the URL host.
    pub ssl_server_name: Option<String>,
}

fn default_upgrade() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            version: None,
            workers: None,
            max_idle_per_host: None,
            compression: false,
            upgrade: true,
            ssl_verify: Vec::new(),
            ssl_server_name: None,
        }
    }
}

impl ClientConfig {
    /// Worker-pool size, falling back to [`DEFAULT_WORKERS`].
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }
}

/// One HTTP request as described by the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestSpec {
    /// Method index; absent means GET.
    pub method: Option<u32>,
    #[serde(default)]
    pub url: String,
    /// Extra query parameters merged into the URL; values are stringified.
    pub args: Option<HashMap<String, serde_json::Value>>,
    pub headers: Option<HashMap<String, String>>,
    /// Literal request body. Wins over `form`/`files`.
    pub body: Option<String>,
    /// Stream the request body from later write commands.
    #[serde(default)]
    pub body_writer: bool,
    /// Stream the response body through later read commands.
    #[serde(default)]
    pub body_reader: bool,
    /// Form fields; urlencoded alone, multipart when `files` is present.
    pub form: Option<HashMap<String, serde_json::Value>>,
    /// File attachments, field name to path. Forces multipart.
    pub files: Option<HashMap<String, String>>,
}

impl RequestSpec {
    /// Map the wire method index onto an HTTP method.
    pub fn method(&self) -> Result<http::Method, EngineError> {
        match self.method {
            None | Some(0) => Ok(http::Method::GET),
            Some(1) => Ok(http::Method::POST),
            Some(2) => Ok(http::Method::PUT),
            Some(3) => Ok(http::Method::DELETE),
            Some(4) => Ok(http::Method::OPTIONS),
            Some(5) => Ok(http::Method::HEAD),
            Some(6) => Ok(http::Method::PATCH),
            Some(other) => Err(EngineError::Decode(format!("unknown method index {other}"))),
        }
    }
}

/// Wire shape of an inbound command, before kind-specific validation.
#[derive(Debug, Deserialize)]
struct RawCommand {
    cmd: u32,
    client: Option<u64>,
    req_id: Option<u64>,
    client_config: Option<ClientConfig>,
    req: Option<RequestSpec>,
}

/// One decoded instruction from the host.
#[derive(Debug)]
pub enum Command {
    NewClient {
        config: ClientConfig,
    },
    CloseClient {
        client: ClientHandle,
    },
    IssueRequest {
        client: ClientHandle,
        spec: RequestSpec,
    },
    /// `chunk: None` is end-of-body.
    WriteRequestBody {
        client: ClientHandle,
        stream: StreamId,
        chunk: Option<String>,
    },
    ReadResponseBody {
        client: ClientHandle,
        stream: StreamId,
    },
    ReadTrailer {
        client: ClientHandle,
        stream: StreamId,
    },
    CloseRequest {
        client: ClientHandle,
        stream: StreamId,
    },
}

impl Command {
    /// Decode one command payload.
    pub fn decode(raw: &[u8]) -> Result<Command, EngineError> {
        let raw: RawCommand =
            serde_json::from_slice(raw).map_err(|err| EngineError::Decode(err.to_string()))?;
        let client = |raw: &RawCommand, kind: &str| {
            raw.client
                .ok_or_else(|| EngineError::Decode(format!("{kind} without a client handle")))
        };
        let stream = |raw: &RawCommand, kind: &str| {
            raw.req_id
                .ok_or_else(|| EngineError::Decode(format!("{kind} without a stream id")))
        };
        match raw.cmd {
            0 => Ok(Command::NewClient {
                config: raw.client_config.unwrap_or_default(),
            }),
            1 => Ok(Command::CloseClient {
                client: client(&raw, "close-client")?,
            }),
            2 => {
                let handle = client(&raw, "issue-request")?;
                let spec = raw
                    .req
                    .ok_or_else(|| EngineError::Decode("issue-request without a request".into()))?;
                spec.method()?;
                Ok(Command::IssueRequest {
                    client: handle,
                    spec,
                })
            }
            3 => Ok(Command::WriteRequestBody {
                client: client(&raw, "write-request-body")?,
                stream: stream(&raw, "write-request-body")?,
                chunk: raw.req.and_then(|req| req.body),
            }),
            4 => Ok(Command::ReadResponseBody {
                client: client(&raw, "read-response-body")?,
                stream: stream(&raw, "read-response-body")?,
            }),
            5 => Ok(Command::ReadTrailer {
                client: client(&raw, "read-trailer")?,
                stream: stream(&raw, "read-trailer")?,
            }),
            6 => Ok(Command::CloseRequest {
                client: client(&raw, "close-request")?,
                stream: stream(&raw, "close-request")?,
            }),
            other => Err(EngineError::Decode(format!("unknown command kind {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_decodes_with_and_without_config() {
        let cmd = Command::decode(br#"{"cmd":0}"#).unwrap();
        let Command::NewClient { config } = cmd else {
            panic!("wrong kind");
        };
        assert_eq!(config.workers(), DEFAULT_WORKERS);
        assert!(config.upgrade);
        assert!(!config.compression);

        let cmd = Command::decode(
            br#"{"cmd":0,"client_config":{"version":2,"workers":3,"ssl_verify":["/a.pem"]}}"#,
        )
        .unwrap();
        let Command::NewClient { config } = cmd else {
            panic!("wrong kind");
        };
        assert_eq!(config.version, Some(2));
        assert_eq!(config.workers(), 3);
        assert_eq!(config.ssl_verify, vec!["/a.pem".to_string()]);
    }

    #[test]
    fn issue_request_requires_a_request() {
        let err = Command::decode(br#"{"cmd":2,"client":1}"#).unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));

        let cmd =
            Command::decode(br#"{"cmd":2,"client":1,"req":{"url":"http://x/","method":1}}"#)
                .unwrap();
        let Command::IssueRequest { client, spec } = cmd else {
            panic!("wrong kind");
        };
        assert_eq!(client, 1);
        assert_eq!(spec.method().unwrap(), http::Method::POST);
    }

    #[test]
    fn write_body_distinguishes_chunk_from_end_of_body() {
        let cmd =
            Command::decode(br#"{"cmd":3,"client":1,"req_id":2,"req":{"body":"abc"}}"#).unwrap();
        assert!(matches!(
            cmd,
            Command::WriteRequestBody {
                chunk: Some(ref c), ..
            } if c == "abc"
        ));

        let cmd = Command::decode(br#"{"cmd":3,"client":1,"req_id":2}"#).unwrap();
        assert!(matches!(cmd, Command::WriteRequestBody { chunk: None, .. }));
    }

    #[test]
    fn stream_commands_require_both_handles() {
        for kind in [3u32, 4, 5, 6] {
            let payload = format!(r#"{{"cmd":{kind},"client":1}}"#);
            let err = Command::decode(payload.as_bytes()).unwrap_err();
            assert!(matches!(err, EngineError::Decode(_)), "kind {kind}");
        }
    }

    #[test]
    fn unknown_kind_and_bad_json_are_decode_errors() {
        assert!(matches!(
            Command::decode(br#"{"cmd":42}"#).unwrap_err(),
            EngineError::Decode(_)
        ));
        assert!(matches!(
            Command::decode(b"not json").unwrap_err(),
            EngineError::Decode(_)
        ));
    }

    #[test]
    fn method_indices_cover_the_wire_enum() {
        let methods = [
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::DELETE,
            http::Method::OPTIONS,
            http::Method::HEAD,
            http::Method::PATCH,
        ];
        for (index, expected) in methods.iter().enumerate() {
            let spec = RequestSpec {
                method: Some(index as u32),
                ..RequestSpec::default()
            };
            assert_eq!(&spec.method().unwrap(), expected);
        }
        let spec = RequestSpec {
            method: Some(9),
            ..RequestSpec::default()
        };
        assert!(spec.method().is_err());

        let spec = RequestSpec::default();
        assert_eq!(spec.method().unwrap(), http::Method::GET);
    }
}
