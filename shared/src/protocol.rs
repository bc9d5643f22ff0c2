//! Control-connection envelope types.
//!
//! Every text message on a control WebSocket is one JSON-encoded
//! [`ControlMessage`]. Raw TCP bytes travel as binary messages framed by
//! [`crate::frame`] instead; they need demultiplexing, the JSON envelopes
//! do not because the WebSocket already frames discrete messages.

use serde::{Deserialize, Serialize};

/// Default deadline for a unary request, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum control message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Everything that travels as a text message on the control connection,
/// in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Relay -> client: one public HTTP request to answer.
    HttpRequest(HttpRequest),
    /// Client -> relay: the correlated answer.
    HttpResponse(HttpResponse),
    /// Either direction: one lifecycle event of a bridged WebSocket.
    WsEvent(WsEvent),
}

impl ControlMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Unary request envelope for one public HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Correlation id, unique per tunnel. Assigned by the relay if absent.
    #[serde(default)]
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Response envelope correlated to an [`HttpRequest`] by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub id: String,
    /// Missing status is treated as 502 by the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// One lifecycle event of one bridged WebSocket connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    /// Sub-connection id, unique per tunnel.
    pub connection_id: String,
    #[serde(flatten)]
    pub kind: WsEventKind,
}

/// Event payloads. `Open` precedes everything else for a connection id;
/// `Close` is terminal in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WsEventKind {
    Open {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        /// Requested `Sec-WebSocket-Protocol`, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    Text {
        text: String,
    },
    Binary {
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Close {
        code: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Base64 (standard alphabet) serde adapter for byte payloads carried
/// inside JSON envelopes.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// [`b64`] for optional payloads.
pub mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_roundtrip() {
        let msg = ControlMessage::HttpRequest(HttpRequest {
            id: "r1".into(),
            method: "POST".into(),
            path: "/api/items".into(),
            query: Some("page=2".into()),
            headers: vec![("X-Forwarded-Host".into(), "falcon-1234.example.com".into())],
            body: Some(b"{\"name\":\"widget\"}".to_vec()),
            content_type: Some("application/json".into()),
        });
        let text = msg.encode().unwrap();
        // Bodies travel base64-encoded, never as raw JSON.
        assert!(text.contains("\"kind\":\"http_request\""));
        assert!(!text.contains("widget"));
        match ControlMessage::decode(&text).unwrap() {
            ControlMessage::HttpRequest(req) => {
                assert_eq!(req.id, "r1");
                assert_eq!(req.body.as_deref(), Some(&b"{\"name\":\"widget\"}"[..]));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_http_response_defaults() {
        let resp: ControlMessage =
            ControlMessage::decode(r#"{"kind":"http_response","id":"r2"}"#).unwrap();
        match resp {
            ControlMessage::HttpResponse(resp) => {
                assert_eq!(resp.status, None);
                assert!(resp.headers.is_empty());
                assert!(resp.body.is_none());
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_ws_event_tagging() {
        let open = ControlMessage::WsEvent(WsEvent {
            connection_id: "c1".into(),
            kind: WsEventKind::Open {
                path: "/socket".into(),
                query: None,
                protocol: Some("graphql-ws".into()),
            },
        });
        let text = open.encode().unwrap();
        assert!(text.contains("\"event\":\"open\""));

        let close: ControlMessage = ControlMessage::decode(
            r#"{"kind":"ws_event","connection_id":"c1","event":"close","code":1000}"#,
        )
        .unwrap();
        match close {
            ControlMessage::WsEvent(WsEvent {
                kind: WsEventKind::Close { code, reason },
                ..
            }) => {
                assert_eq!(code, 1000);
                assert_eq!(reason, None);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_ws_binary_is_base64() {
        let msg = ControlMessage::WsEvent(WsEvent {
            connection_id: "c2".into(),
            kind: WsEventKind::Binary {
                data: vec![0xde, 0xad, 0xbe, 0xef],
            },
        });
        let text = msg.encode().unwrap();
        assert!(text.contains("3q2+7w=="));
        match ControlMessage::decode(&text).unwrap() {
            ControlMessage::WsEvent(WsEvent {
                kind: WsEventKind::Binary { data },
                ..
            }) => assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef]),
            other => panic!("wrong kind: {other:?}"),
        }
    }
}
