//! Envelope: the tagged union carried one-per-line over the tunnel.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Header name -> ordered list of values. Preserves insertion order and
/// duplicate values, per the wire contract.
pub type HeaderMap = IndexMap<String, Vec<String>>;

/// One message on the wire: `{"type": "...", "payload": {...}}\n`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    HttpRequest(HttpRequestPayload),
    HttpResponse(HttpResponsePayload),
    ConnectOpen(ConnectOpenPayload),
    ConnectAck(ConnectAckPayload),
    ConnectData(ConnectDataPayload),
    ConnectClose(ConnectClosePayload),
}

impl Envelope {
    /// The correlation id carried by every variant.
    pub fn id(&self) -> &str {
        match self {
            Envelope::HttpRequest(p) => &p.id,
            Envelope::HttpResponse(p) => &p.id,
            Envelope::ConnectOpen(p) => &p.id,
            Envelope::ConnectAck(p) => &p.id,
            Envelope::ConnectData(p) => &p.id,
            Envelope::ConnectClose(p) => &p.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::HttpRequest(_) => "http_request",
            Envelope::HttpResponse(_) => "http_response",
            Envelope::ConnectOpen(_) => "connect_open",
            Envelope::ConnectAck(_) => "connect_ack",
            Envelope::ConnectData(_) => "connect_data",
            Envelope::ConnectClose(_) => "connect_close",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRequestPayload {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HttpResponsePayload {
    pub id: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl HttpResponsePayload {
    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectOpenPayload {
    pub id: String,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectAckPayload {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectDataPayload {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectClosePayload {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Base64-encodes `Vec<u8>` fields as plain JSON strings (standard
/// alphabet, no line wrapping), per the wire format in spec §6.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_request_round_trips_through_json() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Test".to_string(), vec!["a".to_string(), "b".to_string()]);
        let env = Envelope::HttpRequest(HttpRequestPayload {
            id: "abc".to_string(),
            method: "GET".to_string(),
            url: "http://example.org/".to_string(),
            headers,
            body: b"hello".to_vec(),
        });
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains('\n'));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn wire_shape_matches_spec() {
        let env = Envelope::ConnectOpen(ConnectOpenPayload {
            id: "1".to_string(),
            host: "example.org:443".to_string(),
        });
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "connect_open");
        assert_eq!(json["payload"]["id"], "1");
        assert_eq!(json["payload"]["host"], "example.org:443");
    }

    #[test]
    fn body_is_base64_on_the_wire() {
        let env = Envelope::ConnectData(ConnectDataPayload {
            id: "1".to_string(),
            data: vec![0xff, 0x00, 0x10],
        });
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["payload"]["data"], "/wAQ");
    }

    #[test]
    fn response_with_error_omits_status_fields_from_json() {
        let env = HttpResponsePayload::error("id-1", "timeout");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"], "timeout");
    }
}
