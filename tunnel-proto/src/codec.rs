//! Line-framed envelope codec (spec §4.1, §6).
//!
//! The wire format is "exactly one JSON object per line, newline
//! terminated". We implement `tokio_util::codec::{Decoder, Encoder}` so
//! both endpoints can wrap a TLS stream in a `Framed<_, EnvelopeCodec>`
//! and get `Stream`/`Sink` of `Envelope` directly.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::MAX_LINE_BYTES;

#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    max_line_bytes: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self { max_line_bytes }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        let Some(newline_at) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_line_bytes {
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }
            return Ok(None);
        };

        if newline_at > self.max_line_bytes {
            // Drain the oversized line so the connection doesn't wedge
            // before the caller tears the session down.
            src.advance(newline_at + 1);
            return Err(ProtocolError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }

        let line = src.split_to(newline_at + 1);
        let line = &line[..line.len() - 1]; // drop the trailing \n

        let value: serde_json::Value = serde_json::from_slice(line)?;
        let type_name = value
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let envelope: Envelope = serde_json::from_value(value).map_err(|e| {
            match type_name {
                Some(t)
                    if ![
                        "http_request",
                        "http_response",
                        "connect_open",
                        "connect_ack",
                        "connect_data",
                        "connect_close",
                    ]
                    .contains(&t.as_str()) =>
                {
                    ProtocolError::UnknownType(t)
                }
                None => ProtocolError::UnknownType("<missing>".to_string()),
                _ => ProtocolError::MalformedJson(e),
            }
        })?;

        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ConnectOpenPayload, HttpRequestPayload};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    #[test]
    fn encode_then_decode_round_trips() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        let env = Envelope::ConnectOpen(ConnectOpenPayload {
            id: "42".to_string(),
            host: "example.org:443".to_string(),
        });
        codec.encode(env.clone(), &mut buf).unwrap();
        assert_eq!(buf[buf.len() - 1], b'\n');
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_yields_none_until_newline_arrives() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"connect_ack\","[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\"payload\":{\"id\":\"1\",\"success\":true}}\n");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id(), "1");
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"bogus\",\"payload\":{}}\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(_)));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut codec = EnvelopeCodec::with_max_line_bytes(16);
        let mut buf = BytesMut::from(&b"{\"type\":\"connect_ack\",\"payload\":{\"id\":\"1\",\"success\":true}}\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong { .. }));
    }

    #[tokio::test]
    async fn framed_stream_sink_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Framed::new(client, EnvelopeCodec::new());
        let mut server = Framed::new(server, EnvelopeCodec::new());

        let env = Envelope::HttpRequest(HttpRequestPayload {
            id: "req-1".to_string(),
            method: "GET".to_string(),
            url: "http://example.org/".to_string(),
            headers: Default::default(),
            body: vec![],
        });
        client.send(env.clone()).await.unwrap();
        let received = server.next().await.unwrap().unwrap();
        assert_eq!(received, env);
    }
}
