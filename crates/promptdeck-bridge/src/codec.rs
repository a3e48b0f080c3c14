//! Line-delimited JSON codec for the worker byte stream.
//!
//! Wraps LinesCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Codec that frames messages as newline-terminated JSON lines.
///
/// A line that fails to parse cannot be attributed to any pending request, so
/// it is dropped and logged rather than erroring the stream; decoding resumes
/// with the next line. Bytes after the last newline stay buffered across
/// reads — that buffer is the only statefulness here.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
            _phantom: PhantomData,
        }
    }
}

fn framing_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "frame exceeds max line length")
        }
        LinesCodecError::Io(e) => e,
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src).map_err(framing_error)? {
            match serde_json::from_str(&line) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::warn!(error = %e, line_len = line.len(), "Dropping malformed frame");
                }
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A worker may flush its final line without a newline before exiting.
        while let Some(line) = self.inner.decode_eof(src).map_err(framing_error)? {
            match serde_json::from_str(&line) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::warn!(error = %e, line_len = line.len(), "Dropping malformed frame at EOF");
                }
            }
        }
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_string(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // serde_json escapes control characters, so the encoded form never
        // contains a raw newline; the frame is exactly one line.
        self.inner.encode(json, dst).map_err(framing_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, Notification, Request, Response};
    use serde_json::json;

    fn request(id: u64) -> Message {
        Message::Request(Request {
            id,
            method: "token/count".to_string(),
            params: json!({"text": "hello world"}),
        })
    }

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        codec.encode(request(1), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, request(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn encoded_frame_is_one_newline_terminated_line() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        // Params containing a newline must be escaped by the encoding itself.
        let msg = Message::Request(Request {
            id: 9,
            method: "token/count".to_string(),
            params: json!({"text": "line one\nline two"}),
        });
        codec.encode(msg, &mut buf).unwrap();

        let newlines = buf.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(newlines, 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[test]
    fn decode_split_at_every_byte_boundary() {
        let mut reference = JsonLineCodec::<Message>::new();
        let mut encoded = BytesMut::new();
        reference.encode(request(3), &mut encoded).unwrap();
        let bytes = encoded.to_vec();

        for split in 1..bytes.len() {
            let mut codec = JsonLineCodec::<Message>::new();
            let mut buf = BytesMut::new();

            buf.extend_from_slice(&bytes[..split]);
            let first = codec.decode(&mut buf).unwrap();

            buf.extend_from_slice(&bytes[split..]);
            let second = codec.decode(&mut buf).unwrap();

            let decoded = first.or(second).unwrap_or_else(|| {
                panic!("no frame decoded when split at byte {split}");
            });
            assert_eq!(decoded, request(3), "split at byte {split}");
        }
    }

    #[test]
    fn malformed_line_is_dropped_and_stream_continues() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"this is not json\n");
        buf.extend_from_slice(b"{\"type\":\"ready\"}\n");
        buf.extend_from_slice(b"{\"truncated\":\n");
        buf.extend_from_slice(b"{\"id\":1,\"success\":true,\"result\":null}\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Message::Notification(Notification::Ready));

        // A wire-level `"result":null` deserializes as an absent result; both
        // collapse to a null caller-facing value.
        match codec.decode(&mut buf).unwrap().unwrap() {
            Message::Response(second) => {
                assert_eq!(second.id, 1);
                assert_eq!(second.result, None);
                assert_eq!(second.into_result().unwrap(), json!(null));
            }
            other => panic!("expected response frame, got {other:?}"),
        }

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn trailing_partial_line_is_retained() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":\"ready\"}\n{\"id\":2,\"succ");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Notification(Notification::Ready)
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"ess\":true,\"result\":{\"count\":2}}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            Message::Response(Response::ok(2, json!({"count": 2})))
        );
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        for id in 1..=3u64 {
            codec.encode(request(id), &mut buf).unwrap();
        }

        for id in 1..=3u64 {
            assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), request(id));
        }
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn unterminated_final_line_decodes_at_eof() {
        let mut codec = JsonLineCodec::<Message>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"{\"type\":\"ready\"}");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().unwrap(),
            Message::Notification(Notification::Ready)
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
