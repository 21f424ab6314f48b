//! Helper types for framing JSON objects into async reads/writes.
//!
//! The wire format is one complete JSON value per logical frame.  On the
//! read side we accept back-to-back values with or without separating
//! whitespace; on the write side we always terminate each value with a
//! newline, which keeps the output usable with line-oriented tools.

use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use serde::Serialize;

/// An error from encoding or decoding a JSON frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error on the underlying stream.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    /// A frame was not valid JSON.
    #[error("json error")]
    Json(#[from] serde_json::Error),
    /// More bytes were buffered than the maximum frame length allows,
    /// without a complete value appearing.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Number of buffered bytes when we gave up.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
}

/// Decoder producing one [`serde_json::Value`] per frame.
///
/// We decode into `Value` rather than a typed request, since most frames
/// are forwarded verbatim and must survive the round trip untouched.
#[derive(Clone, Debug)]
pub(crate) struct JsonFrameDecoder {
    /// Give up on a frame once this many bytes are buffered.
    max_frame_len: usize,
}

impl JsonFrameDecoder {
    /// Create a decoder enforcing `max_frame_len`.
    pub(crate) fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl asynchronous_codec::Decoder for JsonFrameDecoder {
    type Item = serde_json::Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut iter = serde_json::Deserializer::from_slice(src).into_iter::<serde_json::Value>();
        match iter.next() {
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                src.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_frame_len {
                    Err(CodecError::FrameTooLarge {
                        len: src.len(),
                        max: self.max_frame_len,
                    })
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// As `JsonCodec`, but only supports encoding, and places a newline after
/// every object.
#[derive(Clone)]
pub(crate) struct JsonLinesEncoder<T> {
    /// We consume objects of type T.
    _phantom: PhantomData<fn(T) -> ()>,
}

impl<T> Default for JsonLinesEncoder<T> {
    fn default() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> asynchronous_codec::Encoder for JsonLinesEncoder<T>
where
    T: Serialize + 'static,
{
    type Item<'a> = T;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        use std::fmt::Write as _;
        let j = serde_json::to_string(&item)?;
        // The jsonlines framing won't work if serde_json starts adding
        // newlines in the middle.
        debug_assert!(!j.contains('\n'));
        writeln!(dst, "{}", j).expect("write! of string on BytesMut failed");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use asynchronous_codec::{Decoder as _, Encoder as _};
    use serde_json::json;

    #[test]
    fn decode_two_frames() {
        let mut dec = JsonFrameDecoder::new(1024);
        let mut buf = BytesMut::from(&br#"{"id":1} {"id":2}"#[..]);
        let one = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(one, json!({"id": 1}));
        let two = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(two, json!({"id": 2}));
        assert!(dec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut dec = JsonFrameDecoder::new(1024);
        let mut buf = BytesMut::from(&br#"{"method":"rpcswitch.pi"#[..]);
        assert!(dec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(br#"ng","id":7}"#);
        let v = dec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(v["method"], "rpcswitch.ping");
    }

    #[test]
    fn decode_oversized() {
        let mut dec = JsonFrameDecoder::new(8);
        let mut buf = BytesMut::from(&br#"{"xxxxxxxxxxxxxxxx":"#[..]);
        let err = dec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { .. }));
    }

    #[test]
    fn decode_garbage() {
        let mut dec = JsonFrameDecoder::new(1024);
        let mut buf = BytesMut::from(&b"this is not json\n"[..]);
        let err = dec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn encode_appends_newline() {
        let mut enc = JsonLinesEncoder::<serde_json::Value>::default();
        let mut buf = BytesMut::new();
        enc.encode(json!({"jsonrpc": "2.0", "id": 1}), &mut buf).unwrap();
        enc.encode(json!({"jsonrpc": "2.0", "id": 2}), &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
