//! Framed codec for driver/worker communication.
//!
//! Each frame is a 4-byte big-endian length prefix followed by one JSON
//! document. Works over any AsyncRead/AsyncWrite (pipes, duplex streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. A point is a handful of floats, so anything
/// near this size means the stream is corrupt.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const PREVIEW_LENGTH: usize = 32;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    /// Every malformed input surfaces as [`io::ErrorKind::InvalidData`] so the
    /// channel can tell a corrupt stream apart from a dead peer.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(announced) = announced_length(src) {
            if announced > MAX_FRAME_LENGTH {
                return Err(malformed(format!(
                    "frame header announces {announced} bytes (limit {MAX_FRAME_LENGTH}), \
                     stream starts with {:?}",
                    preview(src)
                )));
            }
        }

        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(|e| {
            malformed(format!(
                "frame is not a valid message ({e}), payload starts with {:?}",
                preview(&frame)
            ))
        })
    }
}

/// Length from the 4-byte big-endian header, once it has fully arrived.
fn announced_length(src: &[u8]) -> Option<usize> {
    let header: [u8; 4] = src.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// Leading bytes of a rejected frame, for the diagnostic.
fn preview(bytes: &[u8]) -> String {
    let end = bytes.len().min(PREVIEW_LENGTH);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn malformed(detail: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail)
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
