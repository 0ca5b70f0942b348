//! Framed codec for plugin host communication.
//!
//! Uses LengthDelimitedCodec for framing + ciborium (CBOR) for serialization.
//! CBOR is binary and self-describing, so application payloads keep their
//! shape (maps, byte strings, floats) without a schema on either side.
//! Works over any AsyncRead/AsyncWrite (unix sockets, named pipes, etc).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected by the decoder.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Codec that frames messages with a 4-byte length prefix and serializes with CBOR.
///
/// Wraps LengthDelimitedCodec and adds ciborium serialization.
pub struct CborCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CborCodec<T> {
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

impl<T: DeserializeOwned> Decoder for CborCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = ciborium::from_reader(&bytes[..])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for CborCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut record = Vec::new();
        ciborium::into_writer(&item, &mut record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if record.len() > MAX_FRAME_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "record of {} bytes exceeds the {MAX_FRAME_LENGTH} byte frame limit",
                    record.len()
                ),
            ));
        }
        if record.len() > MAX_FRAME_LENGTH / 4 {
            tracing::warn!(len = record.len(), limit = MAX_FRAME_LENGTH, "Frame nearing size limit");
        }
        self.inner.encode(Bytes::from(record), dst)
    }
}
