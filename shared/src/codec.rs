//! Length-delimited bincode framing for [`Packet`]s and JSON value payloads

use crate::entry::Payload;
use crate::protocol::Packet;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("malformed value: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a topic value into its wire payload
pub fn encode_value<V: Serialize>(value: &V) -> Result<Payload, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes a wire payload into a topic value
pub fn decode_value<V: DeserializeOwned>(payload: &[u8]) -> Result<V, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Wraps [`LengthDelimitedCodec`] with bincode serialization of packets
#[derive(Debug)]
pub struct PacketCodec {
    inner: LengthDelimitedCodec,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(bincode::deserialize(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = bincode::serialize(&item)?;
        self.inner.encode(Bytes::from(data), dst)?;
        Ok(())
    }
}
