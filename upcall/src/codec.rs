//! Typed command bodies.
//!
//! The transport moves opaque bytes. This layer lets both ends agree on a
//! serde type instead, encoded with postcard.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol;
use crate::transport::{CommandId, PulledFrame, SubmitError};

/// Marker trait for types that can travel as a command or reply body.
///
/// Automatically implemented for all `Serialize + Deserialize` types.
pub trait Wire: Serialize + for<'de> Deserialize<'de> {}
impl<T> Wire for T where T: Serialize + for<'de> Deserialize<'de> {}

#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("codec error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Error from a typed call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Serialize `msg` into a fresh body.
pub fn encode<T: Wire>(msg: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(msg)?)
}

/// Deserialize a body produced by [`encode`].
pub fn decode<T: Wire>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Decode the typed body at the head of a pulled command frame.
///
/// Scatter regions that follow the body are left for the caller to slice.
pub fn decode_body<T: Wire>(frame: &PulledFrame) -> Result<T, CodecError> {
    decode(frame.body())
}

/// Encode a typed reply as a push frame for `id` into `buf`.
pub fn encode_reply<T: Wire>(id: CommandId, msg: &T, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let body = encode(msg)?;
    protocol::encode_reply(id, &body, buf);
    Ok(())
}
