//! Control channel
//!
//! Frames are a 4-byte big-endian length followed by a body encoded by
//! [`huddle_protocol::wire`].

pub mod connections;
pub mod handler;

use crate::error::{RelayError, Result};
use bytes::BytesMut;
use futures_util::{Stream, StreamExt};
use huddle_protocol::{ClientMessage, WireError};
use std::io;
use tokio_util::codec::LengthDelimitedCodec;

pub use connections::{ConnectionHandle, broadcast};
pub use handler::handle_connection;

pub fn control_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// A decoded inbound frame that does not end the connection
#[derive(Debug)]
pub enum Inbound {
    Message(ClientMessage),
    Unknown(u8),
    Malformed(WireError),
}

/// Read the next frame and classify it
///
/// Transport failures and framing errors come back as `Err`; anything the
/// handler can keep going after is an [`Inbound`].
pub async fn next_inbound<S>(stream: &mut S) -> Result<Inbound>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    let frame = match stream.next().await {
        None => return Err(RelayError::ConnectionLost("peer closed the connection".into())),
        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(RelayError::Protocol(e.to_string()));
        }
        Some(Err(e)) => return Err(RelayError::ConnectionLost(e.to_string())),
        Some(Ok(frame)) => frame,
    };

    match ClientMessage::decode(frame.freeze()) {
        Ok(message) => Ok(Inbound::Message(message)),
        Err(WireError::UnknownKind(kind)) => Ok(Inbound::Unknown(kind)),
        Err(e) if e.is_framing() => Err(RelayError::Protocol(e.to_string())),
        Err(e) => Ok(Inbound::Malformed(e)),
    }
}
