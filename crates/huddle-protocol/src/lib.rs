//! Shared protocol definitions for Huddle
//!
//! The control channel carries length-prefixed frames whose bodies are encoded
//! by [`wire`]; the media channel carries datagrams laid out by [`datagram`].

pub mod datagram;
pub mod messages;
pub mod types;
pub mod wire;

pub use datagram::{DatagramError, MediaDatagram, encode_datagram};
pub use messages::{ClientMessage, ServerMessage};
pub use types::*;
pub use wire::WireError;
