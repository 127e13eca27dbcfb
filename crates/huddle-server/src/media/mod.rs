//! Media channel: datagram routing and server-side audio mixing

pub mod mixer;
pub mod router;

pub use mixer::{AudioMixer, MixedFrame};
pub use router::MediaRouter;
