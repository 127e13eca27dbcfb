//! Media processing utilities for Huddle
//!
//! The relay treats video and screen frames as opaque JPEG bytes; the only
//! media it touches is audio, which it mixes as raw PCM:
//! - Fixed audio contract (22050 Hz, 16-bit, mono, 2048-sample frames)
//! - N-1 mixing with 32-bit accumulation and 16-bit clipping

pub mod audio;

pub use audio::*;
