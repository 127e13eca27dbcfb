//! Huddle Server Library
//!
//! LAN relay for small meetings: one TCP control channel per participant and
//! a shared UDP media channel. Exposed as a library for testing and embedding.

pub mod control;
pub mod error;
pub mod media;
pub mod server;
pub mod services;
pub mod state;

pub use server::RelayServer;
