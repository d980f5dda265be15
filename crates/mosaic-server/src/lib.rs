//! Mosaic server.
//!
//! One accept thread, two threads per connection (reader and writer),
//! plus a housekeeping thread, an audio mixer thread when audio is on,
//! and a grid-compose thread when the server composes for its clients.
//! All shared state lives in [`ServerContext`]; no lock is held across a
//! socket operation, a queue wait, or a render.

pub mod broadcast;
pub mod compose;
pub mod connection;
pub mod housekeeping;
pub mod mixer_loop;
pub mod server;

pub use server::{Server, ServerContext};
