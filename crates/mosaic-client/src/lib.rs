//! Mosaic client.
//!
//! Connects, handshakes, then runs four loops on their own threads:
//! capture (webcam), capture (microphone), receive/classify, and send.
//! The render tick runs on the main thread and paints the grid with one
//! batched terminal write per frame.

pub mod app;
pub mod capture;
pub mod session;

pub use app::run;
