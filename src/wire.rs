//! Byte-level plumbing between a protocol instance and its peer.
//!
//! - [`framing`] turns byte streams into message bodies and back.
//! - [`transport`] abstracts the write side and drives a protocol over
//!   an `AsyncRead`/`AsyncWrite` pair.

pub mod framing;
pub mod transport;

pub use framing::{encode_frame, FrameDecoder, FrameError, FramingMode};
pub use transport::{serve, ChannelTransport, Transport};
