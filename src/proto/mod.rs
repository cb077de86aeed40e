//! RESP (Redis Serialization Protocol) support.
//!
//! - [`codec`] - Encoder and decoder for RESP protocol
//! - [`error`] - Error type shared by the whole client
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
