//! RESP protocol encoder and decoder.
//!
//! # Modules
//!
//! - [`encoder`] - Frame and command encoding to bytes
//! - [`decoder`] - Streaming, resumable frame decoder

pub mod decoder;
pub mod encoder;

pub use decoder::{parse_frame, Decoder};
pub use encoder::Encoder;
