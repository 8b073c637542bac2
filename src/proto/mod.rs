//! # Sentimux Proto
//!
//! RESP2 (Redis Serialization Protocol) codec used for both the master and
//! the sentinels, since they speak the same framing.
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for RESP protocol
//! - [`error`] - Error types shared by the whole crate
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
