//! RESP frame types.
//!
//! This module defines the reply values of the Redis protocol: simple
//! strings, errors, integers, bulk strings, arrays and nulls.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
