//! # Sentimux Core
//!
//! Connections, the multiplexing session, pub/sub routing, sentinel
//! resolution and the client facade built on top of them.
//!
//! ## Modules
//!
//! - [`connection`] - Framed TCP connection
//! - [`session`] - Pipelined session over one connection
//! - [`pubsub`] - Pub/sub messages and subscription streams
//! - [`sentinel`] - Master discovery through sentinels
//! - [`client`] - Sentinel-aware client facade
//! - [`builder`] - Client builder
//! - [`command`] - Command builders
//! - [`config`] - Addresses and options
//!

#![warn(missing_docs)]

pub use crate::proto::error::{Error, Result};

/// Client builder configuration.
pub mod builder;
pub mod client;
/// Command construction helpers.
pub mod command;
pub mod config;
/// Low-level connection management.
pub mod connection;
pub mod pubsub;
pub mod sentinel;
pub mod session;
