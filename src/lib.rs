//! # Sentimux
//!
//! Redis client that discovers the writable master through sentinels and
//! multiplexes pipelined commands, blocking commands and pub/sub over it.
//!
//! ## Example
//!
//! ```no_run
//! use sentimux::{SentinelClient, SentinelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = SentinelClient::builder().build();
//!     let config = SentinelConfig::new(["127.0.0.1:26379"], "mymaster")?;
//!     client.connect(config).await?;
//!     client.on_disconnect(|reason| eprintln!("master lost: {}", reason));
//!     let reply = client.command(["SET", "foo", "bar"]).await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub(crate) mod core;
pub mod proto;

#[cfg(test)]
mod stress;

// Re-export high-level client types for convenience
pub use crate::core::builder::ClientBuilder;
pub use crate::core::client::{ClientStatus, SentinelClient};
pub use crate::core::command::{self, Cmd};
pub use crate::core::config::{ClientOptions, ConnectOptions, NodeAddr, SentinelConfig};
pub use crate::core::pubsub::{PubSubMessage, Subscription, Topic};
pub use crate::core::sentinel::Resolver;
pub use crate::core::session::{DisconnectReason, PendingReply, Session, SessionStatus};
pub use crate::core::{Error, Result};
pub use crate::proto::frame::Frame;
