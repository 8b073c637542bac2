//! Master discovery through sentinels.
//!
//! Sentinels speak the same protocol as data nodes, so the resolver talks to
//! them through ordinary short-lived [`Session`]s.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::command;
use crate::core::config::{ConnectOptions, NodeAddr, SentinelConfig};
use crate::core::session::Session;
use crate::core::{Error, Result};
use crate::proto::frame::Frame;

/// Translates a [`SentinelConfig`] into the address of the current master.
///
/// Sentinels are asked in list order and the first one that reports an
/// address wins. The resolver never retries by itself and keeps no memory
/// between calls: a sentinel that failed last time is asked again next time.
#[derive(Debug, Clone)]
pub struct Resolver {
    options: ConnectOptions,
    query_timeout: Duration,
}

impl Resolver {
    /// Creates a resolver.
    ///
    /// # Arguments
    ///
    /// * `options` - Connection settings for the sentinel sessions
    /// * `query_timeout` - Deadline for one sentinel, connect included
    pub fn new(options: ConnectOptions, query_timeout: Duration) -> Self {
        Self {
            options,
            query_timeout,
        }
    }

    /// Finds the current master address for `config.master_name()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMasterAvailable`] if no sentinel in the list
    /// answered with an address.
    #[instrument(skip_all, fields(master = config.master_name()))]
    pub async fn resolve(&self, config: &SentinelConfig) -> Result<NodeAddr> {
        for sentinel in config.sentinels() {
            match self.query(sentinel, config.master_name()).await {
                Ok(Some(master)) => {
                    info!(%sentinel, %master, "master resolved");
                    return Ok(master);
                }
                Ok(None) => {
                    warn!(%sentinel, "sentinel does not know this master");
                }
                Err(e) => {
                    warn!(%sentinel, error = %e, "sentinel query failed");
                }
            }
        }
        Err(Error::NoMasterAvailable {
            master_name: config.master_name().to_string(),
            attempts: config.sentinels().len(),
        })
    }

    async fn query(&self, sentinel: &NodeAddr, master_name: &str) -> Result<Option<NodeAddr>> {
        let exchange = async {
            let session = Session::open(sentinel, &self.options).await?;
            let reply = session
                .request(command::sentinel_get_master_addr(master_name.to_string()))
                .await;
            session.close();
            reply
        };
        let reply = tokio::time::timeout(self.query_timeout, exchange)
            .await
            .map_err(|_| Error::Timeout {
                operation: "sentinel query",
            })??;
        debug!(%sentinel, ?reply, "sentinel replied");
        parse_master_addr(reply)
    }
}

/// Interprets a `SENTINEL get-master-addr-by-name` reply.
///
/// `[host, port]` yields an address, a null or empty reply yields `None`.
///
/// # Errors
///
/// Error replies become [`Error::Server`]; any other shape or a bad port is
/// a protocol error.
pub fn parse_master_addr(reply: Frame) -> Result<Option<NodeAddr>> {
    let items = match command::parse_frame_response(reply)? {
        Frame::Null | Frame::BulkString(None) => return Ok(None),
        Frame::Array(items) if items.is_empty() => return Ok(None),
        Frame::Array(items) => items,
        other => {
            return Err(Error::protocol(format!(
                "unexpected sentinel reply: {:?}",
                other
            )))
        }
    };

    let [host, port] = items.as_slice() else {
        return Err(Error::protocol(format!(
            "expected [host, port], got {} elements",
            items.len()
        )));
    };
    let host = host
        .as_bytes()
        .and_then(|h| std::str::from_utf8(h).ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::protocol("invalid master host"))?;
    let port = port
        .as_bytes()
        .and_then(|p| std::str::from_utf8(p).ok())
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol("invalid master port"))?;
    Ok(Some(NodeAddr::new(host, port)))
}
