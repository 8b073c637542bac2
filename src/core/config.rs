//! Configuration values.
//!
//! Everything here is an immutable value passed explicitly into the session,
//! resolver and client, so several clients can coexist with different
//! sentinel sets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::{Host, Url};

use crate::core::{Error, Result};

/// Default port of a sentinel node.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Default port of a data node.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

pub(crate) const DEFAULT_QUEUE_SIZE: usize = 1024;
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_SENTINEL_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Network address of a node (sentinel or data node).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    host: String,
    port: u16,
}

impl NodeAddr {
    /// Creates an address from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]:port` or `redis://host:port`.
    ///
    /// # Arguments
    ///
    /// * `input` - The address text
    /// * `default_port` - Port used when `input` carries none
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for anything that is not a plain
    /// `redis://` host address.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        let with_scheme = if input.contains("://") {
            input.to_string()
        } else {
            format!("redis://{}", input)
        };
        let invalid = |message: &str| Error::InvalidArgument {
            message: format!("{}: '{}'", message, input),
        };

        let url = Url::parse(&with_scheme).map_err(|_| invalid("invalid address format"))?;
        if url.scheme() != "redis" {
            return Err(invalid("invalid scheme, expected redis://"));
        }
        let host = match url.host() {
            Some(Host::Ipv6(ip)) => ip.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            _ => return Err(invalid("missing host in address")),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
        })
    }

    /// Host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The set of sentinels to ask and the logical service name to ask for.
///
/// Cheap to clone. The order of `sentinels` is the order they are tried in.
///
/// # Example
///
/// ```
/// use sentimux::SentinelConfig;
///
/// let config = SentinelConfig::new(["10.0.0.1:26379", "10.0.0.2"], "mymaster").unwrap();
/// assert_eq!(config.sentinels().len(), 2);
/// assert_eq!(config.sentinels()[1].port(), 26379);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelConfig {
    inner: Arc<SentinelSet>,
}

#[derive(Debug, PartialEq, Eq)]
struct SentinelSet {
    sentinels: Vec<NodeAddr>,
    master_name: String,
}

impl SentinelConfig {
    /// Builds a configuration from sentinel address strings and a master name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the list is empty, an address
    /// does not parse, or the master name is empty.
    pub fn new<I, S>(sentinels: I, master_name: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sentinels = sentinels
            .into_iter()
            .map(|s| NodeAddr::parse(s.as_ref(), DEFAULT_SENTINEL_PORT))
            .collect::<Result<Vec<_>>>()?;
        Self::from_addrs(sentinels, master_name)
    }

    /// Builds a configuration from already parsed addresses.
    pub fn from_addrs(sentinels: Vec<NodeAddr>, master_name: impl Into<String>) -> Result<Self> {
        let master_name = master_name.into();
        if sentinels.is_empty() {
            return Err(Error::InvalidArgument {
                message: "at least one sentinel address is required".to_string(),
            });
        }
        if master_name.is_empty() {
            return Err(Error::InvalidArgument {
                message: "master name is required".to_string(),
            });
        }
        Ok(Self {
            inner: Arc::new(SentinelSet {
                sentinels,
                master_name,
            }),
        })
    }

    /// Sentinel addresses in the order they are tried.
    pub fn sentinels(&self) -> &[NodeAddr] {
        &self.inner.sentinels
    }

    /// Logical service name.
    pub fn master_name(&self) -> &str {
        &self.inner.master_name
    }
}

/// Settings applied to every session opened to a node.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectOptions {
    /// Password sent with AUTH after connecting.
    pub password: Option<String>,
    /// ACL user name sent with AUTH, only used together with a password.
    pub username: Option<String>,
    /// Database selected after connecting.
    pub database: Option<u8>,
    /// Connection name set with CLIENT SETNAME.
    pub client_name: Option<String>,
    /// Deadline for the TCP connect.
    pub connect_timeout: Duration,
    /// Maximum number of commands waiting for the writer; further sends
    /// wait for a slot.
    pub queue_size: usize,
    /// Maximum size of a single inbound frame.
    pub max_frame_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            password: None,
            username: None,
            database: None,
            client_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Settings of a [`SentinelClient`](crate::SentinelClient).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientOptions {
    /// Options for sessions to the master (main, pub/sub and blocking).
    pub master: ConnectOptions,
    /// Options for the short-lived sentinel sessions.
    pub sentinel: ConnectOptions,
    /// Deadline for one sentinel query, connect included.
    pub sentinel_timeout: Duration,
    /// Check with ROLE that the resolved node is really a master.
    pub verify_role: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            master: ConnectOptions::default(),
            sentinel: ConnectOptions::default(),
            sentinel_timeout: DEFAULT_SENTINEL_TIMEOUT,
            verify_role: true,
        }
    }
}
