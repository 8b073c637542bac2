use std::time::Duration;

use crate::core::client::SentinelClient;
use crate::core::config::{ClientOptions, SentinelConfig};
use crate::core::{Error, Result};

/// Builder for configuring and creating a [`SentinelClient`].
///
/// # Example
///
/// ```no_run
/// use sentimux::ClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new()
///     .sentinel("10.0.0.1:26379")
///     .sentinel("10.0.0.2:26379")
///     .master_name("mymaster")
///     .password("secret")
///     .database(0)
///     .connect()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ClientBuilder {
    sentinels: Vec<String>,
    master_name: Option<String>,
    password: Option<String>,
    username: Option<String>,
    database: Option<u8>,
    client_name: Option<String>,
    sentinel_password: Option<String>,
    connection_timeout: Option<Duration>,
    sentinel_timeout: Option<Duration>,
    queue_size: Option<usize>,
    max_frame_size: Option<usize>,
    verify_role: Option<bool>,
}

impl ClientBuilder {
    /// Creates a new [`ClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the sentinel list.
    ///
    /// # Arguments
    ///
    /// * `sentinels` - Addresses as `host:port`, tried in the given order
    #[inline]
    pub fn sentinels<I, S>(mut self, sentinels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sentinels = sentinels.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one sentinel to the list.
    #[inline]
    pub fn sentinel(mut self, address: impl Into<String>) -> Self {
        self.sentinels.push(address.into());
        self
    }

    /// Sets the logical service name the sentinels monitor.
    #[inline]
    pub fn master_name(mut self, name: impl Into<String>) -> Self {
        self.master_name = Some(name.into());
        self
    }

    /// Sets the password for authenticating to the master.
    ///
    /// # Arguments
    ///
    /// * `password` - Password string
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the username for ACL authentication to the master.
    ///
    /// # Arguments
    ///
    /// * `username` - Username string
    #[inline]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the database number to select after connection.
    ///
    /// # Arguments
    ///
    /// * `database` - Database number (0-15)
    #[inline]
    pub fn database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Sets the client connection name.
    ///
    /// # Arguments
    ///
    /// * `name` - Client name displayed in `CLIENT LIST`
    #[inline]
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Sets the password sent to sentinels, which may differ from the
    /// master's.
    #[inline]
    pub fn sentinel_password(mut self, password: impl Into<String>) -> Self {
        self.sentinel_password = Some(password.into());
        self
    }

    /// Sets the connection timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for a TCP connection, to sentinels and master alike
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the deadline for querying one sentinel (default: 2s).
    #[inline]
    pub fn sentinel_timeout(mut self, timeout: Duration) -> Self {
        self.sentinel_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of pending requests in the queue.
    ///
    /// # Arguments
    ///
    /// * `size` - Maximum number of requests (default: 1024)
    #[inline]
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Sets the largest inbound frame accepted (default: 512 MiB).
    #[inline]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = Some(size);
        self
    }

    /// Enables or disables the ROLE check after connecting (default: on).
    #[inline]
    pub fn verify_role(mut self, enabled: bool) -> Self {
        self.verify_role = Some(enabled);
        self
    }

    /// The options this builder produces.
    pub fn options(&self) -> ClientOptions {
        let mut options = ClientOptions::default();
        for conn in [&mut options.master, &mut options.sentinel] {
            if let Some(timeout) = self.connection_timeout {
                conn.connect_timeout = timeout;
            }
            if let Some(size) = self.queue_size {
                conn.queue_size = size;
            }
            if let Some(size) = self.max_frame_size {
                conn.max_frame_size = size;
            }
        }
        options.master.password = self.password.clone();
        options.master.username = self.username.clone();
        options.master.database = self.database;
        options.master.client_name = self.client_name.clone();
        options.sentinel.password = self.sentinel_password.clone();
        if let Some(timeout) = self.sentinel_timeout {
            options.sentinel_timeout = timeout;
        }
        if let Some(verify) = self.verify_role {
            options.verify_role = verify;
        }
        options
    }

    /// The sentinel configuration from the sentinel list and master name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the master name or sentinels
    /// are missing or an address does not parse.
    pub fn sentinel_config(&self) -> Result<SentinelConfig> {
        let master_name = self
            .master_name
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument {
                message: "master name is required".to_string(),
            })?;
        SentinelConfig::new(&self.sentinels, master_name)
    }

    /// Builds a disconnected [`SentinelClient`].
    #[inline]
    pub fn build(self) -> SentinelClient {
        SentinelClient::new(self.options())
    }

    /// Builds a [`SentinelClient`] and connects it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an incomplete configuration,
    /// and otherwise the errors of [`SentinelClient::connect`].
    pub async fn connect(self) -> Result<SentinelClient> {
        let config = self.sentinel_config()?;
        let client = self.build();
        client.connect(config).await?;
        Ok(client)
    }
}
