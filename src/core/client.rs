//! The sentinel-aware client facade.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::core::builder::ClientBuilder;
use crate::core::command::{self, Cmd};
use crate::core::config::{ClientOptions, NodeAddr, SentinelConfig};
use crate::core::pubsub::{Subscription, Topic};
use crate::core::sentinel::Resolver;
use crate::core::session::{DisconnectReason, Session};
use crate::core::{Error, Result};
use crate::proto::frame::Frame;

type DisconnectHook = Arc<dyn Fn(DisconnectReason) + Send + Sync + 'static>;

/// Connection state of a [`SentinelClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// No master connection. `connect` may be called.
    Disconnected,
    /// Resolving the master and connecting to it.
    Connecting,
    /// Commands are accepted.
    Connected,
    /// Closed for good.
    Closed,
}

struct State {
    status: ClientStatus,
    /// Bumped on every connect and on close, so hooks of replaced sessions
    /// can tell they are stale.
    generation: u64,
    config: Option<SentinelConfig>,
    master: Option<NodeAddr>,
    session: Option<Session>,
    pubsub: Option<Session>,
    blocking: HashMap<u64, Session>,
    next_blocking_id: u64,
    on_disconnect: Option<DisconnectHook>,
}

struct Inner {
    options: ClientOptions,
    resolver: Resolver,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_disconnect(&self, generation: u64, reason: DisconnectReason) {
        let (hook, pubsub) = {
            let mut state = self.lock();
            if state.generation != generation || state.status != ClientStatus::Connected {
                return;
            }
            state.status = ClientStatus::Disconnected;
            state.session = None;
            (state.on_disconnect.clone(), state.pubsub.take())
        };
        info!(%reason, "master connection lost");
        if let Some(pubsub) = pubsub {
            pubsub.close();
        }
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

/// A Redis client that finds the master through sentinels.
///
/// The client is cheap to clone; clones share one master connection, and
/// commands from concurrent callers are pipelined over it. Blocking commands
/// such as BLPOP get a dedicated connection each, and subscriptions share a
/// separate pub/sub connection, so neither stalls ordinary commands.
///
/// The client never reconnects by itself. Register a hook with
/// [`on_disconnect`](SentinelClient::on_disconnect) and call
/// [`connect`](SentinelClient::connect) or
/// [`reconnect`](SentinelClient::reconnect) again, which re-runs sentinel
/// resolution since the master may have changed.
///
/// # Example
///
/// ```no_run
/// use sentimux::{SentinelClient, SentinelConfig};
///
/// # #[tokio::main]
/// # async fn main() -> sentimux::Result<()> {
/// let client = SentinelClient::builder().build();
/// client
///     .connect(SentinelConfig::new(["127.0.0.1:26379"], "mymaster")?)
///     .await?;
/// client.set("foo", "bar").await?;
/// assert_eq!(client.get("foo").await?.as_deref(), Some(&b"bar"[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SentinelClient {
    inner: Arc<Inner>,
}

impl SentinelClient {
    /// Creates a disconnected client.
    pub fn new(options: ClientOptions) -> Self {
        let resolver = Resolver::new(options.sentinel.clone(), options.sentinel_timeout);
        Self {
            inner: Arc::new(Inner {
                options,
                resolver,
                state: Mutex::new(State {
                    status: ClientStatus::Disconnected,
                    generation: 0,
                    config: None,
                    master: None,
                    session: None,
                    pubsub: None,
                    blocking: HashMap::new(),
                    next_blocking_id: 0,
                    on_disconnect: None,
                }),
            }),
        }
    }

    /// Returns a builder for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Current state.
    pub fn status(&self) -> ClientStatus {
        self.inner.lock().status
    }

    /// Address of the master from the last successful resolution.
    pub fn master_address(&self) -> Option<NodeAddr> {
        self.inner.lock().master.clone()
    }

    /// Configuration of the last `connect` call.
    pub fn config(&self) -> Option<SentinelConfig> {
        self.inner.lock().config.clone()
    }

    /// Registers a hook run every time the master connection is lost, and
    /// once on [`close`](SentinelClient::close) if a connection was up.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn(DisconnectReason) + Send + Sync + 'static,
    {
        self.inner.lock().on_disconnect = Some(Arc::new(hook));
    }

    /// Resolves the master through the sentinels and connects to it.
    ///
    /// Calling this while connected re-resolves and replaces the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMasterAvailable`] if no sentinel knows the master,
    /// [`Error::Connect`] if the master is unreachable,
    /// [`Error::RoleMismatch`] if the node is not a master, and
    /// [`Error::ClientClosed`] after [`close`](SentinelClient::close). The
    /// client is left disconnected on failure.
    #[instrument(skip_all, fields(master = config.master_name()))]
    pub async fn connect(&self, config: SentinelConfig) -> Result<()> {
        let (generation, previous) = {
            let mut state = self.inner.lock();
            if state.status == ClientStatus::Closed {
                return Err(Error::ClientClosed);
            }
            state.generation += 1;
            state.status = ClientStatus::Connecting;
            state.config = Some(config.clone());
            (state.generation, [state.session.take(), state.pubsub.take()])
        };
        for session in previous.into_iter().flatten() {
            session.close();
        }

        let result = self.establish(&config).await;

        let session = {
            let mut state = self.inner.lock();
            if state.generation != generation {
                let closed = state.status == ClientStatus::Closed;
                drop(state);
                if let Ok((session, _)) = &result {
                    session.close();
                }
                return Err(if closed {
                    Error::ClientClosed
                } else {
                    Error::ConnectionClosed
                });
            }
            match result {
                Ok((session, master)) => {
                    state.status = ClientStatus::Connected;
                    state.master = Some(master);
                    state.session = Some(session.clone());
                    session
                }
                Err(e) => {
                    state.status = ClientStatus::Disconnected;
                    return Err(e);
                }
            }
        };

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        session.on_disconnect(move |reason| {
            if let Some(inner) = inner.upgrade() {
                inner.handle_disconnect(generation, reason);
            }
        });
        info!(master = %session.address(), "connected");
        Ok(())
    }

    /// Connects again with the configuration of the last `connect` call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `connect` was never called, and
    /// otherwise the errors of [`connect`](SentinelClient::connect).
    pub async fn reconnect(&self) -> Result<()> {
        let config = self.config().ok_or_else(|| Error::InvalidArgument {
            message: "reconnect called before connect".to_string(),
        })?;
        self.connect(config).await
    }

    async fn establish(&self, config: &SentinelConfig) -> Result<(Session, NodeAddr)> {
        let master = self.inner.resolver.resolve(config).await?;
        let session = Session::open(&master, &self.inner.options.master).await?;
        if self.inner.options.verify_role {
            if let Err(e) = verify_role(&session).await {
                session.close();
                return Err(e);
            }
        }
        Ok((session, master))
    }

    /// Closes the client and every connection it holds. Idempotent.
    ///
    /// Outstanding commands fail with [`Error::ConnectionClosed`] and
    /// subscription streams end.
    pub fn close(&self) {
        let (sessions, hook) = {
            let mut state = self.inner.lock();
            if state.status == ClientStatus::Closed {
                return;
            }
            state.status = ClientStatus::Closed;
            state.generation += 1;
            let was_live = state.session.is_some();
            let mut sessions: Vec<Session> = state.session.take().into_iter().collect();
            sessions.extend(state.pubsub.take());
            sessions.extend(state.blocking.drain().map(|(_, s)| s));
            let hook = if was_live {
                state.on_disconnect.clone()
            } else {
                None
            };
            (sessions, hook)
        };
        debug!(count = sessions.len(), "closing sessions");
        for session in sessions {
            session.close();
        }
        if let Some(hook) = hook {
            hook(DisconnectReason::Closed);
        }
    }

    fn active_session(&self) -> Result<Session> {
        let state = self.inner.lock();
        match (state.status, &state.session) {
            (ClientStatus::Connected, Some(session)) => Ok(session.clone()),
            (ClientStatus::Closed, _) => Err(Error::ClientClosed),
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn current_master(&self) -> Result<(NodeAddr, u64)> {
        let state = self.inner.lock();
        match (state.status, &state.master) {
            (ClientStatus::Connected, Some(master)) => Ok((master.clone(), state.generation)),
            (ClientStatus::Closed, _) => Err(Error::ClientClosed),
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Sends a command and waits for its reply.
    ///
    /// Error replies are returned as [`Frame::Error`] values, not as `Err`.
    /// Blocking commands run on a dedicated connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the client is not connected or
    /// the connection drops before the reply arrives.
    pub async fn send(&self, cmd: Cmd) -> Result<Frame> {
        if cmd.is_blocking() {
            return self.send_blocking(cmd).await;
        }
        self.active_session()?.request(cmd).await
    }

    /// Sends a command given as its arguments, name first.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(client: sentimux::SentinelClient) -> sentimux::Result<()> {
    /// let reply = client.command(["SET", "foo", "bar"]).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn command<I, T>(&self, args: I) -> Result<Frame>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        let cmd = Cmd::from_args(args).ok_or_else(|| Error::InvalidArgument {
            message: "empty command".to_string(),
        })?;
        self.send(cmd).await
    }

    /// Writes all commands back to back, then collects their replies in
    /// order.
    ///
    /// Blocking commands are not allowed in a pipeline.
    pub async fn pipeline(&self, cmds: Vec<Cmd>) -> Result<Vec<Frame>> {
        if cmds.iter().any(Cmd::is_blocking) {
            return Err(Error::InvalidArgument {
                message: "blocking commands cannot be pipelined".to_string(),
            });
        }
        let session = self.active_session()?;
        let mut pending = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            pending.push(session.send(cmd).await?);
        }
        let mut replies = Vec::with_capacity(pending.len());
        for reply in pending {
            replies.push(reply.await?);
        }
        Ok(replies)
    }

    async fn send_blocking(&self, cmd: Cmd) -> Result<Frame> {
        let (master, generation) = self.current_master()?;
        let session = Session::open(&master, &self.inner.options.master).await?;
        let id = {
            let mut state = self.inner.lock();
            if state.generation != generation {
                let closed = state.status == ClientStatus::Closed;
                drop(state);
                session.close();
                return Err(if closed {
                    Error::ClientClosed
                } else {
                    Error::ConnectionClosed
                });
            }
            let id = state.next_blocking_id;
            state.next_blocking_id += 1;
            state.blocking.insert(id, session.clone());
            id
        };
        debug!(command = %cmd.name(), %master, "running blocking command on dedicated session");

        let result = session.request(cmd).await;
        self.inner.lock().blocking.remove(&id);
        session.close();
        result
    }

    /// Subscribes to a channel.
    ///
    /// The returned stream yields the subscribe acknowledgment first, then
    /// every message published to the channel.
    pub async fn subscribe(&self, channel: impl Into<Bytes>) -> Result<Subscription> {
        self.subscribe_topic(Topic::Channel(channel.into())).await
    }

    /// Subscribes to every channel matching a glob-style pattern.
    pub async fn psubscribe(&self, pattern: impl Into<Bytes>) -> Result<Subscription> {
        self.subscribe_topic(Topic::Pattern(pattern.into())).await
    }

    async fn subscribe_topic(&self, topic: Topic) -> Result<Subscription> {
        let session = self.pubsub_session().await?;
        session.subscribe(topic).await
    }

    async fn pubsub_session(&self) -> Result<Session> {
        let (master, generation) = {
            let state = self.inner.lock();
            if let (ClientStatus::Connected, Some(pubsub)) = (state.status, &state.pubsub) {
                if pubsub.is_connected() {
                    return Ok(pubsub.clone());
                }
            }
            drop(state);
            self.current_master()?
        };

        let session = Session::open(&master, &self.inner.options.master).await?;
        let mut state = self.inner.lock();
        if state.generation != generation {
            let closed = state.status == ClientStatus::Closed;
            drop(state);
            session.close();
            return Err(if closed {
                Error::ClientClosed
            } else {
                Error::ConnectionClosed
            });
        }
        if let Some(existing) = state.pubsub.as_ref().filter(|s| s.is_connected()) {
            let existing = existing.clone();
            drop(state);
            session.close();
            return Ok(existing);
        }
        state.pubsub = Some(session.clone());
        debug!(%master, "pub/sub session opened");
        Ok(session)
    }

    /// Publishes a message, returning the number of receivers.
    pub async fn publish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> Result<i64> {
        command::frame_to_int(self.send(command::publish(channel, message)).await?)
    }

    /// Sends PING.
    pub async fn ping(&self) -> Result<Bytes> {
        let reply = command::frame_to_bytes(self.send(command::ping()).await?)?;
        Ok(reply.unwrap_or_default())
    }

    /// Gets the value of a key.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        command::frame_to_bytes(self.send(command::get(key)).await?)
    }

    /// Sets the string value of a key.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        command::parse_frame_response(self.send(command::set(key, value)).await?)?;
        Ok(())
    }

    /// Removes a key, returning whether it existed.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<bool> {
        Ok(command::frame_to_int(self.send(command::del(key)).await?)? > 0)
    }

    /// Appends values to a list, returning its new length.
    pub async fn rpush<V: Into<Bytes>>(
        &self,
        key: impl Into<Bytes>,
        values: impl IntoIterator<Item = V>,
    ) -> Result<i64> {
        command::frame_to_int(self.send(command::rpush(key, values)).await?)
    }

    /// Pops the head of a list, waiting up to `timeout_secs` (0 = forever)
    /// for an element. Returns `(key, element)` or `None` on timeout.
    pub async fn blpop(
        &self,
        key: impl Into<Bytes>,
        timeout_secs: u64,
    ) -> Result<Option<(Bytes, Bytes)>> {
        let reply = self.send(command::blpop(key, timeout_secs)).await?;
        match command::frame_to_vec_bytes(reply)? {
            None => Ok(None),
            Some(items) => match <[Bytes; 2]>::try_from(items) {
                Ok([key, value]) => Ok(Some((key, value))),
                Err(items) => Err(Error::protocol(format!(
                    "BLPOP returned {} elements",
                    items.len()
                ))),
            },
        }
    }
}

async fn verify_role(session: &Session) -> Result<()> {
    match session.request(command::role()).await? {
        Frame::Error(e) => {
            warn!(
                address = %session.address(),
                error = %String::from_utf8_lossy(&e),
                "ROLE rejected, skipping role check"
            );
            Ok(())
        }
        Frame::Array(items) => {
            let role = items
                .first()
                .and_then(Frame::as_bytes)
                .map(|r| String::from_utf8_lossy(r).into_owned())
                .unwrap_or_default();
            if role == "master" {
                Ok(())
            } else {
                Err(Error::RoleMismatch {
                    address: session.address().to_string(),
                    role,
                })
            }
        }
        other => Err(Error::protocol(format!(
            "unexpected ROLE reply: {:?}",
            other
        ))),
    }
}

impl fmt::Debug for SentinelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SentinelClient")
            .field("status", &state.status)
            .field("master", &state.master)
            .finish()
    }
}
