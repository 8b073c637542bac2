//! A single connection to one node with pipelined request/response traffic
//! and pub/sub pushes multiplexed over it.
//!
//! Every session runs two tasks. The writer pulls requests from a single
//! queue, registers their reply waiters, then writes them. Ordinary commands
//! hold a queue slot until the writer picks them up; subscribe and
//! unsubscribe requests take no slot, so queueing them never waits or fails.
//!
//! The reader decodes inbound frames and hands each one either to the oldest
//! waiter or, once the connection is in subscribed mode and the frame is
//! shaped like a push, to the subscribers of its topic. The protocol carries
//! no request IDs, so the waiter queue is strictly FIFO.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::core::command::{self, Cmd};
use crate::core::config::{ConnectOptions, NodeAddr};
use crate::core::connection::{self, Connection, ConnectionReader, ConnectionWriter};
use crate::core::pubsub::{Inbound, PubSubMessage, Subscription, Topic};
use crate::core::{Error, Result};
use crate::proto::codec::Decoder;
use crate::proto::frame::Frame;

// Upper bound on commands coalesced into one socket write.
const MAX_WRITE_BATCH: usize = 64;

type Waiter = oneshot::Sender<Result<Frame>>;
type DisconnectHook = Box<dyn FnOnce(DisconnectReason) + Send + 'static>;

/// Connection state of a session.
///
/// A session only exists once its connection is established, so it starts
/// out `Connected` and ends `Disconnected`; it never goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The connection is up.
    Connected,
    /// The connection is gone; every operation fails.
    Disconnected,
}

/// Why a session disconnected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally.
    Closed,
    /// The peer closed the connection.
    PeerClosed,
    /// A read or write failed.
    Io(String),
    /// The peer sent malformed data.
    Protocol(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed locally"),
            DisconnectReason::PeerClosed => write!(f, "closed by peer"),
            DisconnectReason::Io(e) => write!(f, "I/O error: {}", e),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// A request sent to the writer task.
struct Request {
    cmd: Cmd,
    waiter: Option<Waiter>,
    subscribes: bool,
    _slot: Option<OwnedSemaphorePermit>,
}

struct Subscriber {
    id: u64,
    acked: bool,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

struct State {
    status: SessionStatus,
    reason: Option<DisconnectReason>,
    pending: VecDeque<Waiter>,
    /// Waiters ever enqueued / ever resolved, used to tell when replies to
    /// commands written before the first subscribe have all come back.
    enqueued: u64,
    resolved: u64,
    subscribed_after: Option<u64>,
    subscriptions: HashMap<Topic, Vec<Subscriber>>,
    next_subscriber_id: u64,
    on_disconnect: Option<DisconnectHook>,
}

impl State {
    fn subscribed(&self) -> bool {
        self.subscribed_after
            .is_some_and(|barrier| self.resolved >= barrier)
    }

    fn deliver(&mut self, message: PubSubMessage) {
        let topic = message.topic();
        let Some(subscribers) = self.subscriptions.get_mut(&topic) else {
            debug!(%topic, "push for topic without subscribers, discarding");
            return;
        };

        if message.is_subscribe_ack() {
            match subscribers.iter_mut().find(|s| !s.acked) {
                Some(subscriber) => {
                    subscriber.acked = true;
                    let _ = subscriber.tx.send(message);
                }
                None => debug!(%topic, "duplicate subscribe acknowledgment"),
            }
        } else if message.is_unsubscribe_ack() {
            debug!(%topic, "unsubscribe acknowledged");
        } else {
            subscribers.retain(|s| s.tx.send(message.clone()).is_ok());
            if subscribers.is_empty() {
                self.subscriptions.remove(&topic);
            }
        }
    }
}

struct Shared {
    address: NodeAddr,
    state: Mutex<State>,
    slots: Arc<Semaphore>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, frame: Frame) {
        let mut state = self.lock();
        let subscribed = state.subscribed();
        match Inbound::classify(frame, subscribed) {
            Inbound::Reply(frame) => {
                let oldest = state.pending.pop_front();
                match oldest {
                    Some(waiter) => {
                        state.resolved += 1;
                        drop(state);
                        if waiter.send(Ok(frame)).is_err() {
                            warn!(address = %self.address, "discarding reply for abandoned request");
                        }
                    }
                    None => {
                        warn!(address = %self.address, ?frame, "reply with no pending request, discarding");
                    }
                }
            }
            Inbound::Push(message) => state.deliver(message),
        }
    }

    /// Tears the session down. Only the first call has any effect.
    fn shutdown(&self, reason: DisconnectReason) {
        let (pending, subscriptions, hook) = {
            let mut state = self.lock();
            if state.status == SessionStatus::Disconnected {
                return;
            }
            state.status = SessionStatus::Disconnected;
            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscriptions),
                state.on_disconnect.take(),
            )
        };
        self.closed.send_replace(true);
        self.slots.close();

        match &reason {
            DisconnectReason::Closed => debug!(address = %self.address, "session closed"),
            DisconnectReason::PeerClosed => {
                info!(address = %self.address, "session closed by peer")
            }
            other => error!(address = %self.address, reason = %other, "session disconnected"),
        }

        for waiter in pending {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
        drop(subscriptions);
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

/// A handle to one live connection.
///
/// Cheap to clone; all clones share the connection. Commands issued through
/// any clone are written in the order their [`send`](Session::send) calls
/// complete, and replies are matched to them in that same order.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
}

impl Session {
    /// Connects to `address`, runs the handshake configured in `options`
    /// (AUTH, SELECT, CLIENT SETNAME) and starts the session tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] if the connection
    /// cannot be established, [`Error::Auth`] if AUTH is rejected and
    /// [`Error::Server`] if another handshake command fails.
    #[instrument(skip_all, fields(address = %address), level = "debug")]
    pub async fn open(address: &NodeAddr, options: &ConnectOptions) -> Result<Self> {
        let stream = connection::connect_tcp(address, options.connect_timeout).await?;
        let mut conn =
            Connection::with_decoder(stream, Decoder::with_max_frame_size(options.max_frame_size));
        handshake(&mut conn, options).await?;
        debug!("session established");
        Ok(Self::from_connection(conn, address.clone(), options.queue_size))
    }

    /// Starts a session over an already established connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_connection<S>(conn: Connection<S>, address: NodeAddr, queue_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = conn.split();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            address,
            state: Mutex::new(State {
                status: SessionStatus::Connected,
                reason: None,
                pending: VecDeque::new(),
                enqueued: 0,
                resolved: 0,
                subscribed_after: None,
                subscriptions: HashMap::new(),
                next_subscriber_id: 0,
                on_disconnect: None,
            }),
            slots: Arc::new(Semaphore::new(queue_size.clamp(1, Semaphore::MAX_PERMITS))),
            closed: closed_tx,
        });

        tokio::spawn(run_writer(
            shared.clone(),
            writer,
            request_rx,
            shared.closed.subscribe(),
        ));
        tokio::spawn(run_reader(shared.clone(), reader, shared.closed.subscribe()));

        Self {
            shared,
            requests: request_tx,
        }
    }

    /// Address of the node this session talks to.
    pub fn address(&self) -> &NodeAddr {
        &self.shared.address
    }

    /// Current connection state.
    pub fn status(&self) -> SessionStatus {
        self.shared.lock().status
    }

    /// Returns true while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.status() == SessionStatus::Connected
    }

    /// Why the session disconnected, if it did.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.lock().reason.clone()
    }

    /// Number of requests written and still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of live subscribers for `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.shared
            .lock()
            .subscriptions
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Registers a hook invoked once when this session disconnects.
    ///
    /// If the session is already disconnected the hook runs immediately.
    /// Registering again replaces a hook that has not run yet.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: FnOnce(DisconnectReason) + Send + 'static,
    {
        let mut state = self.shared.lock();
        let reason = state.reason.clone();
        match reason {
            Some(reason) => {
                drop(state);
                hook(reason);
            }
            None => state.on_disconnect = Some(Box::new(hook)),
        }
    }

    /// Queues a command for writing and returns a handle resolving to its
    /// reply.
    ///
    /// Several handles may be outstanding at once (pipelining). Waits only
    /// for a free slot in the request queue, never for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session is disconnected.
    pub async fn send(&self, cmd: Cmd) -> Result<PendingReply> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let slot = self
            .shared
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request {
                cmd,
                waiter: Some(tx),
                subscribes: false,
                _slot: Some(slot),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(PendingReply { rx })
    }

    /// Sends a command and waits for its reply.
    ///
    /// Error replies are returned as [`Frame::Error`] values.
    pub async fn request(&self, cmd: Cmd) -> Result<Frame> {
        self.send(cmd).await?.await
    }

    /// Subscribes to a channel or pattern.
    ///
    /// The subscriber is registered before SUBSCRIBE is written, so the
    /// acknowledgment is always the first item of the returned stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session is disconnected.
    pub async fn subscribe(&self, topic: Topic) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.shared.lock();
            if state.status != SessionStatus::Connected {
                return Err(Error::ConnectionClosed);
            }
            // Queued under the lock so it stays ordered against a concurrent
            // release of the same topic.
            self.requests
                .send(Request {
                    cmd: topic.subscribe_cmd(),
                    waiter: None,
                    subscribes: true,
                    _slot: None,
                })
                .map_err(|_| Error::ConnectionClosed)?;
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state
                .subscriptions
                .entry(topic.clone())
                .or_default()
                .push(Subscriber {
                    id,
                    acked: false,
                    tx,
                });
            id
        };
        debug!(address = %self.shared.address, %topic, "subscribe queued");
        Ok(Subscription::new(topic, id, rx, self.clone()))
    }

    /// Removes one subscriber; unsubscribes server-side when it was the last
    /// one for its topic.
    pub(crate) fn release_subscriber(&self, topic: &Topic, id: u64) {
        let mut state = self.shared.lock();
        let Some(subscribers) = state.subscriptions.get_mut(topic) else {
            return;
        };
        subscribers.retain(|s| s.id != id);
        if !subscribers.is_empty() {
            return;
        }
        state.subscriptions.remove(topic);
        if state.status != SessionStatus::Connected {
            return;
        }

        let request = Request {
            cmd: topic.unsubscribe_cmd(),
            waiter: None,
            subscribes: false,
            _slot: None,
        };
        if self.requests.send(request).is_err() {
            debug!(address = %self.shared.address, %topic, "writer gone, unsubscribe skipped");
        }
    }

    /// Closes the session.
    ///
    /// Pending requests fail with [`Error::ConnectionClosed`], subscription
    /// streams end and later calls fail instead of hanging. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown(DisconnectReason::Closed);
    }

    /// Waits until the session has disconnected.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.shared.address)
            .field("status", &self.status())
            .finish()
    }
}

/// The eventual reply to a command queued with [`Session::send`].
///
/// Dropping it abandons the request; its reply is discarded when it arrives
/// and never handed to another caller.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Frame>>,
}

impl Future for PendingReply {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::ConnectionClosed)))
    }
}

async fn handshake<S>(conn: &mut Connection<S>, options: &ConnectOptions) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(password) = &options.password {
        let cmd = match &options.username {
            Some(user) => command::auth_with_username(user.clone(), password.clone()),
            None => command::auth(password.clone()),
        };
        if conn.request(&cmd).await?.is_error() {
            return Err(Error::Auth);
        }
    }

    if let Some(db) = options.database {
        command::parse_frame_response(conn.request(&command::select(db)).await?)?;
    }

    if let Some(name) = &options.client_name {
        command::parse_frame_response(
            conn.request(&command::client_setname(name.clone())).await?,
        )?;
    }
    Ok(())
}

async fn run_writer<S>(
    shared: Arc<Shared>,
    mut writer: ConnectionWriter<S>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut closed: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => {
                    // Every handle is gone.
                    shared.shutdown(DisconnectReason::Closed);
                    break;
                }
            },
        };

        let mut batch = vec![first];
        while batch.len() < MAX_WRITE_BATCH {
            match requests.try_recv() {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }

        let mut cmds = Vec::with_capacity(batch.len());
        {
            let mut state = shared.lock();
            if state.status != SessionStatus::Connected {
                drop(state);
                fail_requests(batch);
                break;
            }
            for request in batch {
                if request.subscribes && state.subscribed_after.is_none() {
                    state.subscribed_after = Some(state.enqueued);
                }
                if let Some(waiter) = request.waiter {
                    state.pending.push_back(waiter);
                    state.enqueued += 1;
                }
                cmds.push(request.cmd);
            }
        }

        debug!(address = %shared.address, count = cmds.len(), "writing commands");
        if let Err(e) = writer.write_commands(&cmds).await {
            error!(address = %shared.address, error = ?e, "failed to write commands");
            shared.shutdown(DisconnectReason::Io(e.to_string()));
            break;
        }
    }

    requests.close();
    let mut leftover = Vec::new();
    while let Ok(request) = requests.try_recv() {
        leftover.push(request);
    }
    fail_requests(leftover);
    let _ = writer.shutdown().await;
}

fn fail_requests(requests: Vec<Request>) {
    for request in requests {
        if let Some(waiter) = request.waiter {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }
}

async fn run_reader<S>(
    shared: Arc<Shared>,
    mut reader: ConnectionReader<S>,
    mut closed: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => return,
            result = reader.read_frame() => result,
        };

        match result {
            Ok(Some(frame)) => {
                debug!(address = %shared.address, ?frame, "received frame");
                shared.dispatch(frame);
            }
            Ok(None) => {
                shared.shutdown(DisconnectReason::PeerClosed);
                return;
            }
            Err(Error::Protocol { message }) => {
                shared.shutdown(DisconnectReason::Protocol(message));
                return;
            }
            Err(e) => {
                shared.shutdown(DisconnectReason::Io(e.to_string()));
                return;
            }
        }
    }
}
