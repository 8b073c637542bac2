//! Publish/subscribe message types and subscription streams.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::core::command::Cmd;
use crate::core::session::Session;
use crate::proto::frame::Frame;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// An exact channel name (SUBSCRIBE).
    Channel(Bytes),
    /// A glob-style pattern (PSUBSCRIBE).
    Pattern(Bytes),
}

impl Topic {
    pub(crate) fn subscribe_cmd(&self) -> Cmd {
        match self {
            Topic::Channel(c) => Cmd::new("SUBSCRIBE").arg(c.clone()),
            Topic::Pattern(p) => Cmd::new("PSUBSCRIBE").arg(p.clone()),
        }
    }

    pub(crate) fn unsubscribe_cmd(&self) -> Cmd {
        match self {
            Topic::Channel(c) => Cmd::new("UNSUBSCRIBE").arg(c.clone()),
            Topic::Pattern(p) => Cmd::new("PUNSUBSCRIBE").arg(p.clone()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(c) => write!(f, "channel {}", String::from_utf8_lossy(c)),
            Topic::Pattern(p) => write!(f, "pattern {}", String::from_utf8_lossy(p)),
        }
    }
}

/// An unsolicited pub/sub push delivered on a subscribed connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    /// Acknowledgment of SUBSCRIBE.
    Subscribe {
        /// Channel subscribed to.
        channel: Bytes,
        /// Number of subscriptions the connection now holds.
        count: i64,
    },
    /// Acknowledgment of UNSUBSCRIBE.
    Unsubscribe {
        /// Channel unsubscribed from.
        channel: Bytes,
        /// Number of subscriptions the connection still holds.
        count: i64,
    },
    /// Acknowledgment of PSUBSCRIBE.
    PSubscribe {
        /// Pattern subscribed to.
        pattern: Bytes,
        /// Number of subscriptions the connection now holds.
        count: i64,
    },
    /// Acknowledgment of PUNSUBSCRIBE.
    PUnsubscribe {
        /// Pattern unsubscribed from.
        pattern: Bytes,
        /// Number of subscriptions the connection still holds.
        count: i64,
    },
    /// A message published to a channel.
    Message {
        /// Channel the message was published to.
        channel: Bytes,
        /// Message body.
        payload: Bytes,
    },
    /// A message matched by a pattern subscription.
    PMessage {
        /// Pattern that matched.
        pattern: Bytes,
        /// Channel the message was published to.
        channel: Bytes,
        /// Message body.
        payload: Bytes,
    },
}

impl PubSubMessage {
    /// Interprets a frame as a pub/sub push, looking only at its shape.
    ///
    /// Returns `None` for anything that is not an array led by one of the
    /// push kind tags with the right arity.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let Frame::Array(items) = frame else {
            return None;
        };
        let kind = items.first()?.as_bytes()?;
        let bytes_at = |i: usize| items.get(i).and_then(Frame::as_bytes).map(Bytes::copy_from_slice);
        let count_at = |i: usize| items.get(i).and_then(Frame::to_int);

        let message = match (kind, items.len()) {
            (b"message", 3) => PubSubMessage::Message {
                channel: bytes_at(1)?,
                payload: bytes_at(2)?,
            },
            (b"pmessage", 4) => PubSubMessage::PMessage {
                pattern: bytes_at(1)?,
                channel: bytes_at(2)?,
                payload: bytes_at(3)?,
            },
            (b"subscribe", 3) => PubSubMessage::Subscribe {
                channel: bytes_at(1)?,
                count: count_at(2)?,
            },
            (b"unsubscribe", 3) => PubSubMessage::Unsubscribe {
                // UNSUBSCRIBE with no subscriptions left answers a null channel.
                channel: bytes_at(1).unwrap_or_default(),
                count: count_at(2)?,
            },
            (b"psubscribe", 3) => PubSubMessage::PSubscribe {
                pattern: bytes_at(1)?,
                count: count_at(2)?,
            },
            (b"punsubscribe", 3) => PubSubMessage::PUnsubscribe {
                pattern: bytes_at(1).unwrap_or_default(),
                count: count_at(2)?,
            },
            _ => return None,
        };
        Some(message)
    }

    /// The topic this push belongs to.
    pub fn topic(&self) -> Topic {
        match self {
            PubSubMessage::Subscribe { channel, .. }
            | PubSubMessage::Unsubscribe { channel, .. }
            | PubSubMessage::Message { channel, .. } => Topic::Channel(channel.clone()),
            PubSubMessage::PSubscribe { pattern, .. }
            | PubSubMessage::PUnsubscribe { pattern, .. }
            | PubSubMessage::PMessage { pattern, .. } => Topic::Pattern(pattern.clone()),
        }
    }

    /// Returns true for SUBSCRIBE/PSUBSCRIBE acknowledgments.
    pub fn is_subscribe_ack(&self) -> bool {
        matches!(
            self,
            PubSubMessage::Subscribe { .. } | PubSubMessage::PSubscribe { .. }
        )
    }

    /// Returns true for UNSUBSCRIBE/PUNSUBSCRIBE acknowledgments.
    pub fn is_unsubscribe_ack(&self) -> bool {
        matches!(
            self,
            PubSubMessage::Unsubscribe { .. } | PubSubMessage::PUnsubscribe { .. }
        )
    }

    /// The body of a published message.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            PubSubMessage::Message { payload, .. } | PubSubMessage::PMessage { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }
}

/// Inbound data at the session boundary.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A reply to the oldest pending request.
    Reply(Frame),
    /// An unsolicited pub/sub push.
    Push(PubSubMessage),
}

impl Inbound {
    /// Pushes only exist once the connection has entered subscribed mode;
    /// before that every frame is an ordered reply, whatever it looks like.
    pub(crate) fn classify(frame: Frame, subscribed: bool) -> Self {
        if subscribed {
            if let Some(message) = PubSubMessage::from_frame(&frame) {
                return Inbound::Push(message);
            }
        }
        Inbound::Reply(frame)
    }
}

/// A stream of pub/sub messages for one channel or pattern.
///
/// The first item is the server's subscribe acknowledgment, followed by
/// published messages in arrival order. The stream ends when the session
/// disconnects or is closed. Dropping the subscription unsubscribes; the
/// server-side unsubscribe is only issued once the last subscriber of the
/// topic on that session goes away.
pub struct Subscription {
    topic: Topic,
    id: u64,
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    session: Session,
}

impl Subscription {
    pub(crate) fn new(
        topic: Topic,
        id: u64,
        rx: mpsc::UnboundedReceiver<PubSubMessage>,
        session: Session,
    ) -> Self {
        Self {
            topic,
            id,
            rx,
            session,
        }
    }

    /// The channel or pattern this subscription listens to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Waits for the next message, returning `None` once the stream ended.
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    /// Stops listening. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.session.release_subscriber(&self.topic, self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}
