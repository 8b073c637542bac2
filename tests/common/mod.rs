//! In-process mock servers shared by the integration tests.
//!
//! `MockRedis` is a tiny data node with strings, lists, BLPOP, pub/sub,
//! ROLE and `DEBUG SLEEP`. `MockSentinel` answers
//! `SENTINEL get-master-addr-by-name`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sentimux::proto::codec::{Decoder, Encoder};
use sentimux::proto::frame::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};

fn ok() -> Frame {
    Frame::SimpleString(b"OK".to_vec())
}

fn err(message: &str) -> Frame {
    Frame::Error(message.as_bytes().to_vec())
}

fn args_of(frame: Frame) -> Option<Vec<Bytes>> {
    match frame {
        Frame::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Frame::BulkString(Some(b)) => Some(b),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Reads frames from one half of a socket.
struct FrameReader {
    half: OwnedReadHalf,
    decoder: Decoder,
    buf: [u8; 4096],
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            decoder: Decoder::new(),
            buf: [0u8; 4096],
        }
    }

    async fn next(&mut self) -> Option<Frame> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(_) => return None,
            }
            match self.half.read(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.decoder.append(&self.buf[..n]),
            }
        }
    }
}

/// Spawns a task writing every frame sent on the returned channel.
fn spawn_writer(
    mut half: tokio::net::tcp::OwnedWriteHalf,
) -> (mpsc::UnboundedSender<Frame>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let handle = tokio::spawn(async move {
        let mut encoder = Encoder::new();
        while let Some(frame) = rx.recv().await {
            encoder.encode(&frame);
            if half.write_all(&encoder.take()).await.is_err() {
                return;
            }
        }
    });
    (tx, handle)
}

enum Value {
    Str(Bytes),
    List(VecDeque<Bytes>),
}

#[derive(Default)]
struct Data {
    values: HashMap<Bytes, Value>,
    channels: HashMap<Bytes, Vec<(u64, mpsc::UnboundedSender<Frame>)>>,
    patterns: HashMap<Bytes, Vec<(u64, mpsc::UnboundedSender<Frame>)>>,
    role: Option<String>,
    password: Option<String>,
    commands: Vec<Vec<Bytes>>,
}

struct Store {
    data: Mutex<Data>,
    pushed: Notify,
    next_conn: AtomicUsize,
    accepted: AtomicUsize,
    kill: watch::Sender<u64>,
}

impl Store {
    fn lock(&self) -> std::sync::MutexGuard<'_, Data> {
        self.data.lock().unwrap()
    }

    fn lpop(&self, key: &Bytes) -> Option<Bytes> {
        let mut data = self.lock();
        let Some(Value::List(list)) = data.values.get_mut(key) else {
            return None;
        };
        let value = list.pop_front();
        if list.is_empty() {
            data.values.remove(key);
        }
        value
    }
}

/// A mock data node.
pub struct MockRedis {
    addr: SocketAddr,
    store: Arc<Store>,
}

impl MockRedis {
    /// Starts a mock master on an ephemeral port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0u64);
        let store = Arc::new(Store {
            data: Mutex::new(Data::default()),
            pushed: Notify::new(),
            next_conn: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            kill,
        });

        let accept_store = store.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                accept_store.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_data_connection(socket, accept_store.clone()));
            }
        });

        Self { addr, store }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Makes ROLE report `role` instead of `master`.
    pub fn set_role(&self, role: &str) {
        self.store.lock().role = Some(role.to_string());
    }

    /// Requires AUTH with `password`.
    pub fn set_password(&self, password: &str) {
        self.store.lock().password = Some(password.to_string());
    }

    /// Drops every open client connection. New connections are still
    /// accepted.
    pub fn kill_connections(&self) {
        self.store.kill.send_modify(|epoch| *epoch += 1);
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.store.accepted.load(Ordering::SeqCst)
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<Vec<Bytes>> {
        self.store.lock().commands.clone()
    }

    /// Number of connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.store
            .lock()
            .channels
            .get(channel.as_bytes())
            .map_or(0, Vec::len)
    }
}

async fn serve_data_connection(socket: TcpStream, store: Arc<Store>) {
    let conn_id = store.next_conn.fetch_add(1, Ordering::SeqCst) as u64;
    let mut kill = store.kill.subscribe();
    let (read_half, write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half);
    let (out, writer) = spawn_writer(write_half);
    let mut subscribed: HashSet<Bytes> = HashSet::new();
    let mut psubscribed: HashSet<Bytes> = HashSet::new();

    loop {
        let frame = tokio::select! {
            _ = kill.changed() => break,
            frame = reader.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(args) = args_of(frame) else {
            let _ = out.send(err("ERR protocol"));
            continue;
        };
        if args.is_empty() {
            continue;
        }
        store.lock().commands.push(args.clone());
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();

        let reply = match name.as_str() {
            "BLPOP" => {
                let reply = tokio::select! {
                    _ = kill.changed() => break,
                    reply = blpop(&store, &args) => reply,
                };
                Some(reply)
            }
            "DEBUG" if args.len() == 3 && args[1].eq_ignore_ascii_case(b"SLEEP") => {
                let secs = std::str::from_utf8(&args[2])
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                tokio::select! {
                    _ = kill.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => Some(ok()),
                }
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let pattern = name == "PSUBSCRIBE";
                for topic in &args[1..] {
                    let set = if pattern { &mut psubscribed } else { &mut subscribed };
                    if set.insert(topic.clone()) {
                        let mut data = store.lock();
                        let registry = if pattern {
                            &mut data.patterns
                        } else {
                            &mut data.channels
                        };
                        registry
                            .entry(topic.clone())
                            .or_default()
                            .push((conn_id, out.clone()));
                    }
                    let kind = if pattern { "psubscribe" } else { "subscribe" };
                    let count = (subscribed.len() + psubscribed.len()) as i64;
                    let _ = out.send(Frame::Array(vec![
                        Frame::bulk(kind),
                        Frame::BulkString(Some(topic.clone())),
                        Frame::Integer(count),
                    ]));
                }
                None
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let pattern = name == "PUNSUBSCRIBE";
                for topic in &args[1..] {
                    let set = if pattern { &mut psubscribed } else { &mut subscribed };
                    set.remove(topic);
                    let mut data = store.lock();
                    let registry = if pattern {
                        &mut data.patterns
                    } else {
                        &mut data.channels
                    };
                    if let Some(subs) = registry.get_mut(topic) {
                        subs.retain(|(id, _)| *id != conn_id);
                        if subs.is_empty() {
                            registry.remove(topic);
                        }
                    }
                    drop(data);
                    let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
                    let count = (subscribed.len() + psubscribed.len()) as i64;
                    let _ = out.send(Frame::Array(vec![
                        Frame::bulk(kind),
                        Frame::BulkString(Some(topic.clone())),
                        Frame::Integer(count),
                    ]));
                }
                None
            }
            _ => Some(execute(&store, &name, &args)),
        };
        if let Some(reply) = reply {
            if out.send(reply).is_err() {
                break;
            }
        }
    }

    {
        let mut guard = store.lock();
        let data = &mut *guard;
        for registry in [&mut data.channels, &mut data.patterns] {
            for subs in registry.values_mut() {
                subs.retain(|(id, _)| *id != conn_id);
            }
            registry.retain(|_, subs| !subs.is_empty());
        }
    }
    writer.abort();
}

async fn blpop(store: &Store, args: &[Bytes]) -> Frame {
    if args.len() != 3 {
        return err("ERR wrong number of arguments for 'blpop' command");
    }
    let key = args[1].clone();
    let timeout: f64 = match std::str::from_utf8(&args[2]).ok().and_then(|t| t.parse().ok()) {
        Some(t) => t,
        None => return err("ERR timeout is not a float or out of range"),
    };
    let deadline = (timeout > 0.0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs_f64(timeout));

    loop {
        let notified = store.pushed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(value) = store.lpop(&key) {
            return Frame::Array(vec![
                Frame::BulkString(Some(key)),
                Frame::BulkString(Some(value)),
            ]);
        }
        match deadline {
            Some(deadline) => {
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Frame::Null;
                }
            }
            None => notified.await,
        }
    }
}

fn glob_match(pattern: &[u8], channel: &[u8]) -> bool {
    match pattern.split_last() {
        Some((b'*', prefix)) => channel.starts_with(prefix),
        _ => pattern == channel,
    }
}

fn execute(store: &Store, name: &str, args: &[Bytes]) -> Frame {
    let mut data = store.lock();
    match (name, args.len()) {
        ("PING", 1) => Frame::SimpleString(b"PONG".to_vec()),
        ("ECHO", 2) => Frame::BulkString(Some(args[1].clone())),
        ("AUTH", 2) | ("AUTH", 3) => match &data.password {
            None => err("ERR AUTH <password> called without any password configured"),
            Some(pw) if pw.as_bytes() == &args[args.len() - 1][..] => ok(),
            Some(_) => err("WRONGPASS invalid username-password pair"),
        },
        ("SELECT", 2) | ("CLIENT", _) => ok(),
        ("ROLE", 1) => match data.role.as_deref() {
            None | Some("master") => Frame::Array(vec![
                Frame::bulk("master"),
                Frame::Integer(0),
                Frame::Array(vec![]),
            ]),
            Some(role) => Frame::Array(vec![
                Frame::bulk(role.to_string()),
                Frame::bulk("127.0.0.1"),
                Frame::Integer(6379),
                Frame::bulk("connected"),
                Frame::Integer(0),
            ]),
        },
        ("SET", 3) => {
            data.values
                .insert(args[1].clone(), Value::Str(args[2].clone()));
            ok()
        }
        ("GET", 2) => match data.values.get(&args[1]) {
            Some(Value::Str(v)) => Frame::BulkString(Some(v.clone())),
            Some(Value::List(_)) => {
                err("WRONGTYPE Operation against a key holding the wrong kind of value")
            }
            None => Frame::BulkString(None),
        },
        ("DEL", n) if n >= 2 => {
            let removed = args[1..]
                .iter()
                .filter(|k| data.values.remove(*k).is_some())
                .count();
            Frame::Integer(removed as i64)
        }
        ("RPUSH", n) if n >= 3 => {
            let entry = data
                .values
                .entry(args[1].clone())
                .or_insert_with(|| Value::List(VecDeque::new()));
            let len = match entry {
                Value::List(list) => {
                    list.extend(args[2..].iter().cloned());
                    list.len()
                }
                Value::Str(_) => {
                    return err("WRONGTYPE Operation against a key holding the wrong kind of value")
                }
            };
            drop(data);
            store.pushed.notify_waiters();
            Frame::Integer(len as i64)
        }
        ("PUBLISH", 3) => {
            let channel = &args[1];
            let payload = &args[2];
            let mut receivers = 0;
            if let Some(subs) = data.channels.get(channel) {
                for (_, tx) in subs {
                    let message = Frame::Array(vec![
                        Frame::bulk("message"),
                        Frame::BulkString(Some(channel.clone())),
                        Frame::BulkString(Some(payload.clone())),
                    ]);
                    if tx.send(message).is_ok() {
                        receivers += 1;
                    }
                }
            }
            for (pattern, subs) in &data.patterns {
                if !glob_match(pattern, channel) {
                    continue;
                }
                for (_, tx) in subs {
                    let message = Frame::Array(vec![
                        Frame::bulk("pmessage"),
                        Frame::BulkString(Some(pattern.clone())),
                        Frame::BulkString(Some(channel.clone())),
                        Frame::BulkString(Some(payload.clone())),
                    ]);
                    if tx.send(message).is_ok() {
                        receivers += 1;
                    }
                }
            }
            Frame::Integer(receivers)
        }
        _ => err(&format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&args[0])
        )),
    }
}

/// A mock sentinel.
pub struct MockSentinel {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
}

impl MockSentinel {
    /// Starts a sentinel that reports `master` for `master_name` and a null
    /// reply for any other name.
    pub async fn start(master_name: &str, master: SocketAddr) -> Self {
        let name = Bytes::from(master_name.to_string());
        let reply = Frame::Array(vec![
            Frame::bulk(master.ip().to_string()),
            Frame::bulk(master.port().to_string()),
        ]);
        Self::with_handler(move |requested| {
            if requested == name {
                reply.clone()
            } else {
                Frame::Null
            }
        })
        .await
    }

    /// Starts a sentinel answering every master query with `reply`.
    pub async fn with_reply(reply: Frame) -> Self {
        Self::with_handler(move |_| reply.clone()).await
    }

    /// Starts a sentinel that accepts connections and never answers.
    pub async fn silent() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        Self { addr, queries }
    }

    async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(Bytes) -> Frame + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let counter = queries.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => break,
                };
                let handler = handler.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = socket.into_split();
                    let mut reader = FrameReader::new(read_half);
                    let (out, writer) = spawn_writer(write_half);
                    while let Some(frame) = reader.next().await {
                        let reply = match args_of(frame).as_deref() {
                            Some([cmd, sub, name])
                                if cmd.eq_ignore_ascii_case(b"SENTINEL")
                                    && sub.eq_ignore_ascii_case(b"get-master-addr-by-name") =>
                            {
                                counter.fetch_add(1, Ordering::SeqCst);
                                (*handler)(name.clone())
                            }
                            Some([cmd]) if cmd.eq_ignore_ascii_case(b"PING") => {
                                Frame::SimpleString(b"PONG".to_vec())
                            }
                            Some([cmd, ..]) if cmd.eq_ignore_ascii_case(b"AUTH") => ok(),
                            _ => err("ERR unknown command"),
                        };
                        if out.send(reply).is_err() {
                            break;
                        }
                    }
                    drop(out);
                    let _ = writer.await;
                });
            }
        });

        Self { addr, queries }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Number of master queries answered (or connections accepted, for a
    /// silent sentinel).
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

/// An address nothing listens on.
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// A master plus one sentinel pointing at it under the name `mymaster`.
pub async fn master_with_sentinel() -> (MockRedis, MockSentinel, sentimux::SentinelConfig) {
    let redis = MockRedis::start().await;
    let sentinel = MockSentinel::start("mymaster", redis.addr()).await;
    let config = sentimux::SentinelConfig::new([sentinel.addr()], "mymaster").unwrap();
    (redis, sentinel, config)
}
